use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_files = [
        "proto/szconfig.proto",
        "proto/szconfigmanager.proto",
        "proto/szdiagnostic.proto",
        "proto/szengine.proto",
        "proto/szproduct.proto",
        "proto/observer.proto",
    ];

    for proto_file in &proto_files {
        println!("cargo:rerun-if-changed={}", proto_file);
    }

    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    // Configure tonic code generation (outputs to OUT_DIR by default).
    // The descriptor set feeds the reflection service.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("sz_descriptor.bin"))
        .compile_protos(&proto_files, &["proto"])?;

    Ok(())
}
