//! Protobuf messages and tonic stubs generated by `build.rs`.

#![allow(clippy::all, missing_debug_implementations)]

pub mod szconfig {
    tonic::include_proto!("szconfig");
}

pub mod szconfigmanager {
    tonic::include_proto!("szconfigmanager");
}

pub mod szdiagnostic {
    tonic::include_proto!("szdiagnostic");
}

pub mod szengine {
    tonic::include_proto!("szengine");
}

pub mod szproduct {
    tonic::include_proto!("szproduct");
}

pub mod observer {
    tonic::include_proto!("observer");
}

/// Encoded descriptors of every service, served by gRPC reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("sz_descriptor");
