//! TLS Integration Tests

use pkcs8::pkcs5::pbes2;
use pkcs8::{LineEnding, PrivateKeyInfo};
use std::path::PathBuf;
use std::sync::Arc;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};

use sz_grpc_server::engine::memory::MemoryEngineFactory;
use sz_grpc_server::proto::szproduct::sz_product_client::SzProductClient;
use sz_grpc_server::proto::szproduct::GetVersionRequest;
use sz_grpc_server::types::{EnabledServices, TlsConfig};
use sz_grpc_server::{GrpcServer, ServerConfig};

const SETTINGS: &str = r#"{"SQL":{"CONNECTION":"sqlite3://na:na@/tmp/sqlite/G2C.db?mode=memory&cache=shared"}}"#;
const PASSPHRASE: &str = "correct horse";

struct Credentials {
    _dir: tempfile::TempDir,
    certificate_pem: String,
    certificate: PathBuf,
    key: PathBuf,
    encrypted_key: PathBuf,
}

fn credentials() -> Credentials {
    let dir = tempfile::tempdir().unwrap();
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let certificate_pem = generated.cert.pem();

    let certificate = dir.path().join("server.pem");
    std::fs::write(&certificate, &certificate_pem).unwrap();
    let key = dir.path().join("server.key");
    std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();

    let der = generated.key_pair.serialize_der();
    let salt = [7u8; 16];
    let iv = [9u8; 16];
    let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(2048, &salt, &iv).unwrap();
    let encrypted = PrivateKeyInfo::try_from(der.as_slice())
        .unwrap()
        .encrypt_with_params(params, PASSPHRASE)
        .unwrap();
    let encrypted_key = dir.path().join("server-encrypted.key");
    std::fs::write(
        &encrypted_key,
        encrypted.to_pem("ENCRYPTED PRIVATE KEY", LineEnding::LF).unwrap().as_bytes(),
    )
    .unwrap();

    Credentials {
        _dir: dir,
        certificate_pem,
        certificate,
        key,
        encrypted_key,
    }
}

fn config(tls: TlsConfig) -> ServerConfig {
    ServerConfig {
        port: 0,
        enable: EnabledServices {
            product: true,
            ..EnabledServices::default()
        },
        settings: SETTINGS.to_string(),
        tls,
        ..ServerConfig::default()
    }
}

async fn get_version_over_tls(tls: TlsConfig, ca_pem: &str) -> String {
    let mut server = GrpcServer::new(config(tls), Arc::new(MemoryEngineFactory::new())).unwrap();
    server.initialize().await.unwrap();
    let addr = server.bind().await.unwrap();
    let shutdown = server.shutdown_token();
    let handle = tokio::spawn(async move {
        server.serve().await.unwrap();
        server
    });

    let channel = Channel::from_shared(format!("https://localhost:{}", addr.port()))
        .unwrap()
        .tls_config(
            ClientTlsConfig::new()
                .ca_certificate(Certificate::from_pem(ca_pem))
                .domain_name("localhost"),
        )
        .unwrap()
        .connect()
        .await
        .unwrap();
    let version = SzProductClient::new(channel)
        .get_version(GetVersionRequest {})
        .await
        .unwrap()
        .into_inner()
        .result;

    shutdown.cancel();
    let mut server = handle.await.unwrap();
    server.destroy().await.unwrap();
    version
}

#[tokio::test]
async fn test_plain_key_serves_tls() {
    let creds = credentials();
    let tls = TlsConfig {
        certificate_path: Some(creds.certificate.clone()),
        key_path: Some(creds.key.clone()),
        ..TlsConfig::default()
    };
    let version = get_version_over_tls(tls, &creds.certificate_pem).await;
    assert!(version.contains("VERSION"));
}

#[tokio::test]
async fn test_encrypted_key_with_passphrase_serves_tls() {
    let creds = credentials();
    let tls = TlsConfig {
        certificate_path: Some(creds.certificate.clone()),
        key_path: Some(creds.encrypted_key.clone()),
        key_passphrase: Some(PASSPHRASE.to_string()),
        ..TlsConfig::default()
    };
    let version = get_version_over_tls(tls, &creds.certificate_pem).await;
    assert!(version.contains("VERSION"));
}

#[tokio::test]
async fn test_wrong_passphrase_fails_initialize() {
    let creds = credentials();
    let tls = TlsConfig {
        certificate_path: Some(creds.certificate.clone()),
        key_path: Some(creds.encrypted_key.clone()),
        key_passphrase: Some("wrong".to_string()),
        ..TlsConfig::default()
    };
    let mut server = GrpcServer::new(config(tls), Arc::new(MemoryEngineFactory::new())).unwrap();
    let err = server.initialize().await.unwrap_err();
    assert_eq!(err.kind(), "transport");
    assert!(server.initialized_subdomains().is_empty());
}

#[tokio::test]
async fn test_empty_certificate_path_fails_initialize() {
    let creds = credentials();
    let tls = TlsConfig {
        certificate_path: Some(PathBuf::new()),
        key_path: Some(creds.key.clone()),
        ..TlsConfig::default()
    };
    let mut server = GrpcServer::new(config(tls), Arc::new(MemoryEngineFactory::new())).unwrap();
    assert_eq!(server.initialize().await.unwrap_err().kind(), "transport");
}
