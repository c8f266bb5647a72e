//! gRPC-over-HTTP bridge tests.

use std::sync::Arc;

use sz_grpc_server::engine::memory::MemoryEngineFactory;
use sz_grpc_server::types::{EnabledServices, HttpConfig};
use sz_grpc_server::{GrpcServer, HttpServer, ServerConfig};

const SETTINGS: &str = r#"{"PIPELINE":{"ALLOW_PURGE":true},"SQL":{"CONNECTION":"sqlite3://na:na@/tmp/sqlite/G2C.db?mode=memory&cache=shared"}}"#;

struct Bridge {
    grpc: GrpcServer,
    base: String,
    task: tokio::task::JoinHandle<sz_grpc_server::Result<()>>,
}

async fn start_bridge() -> Bridge {
    let config = ServerConfig {
        port: 0,
        enable: EnabledServices {
            product: true,
            ..EnabledServices::default()
        },
        settings: SETTINGS.to_string(),
        ..ServerConfig::default()
    };
    let mut grpc = GrpcServer::new(config, Arc::new(MemoryEngineFactory::new())).unwrap();
    grpc.initialize().await.unwrap();

    let http_config = HttpConfig {
        enabled: true,
        address: "127.0.0.1".to_string(),
        port: 0,
        ..HttpConfig::default()
    };
    let mut http = HttpServer::new(http_config, grpc.routes().unwrap(), grpc.shutdown_token()).unwrap();
    let addr = http.bind().await.unwrap();
    let task = tokio::spawn(async move { http.serve().await });
    Bridge {
        grpc,
        base: format!("http://127.0.0.1:{}", addr.port()),
        task,
    }
}

impl Bridge {
    async fn stop(mut self) {
        self.grpc.shutdown_token().cancel();
        self.task.await.unwrap().unwrap();
        self.grpc.destroy().await.unwrap();
    }
}

#[tokio::test]
async fn test_healthz() {
    let bridge = start_bridge().await;
    let response = reqwest::get(format!("{}/healthz", bridge.base)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");
    bridge.stop().await;
}

#[tokio::test]
async fn test_grpc_web_unary_call() {
    let bridge = start_bridge().await;

    // One uncompressed frame carrying an empty GetVersionRequest.
    let response = reqwest::Client::new()
        .post(format!("{}/grpc/szproduct.SzProduct/GetVersion", bridge.base))
        .header("content-type", "application/grpc-web+proto")
        .header("x-grpc-web", "1")
        .body(vec![0u8, 0, 0, 0, 0])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default();
    assert!(content_type.starts_with("application/grpc-web"));

    let body = response.bytes().await.unwrap();
    assert!(body.windows(b"VERSION".len()).any(|w| w == b"VERSION"));

    bridge.stop().await;
}

#[tokio::test]
async fn test_plain_request_under_prefix_is_not_found() {
    let bridge = start_bridge().await;
    let response = reqwest::get(format!("{}/grpc/szproduct.SzProduct/GetVersion", bridge.base))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    bridge.stop().await;
}
