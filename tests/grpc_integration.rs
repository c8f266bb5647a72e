//! gRPC Integration Tests
//!
//! Each test starts a server on an ephemeral port, backed by its own
//! in-memory engine, and talks to it through the generated clients.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use sz_grpc_server::engine::memory::MemoryEngineFactory;
use sz_grpc_server::proto::szconfig::sz_config_client::SzConfigClient;
use sz_grpc_server::proto::szconfig::{
    AddDataSourceRequest, CloseConfigRequest, CreateConfigRequest, ExportConfigRequest,
    GetDataSourcesRequest,
};
use sz_grpc_server::proto::szconfigmanager::sz_config_manager_client::SzConfigManagerClient;
use sz_grpc_server::proto::szconfigmanager::{
    AddConfigRequest, GetConfigsRequest, GetDefaultConfigIdRequest, ReplaceDefaultConfigIdRequest,
    SetDefaultConfigIdRequest,
};
use sz_grpc_server::proto::szdiagnostic::sz_diagnostic_client::SzDiagnosticClient;
use sz_grpc_server::proto::szdiagnostic::PurgeRepositoryRequest;
use sz_grpc_server::proto::szengine::sz_engine_client::SzEngineClient;
use sz_grpc_server::proto::szengine::{
    AddRecordRequest, GetActiveConfigIdRequest, GetRecordRequest, ReinitializeRequest,
    StreamExportJsonEntityReportRequest,
};
use sz_grpc_server::proto::szproduct::sz_product_client::SzProductClient;
use sz_grpc_server::proto::szproduct::GetVersionRequest;
use sz_grpc_server::types::{EnabledServices, ENGINE_CODE_METADATA};
use sz_grpc_server::{Error, GrpcServer, ServerConfig};

// =============================================================================
// Test Helpers
// =============================================================================

const DATABASE_URL: &str = "sqlite3://na:na@/tmp/sqlite/G2C.db?mode=memory&cache=shared";

fn settings(allow_purge: bool) -> String {
    serde_json::json!({
        "PIPELINE": { "ALLOW_PURGE": allow_purge },
        "SQL": { "CONNECTION": DATABASE_URL },
    })
    .to_string()
}

fn config() -> ServerConfig {
    ServerConfig {
        port: 0,
        enable: EnabledServices::all(),
        settings: settings(true),
        ..ServerConfig::default()
    }
}

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<GrpcServer>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Self {
        let mut server = GrpcServer::new(config, Arc::new(MemoryEngineFactory::new())).unwrap();
        server.initialize().await.unwrap();
        let addr = server.bind().await.unwrap();
        let shutdown = server.shutdown_token();
        let handle = tokio::spawn(async move {
            server.serve().await.unwrap();
            server
        });
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.addr.port())
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let mut server = self.handle.await.unwrap();
        server.destroy().await.unwrap();
    }
}

fn record(name: &str) -> String {
    serde_json::json!({ "NAME_FULL": name }).to_string()
}

// =============================================================================
// Configuration Lifecycle
// =============================================================================

#[tokio::test]
async fn test_template_to_default_lifecycle() {
    let server = TestServer::start(config()).await;
    let mut config = SzConfigClient::connect(server.endpoint()).await.unwrap();
    let mut manager = SzConfigManagerClient::connect(server.endpoint()).await.unwrap();
    let mut engine = SzEngineClient::connect(server.endpoint()).await.unwrap();

    let handle = config.create_config(CreateConfigRequest {}).await.unwrap().into_inner().result;
    let added = config
        .add_data_source(AddDataSourceRequest {
            config_handle: handle,
            data_source_code: "CUSTOMERS".to_string(),
        })
        .await
        .unwrap()
        .into_inner()
        .result;
    assert_eq!(added, r#"{"DSRC_ID":1001}"#);

    let sources = config
        .get_data_sources(GetDataSourcesRequest { config_handle: handle })
        .await
        .unwrap()
        .into_inner()
        .result;
    assert!(sources.contains("CUSTOMERS"));

    let definition = config
        .export_config(ExportConfigRequest { config_handle: handle })
        .await
        .unwrap()
        .into_inner()
        .result;
    config.close_config(CloseConfigRequest { config_handle: handle }).await.unwrap();

    let template_id = manager
        .get_default_config_id(GetDefaultConfigIdRequest {})
        .await
        .unwrap()
        .into_inner()
        .result;
    assert!(template_id > 0);

    let new_id = manager
        .add_config(AddConfigRequest {
            config_definition: definition,
            config_comment: "Added CUSTOMERS".to_string(),
        })
        .await
        .unwrap()
        .into_inner()
        .result;
    assert_ne!(new_id, template_id);

    manager
        .replace_default_config_id(ReplaceDefaultConfigIdRequest {
            current_default_config_id: template_id,
            new_default_config_id: new_id,
        })
        .await
        .unwrap();
    let default_id = manager
        .get_default_config_id(GetDefaultConfigIdRequest {})
        .await
        .unwrap()
        .into_inner()
        .result;
    assert_eq!(default_id, new_id);

    manager
        .set_default_config_id(SetDefaultConfigIdRequest { config_id: template_id })
        .await
        .unwrap();
    let default_id = manager
        .get_default_config_id(GetDefaultConfigIdRequest {})
        .await
        .unwrap()
        .into_inner()
        .result;
    assert_eq!(default_id, template_id);

    manager
        .set_default_config_id(SetDefaultConfigIdRequest { config_id: new_id })
        .await
        .unwrap();
    let default_id = manager
        .get_default_config_id(GetDefaultConfigIdRequest {})
        .await
        .unwrap()
        .into_inner()
        .result;
    assert_eq!(default_id, new_id);

    engine.reinitialize(ReinitializeRequest { config_id: new_id }).await.unwrap();
    let active = engine
        .get_active_config_id(GetActiveConfigIdRequest {})
        .await
        .unwrap()
        .into_inner()
        .result;
    assert_eq!(active, new_id);

    engine
        .add_record(AddRecordRequest {
            data_source_code: "CUSTOMERS".to_string(),
            record_id: "1001".to_string(),
            record_definition: record("Robert Smith"),
            flags: 0,
        })
        .await
        .unwrap();

    server.stop().await;
}

#[tokio::test]
async fn test_replace_default_with_stale_current_is_conflict() {
    let server = TestServer::start(config()).await;
    let mut config = SzConfigClient::connect(server.endpoint()).await.unwrap();
    let mut manager = SzConfigManagerClient::connect(server.endpoint()).await.unwrap();

    let handle = config.create_config(CreateConfigRequest {}).await.unwrap().into_inner().result;
    let definition = config
        .export_config(ExportConfigRequest { config_handle: handle })
        .await
        .unwrap()
        .into_inner()
        .result;
    let new_id = manager
        .add_config(AddConfigRequest {
            config_definition: definition,
            config_comment: "copy".to_string(),
        })
        .await
        .unwrap()
        .into_inner()
        .result;
    let current = manager
        .get_default_config_id(GetDefaultConfigIdRequest {})
        .await
        .unwrap()
        .into_inner()
        .result;

    let status = manager
        .replace_default_config_id(ReplaceDefaultConfigIdRequest {
            current_default_config_id: current + 999,
            new_default_config_id: new_id,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Aborted);
    assert_eq!(Error::kind_of(&status).as_deref(), Some("conflict"));

    let unchanged = manager
        .get_default_config_id(GetDefaultConfigIdRequest {})
        .await
        .unwrap()
        .into_inner()
        .result;
    assert_eq!(unchanged, current);

    server.stop().await;
}

#[tokio::test]
async fn test_listing_configs_data_sources_and_version() {
    let server = TestServer::start(config()).await;
    let mut manager = SzConfigManagerClient::connect(server.endpoint()).await.unwrap();
    let mut product = SzProductClient::connect(server.endpoint()).await.unwrap();

    let default_id = manager
        .get_default_config_id(GetDefaultConfigIdRequest {})
        .await
        .unwrap()
        .into_inner()
        .result;
    let configs = manager.get_configs(GetConfigsRequest {}).await.unwrap().into_inner().result;
    let configs: serde_json::Value = serde_json::from_str(&configs).unwrap();
    let ids: Vec<i64> = configs["CONFIGS"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["CONFIG_ID"].as_i64().unwrap())
        .collect();
    assert!(ids.contains(&default_id));

    let mut config = SzConfigClient::connect(server.endpoint()).await.unwrap();
    let handle = config.create_config(CreateConfigRequest {}).await.unwrap().into_inner().result;
    let sources = config
        .get_data_sources(GetDataSourcesRequest { config_handle: handle })
        .await
        .unwrap()
        .into_inner()
        .result;
    assert_eq!(
        sources,
        r#"{"DATA_SOURCES":[{"DSRC_ID":1,"DSRC_CODE":"TEST"},{"DSRC_ID":2,"DSRC_CODE":"SEARCH"}]}"#
    );
    config.close_config(CloseConfigRequest { config_handle: handle }).await.unwrap();

    let version = product.get_version(GetVersionRequest {}).await.unwrap().into_inner().result;
    assert!(version.contains("VERSION"));

    server.stop().await;
}

#[tokio::test]
async fn test_double_close_is_bad_input() {
    let server = TestServer::start(config()).await;
    let mut config = SzConfigClient::connect(server.endpoint()).await.unwrap();

    let handle = config.create_config(CreateConfigRequest {}).await.unwrap().into_inner().result;
    config.close_config(CloseConfigRequest { config_handle: handle }).await.unwrap();
    let status = config
        .close_config(CloseConfigRequest { config_handle: handle })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert_eq!(Error::kind_of(&status).as_deref(), Some("bad-input"));

    server.stop().await;
}

// =============================================================================
// Diagnostic
// =============================================================================

#[tokio::test]
async fn test_purge_requires_privilege() {
    let server = TestServer::start(ServerConfig {
        settings: settings(false),
        ..config()
    })
    .await;
    let mut engine = SzEngineClient::connect(server.endpoint()).await.unwrap();
    let mut diagnostic = SzDiagnosticClient::connect(server.endpoint()).await.unwrap();

    engine
        .add_record(AddRecordRequest {
            data_source_code: "TEST".to_string(),
            record_id: "1".to_string(),
            record_definition: record("Jane Doe"),
            flags: 0,
        })
        .await
        .unwrap();

    let status = diagnostic.purge_repository(PurgeRepositoryRequest {}).await.unwrap_err();
    assert_eq!(Error::kind_of(&status).as_deref(), Some("engine"));
    let code = status
        .metadata()
        .get(ENGINE_CODE_METADATA)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    assert_eq!(code.as_deref(), Some("7245"));

    let kept = engine
        .get_record(GetRecordRequest {
            data_source_code: "TEST".to_string(),
            record_id: "1".to_string(),
            flags: 0,
        })
        .await;
    assert!(kept.is_ok());

    server.stop().await;
}

// =============================================================================
// Streaming Export
// =============================================================================

async fn load_records(engine: &mut SzEngineClient<tonic::transport::Channel>, count: usize) {
    for i in 0..count {
        engine
            .add_record(AddRecordRequest {
                data_source_code: "TEST".to_string(),
                record_id: format!("{}", i + 1),
                record_definition: record(&format!("Person Number{}", i + 1)),
                flags: 0,
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_stream_export_ends_with_done() {
    let server = TestServer::start(config()).await;
    let mut engine = SzEngineClient::connect(server.endpoint()).await.unwrap();
    load_records(&mut engine, 3).await;

    let mut stream = engine
        .stream_export_json_entity_report(StreamExportJsonEntityReportRequest { flags: 0 })
        .await
        .unwrap()
        .into_inner();
    let mut messages = Vec::new();
    while let Some(message) = stream.next().await {
        messages.push(message.unwrap());
    }

    let (last, rows) = messages.split_last().unwrap();
    assert!(last.done);
    assert!(last.result.is_empty());
    assert!(!rows.is_empty());
    assert!(rows.iter().all(|row| !row.done && !row.result.is_empty()));

    server.stop().await;
}

#[tokio::test]
async fn test_abandoned_stream_releases_export() {
    let server = TestServer::start(config()).await;
    let mut engine = SzEngineClient::connect(server.endpoint()).await.unwrap();
    let mut diagnostic = SzDiagnosticClient::connect(server.endpoint()).await.unwrap();
    load_records(&mut engine, 50).await;

    let mut stream = engine
        .stream_export_json_entity_report(StreamExportJsonEntityReportRequest { flags: 0 })
        .await
        .unwrap()
        .into_inner();
    let first = stream.next().await.unwrap().unwrap();
    assert!(!first.done);
    drop(stream);

    // The export closes once the server notices the client is gone; purge
    // is refused while any export is open.
    let purged = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match diagnostic.purge_repository(PurgeRepositoryRequest {}).await {
                Ok(_) => break,
                Err(_) => tokio::time::sleep(Duration::from_millis(25)).await,
            }
        }
    })
    .await;
    assert!(purged.is_ok());

    server.stop().await;
}

// =============================================================================
// Observers
// =============================================================================

type Received = Arc<Mutex<Vec<serde_json::Value>>>;

async fn receive(State(received): State<Received>, Json(event): Json<serde_json::Value>) {
    received.lock().await.push(event);
}

#[tokio::test]
async fn test_http_observer_receives_events() {
    let received: Received = Arc::default();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sink = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/events", post(receive))
        .with_state(Arc::clone(&received));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let server = TestServer::start(ServerConfig {
        observer_urls: vec![format!("http://{}/events", sink)],
        observer_origin: "integration".to_string(),
        ..config()
    })
    .await;
    let mut product = SzProductClient::connect(server.endpoint()).await.unwrap();
    product.get_version(GetVersionRequest {}).await.unwrap();

    // Destroy drains the observer queues.
    server.stop().await;

    let events = received.lock().await;
    let event = events
        .iter()
        .find(|e| e["method"] == "GetVersion")
        .expect("GetVersion event delivered");
    assert_eq!(event["origin"], "integration");
    assert_eq!(event["componentId"], 6016);
    assert_eq!(event["messageId"], "SZSDK60168002");
}
