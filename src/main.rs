//! serve-grpc - gRPC server for the entity-resolution engine.
//!
//! Every flag can also be set through a `SENZING_TOOLS_<UPPER_SNAKE>`
//! environment variable; the flag wins when both are present.
//!
//! Exit codes: `0` clean shutdown, `1` configuration error, `2`
//! initialization or serve failure.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use sz_grpc_server::engine::memory::MemoryEngineFactory;
use sz_grpc_server::engine::settings::settings_from_database_url;
use sz_grpc_server::types::{
    EnabledServices, HttpConfig, ObserverSettings, TlsConfig, DEFAULT_GRPC_PORT,
    DEFAULT_GRPC_ROUTE_PREFIX, DEFAULT_HTTP_PORT,
};
use sz_grpc_server::{GrpcServer, Result, ServerConfig};

/// Default datastore: a shared in-memory SQLite database, bootstrapped at start.
const DEFAULT_DATABASE_URL: &str = "sqlite3://na:na@/tmp/sqlite/G2C.db?mode=memory&cache=shared";

/// Serve the entity-resolution engine over gRPC and gRPC-Web.
#[derive(Parser, Debug)]
#[command(name = "serve-grpc")]
#[command(version, about, long_about = None)]
struct Args {
    /// gRPC TCP port
    #[arg(long, env = "SENZING_TOOLS_GRPC_PORT", default_value_t = DEFAULT_GRPC_PORT)]
    grpc_port: u16,

    /// Enable every subdomain service
    #[arg(long, env = "SENZING_TOOLS_ENABLE_ALL")]
    enable_all: bool,

    #[arg(long, env = "SENZING_TOOLS_ENABLE_SZCONFIG")]
    enable_szconfig: bool,

    #[arg(long, env = "SENZING_TOOLS_ENABLE_SZCONFIGMANAGER")]
    enable_szconfigmanager: bool,

    #[arg(long, env = "SENZING_TOOLS_ENABLE_SZDIAGNOSTIC")]
    enable_szdiagnostic: bool,

    #[arg(long, env = "SENZING_TOOLS_ENABLE_SZENGINE")]
    enable_szengine: bool,

    #[arg(long, env = "SENZING_TOOLS_ENABLE_SZPRODUCT")]
    enable_szproduct: bool,

    /// PEM server certificate
    #[arg(long, env = "SENZING_TOOLS_SERVER_CERTIFICATE_FILE")]
    server_certificate_file: Option<PathBuf>,

    /// PEM server private key, optionally encrypted
    #[arg(long, env = "SENZING_TOOLS_SERVER_KEY_FILE")]
    server_key_file: Option<PathBuf>,

    /// Passphrase of an encrypted server key
    #[arg(long, env = "SENZING_TOOLS_SERVER_KEY_PASSPHRASE", hide_env_values = true)]
    server_key_passphrase: Option<String>,

    /// PEM client CA certificates; enables mutual TLS
    #[arg(long, env = "SENZING_TOOLS_CLIENT_CA_CERTIFICATE_PATH", value_delimiter = ',')]
    client_ca_certificate_path: Vec<PathBuf>,

    /// Engine settings JSON
    #[arg(long, env = "SENZING_TOOLS_ENGINE_SETTINGS", hide_env_values = true)]
    engine_settings: Option<String>,

    /// Database URL used to build engine settings when none are given
    #[arg(long, env = "SENZING_TOOLS_DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    database_url: String,

    /// Label attached to engine log output
    #[arg(long, env = "SENZING_TOOLS_ENGINE_INSTANCE_NAME", default_value = "serve-grpc")]
    engine_instance_name: String,

    /// Engine verbose logging level
    #[arg(long, env = "SENZING_TOOLS_ENGINE_LOG_LEVEL", default_value_t = 0)]
    engine_log_level: i64,

    /// TRACE, DEBUG, INFO, WARN, ERROR, FATAL or PANIC
    #[arg(long, env = "SENZING_TOOLS_LOG_LEVEL", default_value = "INFO")]
    log_level: String,

    /// Observer endpoint (grpc://host:port or http(s)://...)
    #[arg(long, env = "SENZING_TOOLS_OBSERVER_URL", value_delimiter = ',')]
    observer_url: Vec<String>,

    /// Origin label stamped on observer events
    #[arg(long, env = "SENZING_TOOLS_OBSERVER_ORIGIN", default_value = "serve-grpc")]
    observer_origin: String,

    /// Per-event delivery timeout for observers
    #[arg(long, env = "SENZING_TOOLS_OBSERVER_TIMEOUT", default_value = "5s", value_parser = humantime_duration)]
    observer_timeout: Duration,

    /// Initialize and bind, then exit without serving
    #[arg(long, env = "SENZING_TOOLS_AVOID_SERVING")]
    avoid_serving: bool,

    /// Also serve gRPC-Web over HTTP
    #[arg(long, env = "SENZING_TOOLS_ENABLE_HTTP")]
    enable_http: bool,

    /// HTTP bridge interface
    #[arg(long, env = "SENZING_TOOLS_SERVER_ADDRESS", default_value = "0.0.0.0")]
    server_address: String,

    /// HTTP bridge port
    #[arg(long, env = "SENZING_TOOLS_HTTP_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    http_port: u16,

    /// URL prefix for gRPC-Web requests
    #[arg(long, env = "SENZING_TOOLS_GRPC_URL_ROUTE_PREFIX", default_value = DEFAULT_GRPC_ROUTE_PREFIX)]
    grpc_url_route_prefix: String,

    /// Time a client may take to send request headers
    #[arg(long, env = "SENZING_TOOLS_READ_HEADER_TIMEOUT", default_value = "10s", value_parser = humantime_duration)]
    read_header_timeout: Duration,
}

fn humantime_duration(value: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let settings = match self.engine_settings.filter(|s| !s.trim().is_empty()) {
            Some(settings) => settings,
            None => settings_from_database_url(&self.database_url)?,
        };
        let defaults = ServerConfig::default();
        let config = ServerConfig {
            port: self.grpc_port,
            enable: EnabledServices {
                all: self.enable_all,
                config: self.enable_szconfig,
                config_manager: self.enable_szconfigmanager,
                diagnostic: self.enable_szdiagnostic,
                engine: self.enable_szengine,
                product: self.enable_szproduct,
            },
            tls: TlsConfig {
                certificate_path: self.server_certificate_file,
                key_path: self.server_key_file,
                key_passphrase: self.server_key_passphrase,
                client_ca_paths: self.client_ca_certificate_path,
            },
            instance_name: self.engine_instance_name,
            settings,
            verbose_logging: self.engine_log_level,
            log_level: self.log_level,
            observer_origin: self.observer_origin,
            observer_urls: self.observer_url,
            avoid_serving: self.avoid_serving,
            observer: ObserverSettings {
                send_timeout: self.observer_timeout,
                ..ObserverSettings::default()
            },
            http: HttpConfig {
                enabled: self.enable_http,
                address: self.server_address,
                port: self.http_port,
                grpc_route_prefix: self.grpc_url_route_prefix,
                read_header_timeout: self.read_header_timeout,
                ..HttpConfig::default()
            },
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    sz_grpc_server::observability::init_tracing();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "Invalid configuration");
            return ExitCode::from(1);
        }
    };

    let mut server = match GrpcServer::new(config, Arc::new(MemoryEngineFactory::new())) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, "Invalid configuration");
            return ExitCode::from(1);
        }
    };

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, kind = err.kind(), "Server failed");
            ExitCode::from(2)
        }
    }
}
