//! Configuration structures.
//!
//! Configuration is assembled by the binary from flags and
//! `SENZING_TOOLS_*` environment variables, then treated as immutable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{Error, Result};

/// Default gRPC listen port.
pub const DEFAULT_GRPC_PORT: u16 = 8258;

/// Default HTTP bridge listen port.
pub const DEFAULT_HTTP_PORT: u16 = 8261;

/// Default URL prefix for gRPC-over-HTTP.
pub const DEFAULT_GRPC_ROUTE_PREFIX: &str = "grpc";

const REDACTED: &str = "****";

/// Engine subdomains served by this process, in initialization order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subdomain {
    Config,
    ConfigManager,
    Diagnostic,
    Engine,
    Product,
}

impl Subdomain {
    /// All subdomains in the order they must be initialized.
    pub const INIT_ORDER: [Subdomain; 5] = [
        Subdomain::Config,
        Subdomain::ConfigManager,
        Subdomain::Diagnostic,
        Subdomain::Engine,
        Subdomain::Product,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subdomain::Config => "SzConfig",
            Subdomain::ConfigManager => "SzConfigManager",
            Subdomain::Diagnostic => "SzDiagnostic",
            Subdomain::Engine => "SzEngine",
            Subdomain::Product => "SzProduct",
        }
    }
}

impl fmt::Display for Subdomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC TCP port. Port 0 binds an ephemeral port.
    pub port: u16,

    /// Which subdomain handlers to register.
    #[serde(default)]
    pub enable: EnabledServices,

    /// Transport credentials.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Label attached to engine log output.
    pub instance_name: String,

    /// Opaque engine settings document.
    pub settings: String,

    /// Engine verbose-logging level.
    pub verbose_logging: i64,

    /// Initial log level name for every handler.
    pub log_level: String,

    /// Origin label stamped on observer events.
    pub observer_origin: String,

    /// Observer endpoint URIs (`grpc://` or `http(s)://`).
    #[serde(default)]
    pub observer_urls: Vec<String>,

    /// Perform all initialization and bind, but do not block in accept.
    #[serde(default)]
    pub avoid_serving: bool,

    /// Observer delivery tuning.
    #[serde(default)]
    pub observer: ObserverSettings,

    /// Bounded channel capacity for server-streaming responses.
    pub stream_channel_capacity: usize,

    /// Optional gRPC-over-HTTP bridge.
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_GRPC_PORT,
            enable: EnabledServices::default(),
            tls: TlsConfig::default(),
            instance_name: "serve-grpc".to_string(),
            settings: String::new(),
            verbose_logging: 0,
            log_level: "INFO".to_string(),
            observer_origin: String::new(),
            observer_urls: Vec::new(),
            avoid_serving: false,
            observer: ObserverSettings::default(),
            stream_channel_capacity: 16,
            http: HttpConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Check the invariants that must hold before the server is constructed.
    pub fn validate(&self) -> Result<()> {
        if self.enable.enabled().is_empty() {
            return Err(Error::bad_input(
                "at least one service must be enabled (e.g. --enable-all)",
            ));
        }
        if self.tls.certificate_path.is_some() && self.tls.key_path.is_none() {
            return Err(Error::bad_input(
                "a server key file is required when a server certificate file is given",
            ));
        }
        if self.instance_name.trim().is_empty() {
            return Err(Error::bad_input("engine instance name must not be empty"));
        }
        if self.settings.trim().is_empty() {
            return Err(Error::bad_input("engine settings must not be empty"));
        }
        if self.stream_channel_capacity == 0 {
            return Err(Error::bad_input("stream channel capacity must be positive"));
        }
        if self.observer.queue_capacity == 0 {
            return Err(Error::bad_input("observer queue capacity must be positive"));
        }
        Ok(())
    }

    /// JSON view of the configuration with secrets masked, for entry logs.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(tls) = value.get_mut("tls") {
            if let Some(passphrase) = tls.get_mut("key_passphrase") {
                if !passphrase.is_null() {
                    *passphrase = serde_json::Value::String(REDACTED.to_string());
                }
            }
        }
        if let Some(settings) = value.get_mut("settings") {
            *settings = serde_json::Value::String(redact_settings(&self.settings));
        }
        value
    }
}

/// Mask `user:password@` credentials inside connection strings.
fn redact_settings(settings: &str) -> String {
    let mut out = String::with_capacity(settings.len());
    let mut rest = settings;
    while let Some(scheme_end) = rest.find("://") {
        let (head, tail) = rest.split_at(scheme_end + 3);
        out.push_str(head);
        let authority_end = tail
            .find(|c: char| c == '/' || c == '"' || c == '?')
            .unwrap_or(tail.len());
        let authority = &tail[..authority_end];
        match authority.rfind('@') {
            Some(at) => {
                let userinfo = &authority[..at];
                match userinfo.find(':') {
                    Some(colon) => {
                        out.push_str(&userinfo[..colon + 1]);
                        out.push_str(REDACTED);
                    }
                    None => out.push_str(userinfo),
                }
                out.push_str(&authority[at..]);
            }
            None => out.push_str(authority),
        }
        rest = &tail[authority_end..];
    }
    out.push_str(rest);
    out
}

/// Subdomain enablement flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnabledServices {
    pub all: bool,
    pub config: bool,
    pub config_manager: bool,
    pub diagnostic: bool,
    pub engine: bool,
    pub product: bool,
}

impl EnabledServices {
    /// Shorthand for `--enable-all`.
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self, subdomain: Subdomain) -> bool {
        self.all
            || match subdomain {
                Subdomain::Config => self.config,
                Subdomain::ConfigManager => self.config_manager,
                Subdomain::Diagnostic => self.diagnostic,
                Subdomain::Engine => self.engine,
                Subdomain::Product => self.product,
            }
    }

    /// Enabled subdomains in initialization order.
    pub fn enabled(&self) -> Vec<Subdomain> {
        Subdomain::INIT_ORDER
            .iter()
            .copied()
            .filter(|s| self.is_enabled(*s))
            .collect()
    }
}

/// Transport credentials.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM server certificate chain.
    pub certificate_path: Option<PathBuf>,

    /// PEM server private key (PKCS#8, optionally encrypted).
    pub key_path: Option<PathBuf>,

    /// Passphrase for an encrypted private key.
    pub key_passphrase: Option<String>,

    /// Client CA certificates; non-empty enables mutual TLS.
    #[serde(default)]
    pub client_ca_paths: Vec<PathBuf>,
}

impl TlsConfig {
    pub fn is_configured(&self) -> bool {
        self.certificate_path.is_some() || self.key_path.is_some()
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("certificate_path", &self.certificate_path)
            .field("key_path", &self.key_path)
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| REDACTED))
            .field("client_ca_paths", &self.client_ca_paths)
            .finish()
    }
}

/// Observer delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverSettings {
    /// Bounded queue length per sink. Events beyond it are dropped.
    pub queue_capacity: usize,

    /// Minimum spacing between repeated delivery-failure warnings.
    #[serde(with = "humantime_serde")]
    pub failure_window: Duration,

    /// Per-event delivery timeout for remote sinks.
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            failure_window: Duration::from_secs(60),
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// gRPC-over-HTTP bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub enabled: bool,

    /// Interface to bind.
    pub address: String,

    /// TCP port. Port 0 binds an ephemeral port.
    pub port: u16,

    /// Path prefix under which gRPC-Web requests are accepted.
    pub grpc_route_prefix: String,

    /// Upper bound on the time a client may take to send request headers.
    #[serde(with = "humantime_serde")]
    pub read_header_timeout: Duration,

    /// Maximum concurrent HTTP connections.
    pub max_connections: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "0.0.0.0".to_string(),
            port: DEFAULT_HTTP_PORT,
            grpc_route_prefix: DEFAULT_GRPC_ROUTE_PREFIX.to_string(),
            read_header_timeout: Duration::from_secs(10),
            max_connections: 1000,
        }
    }
}
