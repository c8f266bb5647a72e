//! Core types for the server.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed handles and identifiers (ConfigHandle, ConfigId, etc.)
//! - **Errors**: Error kinds shared by handlers, lifecycle and transports
//! - **Config**: Server, TLS, observer and HTTP bridge configuration

mod config;
mod errors;
mod ids;

pub use config::{
    EnabledServices, HttpConfig, ObserverSettings, ServerConfig, Subdomain, TlsConfig,
    DEFAULT_GRPC_PORT, DEFAULT_GRPC_ROUTE_PREFIX, DEFAULT_HTTP_PORT,
};
pub use errors::{Error, Result, ResultExt, ENGINE_CODE_METADATA, ERROR_KIND_METADATA};
pub use ids::{ConfigHandle, ConfigId, CorrelationId, EntityId, ExportHandle};
