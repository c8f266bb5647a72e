//! gRPC service implementations.
//!
//! One handler per engine subdomain:
//! - ConfigService - configuration documents addressed by handle
//! - ConfigManagerService - the persisted configuration repository
//! - DiagnosticService - datastore diagnostics and purge
//! - EngineService - record ingestion, entity queries, exports
//! - ProductService - license and version
//!
//! Every handler also implements [`SubdomainService`], the control surface
//! (log level, observers) the server drives during initialization.

pub mod config_service;
pub mod configmanager_service;
pub mod diagnostic_service;
pub mod engine_service;
pub mod product_service;
mod support;

pub use config_service::ConfigService;
pub use configmanager_service::ConfigManagerService;
pub use diagnostic_service::DiagnosticService;
pub use engine_service::EngineService;
pub use product_service::ProductService;
pub use support::SubdomainService;
