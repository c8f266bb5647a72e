//! # sz-grpc-server - gRPC facade for an entity-resolution engine
//!
//! Serves the engine's five subdomains (Config, ConfigManager, Diagnostic,
//! Engine, Product) over native gRPC and, optionally, as gRPC-Web over
//! HTTP/1.1:
//! - One handler per subdomain translating requests into engine calls
//! - A lifecycle manager initializing each subdomain exactly once, in order
//! - Observer fan-out of per-call events to remote sinks
//! - Message-id logging with enter/exit tracing at `TRACE`
//!
//! ## Architecture
//!
//! ```text
//!   gRPC / gRPC-Web  →  ┌──────────────────────────────────┐
//!                       │  ConfigService  EngineService ...│  grpc
//!                       └───────────────┬──────────────────┘
//!                                       │ spawn_blocking
//!                       ┌───────────────▼──────────────────┐
//!                       │  EngineBinding<dyn SzX>          │  engine
//!                       │  (lifecycle lock, observers)     │
//!                       └───────────────┬──────────────────┘
//!                                       │
//!                               engine backend
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod engine;
pub mod grpc;
pub mod observer;
pub mod proto;
pub mod server;
pub mod types;

// Internal utilities
pub mod observability;

pub use server::{GrpcServer, HttpServer, ServerState};
pub use types::{Error, Result, ServerConfig};
