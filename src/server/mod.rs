//! Server lifecycle and transports.
//!
//! [`GrpcServer`] owns the engine subdomains and the native gRPC listener;
//! [`HttpServer`] optionally bridges the same routes over HTTP/1.1 as
//! gRPC-Web.

mod grpc;
mod http;
pub mod tls;

pub use grpc::{GrpcServer, ServerState, GRPC_SERVER_COMPONENT_ID};
pub use http::{HttpServer, HTTP_SERVER_COMPONENT_ID};
