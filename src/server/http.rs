//! gRPC-over-HTTP bridge.
//!
//! One axum router: gRPC-Web requests under `/<prefix>/` have the prefix
//! stripped and go to the gRPC routes wrapped in [`GrpcWebLayer`];
//! everything else, including non-gRPC requests under the prefix, is
//! answered by the default handlers.

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;
use tonic_web::{GrpcWebLayer, GrpcWebService};
use tower::{Layer, ServiceExt};

use crate::observability::{MessageLogger, MessageTemplates};
use crate::types::{Error, HttpConfig, Result};

pub const HTTP_SERVER_COMPONENT_ID: u32 = 6042;

const MESSAGES: MessageTemplates = &[
    (1000, "gRPC Web request"),
    (1001, "HTTP Web request"),
    (2001, "Starting HTTP server on interface:port"),
    (2002, "Serving GRPC over HTTP at"),
    (2003, "HTTP server stopped"),
    (3001, "Connection rejected at max connections"),
    (3002, "Connection error"),
    (4001, "Failed to listen"),
];

#[derive(Clone)]
struct BridgeState {
    grpc_web: GrpcWebService<Routes>,
    logger: Arc<MessageLogger>,
}

/// HTTP server fronting the gRPC routes.
pub struct HttpServer {
    config: HttpConfig,
    prefix: String,
    router: Router,
    logger: Arc<MessageLogger>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
}

impl HttpServer {
    pub fn new(config: HttpConfig, routes: Routes, shutdown: CancellationToken) -> Result<Self> {
        let prefix = config.grpc_route_prefix.trim_matches('/').to_string();
        if prefix.is_empty() {
            return Err(Error::bad_input("gRPC route prefix must not be empty"));
        }
        let logger = Arc::new(MessageLogger::new(HTTP_SERVER_COMPONENT_ID, "httpserver.", MESSAGES));
        let router = router(&prefix, routes, Arc::clone(&logger));
        Ok(Self {
            config,
            prefix,
            router,
            logger,
            listener: None,
            local_addr: None,
            shutdown,
        })
    }

    pub fn logger(&self) -> &Arc<MessageLogger> {
        &self.logger
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener. Port 0 picks an ephemeral port.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr.filter(|_| self.listener.is_some()) {
            return Ok(addr);
        }
        let interface = format!("{}:{}", self.config.address, self.config.port);
        self.logger.log(2001, &interface);
        let listener = TcpListener::bind(&interface).await.map_err(|err| {
            self.logger.log(4001, format_args!("address={} error={}", interface, err));
            Error::transport(format!("cannot listen on {}: {}", interface, err))
        })?;
        let addr = listener.local_addr()?;
        self.logger
            .log(2002, format_args!("http://localhost:{}/{}", addr.port(), self.prefix));
        self.local_addr = Some(addr);
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Accept connections until the shutdown token is cancelled, then let
    /// open connections finish their in-flight requests.
    pub async fn serve(&mut self) -> Result<()> {
        self.bind().await?;
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::internal("listener missing after bind"))?;
        let permits = Arc::new(Semaphore::new(self.config.max_connections.max(1)));
        let mut connections = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            self.logger.log(3002, format_args!("accept error={}", err));
                            continue;
                        }
                    };
                    let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                        self.logger.log(
                            3001,
                            format_args!("peer={} max_connections={}", peer, self.config.max_connections),
                        );
                        drop(stream);
                        continue;
                    };

                    let service = TowerToHyperService::new(self.router.clone());
                    let mut builder = http1::Builder::new();
                    builder
                        .timer(TokioTimer::new())
                        .header_read_timeout(self.config.read_header_timeout);
                    let shutdown = self.shutdown.clone();
                    let logger = Arc::clone(&self.logger);
                    connections.spawn(async move {
                        let _permit = permit;
                        let connection = builder.serve_connection(TokioIo::new(stream), service);
                        tokio::pin!(connection);
                        let result = tokio::select! {
                            result = connection.as_mut() => result,
                            _ = shutdown.cancelled() => {
                                connection.as_mut().graceful_shutdown();
                                connection.as_mut().await
                            }
                        };
                        if let Err(err) = result {
                            logger.log(3002, format_args!("peer={} error={}", peer, err));
                        }
                    });
                }
            }
            while connections.try_join_next().is_some() {}
        }

        while connections.join_next().await.is_some() {}
        self.logger.log(2003, "");
        Ok(())
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("config", &self.config)
            .field("prefix", &self.prefix)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeState").finish_non_exhaustive()
    }
}

fn router(prefix: &str, routes: Routes, logger: Arc<MessageLogger>) -> Router {
    let state = BridgeState {
        grpc_web: GrpcWebLayer::new().layer(routes),
        logger,
    };
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route(&format!("/{}/*path", prefix), any(bridge))
        .fallback(not_found)
        .with_state(state)
}

/// True for `application/grpc`, `application/grpc-web` and their `+proto`
/// or `-text` variants.
fn is_grpc(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/grpc"))
        .unwrap_or(false)
}

async fn bridge(
    State(state): State<BridgeState>,
    Path(path): Path<String>,
    request: Request,
) -> Response {
    if !is_grpc(&request) {
        state.logger.log(1001, request.uri());
        return not_found().await.into_response();
    }
    state.logger.log(1000, request.uri());

    // The gRPC routes match on `/package.Service/Method`, without the prefix.
    let (mut parts, body) = request.into_parts();
    let target = match parts.uri.query() {
        Some(query) => format!("/{}?{}", path, query),
        None => format!("/{}", path),
    };
    parts.uri = match target.parse() {
        Ok(uri) => uri,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid path").into_response(),
    };
    match state
        .grpc_web
        .oneshot(Request::from_parts(parts, tonic::body::boxed(body)))
        .await
    {
        Ok(response) => response.map(Body::new),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn index() -> Html<&'static str> {
    Html(concat!(
        "<!DOCTYPE html><html><head><title>serve-grpc</title></head><body>",
        "<h1>serve-grpc</h1><p>gRPC and gRPC-Web facade for the entity-resolution engine.</p>",
        "<p><a href=\"/healthz\">healthz</a></p></body></html>"
    ))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}
