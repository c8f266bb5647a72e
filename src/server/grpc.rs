//! gRPC server lifecycle.
//!
//! ```text
//!   Unconfigured ──initialize──▶ Initialized ──serve──▶ Serving
//!        ▲                            │                    │
//!        └────────── Stopped ◀──destroy────────────────────┘
//! ```
//!
//! `initialize` brings the enabled engine subdomains up in
//! [`Subdomain::INIT_ORDER`] and `destroy` tears them down in reverse.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::{Routes, RoutesBuilder};
use tonic::transport::{Server, ServerTlsConfig};

use super::tls::server_tls_config;
use crate::engine::settings::bootstrap_urls;
use crate::engine::{
    EngineBinding, EngineFactory, EngineLifecycle, InitArgs, LifecycleLock, SzConfig,
    SzConfigManager, SzDiagnostic, SzEngine, SzProduct,
};
use crate::grpc::{
    ConfigManagerService, ConfigService, DiagnosticService, EngineService, ProductService,
    SubdomainService,
};
use crate::observability::{LogLevel, MessageLogger, MessageTemplates};
use crate::observer::{observer_from_url, Observer};
use crate::proto::szconfig::sz_config_server::SzConfigServer;
use crate::proto::szconfigmanager::sz_config_manager_server::SzConfigManagerServer;
use crate::proto::szdiagnostic::sz_diagnostic_server::SzDiagnosticServer;
use crate::proto::szengine::sz_engine_server::SzEngineServer;
use crate::proto::szproduct::sz_product_server::SzProductServer;
use crate::proto::FILE_DESCRIPTOR_SET;
use crate::types::{Error, Result, ServerConfig, Subdomain};

pub const GRPC_SERVER_COMPONENT_ID: u32 = 6204;

const MESSAGES: MessageTemplates = &[
    (2000, "Entry"),
    (2001, "Enabled services"),
    (2002, "Enabling all services"),
    (2003, "Server listening at"),
    (2004, "Serving avoided"),
    (2005, "Subdomain initialized"),
    (2006, "Subdomain destroyed"),
    (2007, "Server stopped"),
    (3001, "Subdomain destroy failed"),
    (4001, "Failed to listen"),
    (4002, "Initialization failed"),
    (5001, "Failed to serve"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unconfigured,
    Initialized,
    Serving,
    Stopped,
}

/// Engine bindings for every subdomain, constructed eagerly.
#[derive(Debug)]
struct Bindings {
    config: Arc<EngineBinding<dyn SzConfig>>,
    config_manager: Arc<EngineBinding<dyn SzConfigManager>>,
    diagnostic: Arc<EngineBinding<dyn SzDiagnostic>>,
    engine: Arc<EngineBinding<dyn SzEngine>>,
    product: Arc<EngineBinding<dyn SzProduct>>,
}

impl Bindings {
    fn new(factory: &dyn EngineFactory, config: &ServerConfig) -> Self {
        let lock = LifecycleLock::new();
        let settings = &config.observer;
        Self {
            config: Arc::new(EngineBinding::new(
                Subdomain::Config,
                factory.config(),
                lock.clone(),
                settings.clone(),
            )),
            config_manager: Arc::new(EngineBinding::new(
                Subdomain::ConfigManager,
                factory.config_manager(),
                lock.clone(),
                settings.clone(),
            )),
            diagnostic: Arc::new(EngineBinding::new(
                Subdomain::Diagnostic,
                factory.diagnostic(),
                lock.clone(),
                settings.clone(),
            )),
            engine: Arc::new(EngineBinding::new(
                Subdomain::Engine,
                factory.engine(),
                lock.clone(),
                settings.clone(),
            )),
            product: Arc::new(EngineBinding::new(
                Subdomain::Product,
                factory.product(),
                lock,
                settings.clone(),
            )),
        }
    }
}

/// gRPC server owning the engine subdomains it serves.
pub struct GrpcServer {
    config: ServerConfig,
    factory: Arc<dyn EngineFactory>,
    logger: Arc<MessageLogger>,
    state: ServerState,
    bindings: Bindings,
    observers: Vec<Arc<dyn Observer>>,
    services: Vec<(Subdomain, Arc<dyn SubdomainService>)>,
    routes: Option<Routes>,
    tls: Option<ServerTlsConfig>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    /// Process-level stop signal; cancelling it ends serving for good.
    shutdown: CancellationToken,
    /// Child of `shutdown` for the current initialize/destroy cycle.
    session: CancellationToken,
}

impl GrpcServer {
    /// Validate `config` and construct the server. Nothing is initialized yet.
    pub fn new(config: ServerConfig, factory: Arc<dyn EngineFactory>) -> Result<Self> {
        config.validate()?;
        let logger = Arc::new(MessageLogger::new(GRPC_SERVER_COMPONENT_ID, "grpcserver.", MESSAGES));
        logger.set_log_level(&config.log_level)?;
        let bindings = Bindings::new(factory.as_ref(), &config);
        Ok(Self {
            config,
            factory,
            logger,
            state: ServerState::Unconfigured,
            bindings,
            observers: Vec::new(),
            services: Vec::new(),
            routes: None,
            tls: None,
            listener: None,
            local_addr: None,
            shutdown: CancellationToken::new(),
            session: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address of the bound listener, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Token that stops [`GrpcServer::serve`] when cancelled.
    ///
    /// The token lives as long as the server: one cancelled before or during
    /// `initialize` makes the next `serve` return immediately, and it stays
    /// valid across destroy and re-initialize.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Routes of the enabled services, for the HTTP bridge.
    pub fn routes(&self) -> Option<Routes> {
        self.routes.clone()
    }

    /// Control surface of an enabled subdomain.
    pub fn service(&self, subdomain: Subdomain) -> Option<Arc<dyn SubdomainService>> {
        self.services
            .iter()
            .find(|(s, _)| *s == subdomain)
            .map(|(_, service)| Arc::clone(service))
    }

    /// Subdomains currently initialized, in initialization order.
    pub fn initialized_subdomains(&self) -> Vec<Subdomain> {
        self.services.iter().map(|(s, _)| *s).collect()
    }

    /// Change the log level of the server and every enabled handler.
    pub fn set_log_level(&self, name: &str) -> Result<LogLevel> {
        let level = self.logger.set_log_level(name)?;
        for (_, service) in &self.services {
            service.set_log_level(name)?;
        }
        Ok(level)
    }

    /// Bring every enabled subdomain up and assemble the gRPC routes.
    ///
    /// A second call without an intervening [`GrpcServer::destroy`] is
    /// `conflict`. On failure, subdomains already initialized are destroyed.
    pub async fn initialize(&mut self) -> Result<()> {
        if matches!(self.state, ServerState::Initialized | ServerState::Serving) {
            return Err(Error::conflict("server is already initialized"));
        }
        self.logger.log(2000, self.config.redacted());
        if self.config.enable.all {
            self.logger.log(2002, "");
        }

        match self.bring_up().await {
            Ok(routes) => {
                self.routes = Some(routes);
                self.session = self.shutdown.child_token();
                self.state = ServerState::Initialized;
                self.logger.log(
                    2001,
                    format_args!("services={:?}", self.initialized_subdomains()),
                );
                Ok(())
            }
            Err(err) => {
                self.logger.log(4002, &err);
                let _ = self.tear_down().await;
                Err(err)
            }
        }
    }

    async fn bring_up(&mut self) -> Result<Routes> {
        self.observers = self
            .config
            .observer_urls
            .iter()
            .map(|url| observer_from_url(url, self.config.observer.send_timeout))
            .collect::<Result<_>>()?;

        let urls = bootstrap_urls(&self.config.settings)?;
        if !urls.is_empty() {
            let bootstrap = self.factory.datastore_bootstrap();
            tokio::task::spawn_blocking(move || bootstrap.bootstrap(&urls)).await??;
        }

        self.tls = server_tls_config(&self.config.tls)?;

        let args = InitArgs {
            instance_name: self.config.instance_name.clone(),
            settings: self.config.settings.clone(),
            verbose_logging: self.config.verbose_logging,
            config_id: None,
        };
        let mut routes = RoutesBuilder::default();
        for subdomain in self.config.enable.enabled() {
            match subdomain {
                Subdomain::Config => {
                    let binding = Arc::clone(&self.bindings.config);
                    let service = Arc::new(ConfigService::new(Arc::clone(&binding)));
                    self.enable(subdomain, &binding, service.clone(), &args).await?;
                    routes.add_service(SzConfigServer::from_arc(service));
                }
                Subdomain::ConfigManager => {
                    let binding = Arc::clone(&self.bindings.config_manager);
                    let service = Arc::new(ConfigManagerService::new(Arc::clone(&binding)));
                    self.enable(subdomain, &binding, service.clone(), &args).await?;
                    routes.add_service(SzConfigManagerServer::from_arc(service));
                }
                Subdomain::Diagnostic => {
                    let binding = Arc::clone(&self.bindings.diagnostic);
                    let service = Arc::new(DiagnosticService::new(Arc::clone(&binding)));
                    self.enable(subdomain, &binding, service.clone(), &args).await?;
                    routes.add_service(SzDiagnosticServer::from_arc(service));
                }
                Subdomain::Engine => {
                    let binding = Arc::clone(&self.bindings.engine);
                    let service = Arc::new(EngineService::new(
                        Arc::clone(&binding),
                        self.config.stream_channel_capacity,
                    ));
                    self.enable(subdomain, &binding, service.clone(), &args).await?;
                    routes.add_service(SzEngineServer::from_arc(service));
                }
                Subdomain::Product => {
                    let binding = Arc::clone(&self.bindings.product);
                    let service = Arc::new(ProductService::new(Arc::clone(&binding)));
                    self.enable(subdomain, &binding, service.clone(), &args).await?;
                    routes.add_service(SzProductServer::from_arc(service));
                }
            }
        }

        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|err| Error::internal(format!("reflection: {}", err)))?;
        routes.add_service(reflection);
        Ok(routes.routes())
    }

    /// Set the level, initialize the engine, then attach observers and origin.
    async fn enable<T>(
        &mut self,
        subdomain: Subdomain,
        binding: &Arc<EngineBinding<T>>,
        service: Arc<dyn SubdomainService>,
        args: &InitArgs,
    ) -> Result<()>
    where
        T: ?Sized + EngineLifecycle + 'static,
    {
        service.set_log_level(&self.config.log_level)?;

        let init = Arc::clone(binding);
        let init_args = args.clone();
        tokio::task::spawn_blocking(move || init.initialize(&init_args)).await??;
        self.services.push((subdomain, Arc::clone(&service)));

        for observer in &self.observers {
            service.register_observer(Arc::clone(observer)).await?;
        }
        service.set_observer_origin(&self.config.observer_origin).await;
        self.logger.log(2005, subdomain);
        Ok(())
    }

    /// Bind the listener without serving. Port 0 picks an ephemeral port.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr.filter(|_| self.listener.is_some()) {
            return Ok(addr);
        }
        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .map_err(|err| {
                self.logger.log(4001, format_args!("port={} error={}", self.config.port, err));
                Error::transport(format!("cannot listen on port {}: {}", self.config.port, err))
            })?;
        let addr = listener.local_addr()?;
        self.logger.log(2003, addr);
        self.local_addr = Some(addr);
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Serve until the shutdown token is cancelled.
    ///
    /// With `avoid_serving` the listener is bound and released and the call
    /// returns immediately.
    pub async fn serve(&mut self) -> Result<()> {
        if self.state != ServerState::Initialized {
            return Err(Error::unavailable("server is not initialized"));
        }
        let routes = self
            .routes
            .clone()
            .ok_or_else(|| Error::internal("initialized server has no routes"))?;
        self.bind().await?;
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::internal("listener missing after bind"))?;

        if self.config.avoid_serving {
            self.logger.log(2004, format_args!("port={}", self.config.port));
            return Ok(());
        }

        self.state = ServerState::Serving;
        let mut builder = Server::builder();
        if let Some(tls) = self.tls.clone() {
            builder = builder.tls_config(tls)?;
        }
        let result = builder
            .add_routes(routes)
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                self.session.clone().cancelled_owned(),
            )
            .await;
        if let Err(err) = &result {
            self.logger.log(5001, err);
        }
        self.logger.log(2007, "");
        result.map_err(Error::from)
    }

    /// Destroy the initialized subdomains in reverse order and drain their
    /// observer queues. Initialization becomes legal again afterwards.
    pub async fn destroy(&mut self) -> Result<()> {
        if self.state == ServerState::Unconfigured {
            return Err(Error::unavailable("server is not initialized"));
        }
        self.session.cancel();
        let result = self.tear_down().await;
        self.state = ServerState::Stopped;
        result
    }

    async fn tear_down(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some((subdomain, _)) = self.services.pop() {
            let outcome = match subdomain {
                Subdomain::Config => destroy_binding(&self.bindings.config).await,
                Subdomain::ConfigManager => destroy_binding(&self.bindings.config_manager).await,
                Subdomain::Diagnostic => destroy_binding(&self.bindings.diagnostic).await,
                Subdomain::Engine => destroy_binding(&self.bindings.engine).await,
                Subdomain::Product => destroy_binding(&self.bindings.product).await,
            };
            match outcome {
                Ok(()) => self.logger.log(2006, subdomain),
                Err(err) => {
                    self.logger.log(3001, format_args!("subdomain={} error={}", subdomain, err));
                    first_error.get_or_insert(err);
                }
            }
        }
        self.routes = None;
        self.listener = None;
        self.local_addr = None;
        self.observers.clear();
        first_error.map_or(Ok(()), Err)
    }

    /// Full lifecycle: initialize, serve (with the HTTP bridge when enabled)
    /// until the shutdown token fires, then destroy.
    pub async fn run(&mut self) -> Result<()> {
        self.initialize().await?;

        let bridge = if self.config.http.enabled {
            let routes = self
                .routes
                .clone()
                .ok_or_else(|| Error::internal("initialized server has no routes"))?;
            let mut http = super::HttpServer::new(
                self.config.http.clone(),
                routes,
                self.session.clone(),
            )?;
            if let Err(err) = http.bind().await {
                let _ = self.destroy().await;
                return Err(err);
            }
            Some(tokio::spawn(async move { http.serve().await }))
        } else {
            None
        };

        let served = self.serve().await;
        self.session.cancel();
        let bridged = match bridge {
            Some(task) => task.await.unwrap_or_else(|join| Err(Error::from(join))),
            None => Ok(()),
        };
        let destroyed = self.destroy().await;
        served.and(bridged).and(destroyed)
    }
}

async fn destroy_binding<T>(binding: &Arc<EngineBinding<T>>) -> Result<()>
where
    T: ?Sized + EngineLifecycle + 'static,
{
    binding.observers().shutdown().await;
    let binding = Arc::clone(binding);
    tokio::task::spawn_blocking(move || binding.destroy()).await?
}

impl std::fmt::Debug for GrpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcServer")
            .field("state", &self.state)
            .field("port", &self.config.port)
            .field("local_addr", &self.local_addr)
            .field("services", &self.initialized_subdomains())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::testing::SETTINGS;
    use crate::engine::memory::MemoryEngineFactory;
    use crate::types::EnabledServices;
    use tracing_test::traced_test;

    fn config() -> ServerConfig {
        ServerConfig {
            port: 0,
            enable: EnabledServices::all(),
            settings: SETTINGS.to_string(),
            ..ServerConfig::default()
        }
    }

    fn server(config: ServerConfig) -> GrpcServer {
        GrpcServer::new(config, Arc::new(MemoryEngineFactory::new())).unwrap()
    }

    #[test]
    fn test_no_services_enabled_is_bad_input() {
        let config = ServerConfig {
            enable: EnabledServices::default(),
            ..config()
        };
        let err = GrpcServer::new(config, Arc::new(MemoryEngineFactory::new())).unwrap_err();
        assert_eq!(err.kind(), "bad-input");
    }

    #[tokio::test]
    async fn test_initialize_follows_init_order() {
        let mut server = server(config());
        server.initialize().await.unwrap();
        assert_eq!(server.state(), ServerState::Initialized);
        assert_eq!(server.initialized_subdomains(), Subdomain::INIT_ORDER.to_vec());
        assert!(server.routes().is_some());
        server.destroy().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.initialized_subdomains().is_empty());
    }

    #[tokio::test]
    async fn test_partial_enablement_keeps_order() {
        let mut server = server(ServerConfig {
            enable: EnabledServices {
                product: true,
                config: true,
                ..EnabledServices::default()
            },
            ..config()
        });
        server.initialize().await.unwrap();
        assert_eq!(
            server.initialized_subdomains(),
            vec![Subdomain::Config, Subdomain::Product]
        );
        assert!(server.service(Subdomain::Engine).is_none());
        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_initialize_is_conflict() {
        let mut server = server(config());
        server.initialize().await.unwrap();
        let err = server.initialize().await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        server.destroy().await.unwrap();
        server.initialize().await.unwrap();
        assert_eq!(server.state(), ServerState::Initialized);
        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_before_initialize_is_unavailable() {
        let mut server = server(config());
        assert_eq!(server.serve().await.unwrap_err().kind(), "unavailable");
        assert_eq!(server.destroy().await.unwrap_err().kind(), "unavailable");
    }

    #[tokio::test]
    async fn test_failed_initialize_rolls_back() {
        // A non-shared-cache datastore is not bootstrapped, so no default
        // configuration exists when Diagnostic initializes.
        let mut server = server(ServerConfig {
            settings: r#"{"SQL":{"CONNECTION":"postgresql://user:pw@db:5432:G2"}}"#.to_string(),
            ..config()
        });
        let err = server.initialize().await.unwrap_err();
        assert_eq!(err.kind(), "engine");
        assert!(server.initialized_subdomains().is_empty());
        assert_eq!(server.state(), ServerState::Unconfigured);
    }

    #[tokio::test]
    async fn test_set_log_level_reaches_handlers() {
        let mut server = server(config());
        server.initialize().await.unwrap();
        assert_eq!(server.set_log_level("DEBUG").unwrap(), LogLevel::Debug);
        let product = server.service(Subdomain::Product).unwrap();
        assert_eq!(product.logger().log_level(), LogLevel::Debug);
        assert_eq!(server.set_log_level("LOUD").unwrap_err().kind(), "bad-input");
        server.destroy().await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_avoid_serving_returns_after_bind() {
        let mut server = server(ServerConfig {
            avoid_serving: true,
            ..config()
        });
        server.initialize().await.unwrap();
        server.serve().await.unwrap();

        assert!(server.local_addr().is_some());
        assert_eq!(server.state(), ServerState::Initialized);
        assert!(logs_contain("SZSDK62042004"));
        assert!(logs_contain("Serving avoided"));
        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_serving() {
        let mut server = server(config());
        server.initialize().await.unwrap();
        let shutdown = server.shutdown_token();
        let handle = tokio::spawn(async move {
            let result = server.serve().await;
            (server, result)
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.cancel();

        let (mut server, result) = handle.await.unwrap();
        result.unwrap();
        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_initialize_is_honoured() {
        let mut server = server(config());
        let shutdown = server.shutdown_token();
        shutdown.cancel();
        server.initialize().await.unwrap();

        let served = tokio::time::timeout(std::time::Duration::from_secs(2), server.serve()).await;
        assert!(matches!(served, Ok(Ok(()))));
        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_survives_reinitialize() {
        let mut server = server(config());
        let shutdown = server.shutdown_token();
        server.initialize().await.unwrap();
        server.destroy().await.unwrap();
        server.initialize().await.unwrap();

        let handle = tokio::spawn(async move {
            let result = server.serve().await;
            (server, result)
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.cancel();

        let (mut server, result) = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        result.unwrap();
        server.destroy().await.unwrap();
    }
}
