//! In-process engine backend.
//!
//! Implements all five subdomain traits against one shared in-memory
//! repository. The binary and the tests run against it; a native engine
//! binding would implement the same traits.

mod config;
mod configmanager;
mod diagnostic;
pub mod document;
mod engine;
mod product;
mod resolver;

pub use config::MemoryConfig;
pub use configmanager::MemoryConfigManager;
pub use diagnostic::MemoryDiagnostic;
pub use engine::MemoryEngine;
pub use product::MemoryProduct;

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use self::document::ConfigDocument;
use self::resolver::EntityStore;
use super::settings::EngineSettings;
use super::{
    DatastoreBootstrap, EngineFactory, InitArgs, SzConfig, SzConfigManager, SzDiagnostic, SzEngine,
    SzProduct,
};
use crate::types::{ConfigId, Error, Result};

/// Engine code: no default configuration registered.
pub const ERR_NO_DEFAULT_CONFIG: i64 = 7221;
/// Engine code: purge attempted without the purge privilege.
pub const ERR_PURGE_NOT_PERMITTED: i64 = 7245;
/// Engine code: purge attempted while other work is in flight.
pub const ERR_PURGE_BUSY: i64 = 7246;
/// Engine code: record names a data source missing from the active configuration.
pub const ERR_UNKNOWN_DATA_SOURCE: i64 = 2207;

#[derive(Debug, Clone)]
pub(crate) struct StoredConfig {
    pub definition: String,
    pub document: ConfigDocument,
    pub comment: String,
    pub created: DateTime<Utc>,
}

/// Workload counters reported by `GetStats`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Workload {
    pub added_records: u64,
    pub deleted_records: u64,
    pub reevaluations: u64,
    pub redo_triggers: u64,
    pub processed_redo: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RepoState {
    pub configs: BTreeMap<i64, StoredConfig>,
    pub next_config_id: i64,
    pub default_config_id: i64,
    pub active_config_id: i64,
    pub active_codes: HashSet<String>,
    pub store: EntityStore,
    pub redo: VecDeque<String>,
    pub exports: HashMap<i64, VecDeque<String>>,
    pub next_export_handle: i64,
    pub workload: Workload,
}

impl RepoState {
    /// Point the engine at `config_id`, which must exist.
    pub fn activate(&mut self, config_id: i64) -> Result<()> {
        let config = self
            .configs
            .get(&config_id)
            .ok_or_else(|| Error::not_found(format!("configuration {} does not exist", config_id)))?;
        self.active_codes = config.document.codes();
        self.active_config_id = config_id;
        Ok(())
    }

    /// Activate the requested configuration, or the default one.
    pub fn activate_for_init(&mut self, requested: Option<ConfigId>) -> Result<()> {
        let config_id = match requested {
            Some(id) => id.get(),
            None if self.default_config_id > 0 => self.default_config_id,
            None => {
                return Err(Error::engine(
                    ERR_NO_DEFAULT_CONFIG,
                    "no default configuration ID is registered",
                ))
            }
        };
        self.activate(config_id)
    }

    pub fn store_config(&mut self, definition: &str, document: ConfigDocument, comment: &str) -> i64 {
        if let Some((id, _)) = self.configs.iter().find(|(_, c)| c.document == document) {
            return *id;
        }
        self.next_config_id += 1;
        let id = self.next_config_id;
        self.configs.insert(
            id,
            StoredConfig {
                definition: definition.to_string(),
                document,
                comment: comment.to_string(),
                created: Utc::now(),
            },
        );
        id
    }
}

/// State shared by all subdomains of one factory.
#[derive(Debug, Default)]
pub(crate) struct Repository {
    state: Mutex<RepoState>,
    in_flight: AtomicUsize,
}

impl Repository {
    pub fn lock(&self) -> MutexGuard<'_, RepoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a data-plane call as in flight for the guard's lifetime.
    pub fn busy(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

pub(crate) struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a subdomain remembers from `initialize`.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub instance_name: String,
    pub settings: EngineSettings,
}

#[derive(Debug, Default)]
pub(crate) struct SessionSlot(Mutex<Option<Session>>);

impl SessionSlot {
    pub fn open(&self, args: &InitArgs) -> Result<Session> {
        let session = Session {
            instance_name: args.instance_name.clone(),
            settings: EngineSettings::parse(&args.settings)?,
        };
        *self.guard() = Some(session.clone());
        Ok(session)
    }

    pub fn close(&self) -> Result<()> {
        match self.guard().take() {
            Some(_) => Ok(()),
            None => Err(Error::unavailable("engine is not initialized")),
        }
    }

    pub fn current(&self) -> Result<Session> {
        self.guard()
            .clone()
            .ok_or_else(|| Error::unavailable("engine is not initialized"))
    }

    fn guard(&self) -> MutexGuard<'_, Option<Session>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Installs the template configuration as the default in a fresh repository.
#[derive(Debug)]
pub struct MemoryBootstrap {
    repo: Arc<Repository>,
}

impl DatastoreBootstrap for MemoryBootstrap {
    fn bootstrap(&self, database_urls: &[String]) -> Result<()> {
        if database_urls.is_empty() {
            return Err(Error::bad_input("no database URL to bootstrap"));
        }
        let mut state = self.repo.lock();
        if state.default_config_id == 0 {
            let template = ConfigDocument::template();
            let definition = template.to_json();
            let id = state.store_config(&definition, template, "Template configuration");
            state.default_config_id = id;
        }
        Ok(())
    }
}

/// Factory handing out the in-process subdomains, all sharing one repository.
#[derive(Debug, Clone)]
pub struct MemoryEngineFactory {
    config: Arc<MemoryConfig>,
    config_manager: Arc<MemoryConfigManager>,
    diagnostic: Arc<MemoryDiagnostic>,
    engine: Arc<MemoryEngine>,
    product: Arc<MemoryProduct>,
    bootstrap: Arc<MemoryBootstrap>,
}

impl MemoryEngineFactory {
    pub fn new() -> Self {
        let repo = Arc::new(Repository::default());
        Self {
            config: Arc::new(MemoryConfig::new()),
            config_manager: Arc::new(MemoryConfigManager::new(Arc::clone(&repo))),
            diagnostic: Arc::new(MemoryDiagnostic::new(Arc::clone(&repo))),
            engine: Arc::new(MemoryEngine::new(Arc::clone(&repo))),
            product: Arc::new(MemoryProduct::new()),
            bootstrap: Arc::new(MemoryBootstrap { repo }),
        }
    }
}

impl Default for MemoryEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineFactory for MemoryEngineFactory {
    fn config(&self) -> Arc<dyn SzConfig> {
        self.config.clone()
    }

    fn config_manager(&self) -> Arc<dyn SzConfigManager> {
        self.config_manager.clone()
    }

    fn diagnostic(&self) -> Arc<dyn SzDiagnostic> {
        self.diagnostic.clone()
    }

    fn engine(&self) -> Arc<dyn SzEngine> {
        self.engine.clone()
    }

    fn product(&self) -> Arc<dyn SzProduct> {
        self.product.clone()
    }

    fn datastore_bootstrap(&self) -> Arc<dyn DatastoreBootstrap> {
        self.bootstrap.clone()
    }
}
