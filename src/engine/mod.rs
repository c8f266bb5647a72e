//! Engine capability model.
//!
//! The entity-resolution engine is consumed through one trait per subdomain.
//! Engine calls are blocking; handlers run them on the blocking thread pool.
//! Lifecycle (initialize/destroy) is owned by [`EngineBinding`], which the
//! server constructs eagerly and hands to the service handlers.

mod binding;
pub mod flags;
pub mod memory;
pub mod settings;

pub use binding::{BindingState, EngineBinding, LifecycleLock};

use std::sync::Arc;

use crate::types::{ConfigHandle, ConfigId, EntityId, ExportHandle, Result};

/// Arguments shared by every subdomain initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct InitArgs {
    pub instance_name: String,
    pub settings: String,
    pub verbose_logging: i64,
    /// Configuration to activate; `None` uses the repository default.
    pub config_id: Option<ConfigId>,
}

/// Lifecycle common to all subdomains.
pub trait EngineLifecycle: Send + Sync {
    fn initialize(&self, args: &InitArgs) -> Result<()>;
    fn destroy(&self) -> Result<()>;
}

/// In-memory configuration documents addressed by handle.
pub trait SzConfig: EngineLifecycle {
    fn create_config(&self) -> Result<ConfigHandle>;
    fn import_config(&self, config_definition: &str) -> Result<ConfigHandle>;
    fn export_config(&self, handle: ConfigHandle) -> Result<String>;
    /// Returns `{"DSRC_ID":n}`.
    fn add_data_source(&self, handle: ConfigHandle, data_source_code: &str) -> Result<String>;
    fn delete_data_source(&self, handle: ConfigHandle, data_source_code: &str) -> Result<()>;
    fn get_data_sources(&self, handle: ConfigHandle) -> Result<String>;
    fn close_config(&self, handle: ConfigHandle) -> Result<()>;
}

/// Persisted configurations and the default configuration pointer.
pub trait SzConfigManager: EngineLifecycle {
    fn add_config(&self, config_definition: &str, config_comment: &str) -> Result<ConfigId>;
    fn get_config(&self, config_id: ConfigId) -> Result<String>;
    fn get_configs(&self) -> Result<String>;
    /// Returns 0 when no default is set.
    fn get_default_config_id(&self) -> Result<i64>;
    /// Compare-and-swap on the default pointer.
    fn replace_default_config_id(&self, current_default_config_id: i64, new_default_config_id: ConfigId) -> Result<()>;
    fn set_default_config_id(&self, config_id: ConfigId) -> Result<()>;
}

pub trait SzDiagnostic: EngineLifecycle {
    fn check_datastore_performance(&self, seconds_to_run: i32) -> Result<String>;
    fn get_datastore_info(&self) -> Result<String>;
    fn get_feature(&self, feature_id: i64) -> Result<String>;
    fn purge_repository(&self) -> Result<()>;
    fn reinitialize(&self, config_id: ConfigId) -> Result<()>;
}

/// Record ingestion and entity queries.
///
/// `flags` are the bit flags from [`flags`]; methods returning "info" return
/// an empty string unless `SZ_WITH_INFO` is set.
pub trait SzEngine: EngineLifecycle {
    fn add_record(&self, data_source_code: &str, record_id: &str, record_definition: &str, flags: i64) -> Result<String>;
    fn replace_record(&self, data_source_code: &str, record_id: &str, record_definition: &str, flags: i64) -> Result<String>;
    fn delete_record(&self, data_source_code: &str, record_id: &str, flags: i64) -> Result<String>;
    fn get_record(&self, data_source_code: &str, record_id: &str, flags: i64) -> Result<String>;
    fn get_entity_by_entity_id(&self, entity_id: EntityId, flags: i64) -> Result<String>;
    fn get_entity_by_record_id(&self, data_source_code: &str, record_id: &str, flags: i64) -> Result<String>;
    fn search_by_attributes(&self, attributes: &str, search_profile: &str, flags: i64) -> Result<String>;
    fn find_path_by_entity_id(
        &self,
        start_entity_id: EntityId,
        end_entity_id: EntityId,
        max_degrees: i64,
        avoid_entity_ids: &str,
        flags: i64,
    ) -> Result<String>;
    fn find_path_by_record_id(
        &self,
        start_data_source_code: &str,
        start_record_id: &str,
        end_data_source_code: &str,
        end_record_id: &str,
        max_degrees: i64,
        flags: i64,
    ) -> Result<String>;
    fn find_network_by_entity_id(
        &self,
        entity_ids: &str,
        max_degrees: i64,
        build_out_degrees: i64,
        build_out_max_entities: i64,
        flags: i64,
    ) -> Result<String>;
    fn why_entities(&self, entity_id_1: EntityId, entity_id_2: EntityId, flags: i64) -> Result<String>;
    fn why_records(
        &self,
        data_source_code_1: &str,
        record_id_1: &str,
        data_source_code_2: &str,
        record_id_2: &str,
        flags: i64,
    ) -> Result<String>;
    fn how_entity_by_entity_id(&self, entity_id: EntityId, flags: i64) -> Result<String>;
    fn reevaluate_entity(&self, entity_id: EntityId, flags: i64) -> Result<String>;
    fn reevaluate_record(&self, data_source_code: &str, record_id: &str, flags: i64) -> Result<String>;
    fn count_redo_records(&self) -> Result<i64>;
    /// Next pending redo record, or an empty string when none is queued.
    fn get_redo_record(&self) -> Result<String>;
    fn process_redo_record(&self, redo_record: &str, flags: i64) -> Result<String>;
    fn get_active_config_id(&self) -> Result<i64>;
    fn get_stats(&self) -> Result<String>;
    fn prime_engine(&self) -> Result<()>;
    fn reinitialize(&self, config_id: ConfigId) -> Result<()>;
    fn export_json_entity_report(&self, flags: i64) -> Result<ExportHandle>;
    fn export_csv_entity_report(&self, csv_column_list: &str, flags: i64) -> Result<ExportHandle>;
    /// Next export row, or an empty string once the export is exhausted.
    fn fetch_next(&self, export_handle: ExportHandle) -> Result<String>;
    fn close_export(&self, export_handle: ExportHandle) -> Result<()>;
}

pub trait SzProduct: EngineLifecycle {
    fn get_license(&self) -> Result<String>;
    fn get_version(&self) -> Result<String>;
}

/// Prepares an embedded datastore before any subdomain initializes.
pub trait DatastoreBootstrap: Send + Sync {
    fn bootstrap(&self, database_urls: &[String]) -> Result<()>;
}

/// Source of the engine subdomains for one server process.
pub trait EngineFactory: Send + Sync {
    fn config(&self) -> Arc<dyn SzConfig>;
    fn config_manager(&self) -> Arc<dyn SzConfigManager>;
    fn diagnostic(&self) -> Arc<dyn SzDiagnostic>;
    fn engine(&self) -> Arc<dyn SzEngine>;
    fn product(&self) -> Arc<dyn SzProduct>;
    fn datastore_bootstrap(&self) -> Arc<dyn DatastoreBootstrap>;
}
