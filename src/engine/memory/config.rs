use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::document::ConfigDocument;
use super::SessionSlot;
use crate::engine::{EngineLifecycle, InitArgs, SzConfig};
use crate::types::{ConfigHandle, Error, Result};

#[derive(Debug, Default)]
struct Handles {
    next: i64,
    open: HashMap<i64, ConfigDocument>,
}

/// Configuration documents held open by handle.
#[derive(Debug, Default)]
pub struct MemoryConfig {
    session: SessionSlot,
    handles: Mutex<Handles>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> Result<MutexGuard<'_, Handles>> {
        self.session.current()?;
        Ok(self.handles.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn open(&self, document: ConfigDocument) -> Result<ConfigHandle> {
        let mut handles = self.handles()?;
        handles.next += 1;
        let handle = handles.next;
        handles.open.insert(handle, document);
        ConfigHandle::new(handle).map_err(Error::internal)
    }

    fn with_document<R>(
        &self,
        handle: ConfigHandle,
        f: impl FnOnce(&mut ConfigDocument) -> Result<R>,
    ) -> Result<R> {
        let mut handles = self.handles()?;
        let document = handles
            .open
            .get_mut(&handle.get())
            .ok_or_else(|| Error::bad_input(format!("configuration handle {} is not open", handle)))?;
        f(document)
    }
}

impl EngineLifecycle for MemoryConfig {
    fn initialize(&self, args: &InitArgs) -> Result<()> {
        self.session.open(args)?;
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.session.close()?;
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open
            .clear();
        Ok(())
    }
}

impl SzConfig for MemoryConfig {
    fn create_config(&self) -> Result<ConfigHandle> {
        self.open(ConfigDocument::template())
    }

    fn import_config(&self, config_definition: &str) -> Result<ConfigHandle> {
        self.open(ConfigDocument::parse(config_definition)?)
    }

    fn export_config(&self, handle: ConfigHandle) -> Result<String> {
        self.with_document(handle, |document| Ok(document.to_json()))
    }

    fn add_data_source(&self, handle: ConfigHandle, data_source_code: &str) -> Result<String> {
        self.with_document(handle, |document| {
            let id = document.add_data_source(data_source_code)?;
            Ok(serde_json::json!({ "DSRC_ID": id }).to_string())
        })
    }

    fn delete_data_source(&self, handle: ConfigHandle, data_source_code: &str) -> Result<()> {
        self.with_document(handle, |document| document.delete_data_source(data_source_code))
    }

    fn get_data_sources(&self, handle: ConfigHandle) -> Result<String> {
        self.with_document(handle, |document| Ok(document.data_sources_json()))
    }

    fn close_config(&self, handle: ConfigHandle) -> Result<()> {
        let mut handles = self.handles()?;
        handles
            .open
            .remove(&handle.get())
            .map(|_| ())
            .ok_or_else(|| Error::bad_input(format!("configuration handle {} is not open", handle)))
    }
}
