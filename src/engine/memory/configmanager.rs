use serde_json::json;
use std::sync::Arc;

use super::document::ConfigDocument;
use super::{Repository, SessionSlot};
use crate::engine::{EngineLifecycle, InitArgs, SzConfigManager};
use crate::types::{ConfigId, Error, Result};

/// Persisted configurations and the default pointer.
#[derive(Debug)]
pub struct MemoryConfigManager {
    repo: Arc<Repository>,
    session: SessionSlot,
}

impl MemoryConfigManager {
    pub(crate) fn new(repo: Arc<Repository>) -> Self {
        Self {
            repo,
            session: SessionSlot::default(),
        }
    }
}

impl EngineLifecycle for MemoryConfigManager {
    fn initialize(&self, args: &InitArgs) -> Result<()> {
        self.session.open(args)?;
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.session.close()
    }
}

impl SzConfigManager for MemoryConfigManager {
    fn add_config(&self, config_definition: &str, config_comment: &str) -> Result<ConfigId> {
        self.session.current()?;
        let document = ConfigDocument::parse(config_definition)?;
        let id = self
            .repo
            .lock()
            .store_config(config_definition, document, config_comment);
        ConfigId::new(id).map_err(Error::internal)
    }

    fn get_config(&self, config_id: ConfigId) -> Result<String> {
        self.session.current()?;
        self.repo
            .lock()
            .configs
            .get(&config_id.get())
            .map(|c| c.definition.clone())
            .ok_or_else(|| Error::not_found(format!("configuration {} does not exist", config_id)))
    }

    fn get_configs(&self) -> Result<String> {
        self.session.current()?;
        let state = self.repo.lock();
        let configs: Vec<_> = state
            .configs
            .iter()
            .map(|(id, c)| {
                json!({
                    "CONFIG_ID": id,
                    "CONFIG_COMMENT": c.comment,
                    "SYS_CREATE_DT": c.created.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                })
            })
            .collect();
        Ok(json!({ "CONFIGS": configs }).to_string())
    }

    fn get_default_config_id(&self) -> Result<i64> {
        self.session.current()?;
        Ok(self.repo.lock().default_config_id)
    }

    fn replace_default_config_id(
        &self,
        current_default_config_id: i64,
        new_default_config_id: ConfigId,
    ) -> Result<()> {
        self.session.current()?;
        let mut state = self.repo.lock();
        if state.default_config_id != current_default_config_id {
            return Err(Error::conflict(format!(
                "default configuration is {}, not {}",
                state.default_config_id, current_default_config_id
            )));
        }
        if !state.configs.contains_key(&new_default_config_id.get()) {
            return Err(Error::not_found(format!(
                "configuration {} does not exist",
                new_default_config_id
            )));
        }
        state.default_config_id = new_default_config_id.get();
        Ok(())
    }

    fn set_default_config_id(&self, config_id: ConfigId) -> Result<()> {
        self.session.current()?;
        let mut state = self.repo.lock();
        if !state.configs.contains_key(&config_id.get()) {
            return Err(Error::not_found(format!("configuration {} does not exist", config_id)));
        }
        state.default_config_id = config_id.get();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::initialized;
    use super::*;
    use crate::engine::EngineFactory;

    fn definition_with(code: &str) -> String {
        let mut document = ConfigDocument::template();
        document.add_data_source(code).unwrap();
        document.to_json()
    }

    #[test]
    fn test_ids_are_sequential_and_deduplicated() {
        let manager = initialized().config_manager();
        let first = manager.add_config(&definition_with("A"), "a").unwrap();
        let second = manager.add_config(&definition_with("B"), "b").unwrap();
        assert_eq!(second.get(), first.get() + 1);

        let again = manager.add_config(&definition_with("A"), "a again").unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_replace_default_is_compare_and_swap() {
        let manager = initialized().config_manager();
        let current = manager.get_default_config_id().unwrap();
        let next = manager.add_config(&definition_with("NEXT"), "next").unwrap();

        let err = manager
            .replace_default_config_id(current + 100, next)
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(manager.get_default_config_id().unwrap(), current);

        manager.replace_default_config_id(current, next).unwrap();
        assert_eq!(manager.get_default_config_id().unwrap(), next.get());
    }

    #[test]
    fn test_unknown_config_is_not_found() {
        let manager = initialized().config_manager();
        let missing = ConfigId::new(999).unwrap();
        assert_eq!(manager.get_config(missing).unwrap_err().kind(), "not-found");
        assert_eq!(manager.set_default_config_id(missing).unwrap_err().kind(), "not-found");

        let current = manager.get_default_config_id().unwrap();
        assert_eq!(
            manager.replace_default_config_id(current, missing).unwrap_err().kind(),
            "not-found"
        );
    }

    #[test]
    fn test_get_configs_lists_comments() {
        let manager = initialized().config_manager();
        manager.add_config(&definition_with("LISTED"), "listed one").unwrap();
        let list: serde_json::Value = serde_json::from_str(&manager.get_configs().unwrap()).unwrap();
        let comments: Vec<_> = list["CONFIGS"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["CONFIG_COMMENT"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(comments, vec!["Template configuration", "listed one"]);
    }
}
