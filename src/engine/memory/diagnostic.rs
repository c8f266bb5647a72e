use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Repository, SessionSlot, ERR_PURGE_BUSY, ERR_PURGE_NOT_PERMITTED};
use crate::engine::{EngineLifecycle, InitArgs, SzDiagnostic};
use crate::types::{ConfigId, Error, Result};

/// Upper bound on the synthetic performance probe, whatever the caller asks for.
const MAX_PROBE: Duration = Duration::from_secs(5);
const PROBE_SLOTS: u64 = 10_000;

#[derive(Debug)]
pub struct MemoryDiagnostic {
    repo: Arc<Repository>,
    session: SessionSlot,
}

impl MemoryDiagnostic {
    pub(crate) fn new(repo: Arc<Repository>) -> Self {
        Self {
            repo,
            session: SessionSlot::default(),
        }
    }
}

impl EngineLifecycle for MemoryDiagnostic {
    fn initialize(&self, args: &InitArgs) -> Result<()> {
        self.repo.lock().activate_for_init(args.config_id)?;
        self.session.open(args)?;
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.session.close()
    }
}

impl SzDiagnostic for MemoryDiagnostic {
    fn check_datastore_performance(&self, seconds_to_run: i32) -> Result<String> {
        self.session.current()?;
        if seconds_to_run < 0 {
            return Err(Error::bad_input(format!(
                "seconds to run must not be negative, got {}",
                seconds_to_run
            )));
        }
        let budget = Duration::from_secs(u64::from(seconds_to_run.unsigned_abs())).min(MAX_PROBE);
        let started = Instant::now();
        let mut slots: HashMap<u64, u64> = HashMap::new();
        let mut inserted: u64 = 0;
        while started.elapsed() < budget {
            for _ in 0..1_000 {
                *slots.entry(inserted % PROBE_SLOTS).or_default() += 1;
                inserted += 1;
            }
        }
        Ok(json!({
            "numRecordsInserted": inserted,
            "insertTime": started.elapsed().as_millis(),
        })
        .to_string())
    }

    fn get_datastore_info(&self) -> Result<String> {
        let session = self.session.current()?;
        let stores: Vec<_> = session
            .settings
            .database_urls()
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let (scheme, location) = url.split_once("://").unwrap_or(("", url.as_str()));
                let id = if i == 0 { "CORE".to_string() } else { format!("CORE_{}", i) };
                json!({
                    "id": id,
                    "type": scheme,
                    "location": location.rsplit('@').next().unwrap_or(location),
                })
            })
            .collect();
        Ok(json!({ "dataStores": stores }).to_string())
    }

    fn get_feature(&self, feature_id: i64) -> Result<String> {
        self.session.current()?;
        self.repo
            .lock()
            .store
            .feature_doc(feature_id)
            .map(|doc| doc.to_string())
            .ok_or_else(|| Error::not_found(format!("feature {} does not exist", feature_id)))
    }

    fn purge_repository(&self) -> Result<()> {
        let session = self.session.current()?;
        if !session.settings.allow_purge() {
            return Err(Error::engine(
                ERR_PURGE_NOT_PERMITTED,
                "purging the repository is not permitted by the engine settings",
            ));
        }
        let mut state = self.repo.lock();
        if self.repo.in_flight() > 0 || !state.exports.is_empty() {
            return Err(Error::engine(
                ERR_PURGE_BUSY,
                "repository is in use by other operations",
            ));
        }
        state.store.clear();
        state.redo.clear();
        state.workload = Default::default();
        Ok(())
    }

    fn reinitialize(&self, config_id: ConfigId) -> Result<()> {
        self.session.current()?;
        self.repo.lock().activate(config_id.get())
    }
}
