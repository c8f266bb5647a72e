use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use super::document::normalize_code;
use super::{InFlight, RepoState, Repository, SessionSlot, ERR_UNKNOWN_DATA_SOURCE};
use crate::engine::flags::{self, has};
use crate::engine::{EngineLifecycle, InitArgs, SzEngine};
use crate::types::{ConfigId, EntityId, Error, ExportHandle, Result};

/// Record ingestion, entity queries and exports over the shared repository.
#[derive(Debug)]
pub struct MemoryEngine {
    repo: Arc<Repository>,
    session: SessionSlot,
}

impl MemoryEngine {
    pub(crate) fn new(repo: Arc<Repository>) -> Self {
        Self {
            repo,
            session: SessionSlot::default(),
        }
    }

    fn ready(&self) -> Result<InFlight<'_>> {
        self.session.current()?;
        Ok(self.repo.busy())
    }

    fn upsert(&self, data_source_code: &str, record_id: &str, record_definition: &str, flags: i64) -> Result<String> {
        let _busy = self.ready()?;
        let record_id = record_id.trim();
        if record_id.is_empty() {
            return Err(Error::bad_input("record ID must not be empty"));
        }
        let code = normalize_code(data_source_code)?;
        let document: Value = serde_json::from_str(record_definition)
            .map_err(|e| Error::bad_input(format!("record definition is not valid JSON: {}", e)))?;
        check_embedded(&document, "DATA_SOURCE", &code, |v| normalize_code(v).ok())?;
        check_embedded(&document, "RECORD_ID", record_id, |v| Some(v.trim().to_string()))?;

        let mut state = self.repo.lock();
        known_source(&state, &code)?;
        let change = state.store.upsert(&code, record_id, document)?;
        state.workload.added_records += 1;
        for (_, (ds, rid)) in &change.merged_away {
            state.redo.push_back(redo_record(ds, rid));
            state.workload.redo_triggers += 1;
        }
        Ok(with_info(flags, &code, record_id, &change.affected))
    }

    fn entity_doc(state: &RepoState, entity_id: i64, flags: i64) -> Result<Value> {
        state
            .store
            .entity_doc(entity_id, flags)
            .ok_or_else(|| Error::not_found(format!("entity {} does not exist", entity_id)))
    }

    fn record_entity(state: &RepoState, data_source_code: &str, record_id: &str) -> Result<i64> {
        let code = normalize_code(data_source_code)?;
        known_source(state, &code)?;
        state
            .store
            .entity_of(&code, record_id)
            .ok_or_else(|| Error::not_found(format!("record {}:{} does not exist", code, record_id)))
    }

    fn open_export(state: &mut RepoState, rows: std::collections::VecDeque<String>) -> Result<ExportHandle> {
        state.next_export_handle += 1;
        let handle = state.next_export_handle;
        state.exports.insert(handle, rows);
        ExportHandle::new(handle).map_err(Error::internal)
    }
}

/// An attribute embedded in the record must agree with the call arguments.
fn check_embedded(
    document: &Value,
    attribute: &str,
    expected: &str,
    normalize: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let embedded = match document.get(attribute) {
        None => return Ok(()),
        Some(Value::String(s)) => normalize(s),
        Some(Value::Number(n)) => normalize(&n.to_string()),
        Some(_) => None,
    };
    match embedded {
        Some(value) if value == expected => Ok(()),
        _ => Err(Error::bad_input(format!(
            "{} in record definition does not match '{}'",
            attribute, expected
        ))),
    }
}

fn known_source(state: &RepoState, code: &str) -> Result<()> {
    if state.active_codes.contains(code) {
        Ok(())
    } else {
        Err(Error::engine(
            ERR_UNKNOWN_DATA_SOURCE,
            format!("Unknown data source '{}'", code),
        ))
    }
}

fn redo_record(data_source_code: &str, record_id: &str) -> String {
    json!({
        "REASON": "LIB_FEAT_ID[ENTITY_MERGE]",
        "DATA_SOURCE": data_source_code,
        "RECORD_ID": record_id,
    })
    .to_string()
}

/// Affected-entity document, or an empty string without `SZ_WITH_INFO`.
fn with_info(flags: i64, data_source_code: &str, record_id: &str, affected: &BTreeSet<i64>) -> String {
    if !has(flags, flags::SZ_WITH_INFO) {
        return String::new();
    }
    json!({
        "DATA_SOURCE": data_source_code,
        "RECORD_ID": record_id,
        "AFFECTED_ENTITIES": affected.iter().map(|id| json!({ "ENTITY_ID": id })).collect::<Vec<_>>(),
    })
    .to_string()
}

/// Parse `{"ENTITIES":[{"ENTITY_ID":n},...]}`. Blank input is an empty list.
fn parse_entity_list(text: &str) -> Result<Vec<i64>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::bad_input(format!("entity list is not valid JSON: {}", e)))?;
    let entries = value
        .get("ENTITIES")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::bad_input("entity list has no ENTITIES array"))?;
    entries
        .iter()
        .map(|entry| {
            entry
                .get("ENTITY_ID")
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::bad_input("entity list entry has no numeric ENTITY_ID"))
        })
        .collect()
}

fn non_negative(name: &str, value: i64) -> Result<()> {
    if value < 0 {
        return Err(Error::bad_input(format!("{} must not be negative, got {}", name, value)));
    }
    Ok(())
}

struct FoundPath {
    start: i64,
    end: i64,
    entities: Vec<i64>,
}

/// Render paths plus the documents of every entity on them.
fn paths_doc(state: &RepoState, paths: &[FoundPath], extra: &[i64], links_key: &str, flags: i64) -> Value {
    let mut members: Vec<i64> = Vec::new();
    let mut seen = HashSet::new();
    for id in paths.iter().flat_map(|p| p.entities.iter()).chain(extra.iter()) {
        if seen.insert(*id) {
            members.push(*id);
        }
    }

    let mut doc = Map::new();
    doc.insert(
        "ENTITY_PATHS".to_string(),
        Value::Array(
            paths
                .iter()
                .map(|p| {
                    json!({
                        "START_ENTITY_ID": p.start,
                        "END_ENTITY_ID": p.end,
                        "ENTITIES": p.entities,
                    })
                })
                .collect(),
        ),
    );
    if has(flags, flags::SZ_FIND_PATH_INCLUDE_MATCHING_INFO) {
        let mut links = Vec::new();
        let mut linked = HashSet::new();
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                let related = state.store.related(*a).iter().any(|(id, _)| id == b);
                if related && linked.insert((*a.min(b), *a.max(b))) {
                    links.push(state.store.link_doc(*a, *b));
                }
            }
        }
        doc.insert(links_key.to_string(), Value::Array(links));
    }
    doc.insert(
        "ENTITIES".to_string(),
        Value::Array(
            members
                .iter()
                .filter_map(|id| state.store.entity_doc(*id, flags))
                .collect(),
        ),
    );
    Value::Object(doc)
}

impl EngineLifecycle for MemoryEngine {
    fn initialize(&self, args: &InitArgs) -> Result<()> {
        self.repo.lock().activate_for_init(args.config_id)?;
        self.session.open(args)?;
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.session.close()?;
        // Export handles do not outlive the session.
        self.repo.lock().exports.clear();
        Ok(())
    }
}

impl SzEngine for MemoryEngine {
    fn add_record(&self, data_source_code: &str, record_id: &str, record_definition: &str, flags: i64) -> Result<String> {
        self.upsert(data_source_code, record_id, record_definition, flags)
    }

    fn replace_record(&self, data_source_code: &str, record_id: &str, record_definition: &str, flags: i64) -> Result<String> {
        self.upsert(data_source_code, record_id, record_definition, flags)
    }

    fn delete_record(&self, data_source_code: &str, record_id: &str, flags: i64) -> Result<String> {
        let _busy = self.ready()?;
        let code = normalize_code(data_source_code)?;
        let mut state = self.repo.lock();
        known_source(&state, &code)?;
        let affected = match state.store.remove(&code, record_id) {
            Some(change) => {
                state.workload.deleted_records += 1;
                change.affected
            }
            None => BTreeSet::new(),
        };
        Ok(with_info(flags, &code, record_id, &affected))
    }

    fn get_record(&self, data_source_code: &str, record_id: &str, flags: i64) -> Result<String> {
        let _busy = self.ready()?;
        let code = normalize_code(data_source_code)?;
        let state = self.repo.lock();
        known_source(&state, &code)?;
        state
            .store
            .record_doc(&code, record_id, flags)
            .map(|doc| doc.to_string())
            .ok_or_else(|| Error::not_found(format!("record {}:{} does not exist", code, record_id)))
    }

    fn get_entity_by_entity_id(&self, entity_id: EntityId, flags: i64) -> Result<String> {
        let _busy = self.ready()?;
        let state = self.repo.lock();
        Ok(Self::entity_doc(&state, entity_id.get(), flags)?.to_string())
    }

    fn get_entity_by_record_id(&self, data_source_code: &str, record_id: &str, flags: i64) -> Result<String> {
        let _busy = self.ready()?;
        let state = self.repo.lock();
        let entity_id = Self::record_entity(&state, data_source_code, record_id)?;
        Ok(Self::entity_doc(&state, entity_id, flags)?.to_string())
    }

    fn search_by_attributes(&self, attributes: &str, _search_profile: &str, flags: i64) -> Result<String> {
        let _busy = self.ready()?;
        let document: Value = serde_json::from_str(attributes)
            .map_err(|e| Error::bad_input(format!("search attributes are not valid JSON: {}", e)))?;
        let state = self.repo.lock();
        let wanted = flags & flags::SZ_SEARCH_INCLUDE_ALL_ENTITIES;
        let results: Vec<Value> = state
            .store
            .search(&document)?
            .into_iter()
            .filter(|(_, level, _)| {
                let bit = match *level {
                    "RESOLVED" => flags::SZ_SEARCH_INCLUDE_RESOLVED,
                    "POSSIBLY_RELATED" => flags::SZ_SEARCH_INCLUDE_POSSIBLY_RELATED,
                    _ => flags::SZ_SEARCH_INCLUDE_NAME_ONLY,
                };
                wanted == 0 || wanted & bit != 0
            })
            .filter_map(|(entity_id, level, match_key)| {
                state.store.entity_doc(entity_id, flags).map(|entity| {
                    json!({
                        "MATCH_INFO": { "MATCH_LEVEL_CODE": level, "MATCH_KEY": match_key },
                        "ENTITY": entity,
                    })
                })
            })
            .collect();
        Ok(json!({ "RESOLVED_ENTITIES": results }).to_string())
    }

    fn find_path_by_entity_id(
        &self,
        start_entity_id: EntityId,
        end_entity_id: EntityId,
        max_degrees: i64,
        avoid_entity_ids: &str,
        flags: i64,
    ) -> Result<String> {
        let _busy = self.ready()?;
        non_negative("max degrees", max_degrees)?;
        let avoid: HashSet<i64> = parse_entity_list(avoid_entity_ids)?.into_iter().collect();
        let (start, end) = (start_entity_id.get(), end_entity_id.get());
        let state = self.repo.lock();
        Self::entity_doc(&state, start, flags)?;
        Self::entity_doc(&state, end, flags)?;

        let mut found = state.store.path(start, end, max_degrees, &avoid);
        if found.is_none() && !avoid.is_empty() && !has(flags, flags::SZ_FIND_PATH_STRICT_AVOID) {
            found = state.store.path(start, end, max_degrees, &HashSet::new());
        }
        let path = FoundPath {
            start,
            end,
            entities: found.unwrap_or_default(),
        };
        Ok(paths_doc(&state, &[path], &[], "ENTITY_PATH_LINKS", flags).to_string())
    }

    fn find_path_by_record_id(
        &self,
        start_data_source_code: &str,
        start_record_id: &str,
        end_data_source_code: &str,
        end_record_id: &str,
        max_degrees: i64,
        flags: i64,
    ) -> Result<String> {
        let _busy = self.ready()?;
        non_negative("max degrees", max_degrees)?;
        let state = self.repo.lock();
        let start = Self::record_entity(&state, start_data_source_code, start_record_id)?;
        let end = Self::record_entity(&state, end_data_source_code, end_record_id)?;
        let path = FoundPath {
            start,
            end,
            entities: state
                .store
                .path(start, end, max_degrees, &HashSet::new())
                .unwrap_or_default(),
        };
        Ok(paths_doc(&state, &[path], &[], "ENTITY_PATH_LINKS", flags).to_string())
    }

    fn find_network_by_entity_id(
        &self,
        entity_ids: &str,
        max_degrees: i64,
        build_out_degrees: i64,
        build_out_max_entities: i64,
        flags: i64,
    ) -> Result<String> {
        let _busy = self.ready()?;
        non_negative("max degrees", max_degrees)?;
        non_negative("build out degrees", build_out_degrees)?;
        non_negative("build out max entities", build_out_max_entities)?;
        let ids = parse_entity_list(entity_ids)?;
        if ids.is_empty() {
            return Err(Error::bad_input("entity list must name at least one entity"));
        }
        let state = self.repo.lock();
        for id in &ids {
            Self::entity_doc(&state, *id, flags)?;
        }

        let mut paths = Vec::new();
        for (i, start) in ids.iter().enumerate() {
            for end in &ids[i + 1..] {
                paths.push(FoundPath {
                    start: *start,
                    end: *end,
                    entities: state
                        .store
                        .path(*start, *end, max_degrees, &HashSet::new())
                        .unwrap_or_default(),
                });
            }
        }

        let mut extra = ids.clone();
        let budget = usize::try_from(build_out_max_entities).unwrap_or(0);
        let mut built_out = 0;
        for id in &ids {
            for neighbor in state.store.neighborhood(*id, build_out_degrees) {
                if built_out >= budget {
                    break;
                }
                if !extra.contains(&neighbor) {
                    extra.push(neighbor);
                    built_out += 1;
                }
            }
        }
        Ok(paths_doc(&state, &paths, &extra, "ENTITY_NETWORK_LINKS", flags).to_string())
    }

    fn why_entities(&self, entity_id_1: EntityId, entity_id_2: EntityId, flags: i64) -> Result<String> {
        let _busy = self.ready()?;
        let state = self.repo.lock();
        let first = Self::entity_doc(&state, entity_id_1.get(), flags)?;
        let second = Self::entity_doc(&state, entity_id_2.get(), flags)?;
        let why = state.store.why_entities(entity_id_1.get(), entity_id_2.get());
        Ok(json!({ "WHY_RESULTS": [why], "ENTITIES": [first, second] }).to_string())
    }

    fn why_records(
        &self,
        data_source_code_1: &str,
        record_id_1: &str,
        data_source_code_2: &str,
        record_id_2: &str,
        flags: i64,
    ) -> Result<String> {
        let _busy = self.ready()?;
        let state = self.repo.lock();
        let entity_1 = Self::record_entity(&state, data_source_code_1, record_id_1)?;
        let entity_2 = Self::record_entity(&state, data_source_code_2, record_id_2)?;
        let (code_1, code_2) = (normalize_code(data_source_code_1)?, normalize_code(data_source_code_2)?);
        let (Some(record_1), Some(record_2)) = (
            state.store.record(&code_1, record_id_1),
            state.store.record(&code_2, record_id_2),
        ) else {
            return Err(Error::not_found("record does not exist"));
        };
        let mut entities = vec![Self::entity_doc(&state, entity_1, flags)?];
        if entity_2 != entity_1 {
            entities.push(Self::entity_doc(&state, entity_2, flags)?);
        }
        let why = state.store.why_records(record_1, record_2);
        Ok(json!({ "WHY_RESULTS": [why], "ENTITIES": entities }).to_string())
    }

    fn how_entity_by_entity_id(&self, entity_id: EntityId, _flags: i64) -> Result<String> {
        let _busy = self.ready()?;
        let state = self.repo.lock();
        state
            .store
            .how(entity_id.get())
            .map(|doc| doc.to_string())
            .ok_or_else(|| Error::not_found(format!("entity {} does not exist", entity_id)))
    }

    fn reevaluate_entity(&self, entity_id: EntityId, flags: i64) -> Result<String> {
        let _busy = self.ready()?;
        let mut state = self.repo.lock();
        let mut affected = BTreeSet::new();
        if state.store.contains_entity(entity_id.get()) {
            state.workload.reevaluations += 1;
            affected.insert(entity_id.get());
        }
        if !has(flags, flags::SZ_WITH_INFO) {
            return Ok(String::new());
        }
        Ok(json!({
            "AFFECTED_ENTITIES": affected.iter().map(|id| json!({ "ENTITY_ID": id })).collect::<Vec<_>>(),
        })
        .to_string())
    }

    fn reevaluate_record(&self, data_source_code: &str, record_id: &str, flags: i64) -> Result<String> {
        let _busy = self.ready()?;
        let code = normalize_code(data_source_code)?;
        let mut state = self.repo.lock();
        let entity_id = Self::record_entity(&state, &code, record_id)?;
        state.workload.reevaluations += 1;
        Ok(with_info(flags, &code, record_id, &BTreeSet::from([entity_id])))
    }

    fn count_redo_records(&self) -> Result<i64> {
        let _busy = self.ready()?;
        i64::try_from(self.repo.lock().redo.len()).map_err(|e| Error::internal(e.to_string()))
    }

    fn get_redo_record(&self) -> Result<String> {
        let _busy = self.ready()?;
        Ok(self.repo.lock().redo.pop_front().unwrap_or_default())
    }

    fn process_redo_record(&self, redo_record: &str, flags: i64) -> Result<String> {
        let _busy = self.ready()?;
        let document: Value = serde_json::from_str(redo_record)
            .map_err(|e| Error::bad_input(format!("redo record is not valid JSON: {}", e)))?;
        let field = |name: &str| {
            document
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::bad_input(format!("redo record has no {}", name)))
        };
        let (code, record_id) = (normalize_code(&field("DATA_SOURCE")?)?, field("RECORD_ID")?);
        let mut state = self.repo.lock();
        state.workload.processed_redo += 1;
        let affected: BTreeSet<i64> = state.store.entity_of(&code, &record_id).into_iter().collect();
        Ok(with_info(flags, &code, &record_id, &affected))
    }

    fn get_active_config_id(&self) -> Result<i64> {
        self.session.current()?;
        Ok(self.repo.lock().active_config_id)
    }

    fn get_stats(&self) -> Result<String> {
        let _busy = self.ready()?;
        let mut state = self.repo.lock();
        let workload = std::mem::take(&mut state.workload);
        Ok(json!({
            "workload": {
                "apiVersion": env!("CARGO_PKG_VERSION"),
                "loadedRecords": state.store.record_count(),
                "entityCount": state.store.entity_count(),
                "addedRecords": workload.added_records,
                "deletedRecords": workload.deleted_records,
                "reevaluations": workload.reevaluations,
                "redoTriggers": workload.redo_triggers,
                "processedRedo": workload.processed_redo,
                "pendingRedo": state.redo.len(),
            }
        })
        .to_string())
    }

    fn prime_engine(&self) -> Result<()> {
        self.session.current()?;
        Ok(())
    }

    fn reinitialize(&self, config_id: ConfigId) -> Result<()> {
        self.session.current()?;
        self.repo.lock().activate(config_id.get())
    }

    fn export_json_entity_report(&self, flags: i64) -> Result<ExportHandle> {
        let _busy = self.ready()?;
        let mut state = self.repo.lock();
        let rows = state.store.export_json(flags);
        Self::open_export(&mut state, rows)
    }

    fn export_csv_entity_report(&self, csv_column_list: &str, flags: i64) -> Result<ExportHandle> {
        let _busy = self.ready()?;
        let mut state = self.repo.lock();
        let rows = state.store.export_csv(csv_column_list, flags)?;
        Self::open_export(&mut state, rows)
    }

    fn fetch_next(&self, export_handle: ExportHandle) -> Result<String> {
        self.session.current()?;
        let mut state = self.repo.lock();
        let rows = state
            .exports
            .get_mut(&export_handle.get())
            .ok_or_else(|| Error::bad_input(format!("export handle {} is not open", export_handle)))?;
        Ok(rows.pop_front().unwrap_or_default())
    }

    fn close_export(&self, export_handle: ExportHandle) -> Result<()> {
        self.session.current()?;
        self.repo
            .lock()
            .exports
            .remove(&export_handle.get())
            .map(|_| ())
            .ok_or_else(|| Error::bad_input(format!("export handle {} is not open", export_handle)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{args, initialized};
    use super::*;
    use crate::engine::EngineFactory;
    use crate::types::ConfigHandle;

    /// Engine whose active configuration knows CUSTOMERS and WATCHLIST.
    fn engine() -> Arc<dyn SzEngine> {
        let factory = initialized();
        let config = factory.config();
        let handle: ConfigHandle = config.create_config().unwrap();
        config.add_data_source(handle, "CUSTOMERS").unwrap();
        config.add_data_source(handle, "WATCHLIST").unwrap();
        let definition = config.export_config(handle).unwrap();
        let manager = factory.config_manager();
        let id = manager.add_config(&definition, "with sources").unwrap();
        manager.set_default_config_id(id).unwrap();
        factory.diagnostic().reinitialize(id).unwrap();
        let engine = factory.engine();
        engine.reinitialize(id).unwrap();
        engine
    }

    fn entity(id: i64) -> EntityId {
        EntityId::new(id).unwrap()
    }

    #[test]
    fn test_add_record_with_info() {
        let engine = engine();
        let info = engine
            .add_record("CUSTOMERS", "1001", r#"{"NAME_FULL":"Robert Smith","SSN_NUMBER":"123-45-6789"}"#, flags::SZ_WITH_INFO)
            .unwrap();
        assert_eq!(
            info,
            r#"{"DATA_SOURCE":"CUSTOMERS","RECORD_ID":"1001","AFFECTED_ENTITIES":[{"ENTITY_ID":1}]}"#
        );
        let silent = engine
            .add_record("CUSTOMERS", "1002", r#"{"NAME_FULL":"Jane Doe"}"#, flags::SZ_NO_FLAGS)
            .unwrap();
        assert_eq!(silent, "");
    }

    #[test]
    fn test_unknown_data_source() {
        let engine = engine();
        let err = engine
            .add_record("NOPE", "1", r#"{"NAME_FULL":"X"}"#, 0)
            .unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_UNKNOWN_DATA_SOURCE));
    }

    #[test]
    fn test_record_argument_validation() {
        let engine = engine();
        for (id, definition) in [
            ("", r#"{"NAME_FULL":"X"}"#),
            ("1", "not json"),
            ("1", r#"{"RECORD_ID":"2","NAME_FULL":"X"}"#),
            ("1", r#"{"DATA_SOURCE":"WATCHLIST","NAME_FULL":"X"}"#),
        ] {
            let err = engine.add_record("CUSTOMERS", id, definition, 0).unwrap_err();
            assert_eq!(err.kind(), "bad-input", "{} {}", id, definition);
        }
        engine
            .add_record("CUSTOMERS", "7", r#"{"DATA_SOURCE":"customers","RECORD_ID":7,"NAME_FULL":"X"}"#, 0)
            .unwrap();
    }

    #[test]
    fn test_get_record_and_entity() {
        let engine = engine();
        engine
            .add_record("CUSTOMERS", "1", r#"{"NAME_FULL":"Robert Smith","EMAIL_ADDRESS":"bob@example.com"}"#, 0)
            .unwrap();
        engine
            .add_record("WATCHLIST", "9", r#"{"NAME_FULL":"Bobby Smith","EMAIL_ADDRESS":"BOB@example.com"}"#, 0)
            .unwrap();

        let record: Value = serde_json::from_str(
            &engine.get_record("CUSTOMERS", "1", flags::SZ_RECORD_DEFAULT_FLAGS).unwrap(),
        )
        .unwrap();
        assert_eq!(record["JSON_DATA"]["NAME_FULL"], "Robert Smith");

        let by_record: Value = serde_json::from_str(
            &engine.get_entity_by_record_id("WATCHLIST", "9", flags::SZ_ENTITY_DEFAULT_FLAGS).unwrap(),
        )
        .unwrap();
        assert_eq!(by_record["RESOLVED_ENTITY"]["ENTITY_ID"], 1);
        assert_eq!(by_record["RESOLVED_ENTITY"]["RECORDS"][1]["MATCH_KEY"], "+EMAIL");

        assert_eq!(engine.get_record("CUSTOMERS", "404", 0).unwrap_err().kind(), "not-found");
        assert_eq!(
            engine.get_entity_by_entity_id(entity(404), 0).unwrap_err().kind(),
            "not-found"
        );
    }

    #[test]
    fn test_delete_missing_record_is_ok() {
        let engine = engine();
        let info = engine.delete_record("CUSTOMERS", "missing", flags::SZ_WITH_INFO).unwrap();
        assert_eq!(
            info,
            r#"{"DATA_SOURCE":"CUSTOMERS","RECORD_ID":"missing","AFFECTED_ENTITIES":[]}"#
        );
    }

    #[test]
    fn test_merge_queues_redo() {
        let engine = engine();
        engine.add_record("CUSTOMERS", "1", r#"{"SSN_NUMBER":"111"}"#, 0).unwrap();
        engine.add_record("CUSTOMERS", "2", r#"{"PASSPORT_NUMBER":"P2"}"#, 0).unwrap();
        engine
            .add_record("CUSTOMERS", "3", r#"{"SSN_NUMBER":"111","PASSPORT_NUMBER":"P2"}"#, 0)
            .unwrap();

        assert_eq!(engine.count_redo_records().unwrap(), 1);
        let redo = engine.get_redo_record().unwrap();
        assert!(redo.contains(r#""RECORD_ID":"2""#));
        assert_eq!(engine.get_redo_record().unwrap(), "");

        let info = engine.process_redo_record(&redo, flags::SZ_WITH_INFO).unwrap();
        assert!(info.contains(r#""AFFECTED_ENTITIES":[{"ENTITY_ID":1}]"#));
        assert_eq!(engine.process_redo_record("{}", 0).unwrap_err().kind(), "bad-input");
    }

    #[test]
    fn test_find_path_with_avoidance() {
        let engine = engine();
        engine.add_record("CUSTOMERS", "1", r#"{"ADDR_FULL":"1 Main St"}"#, 0).unwrap();
        engine
            .add_record("CUSTOMERS", "2", r#"{"ADDR_FULL":"1 Main St","PHONE_NUMBER":"555-0100"}"#, 0)
            .unwrap();
        engine.add_record("CUSTOMERS", "3", r#"{"PHONE_NUMBER":"5550100"}"#, 0).unwrap();

        let path: Value = serde_json::from_str(
            &engine
                .find_path_by_entity_id(entity(1), entity(3), 2, "", flags::SZ_FIND_PATH_DEFAULT_FLAGS)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(path["ENTITY_PATHS"][0]["ENTITIES"], json!([1, 2, 3]));
        assert_eq!(path["ENTITY_PATH_LINKS"].as_array().unwrap().len(), 2);

        let avoid = r#"{"ENTITIES":[{"ENTITY_ID":2}]}"#;
        let strict: Value = serde_json::from_str(
            &engine
                .find_path_by_entity_id(entity(1), entity(3), 2, avoid, flags::SZ_FIND_PATH_STRICT_AVOID)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(strict["ENTITY_PATHS"][0]["ENTITIES"], json!([]));

        let lenient: Value = serde_json::from_str(
            &engine.find_path_by_entity_id(entity(1), entity(3), 2, avoid, 0).unwrap(),
        )
        .unwrap();
        assert_eq!(lenient["ENTITY_PATHS"][0]["ENTITIES"], json!([1, 2, 3]));

        let network: Value = serde_json::from_str(
            &engine
                .find_network_by_entity_id(r#"{"ENTITIES":[{"ENTITY_ID":1}]}"#, 1, 1, 10, 0)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(network["ENTITIES"].as_array().unwrap().len(), 2);
        assert!(engine.find_path_by_entity_id(entity(1), entity(3), -1, "", 0).is_err());
    }

    #[test]
    fn test_search_filters_by_level() {
        let engine = engine();
        engine
            .add_record("CUSTOMERS", "1", r#"{"NAME_FULL":"Ann Lee","SSN_NUMBER":"999"}"#, 0)
            .unwrap();
        engine
            .add_record("CUSTOMERS", "2", r#"{"NAME_FULL":"Ann Lee","ADDR_FULL":"2 Elm"}"#, 0)
            .unwrap();

        let search = |flags: i64| -> usize {
            let doc: Value = serde_json::from_str(
                &engine
                    .search_by_attributes(r#"{"NAME_FULL":"ann lee","SSN_NUMBER":"999"}"#, "", flags)
                    .unwrap(),
            )
            .unwrap();
            doc["RESOLVED_ENTITIES"].as_array().unwrap().len()
        };
        assert_eq!(search(flags::SZ_SEARCH_BY_ATTRIBUTES_DEFAULT_FLAGS), 2);
        assert_eq!(search(flags::SZ_SEARCH_INCLUDE_RESOLVED), 1);
    }

    #[test]
    fn test_export_rows_then_empty() {
        let engine = engine();
        engine.add_record("CUSTOMERS", "1", r#"{"NAME_FULL":"A"}"#, 0).unwrap();
        engine.add_record("WATCHLIST", "2", r#"{"NAME_FULL":"B"}"#, 0).unwrap();

        let handle = engine.export_json_entity_report(flags::SZ_EXPORT_DEFAULT_FLAGS).unwrap();
        engine.delete_record("WATCHLIST", "2", 0).unwrap();
        let mut rows = 0;
        loop {
            let row = engine.fetch_next(handle).unwrap();
            if row.is_empty() {
                break;
            }
            assert!(row.ends_with('\n'));
            rows += 1;
        }
        assert_eq!(rows, 2);
        engine.close_export(handle).unwrap();
        assert_eq!(engine.fetch_next(handle).unwrap_err().kind(), "bad-input");
    }

    #[test]
    fn test_stats_reset_on_read() {
        let engine = engine();
        engine.add_record("CUSTOMERS", "1", r#"{"NAME_FULL":"A"}"#, 0).unwrap();
        let first: Value = serde_json::from_str(&engine.get_stats().unwrap()).unwrap();
        assert_eq!(first["workload"]["addedRecords"], 1);
        let second: Value = serde_json::from_str(&engine.get_stats().unwrap()).unwrap();
        assert_eq!(second["workload"]["addedRecords"], 0);
        assert_eq!(second["workload"]["loadedRecords"], 1);
    }

    #[test]
    fn test_why_and_how() {
        let engine = engine();
        engine.add_record("CUSTOMERS", "1", r#"{"NAME_FULL":"A","DRIVERS_LICENSE_NUMBER":"D1"}"#, 0).unwrap();
        engine.add_record("WATCHLIST", "2", r#"{"NAME_FULL":"A","DRIVERS_LICENSE_NUMBER":"d-1"}"#, 0).unwrap();

        let why: Value = serde_json::from_str(
            &engine.why_records("CUSTOMERS", "1", "WATCHLIST", "2", 0).unwrap(),
        )
        .unwrap();
        assert_eq!(why["WHY_RESULTS"][0]["MATCH_INFO"]["WHY_KEY"], "+NAME+DRLIC");
        assert_eq!(why["WHY_RESULTS"][0]["MATCH_INFO"]["MATCH_LEVEL_CODE"], "RESOLVED");

        let how: Value = serde_json::from_str(&engine.how_entity_by_entity_id(entity(1), 0).unwrap()).unwrap();
        assert_eq!(how["HOW_RESULTS"]["RESOLUTION_STEPS"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_reinitialize_unknown_config() {
        let engine = engine();
        let missing = ConfigId::new(404).unwrap();
        assert_eq!(engine.reinitialize(missing).unwrap_err().kind(), "not-found");
    }

    #[test]
    fn test_destroy_releases_open_exports() {
        let factory = initialized();
        let engine = factory.engine();
        engine
            .add_record("TEST", "1", r#"{"NAME_FULL":"Jane Doe"}"#, flags::SZ_NO_FLAGS)
            .unwrap();
        let _open = engine.export_json_entity_report(flags::SZ_NO_FLAGS).unwrap();

        engine.destroy().unwrap();
        engine.initialize(&args()).unwrap();
        factory.diagnostic().purge_repository().unwrap();
    }
}
