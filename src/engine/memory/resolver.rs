//! Records, features and entity resolution for the in-process engine.
//!
//! Resolution is recomputed from scratch after every mutation: records that
//! share a resolving feature value (or the same name and date of birth) form
//! one entity, identified by the sequence number of its earliest record.
//! Entities sharing an address or phone number are related.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::engine::flags::{self, has};
use crate::types::{Error, Result};

pub(crate) type RecordKey = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Name,
    DateOfBirth,
    Resolving,
    Relating,
}

#[derive(Debug)]
struct FeatureSpec {
    attribute: &'static str,
    ftype: &'static str,
    role: Role,
}

/// Recognized attributes, in the order feature types are reported.
const FEATURES: &[FeatureSpec] = &[
    FeatureSpec { attribute: "NAME_FULL", ftype: "NAME", role: Role::Name },
    FeatureSpec { attribute: "DATE_OF_BIRTH", ftype: "DOB", role: Role::DateOfBirth },
    FeatureSpec { attribute: "ADDR_FULL", ftype: "ADDRESS", role: Role::Relating },
    FeatureSpec { attribute: "PHONE_NUMBER", ftype: "PHONE", role: Role::Relating },
    FeatureSpec { attribute: "SSN_NUMBER", ftype: "SSN", role: Role::Resolving },
    FeatureSpec { attribute: "PASSPORT_NUMBER", ftype: "PASSPORT", role: Role::Resolving },
    FeatureSpec { attribute: "DRIVERS_LICENSE_NUMBER", ftype: "DRLIC", role: Role::Resolving },
    FeatureSpec { attribute: "EMAIL_ADDRESS", ftype: "EMAIL", role: Role::Resolving },
];

fn spec_for(attribute: &str) -> Option<&'static FeatureSpec> {
    FEATURES.iter().find(|s| s.attribute == attribute)
}

fn ftype_rank(ftype: &str) -> usize {
    FEATURES.iter().position(|s| s.ftype == ftype).unwrap_or(usize::MAX)
}

#[derive(Debug, Clone)]
pub(crate) struct FeatureValue {
    pub id: i64,
    spec: &'static FeatureSpec,
    pub value: String,
}

impl FeatureValue {
    pub fn ftype(&self) -> &'static str {
        self.spec.ftype
    }

    fn same_as(&self, other: &FeatureValue) -> bool {
        self.spec.ftype == other.spec.ftype && self.value == other.value
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StoredRecord {
    pub seq: i64,
    pub data_source: String,
    pub record_id: String,
    pub json: Value,
    pub features: Vec<FeatureValue>,
}

impl StoredRecord {
    fn key(&self) -> RecordKey {
        (self.data_source.clone(), self.record_id.clone())
    }

    /// Keys under which this record resolves with others.
    fn resolve_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .features
            .iter()
            .filter(|f| f.spec.role == Role::Resolving)
            .map(|f| format!("{}|{}", f.ftype(), f.value))
            .collect();
        for name in self.features.iter().filter(|f| f.spec.role == Role::Name) {
            for dob in self.features.iter().filter(|f| f.spec.role == Role::DateOfBirth) {
                keys.push(format!("NAME+DOB|{}|{}", name.value, dob.value));
            }
        }
        keys
    }

    fn member_doc(&self) -> Value {
        json!({ "DATA_SOURCE": self.data_source, "RECORD_ID": self.record_id })
    }
}

fn normalize(spec: &FeatureSpec, raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    match spec.ftype {
        "SSN" | "PHONE" | "PASSPORT" | "DRLIC" => {
            collapsed.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
        }
        _ => collapsed,
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_from(object: &Map<String, Value>, out: &mut Vec<(&'static FeatureSpec, String)>) {
    for (attribute, value) in object {
        if let (Some(spec), Some(raw)) = (spec_for(attribute), scalar(value)) {
            out.push((spec, normalize(spec, &raw)));
        }
    }
    if !object.contains_key("NAME_FULL") {
        let parts: Vec<String> = ["NAME_FIRST", "NAME_MIDDLE", "NAME_LAST"]
            .iter()
            .filter_map(|k| object.get(*k).and_then(scalar))
            .collect();
        if !parts.is_empty() {
            if let Some(spec) = spec_for("NAME_FULL") {
                out.push((spec, normalize(spec, &parts.join(" "))));
            }
        }
    }
}

/// Recognized features of a record or search document. Features may be
/// top-level attributes or objects inside a `FEATURES` array.
fn extract_features(document: &Value) -> Result<Vec<(&'static FeatureSpec, String)>> {
    let object = document
        .as_object()
        .ok_or_else(|| Error::bad_input("record definition must be a JSON object"))?;
    let mut out = Vec::new();
    extract_from(object, &mut out);
    if let Some(Value::Array(items)) = object.get("FEATURES") {
        for item in items.iter().filter_map(Value::as_object) {
            extract_from(item, &mut out);
        }
    }
    let mut seen = HashSet::new();
    out.retain(|(spec, value)| seen.insert((spec.ftype, value.clone())));
    Ok(out)
}

/// `+FTYPE` for every feature type with a value present on both sides.
fn match_key(left: &[&FeatureValue], right: &[&FeatureValue]) -> String {
    let mut shared: BTreeSet<(usize, &'static str)> = BTreeSet::new();
    for l in left {
        if right.iter().any(|r| l.same_as(r)) {
            shared.insert((ftype_rank(l.ftype()), l.ftype()));
        }
    }
    shared.iter().map(|(_, f)| format!("+{}", f)).collect()
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Columns accepted by the CSV export.
pub const CSV_COLUMNS: &[&str] = &[
    "RESOLVED_ENTITY_ID",
    "RESOLVED_ENTITY_NAME",
    "RELATED_ENTITY_ID",
    "MATCH_LEVEL",
    "MATCH_LEVEL_CODE",
    "MATCH_KEY",
    "IS_DISCLOSED",
    "IS_AMBIGUOUS",
    "DATA_SOURCE",
    "RECORD_ID",
    "JSON_DATA",
];

const CSV_DEFAULT_COLUMNS: &[&str] = &[
    "RESOLVED_ENTITY_ID",
    "RELATED_ENTITY_ID",
    "MATCH_LEVEL_CODE",
    "MATCH_KEY",
    "DATA_SOURCE",
    "RECORD_ID",
];

/// Outcome of a record mutation.
#[derive(Debug, Default)]
pub(crate) struct Change {
    pub affected: BTreeSet<i64>,
    /// Entity ids that no longer exist, each with its smallest surviving record.
    pub merged_away: Vec<(i64, RecordKey)>,
}

#[derive(Debug, Default)]
pub(crate) struct EntityStore {
    next_seq: i64,
    next_feature_id: i64,
    feature_ids: HashMap<(&'static str, String), i64>,
    feature_lib: BTreeMap<i64, (&'static FeatureSpec, String)>,
    records: BTreeMap<RecordKey, StoredRecord>,
    entities: BTreeMap<i64, Vec<RecordKey>>,
    record_entity: HashMap<RecordKey, i64>,
    relations: BTreeMap<i64, BTreeMap<i64, BTreeSet<&'static str>>>,
}

impl EntityStore {
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn contains_entity(&self, entity_id: i64) -> bool {
        self.entities.contains_key(&entity_id)
    }

    pub fn entity_of(&self, data_source: &str, record_id: &str) -> Option<i64> {
        self.record_entity
            .get(&(data_source.to_string(), record_id.to_string()))
            .copied()
    }

    pub fn record(&self, data_source: &str, record_id: &str) -> Option<&StoredRecord> {
        self.records.get(&(data_source.to_string(), record_id.to_string()))
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Insert or replace a record and re-resolve.
    pub fn upsert(&mut self, data_source: &str, record_id: &str, document: Value) -> Result<Change> {
        let extracted = extract_features(&document)?;
        let key = (data_source.to_string(), record_id.to_string());
        let seq = match self.records.get(&key) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        let features = extracted
            .into_iter()
            .map(|(spec, value)| FeatureValue {
                id: self.feature_id(spec, &value),
                spec,
                value,
            })
            .collect();

        let before = self.record_entity.clone();
        let previous = before.get(&key).copied();
        self.records.insert(
            key.clone(),
            StoredRecord {
                seq,
                data_source: key.0.clone(),
                record_id: key.1.clone(),
                json: document,
                features,
            },
        );
        self.rebuild();

        let mut change = self.diff(&before);
        change.affected.extend(previous);
        change.affected.extend(self.record_entity.get(&key).copied());
        Ok(change)
    }

    /// Remove a record; `None` when it did not exist.
    pub fn remove(&mut self, data_source: &str, record_id: &str) -> Option<Change> {
        let key = (data_source.to_string(), record_id.to_string());
        self.records.get(&key)?;
        let before = self.record_entity.clone();
        self.records.remove(&key);
        self.rebuild();
        Some(self.diff(&before))
    }

    fn feature_id(&mut self, spec: &'static FeatureSpec, value: &str) -> i64 {
        let lookup = (spec.ftype, value.to_string());
        if let Some(id) = self.feature_ids.get(&lookup) {
            return *id;
        }
        self.next_feature_id += 1;
        let id = self.next_feature_id;
        self.feature_ids.insert(lookup, id);
        self.feature_lib.insert(id, (spec, value.to_string()));
        id
    }

    fn rebuild(&mut self) {
        let mut ordered: Vec<&StoredRecord> = self.records.values().collect();
        ordered.sort_by_key(|r| r.seq);

        let mut parent: Vec<usize> = (0..ordered.len()).collect();
        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        let mut first_with_key: HashMap<String, usize> = HashMap::new();
        for (i, record) in ordered.iter().enumerate() {
            for key in record.resolve_keys() {
                match first_with_key.get(&key) {
                    Some(&j) => {
                        let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                        // Smaller index (earlier record) stays root.
                        let (root, child) = if a < b { (a, b) } else { (b, a) };
                        parent[child] = root;
                    }
                    None => {
                        first_with_key.insert(key, i);
                    }
                }
            }
        }

        let mut entities: BTreeMap<i64, Vec<RecordKey>> = BTreeMap::new();
        let mut record_entity = HashMap::new();
        for i in 0..ordered.len() {
            let root = find(&mut parent, i);
            let entity_id = ordered[root].seq;
            entities.entry(entity_id).or_default().push(ordered[i].key());
            record_entity.insert(ordered[i].key(), entity_id);
        }

        let mut by_relating: HashMap<(&'static str, &str), BTreeSet<i64>> = HashMap::new();
        for record in &ordered {
            let entity_id = record_entity[&record.key()];
            for feature in record.features.iter().filter(|f| f.spec.role == Role::Relating) {
                by_relating
                    .entry((feature.ftype(), feature.value.as_str()))
                    .or_default()
                    .insert(entity_id);
            }
        }
        let mut relations: BTreeMap<i64, BTreeMap<i64, BTreeSet<&'static str>>> = BTreeMap::new();
        for ((ftype, _), ids) in &by_relating {
            for a in ids {
                for b in ids.iter().filter(|b| *b != a) {
                    relations.entry(*a).or_default().entry(*b).or_default().insert(*ftype);
                }
            }
        }

        self.entities = entities;
        self.record_entity = record_entity;
        self.relations = relations;
    }

    fn diff(&self, before: &HashMap<RecordKey, i64>) -> Change {
        let mut change = Change::default();
        for (key, old) in before {
            match self.record_entity.get(key) {
                Some(new) if new == old => {}
                Some(new) => {
                    change.affected.insert(*old);
                    change.affected.insert(*new);
                }
                None => {
                    change.affected.insert(*old);
                }
            }
        }
        for (key, new) in &self.record_entity {
            if !before.contains_key(key) {
                change.affected.insert(*new);
            }
        }
        let mut vanished: BTreeMap<i64, RecordKey> = BTreeMap::new();
        for (key, old) in before {
            if self.entities.contains_key(old) || !self.records.contains_key(key) {
                continue;
            }
            let slot = vanished.entry(*old).or_insert_with(|| key.clone());
            if key < slot {
                *slot = key.clone();
            }
        }
        change.merged_away = vanished.into_iter().collect();
        change
    }

    // =========================================================================
    // Views
    // =========================================================================

    fn members(&self, entity_id: i64) -> Vec<&StoredRecord> {
        self.entities
            .get(&entity_id)
            .map(|keys| keys.iter().filter_map(|k| self.records.get(k)).collect())
            .unwrap_or_default()
    }

    fn entity_features(&self, entity_id: i64) -> Vec<&FeatureValue> {
        let mut seen = HashSet::new();
        self.members(entity_id)
            .into_iter()
            .flat_map(|r| r.features.iter())
            .filter(|f| seen.insert(f.id))
            .collect()
    }

    pub fn entity_name(&self, entity_id: i64) -> String {
        self.members(entity_id)
            .iter()
            .flat_map(|r| r.features.iter())
            .find(|f| f.spec.role == Role::Name)
            .map(|f| f.value.clone())
            .unwrap_or_default()
    }

    pub fn related(&self, entity_id: i64) -> Vec<(i64, String)> {
        self.relations
            .get(&entity_id)
            .map(|rel| {
                rel.iter()
                    .map(|(id, ftypes)| {
                        let mut ftypes: Vec<_> = ftypes.iter().copied().collect();
                        ftypes.sort_by_key(|f| ftype_rank(f));
                        (*id, ftypes.iter().map(|f| format!("+{}", f)).collect())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn record_summary(&self, entity_id: i64) -> Value {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for record in self.members(entity_id) {
            *counts.entry(record.data_source.as_str()).or_default() += 1;
        }
        Value::Array(
            counts
                .into_iter()
                .map(|(ds, n)| json!({ "DATA_SOURCE": ds, "RECORD_COUNT": n }))
                .collect(),
        )
    }

    fn features_doc(&self, features: &[&FeatureValue]) -> Value {
        let mut sorted: Vec<&&FeatureValue> = features.iter().collect();
        sorted.sort_by_key(|f| (ftype_rank(f.ftype()), f.id));
        let mut doc = Map::new();
        for feature in sorted {
            let entry = doc
                .entry(feature.ftype().to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = entry {
                items.push(json!({ "FEAT_DESC": feature.value, "LIB_FEAT_ID": feature.id }));
            }
        }
        Value::Object(doc)
    }

    /// Match key of a member record against the members before it.
    fn member_match_key(&self, members: &[&StoredRecord], index: usize) -> String {
        let earlier: Vec<&FeatureValue> = members[..index]
            .iter()
            .flat_map(|r| r.features.iter())
            .collect();
        let own: Vec<&FeatureValue> = members[index].features.iter().collect();
        match_key(&own, &earlier)
    }

    pub fn record_doc(&self, data_source: &str, record_id: &str, flags: i64) -> Option<Value> {
        let record = self.record(data_source, record_id)?;
        let mut doc = Map::new();
        doc.insert("DATA_SOURCE".to_string(), json!(record.data_source));
        doc.insert("RECORD_ID".to_string(), json!(record.record_id));
        if has(flags, flags::SZ_ENTITY_INCLUDE_RECORD_FEATURES) {
            let features: Vec<&FeatureValue> = record.features.iter().collect();
            doc.insert("FEATURES".to_string(), self.features_doc(&features));
        }
        if has(flags, flags::SZ_ENTITY_INCLUDE_RECORD_JSON_DATA) {
            doc.insert("JSON_DATA".to_string(), record.json.clone());
        }
        Some(Value::Object(doc))
    }

    pub fn entity_doc(&self, entity_id: i64, flags: i64) -> Option<Value> {
        let members = self.members(entity_id);
        if members.is_empty() {
            return None;
        }

        let mut resolved = Map::new();
        resolved.insert("ENTITY_ID".to_string(), json!(entity_id));
        if has(flags, flags::SZ_ENTITY_INCLUDE_ENTITY_NAME) {
            resolved.insert("ENTITY_NAME".to_string(), json!(self.entity_name(entity_id)));
        }
        if has(flags, flags::SZ_ENTITY_INCLUDE_ALL_FEATURES)
            || has(flags, flags::SZ_ENTITY_INCLUDE_REPRESENTATIVE_FEATURES)
        {
            let features = self.entity_features(entity_id);
            resolved.insert("FEATURES".to_string(), self.features_doc(&features));
        }
        if has(flags, flags::SZ_ENTITY_INCLUDE_RECORD_SUMMARY) {
            resolved.insert("RECORD_SUMMARY".to_string(), self.record_summary(entity_id));
        }
        let with_json = has(flags, flags::SZ_ENTITY_INCLUDE_RECORD_JSON_DATA);
        let with_matching = has(flags, flags::SZ_ENTITY_INCLUDE_RECORD_MATCHING_INFO);
        if has(flags, flags::SZ_ENTITY_INCLUDE_RECORD_DATA) || with_json || with_matching {
            let records: Vec<Value> = members
                .iter()
                .enumerate()
                .map(|(i, record)| {
                    let mut doc = Map::new();
                    doc.insert("DATA_SOURCE".to_string(), json!(record.data_source));
                    doc.insert("RECORD_ID".to_string(), json!(record.record_id));
                    if with_matching {
                        doc.insert("INTERNAL_ID".to_string(), json!(record.seq));
                        doc.insert("MATCH_KEY".to_string(), json!(self.member_match_key(&members, i)));
                    }
                    if with_json {
                        doc.insert("JSON_DATA".to_string(), record.json.clone());
                    }
                    Value::Object(doc)
                })
                .collect();
            resolved.insert("RECORDS".to_string(), Value::Array(records));
        }

        let mut doc = Map::new();
        doc.insert("RESOLVED_ENTITY".to_string(), Value::Object(resolved));
        if flags & flags::SZ_ENTITY_INCLUDE_ALL_RELATIONS != 0 {
            let related: Vec<Value> = if has(flags, flags::SZ_ENTITY_INCLUDE_POSSIBLY_RELATED_RELATIONS) {
                self.related(entity_id)
                    .into_iter()
                    .map(|(id, key)| self.related_doc(id, &key, flags))
                    .collect()
            } else {
                Vec::new()
            };
            doc.insert("RELATED_ENTITIES".to_string(), Value::Array(related));
        }
        Some(Value::Object(doc))
    }

    fn related_doc(&self, entity_id: i64, match_key: &str, flags: i64) -> Value {
        let mut doc = Map::new();
        doc.insert("ENTITY_ID".to_string(), json!(entity_id));
        doc.insert("MATCH_LEVEL_CODE".to_string(), json!("POSSIBLY_RELATED"));
        doc.insert("MATCH_KEY".to_string(), json!(match_key));
        if has(flags, flags::SZ_ENTITY_INCLUDE_RELATED_ENTITY_NAME) {
            doc.insert("ENTITY_NAME".to_string(), json!(self.entity_name(entity_id)));
        }
        if has(flags, flags::SZ_ENTITY_INCLUDE_RELATED_RECORD_SUMMARY) {
            doc.insert("RECORD_SUMMARY".to_string(), self.record_summary(entity_id));
        }
        Value::Object(doc)
    }

    pub fn feature_doc(&self, feature_id: i64) -> Option<Value> {
        let (spec, value) = self.feature_lib.get(&feature_id)?;
        Some(json!({
            "LIB_FEAT_ID": feature_id,
            "FTYPE_CODE": spec.ftype,
            "ELEMENTS": [{ "FELEM_CODE": spec.attribute, "FELEM_VALUE": value }],
        }))
    }

    // =========================================================================
    // Search, paths, networks
    // =========================================================================

    /// Entities matching a search document as `(entity_id, level, match_key)`.
    pub fn search(&self, attributes: &Value) -> Result<Vec<(i64, &'static str, String)>> {
        let extracted = extract_features(attributes)?;
        if extracted.is_empty() {
            return Err(Error::bad_input("search attributes contain no recognized features"));
        }
        let probe = StoredRecord {
            seq: 0,
            data_source: String::new(),
            record_id: String::new(),
            json: Value::Null,
            features: extracted
                .into_iter()
                .map(|(spec, value)| FeatureValue { id: 0, spec, value })
                .collect(),
        };
        let probe_keys: HashSet<String> = probe.resolve_keys().into_iter().collect();
        let probe_features: Vec<&FeatureValue> = probe.features.iter().collect();

        let mut results = Vec::new();
        for entity_id in self.entities.keys() {
            let members = self.members(*entity_id);
            let resolves = members
                .iter()
                .flat_map(|r| r.resolve_keys())
                .any(|k| probe_keys.contains(&k));
            let entity_features = self.entity_features(*entity_id);
            let shared: Vec<&FeatureValue> = entity_features
                .iter()
                .copied()
                .filter(|f| probe_features.iter().any(|p| p.same_as(f)))
                .collect();
            let level = if resolves {
                "RESOLVED"
            } else if shared.iter().any(|f| f.spec.role == Role::Relating) {
                "POSSIBLY_RELATED"
            } else if shared.iter().any(|f| f.spec.role == Role::Name) {
                "NAME_ONLY"
            } else {
                continue;
            };
            results.push((*entity_id, level, match_key(&probe_features, &entity_features)));
        }
        Ok(results)
    }

    /// Shortest path over relations, at most `max_degrees` hops.
    pub fn path(&self, start: i64, end: i64, max_degrees: i64, avoid: &HashSet<i64>) -> Option<Vec<i64>> {
        if start == end {
            return Some(vec![start]);
        }
        let mut previous: HashMap<i64, i64> = HashMap::new();
        let mut queue = VecDeque::from([(start, 0i64)]);
        let mut visited = HashSet::from([start]);
        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_degrees {
                continue;
            }
            let Some(neighbors) = self.relations.get(&current) else {
                continue;
            };
            for next in neighbors.keys() {
                if (avoid.contains(next) && *next != end) || !visited.insert(*next) {
                    continue;
                }
                previous.insert(*next, current);
                if *next == end {
                    let mut path = vec![end];
                    let mut at = end;
                    while let Some(p) = previous.get(&at) {
                        path.push(*p);
                        at = *p;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back((*next, depth + 1));
            }
        }
        None
    }

    /// Entities within `degrees` hops of `start`, closest first, excluding `start`.
    pub fn neighborhood(&self, start: i64, degrees: i64) -> Vec<i64> {
        let mut found = Vec::new();
        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([(start, 0i64)]);
        while let Some((current, depth)) = queue.pop_front() {
            if depth >= degrees {
                continue;
            }
            if let Some(neighbors) = self.relations.get(&current) {
                for next in neighbors.keys() {
                    if visited.insert(*next) {
                        found.push(*next);
                        queue.push_back((*next, depth + 1));
                    }
                }
            }
        }
        found
    }

    pub fn link_doc(&self, a: i64, b: i64) -> Value {
        let key = self
            .related(a)
            .into_iter()
            .find(|(id, _)| *id == b)
            .map(|(_, key)| key)
            .unwrap_or_default();
        json!({
            "MIN_ENTITY_ID": a.min(b),
            "MAX_ENTITY_ID": a.max(b),
            "MATCH_LEVEL_CODE": "POSSIBLY_RELATED",
            "MATCH_KEY": key,
        })
    }

    // =========================================================================
    // Why / how
    // =========================================================================

    pub fn why_entities(&self, a: i64, b: i64) -> Value {
        let left = self.entity_features(a);
        let right = self.entity_features(b);
        let level = if a == b {
            "RESOLVED"
        } else if self.relations.get(&a).is_some_and(|r| r.contains_key(&b)) {
            "POSSIBLY_RELATED"
        } else {
            "NO_MATCH"
        };
        json!({
            "ENTITY_ID": a,
            "ENTITY_ID_2": b,
            "MATCH_INFO": {
                "WHY_KEY": match_key(&left, &right),
                "MATCH_LEVEL_CODE": level,
                "FEATURE_SCORES": feature_scores(&left, &right),
            }
        })
    }

    pub fn why_records(&self, a: &StoredRecord, b: &StoredRecord) -> Value {
        let left: Vec<&FeatureValue> = a.features.iter().collect();
        let right: Vec<&FeatureValue> = b.features.iter().collect();
        let entity_a = self.record_entity.get(&a.key()).copied().unwrap_or(0);
        let entity_b = self.record_entity.get(&b.key()).copied().unwrap_or(0);
        let resolves = a.resolve_keys().iter().any(|k| b.resolve_keys().contains(k));
        let level = if resolves {
            "RESOLVED"
        } else if left
            .iter()
            .any(|l| l.spec.role == Role::Relating && right.iter().any(|r| l.same_as(r)))
        {
            "POSSIBLY_RELATED"
        } else {
            "NO_MATCH"
        };
        json!({
            "INTERNAL_ID": a.seq,
            "ENTITY_ID": entity_a,
            "INTERNAL_ID_2": b.seq,
            "ENTITY_ID_2": entity_b,
            "MATCH_INFO": {
                "WHY_KEY": match_key(&left, &right),
                "MATCH_LEVEL_CODE": level,
                "FEATURE_SCORES": feature_scores(&left, &right),
            }
        })
    }

    /// Replay how the entity's records came together, in ingestion order.
    pub fn how(&self, entity_id: i64) -> Option<Value> {
        let members = self.members(entity_id);
        if members.is_empty() {
            return None;
        }

        let virtual_doc = |id: &str, records: &[&StoredRecord]| {
            json!({
                "VIRTUAL_ENTITY_ID": id,
                "MEMBER_RECORDS": records.iter().map(|r| r.member_doc()).collect::<Vec<_>>(),
            })
        };

        let mut virtuals: Vec<(String, Vec<&StoredRecord>)> = Vec::new();
        let mut steps = Vec::new();
        for record in &members {
            let keys: HashSet<String> = record.resolve_keys().into_iter().collect();
            let mut current = (format!("V{}", record.seq), vec![*record]);
            while let Some(pos) = virtuals.iter().position(|(_, records)| {
                records
                    .iter()
                    .flat_map(|r| r.resolve_keys())
                    .any(|k| keys.contains(&k))
            }) {
                let (existing_id, existing) = virtuals.remove(pos);
                let step = steps.len() + 1;
                let existing_features: Vec<&FeatureValue> =
                    existing.iter().flat_map(|r| r.features.iter()).collect();
                let inbound_features: Vec<&FeatureValue> = record.features.iter().collect();
                let anchor = existing.iter().map(|r| r.seq).min().unwrap_or(record.seq);
                let result_id = format!("V{}-S{}", anchor, step);
                steps.push(json!({
                    "STEP": step,
                    "VIRTUAL_ENTITY_1": virtual_doc(&existing_id, &existing),
                    "VIRTUAL_ENTITY_2": virtual_doc(&current.0, &current.1),
                    "INBOUND_VIRTUAL_ENTITY_ID": current.0,
                    "RESULT_VIRTUAL_ENTITY_ID": result_id,
                    "MATCH_INFO": { "MATCH_KEY": match_key(&inbound_features, &existing_features) },
                }));
                let mut merged = existing;
                merged.extend(current.1);
                merged.sort_by_key(|r| r.seq);
                current = (result_id, merged);
            }
            virtuals.push(current);
        }

        Some(json!({
            "HOW_RESULTS": {
                "RESOLUTION_STEPS": steps,
                "FINAL_STATE": {
                    "NEED_REEVALUATION": 0,
                    "VIRTUAL_ENTITIES": virtuals
                        .iter()
                        .map(|(id, records)| virtual_doc(id, records))
                        .collect::<Vec<_>>(),
                }
            }
        }))
    }

    // =========================================================================
    // Export
    // =========================================================================

    fn exported_entities(&self, flags: i64) -> Vec<i64> {
        let multi = has(flags, flags::SZ_EXPORT_INCLUDE_MULTI_RECORD_ENTITIES);
        let single = has(flags, flags::SZ_EXPORT_INCLUDE_SINGLE_RECORD_ENTITIES);
        self.entities
            .iter()
            .filter(|(_, members)| match (multi, single) {
                (false, false) => true,
                _ => (members.len() > 1 && multi) || (members.len() == 1 && single),
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn export_json(&self, flags: i64) -> VecDeque<String> {
        self.exported_entities(flags)
            .into_iter()
            .filter_map(|id| self.entity_doc(id, flags))
            .map(|doc| format!("{}\n", doc))
            .collect()
    }

    pub fn export_csv(&self, csv_column_list: &str, flags: i64) -> Result<VecDeque<String>> {
        let list = csv_column_list.trim();
        let columns: Vec<String> = if list.is_empty() || list == "*" {
            CSV_DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect()
        } else {
            list.split(',').map(|c| c.trim().to_ascii_uppercase()).collect()
        };
        if let Some(unknown) = columns.iter().find(|c| !CSV_COLUMNS.contains(&c.as_str())) {
            return Err(Error::bad_input(format!("unknown CSV column {}", unknown)));
        }

        let mut rows = VecDeque::new();
        rows.push_back(format!("{}\n", columns.join(",")));
        for entity_id in self.exported_entities(flags) {
            let members = self.members(entity_id);
            let name = self.entity_name(entity_id);
            for (i, record) in members.iter().enumerate() {
                let is_first = i == 0;
                let match_key = self.member_match_key(&members, i);
                let fields: Vec<String> = columns
                    .iter()
                    .map(|column| match column.as_str() {
                        "RESOLVED_ENTITY_ID" => entity_id.to_string(),
                        "RESOLVED_ENTITY_NAME" => name.clone(),
                        "RELATED_ENTITY_ID" => "0".to_string(),
                        "MATCH_LEVEL" => (if is_first { "0" } else { "1" }).to_string(),
                        "MATCH_LEVEL_CODE" => (if is_first { "" } else { "RESOLVED" }).to_string(),
                        "MATCH_KEY" => match_key.clone(),
                        "IS_DISCLOSED" | "IS_AMBIGUOUS" => "0".to_string(),
                        "DATA_SOURCE" => record.data_source.clone(),
                        "RECORD_ID" => record.record_id.clone(),
                        "JSON_DATA" => record.json.to_string(),
                        _ => String::new(),
                    })
                    .map(|f| csv_field(&f))
                    .collect();
                rows.push_back(format!("{}\n", fields.join(",")));
            }
        }
        Ok(rows)
    }
}

fn feature_scores(left: &[&FeatureValue], right: &[&FeatureValue]) -> Value {
    let mut scores = Map::new();
    for l in left {
        for r in right.iter().filter(|r| r.ftype() == l.ftype()) {
            let score = if l.value == r.value { 100 } else { 0 };
            let entry = scores
                .entry(l.ftype().to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = entry {
                items.push(json!({
                    "INBOUND_FEAT_DESC": l.value,
                    "CANDIDATE_FEAT_DESC": r.value,
                    "SCORE": score,
                }));
            }
        }
    }
    Value::Object(scores)
}
