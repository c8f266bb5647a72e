//! Configuration documents: `{"G2_CONFIG": {"CFG_DSRC": [...], ...}}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

use crate::types::{Error, Result};

/// First id handed out to user-added data sources.
pub const FIRST_USER_DSRC_ID: i64 = 1001;

const MAX_CODE_LEN: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    #[serde(rename = "DSRC_ID")]
    pub id: i64,
    #[serde(rename = "DSRC_CODE")]
    pub code: String,
}

#[derive(Serialize)]
struct DataSourceList<'a> {
    #[serde(rename = "DATA_SOURCES")]
    data_sources: &'a [DataSource],
}

/// A parsed configuration document. Sections other than `CFG_DSRC` are kept
/// verbatim so export/import round-trips.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    data_sources: Vec<DataSource>,
    extra: Map<String, Value>,
}

impl ConfigDocument {
    /// The template every new configuration starts from.
    pub fn template() -> Self {
        let mut extra = Map::new();
        extra.insert(
            "CONFIG_BASE_VERSION".to_string(),
            json!({
                "VERSION": "4.0.0",
                "BUILD_VERSION": "4.0.0.00000",
                "COMPATIBILITY_VERSION": { "CONFIG_VERSION": "11" }
            }),
        );
        Self {
            data_sources: vec![
                DataSource {
                    id: 1,
                    code: "TEST".to_string(),
                },
                DataSource {
                    id: 2,
                    code: "SEARCH".to_string(),
                },
            ],
            extra,
        }
    }

    pub fn parse(definition: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(definition)
            .map_err(|e| Error::bad_input(format!("configuration is not valid JSON: {}", e)))?;
        let mut root = match value {
            Value::Object(mut obj) => match obj.remove("G2_CONFIG") {
                Some(Value::Object(root)) => root,
                _ => return Err(Error::bad_input("configuration has no G2_CONFIG object")),
            },
            _ => return Err(Error::bad_input("configuration must be a JSON object")),
        };

        let entries = match root.remove("CFG_DSRC") {
            Some(Value::Array(entries)) => entries,
            _ => return Err(Error::bad_input("configuration has no CFG_DSRC array")),
        };

        let mut document = Self {
            data_sources: Vec::with_capacity(entries.len()),
            extra: root,
        };
        let mut ids = HashSet::new();
        for entry in entries {
            let source: DataSource = serde_json::from_value(entry)
                .map_err(|e| Error::bad_input(format!("invalid CFG_DSRC entry: {}", e)))?;
            let code = normalize_code(&source.code)?;
            if source.id <= 0 || !ids.insert(source.id) {
                return Err(Error::bad_input(format!("invalid or duplicate DSRC_ID {}", source.id)));
            }
            if document.position(&code).is_some() {
                return Err(Error::bad_input(format!("duplicate DSRC_CODE {}", code)));
            }
            document.data_sources.push(DataSource { id: source.id, code });
        }
        Ok(document)
    }

    pub fn to_json(&self) -> String {
        let mut root = Map::new();
        root.insert(
            "CFG_DSRC".to_string(),
            serde_json::to_value(&self.data_sources).unwrap_or(Value::Array(Vec::new())),
        );
        for (key, value) in &self.extra {
            root.insert(key.clone(), value.clone());
        }
        let mut document = Map::new();
        document.insert("G2_CONFIG".to_string(), Value::Object(root));
        Value::Object(document).to_string()
    }

    /// Add a data source and return its id. Duplicates are `bad-input`.
    pub fn add_data_source(&mut self, code: &str) -> Result<i64> {
        let code = normalize_code(code)?;
        if self.position(&code).is_some() {
            return Err(Error::bad_input(format!("data source {} already exists", code)));
        }
        let id = self
            .data_sources
            .iter()
            .map(|d| d.id + 1)
            .max()
            .unwrap_or(0)
            .max(FIRST_USER_DSRC_ID);
        self.data_sources.push(DataSource { id, code });
        Ok(id)
    }

    /// Remove a data source. Absent codes are ignored.
    pub fn delete_data_source(&mut self, code: &str) -> Result<()> {
        let code = normalize_code(code)?;
        if let Some(index) = self.position(&code) {
            self.data_sources.remove(index);
        }
        Ok(())
    }

    pub fn data_sources(&self) -> &[DataSource] {
        &self.data_sources
    }

    pub fn data_sources_json(&self) -> String {
        serde_json::to_string(&DataSourceList {
            data_sources: &self.data_sources,
        })
        .unwrap_or_default()
    }

    pub fn codes(&self) -> HashSet<String> {
        self.data_sources.iter().map(|d| d.code.clone()).collect()
    }

    fn position(&self, code: &str) -> Option<usize> {
        self.data_sources.iter().position(|d| d.code == code)
    }
}

/// Upper-case and validate a data source code: 1-25 of `[A-Z0-9_-]`.
pub fn normalize_code(code: &str) -> Result<String> {
    let code = code.trim().to_ascii_uppercase();
    let valid = !code.is_empty()
        && code.len() <= MAX_CODE_LEN
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(code)
    } else {
        Err(Error::bad_input(format!("invalid data source code '{}'", code)))
    }
}
