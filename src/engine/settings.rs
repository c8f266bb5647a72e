//! Engine settings document helpers.
//!
//! The settings string is opaque to the server except for two things: the
//! datastore connection URLs (needed to decide on bootstrap) and the purge
//! privilege.

use serde_json::{json, Value};

use crate::types::{Error, Result};

/// Parsed view over an engine settings JSON document.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    document: Value,
}

impl EngineSettings {
    pub fn parse(settings: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(settings)
            .map_err(|e| Error::bad_input(format!("engine settings are not valid JSON: {}", e)))?;
        if !document.is_object() {
            return Err(Error::bad_input("engine settings must be a JSON object"));
        }
        Ok(Self { document })
    }

    /// Datastore URLs from `SQL.CONNECTION`, in document order.
    ///
    /// `CONNECTION` may hold one URL or an array of URLs.
    pub fn database_urls(&self) -> Vec<String> {
        match self.document.pointer("/SQL/CONNECTION") {
            Some(Value::String(url)) if !url.is_empty() => vec![url.clone()],
            Some(Value::Array(urls)) => urls
                .iter()
                .filter_map(|u| u.as_str())
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether destructive repository operations are permitted.
    pub fn allow_purge(&self) -> bool {
        match self.document.pointer("/PIPELINE/ALLOW_PURGE") {
            Some(Value::Bool(allowed)) => *allowed,
            Some(Value::String(allowed)) => allowed.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.document
    }
}

/// True for `sqlite3://` URLs that ask for a shared in-memory database
/// (`mode=memory` and `cache=shared`). Such a datastore exists only inside
/// this process and must be bootstrapped before the engine starts.
pub fn is_in_memory_shared_cache(database_url: &str) -> bool {
    let Some(rest) = database_url.strip_prefix("sqlite3://") else {
        return false;
    };
    let Some((_, query)) = rest.split_once('?') else {
        return false;
    };
    let mut memory = false;
    let mut shared = false;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "mode" => memory = value == "memory",
            "cache" => shared = value == "shared",
            _ => {}
        }
    }
    memory && shared
}

/// Database URLs of `settings` that need bootstrapping, or an empty list.
pub fn bootstrap_urls(settings: &str) -> Result<Vec<String>> {
    let settings = EngineSettings::parse(settings)?;
    let urls = settings.database_urls();
    match urls.first() {
        Some(first) if is_in_memory_shared_cache(first) => Ok(urls),
        _ => Ok(Vec::new()),
    }
}

/// Build a minimal settings document around a single database URL.
pub fn settings_from_database_url(database_url: &str) -> Result<String> {
    // Engine URLs such as `sqlite3://na:na@/path` carry credentials without a
    // host, which generic URL parsers reject; only the scheme is checked.
    let (scheme, _) = database_url
        .split_once("://")
        .ok_or_else(|| Error::bad_input(format!("invalid database URL {}", database_url)))?;
    match scheme {
        "sqlite3" | "postgresql" | "mysql" | "mssql" | "oci" => {}
        other => {
            return Err(Error::bad_input(format!(
                "unsupported database URL scheme '{}'",
                other
            )))
        }
    }
    let document = json!({
        "PIPELINE": {
            "CONFIGPATH": "/etc/opt/senzing",
            "RESOURCEPATH": "/opt/senzing/er/resources",
            "SUPPORTPATH": "/opt/senzing/data"
        },
        "SQL": {
            "CONNECTION": database_url
        }
    });
    Ok(document.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMORY: &str = "sqlite3://na:na@/tmp/sqlite/G2C.db?mode=memory&cache=shared";

    #[test]
    fn test_database_urls() {
        let settings = EngineSettings::parse(&format!(r#"{{"SQL":{{"CONNECTION":"{}"}}}}"#, MEMORY)).unwrap();
        assert_eq!(settings.database_urls(), vec![MEMORY.to_string()]);

        let settings = EngineSettings::parse(r#"{"PIPELINE":{}}"#).unwrap();
        assert!(settings.database_urls().is_empty());
    }

    #[test]
    fn test_invalid_settings() {
        assert_eq!(EngineSettings::parse("not json").unwrap_err().kind(), "bad-input");
        assert_eq!(EngineSettings::parse("[1,2]").unwrap_err().kind(), "bad-input");
    }

    #[test]
    fn test_in_memory_shared_cache_detection() {
        assert!(is_in_memory_shared_cache(MEMORY));
        assert!(is_in_memory_shared_cache("sqlite3://na:na@nowhere/tmp/G2C.db?cache=shared&mode=memory"));
        assert!(!is_in_memory_shared_cache("sqlite3://na:na@/tmp/sqlite/G2C.db"));
        assert!(!is_in_memory_shared_cache("sqlite3://na:na@/tmp/G2C.db?mode=memory"));
        assert!(!is_in_memory_shared_cache("postgresql://u:p@db:5432:G2/?mode=memory&cache=shared"));
    }

    #[test]
    fn test_bootstrap_urls() {
        let settings = format!(r#"{{"SQL":{{"CONNECTION":"{}"}}}}"#, MEMORY);
        assert_eq!(bootstrap_urls(&settings).unwrap().len(), 1);
        assert!(bootstrap_urls(r#"{"SQL":{"CONNECTION":"sqlite3://na:na@/tmp/G2C.db"}}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_allow_purge() {
        assert!(EngineSettings::parse(r#"{"PIPELINE":{"ALLOW_PURGE":true}}"#).unwrap().allow_purge());
        assert!(!EngineSettings::parse(r#"{"PIPELINE":{}}"#).unwrap().allow_purge());
    }

    #[test]
    fn test_settings_from_database_url() {
        let settings = settings_from_database_url("sqlite3://na:na@/tmp/sqlite/G2C.db").unwrap();
        let parsed = EngineSettings::parse(&settings).unwrap();
        assert_eq!(parsed.database_urls(), vec!["sqlite3://na:na@/tmp/sqlite/G2C.db".to_string()]);

        assert!(settings_from_database_url("ftp://host/file").is_err());
    }
}
