//! Strongly-typed identifiers.
//!
//! Engine handles and ids travel as `i64` on the wire; these newtypes keep
//! them from being mixed up once they are inside the server.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed numeric identifier.
///
/// Generates: struct, `new()` (rejects non-positive values), `get()`,
/// Display, Serialize, Deserialize.
macro_rules! define_numeric_id {
    ($name:ident, $what:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(i64);

        impl $name {
            pub fn new(value: i64) -> Result<Self, String> {
                if value <= 0 {
                    return Err(format!("invalid {}: {}", $what, value));
                }
                Ok(Self(value))
            }

            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_numeric_id!(ConfigHandle, "config handle");
define_numeric_id!(ExportHandle, "export handle");
define_numeric_id!(ConfigId, "config id");
define_numeric_id!(EntityId, "entity id");

/// Identifier shared by the enter/exit trace pair and observer events of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
