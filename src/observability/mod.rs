//! Observability utilities.
//!
//! All log output of the crate goes through component [`MessageLogger`]s,
//! which stamp numeric message ids and gate on a per-component level that
//! can be changed at runtime. The process subscriber therefore admits every
//! level for this crate and leaves filtering to the components.

mod level;
mod logger;
mod trace;

pub use level::LogLevel;
pub use logger::{MessageLogger, MessageTemplates};
pub use trace::CallTrace;

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Default subscriber filter: everything from this crate, warnings from dependencies.
const DEFAULT_FILTER: &str = "warn,sz_grpc_server=trace";

/// Initialize tracing subscriber once for the process.
///
/// Log format defaults to plain text and can be switched to JSON via
/// `SENZING_TOOLS_LOG_FORMAT=json`. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let json = std::env::var("SENZING_TOOLS_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let result = if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}
