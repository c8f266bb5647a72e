//! Application error types.
//!
//! Every error carries one of a fixed set of kinds so clients can branch on
//! the failure class without parsing messages. Handlers annotate errors with
//! their call site before returning them.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// gRPC metadata key carrying the machine-readable error kind.
pub const ERROR_KIND_METADATA: &str = "sz-error-kind";

/// gRPC metadata key carrying the engine's numeric error code.
pub const ENGINE_CODE_METADATA: &str = "sz-engine-code";

/// Main error enum for the server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed or invalid client argument (map to gRPC INVALID_ARGUMENT).
    #[error("bad input: {0}")]
    BadInput(String),

    /// Compare-and-swap precondition failed (map to gRPC ABORTED).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Referenced object does not exist (map to gRPC NOT_FOUND).
    #[error("not found: {0}")]
    NotFound(String),

    /// Failure reported by the engine, code passed through verbatim.
    #[error("engine error {code}: {message}")]
    Engine { code: i64, message: String },

    /// Engine subdomain not initialized or already destroyed (map to gRPC UNAVAILABLE).
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Listener, TLS or connection failure below the handler layer.
    #[error("transport error: {0}")]
    Transport(String),

    /// Condition caused by the handler layer itself (map to gRPC INTERNAL).
    #[error("internal error: {0}")]
    Internal(String),

    /// The caller went away before the call finished.
    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Machine-readable kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BadInput(_) => "bad-input",
            Error::Conflict(_) => "conflict",
            Error::NotFound(_) => "not-found",
            Error::Engine { .. } => "engine",
            Error::Unavailable(_) => "unavailable",
            Error::Transport(_) => "transport",
            Error::Internal(_) => "internal",
            Error::Cancelled(_) => "cancelled",
        }
    }

    /// Engine error code, when the engine reported one.
    pub fn engine_code(&self) -> Option<i64> {
        match self {
            Error::Engine { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Message without the kind prefix added by `Display`.
    pub fn message(&self) -> &str {
        match self {
            Error::BadInput(msg)
            | Error::Conflict(msg)
            | Error::NotFound(msg)
            | Error::Unavailable(msg)
            | Error::Transport(msg)
            | Error::Internal(msg)
            | Error::Cancelled(msg) => msg,
            Error::Engine { message, .. } => message,
        }
    }

    /// Prefix the message with a call-site label, keeping kind and code.
    pub fn with_site(self, site: &str) -> Self {
        let wrap = |msg: String| format!("{}: {}", site, msg);
        match self {
            Error::BadInput(msg) => Error::BadInput(wrap(msg)),
            Error::Conflict(msg) => Error::Conflict(wrap(msg)),
            Error::NotFound(msg) => Error::NotFound(wrap(msg)),
            Error::Engine { code, message } => Error::Engine {
                code,
                message: wrap(message),
            },
            Error::Unavailable(msg) => Error::Unavailable(wrap(msg)),
            Error::Transport(msg) => Error::Transport(wrap(msg)),
            Error::Internal(msg) => Error::Internal(wrap(msg)),
            Error::Cancelled(msg) => Error::Cancelled(wrap(msg)),
        }
    }

    /// Convert to gRPC status, attaching kind and engine code as metadata.
    pub fn to_grpc_status(&self) -> tonic::Status {
        let message = self.to_string();
        let mut status = match self {
            Error::BadInput(_) => tonic::Status::invalid_argument(message),
            Error::Conflict(_) => tonic::Status::aborted(message),
            Error::NotFound(_) => tonic::Status::not_found(message),
            Error::Engine { .. } => tonic::Status::unknown(message),
            Error::Unavailable(_) | Error::Transport(_) => tonic::Status::unavailable(message),
            Error::Internal(_) => tonic::Status::internal(message),
            Error::Cancelled(_) => tonic::Status::cancelled(message),
        };

        let metadata = status.metadata_mut();
        metadata.insert(
            ERROR_KIND_METADATA,
            tonic::metadata::MetadataValue::from_static(self.kind()),
        );
        if let Some(code) = self.engine_code() {
            if let Ok(value) = code.to_string().parse() {
                metadata.insert(ENGINE_CODE_METADATA, value);
            }
        }
        status
    }

    /// Recover the error kind from a status produced by [`Error::to_grpc_status`].
    pub fn kind_of(status: &tonic::Status) -> Option<String> {
        status
            .metadata()
            .get(ERROR_KIND_METADATA)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

// Convenience constructors
impl Error {
    pub fn bad_input(msg: impl Into<String>) -> Self {
        Self::BadInput(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn engine(code: i64, msg: impl Into<String>) -> Self {
        Self::Engine {
            code,
            message: msg.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }
}

/// Call-site annotation for results.
pub trait ResultExt<T> {
    fn site(self, site: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn site(self, site: &str) -> Result<T> {
        self.map_err(|e| e.with_site(site))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::BadInput(format!("invalid JSON: {}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Error::Cancelled(err.to_string())
        } else {
            Error::Internal(format!("engine call panicked: {}", err))
        }
    }
}

// Implement From<Error> for Status to enable ? operator in gRPC handlers
impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        err.to_grpc_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_site_keeps_kind_and_code() {
        let err = Error::engine(7245, "purge not permitted").with_site("szdiagnosticserver.PurgeRepository");
        assert_eq!(err.kind(), "engine");
        assert_eq!(err.engine_code(), Some(7245));
        assert_eq!(
            err.message(),
            "szdiagnosticserver.PurgeRepository: purge not permitted"
        );
    }

    #[test]
    fn test_status_carries_kind_metadata() {
        let status = Error::conflict("default changed").to_grpc_status();
        assert_eq!(status.code(), tonic::Code::Aborted);
        assert_eq!(Error::kind_of(&status).as_deref(), Some("conflict"));
    }

    #[test]
    fn test_engine_status_carries_code() {
        let status = Error::engine(7221, "no default").to_grpc_status();
        assert_eq!(status.code(), tonic::Code::Unknown);
        let code = status
            .metadata()
            .get(ENGINE_CODE_METADATA)
            .and_then(|v| v.to_str().ok());
        assert_eq!(code, Some("7221"));
    }

    #[test]
    fn test_result_ext_site() {
        let result: Result<()> = Err(Error::bad_input("unknown level"));
        let err = result.site("szproductserver.SetLogLevel").unwrap_err();
        assert_eq!(err.to_string(), "bad input: szproductserver.SetLogLevel: unknown level");
    }
}
