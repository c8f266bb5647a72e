//! Observer fan-out.
//!
//! Observers are remote sinks that receive one [`ObserverEvent`] per handler
//! call. Each registered observer gets its own bounded queue and delivery
//! task (see [`ObserverRegistry`]), so a slow or failing sink never holds up
//! the engine call that produced the event.

mod registry;
mod sinks;

pub use registry::ObserverRegistry;
pub use sinks::{observer_from_url, GrpcObserver, HttpObserver, DEFAULT_GRPC_OBSERVER_PORT};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Result;

/// Event record delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserverEvent {
    pub component_id: u32,
    pub message_id: String,
    pub method: String,
    pub correlation_id: String,
    pub origin: String,
    /// Method-specific data: record keys, entity ids, duration, error kind.
    pub subject: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// A sink for observer events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Observer: Send + Sync {
    /// Identity used for deduplication and unregistration.
    fn id(&self) -> &str;

    /// Deliver one event.
    async fn update(&self, event: &ObserverEvent) -> Result<()>;
}
