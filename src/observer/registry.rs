//! Per-subdomain observer registry with bounded, non-blocking delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::{Observer, ObserverEvent};
use crate::observability::{MessageLogger, MessageTemplates};
use crate::types::{ObserverSettings, Result};

/// Component id of observer delivery log records.
pub const OBSERVER_COMPONENT_ID: u32 = 6205;

const MESSAGES: MessageTemplates = &[
    (2001, "Observer registered"),
    (2002, "Observer unregistered"),
    (3001, "Observer delivery failing"),
    (3002, "Observer queue full, events dropped"),
];

/// Rate limiter for repeated warnings: at most one per window.
#[derive(Debug)]
struct FailureWindow {
    window: Duration,
    last_warned: Mutex<Option<Instant>>,
}

impl FailureWindow {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_warned: Mutex::new(None),
        }
    }

    /// True when a warning may be emitted now.
    fn should_warn(&self) -> bool {
        let mut last = self
            .last_warned
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// One registered sink: its queue sender and delivery task.
#[derive(Debug)]
struct ObserverHandle {
    tx: mpsc::Sender<Arc<ObserverEvent>>,
    dropped: Arc<AtomicU64>,
    overflow_warnings: FailureWindow,
    task: JoinHandle<()>,
}

/// Observers registered with one subdomain, plus its origin label.
pub struct ObserverRegistry {
    scope: String,
    settings: ObserverSettings,
    logger: Arc<MessageLogger>,
    observers: RwLock<HashMap<String, ObserverHandle>>,
    origin: RwLock<String>,
}

impl ObserverRegistry {
    pub fn new(scope: impl Into<String>, settings: ObserverSettings) -> Self {
        Self {
            scope: scope.into(),
            settings,
            logger: Arc::new(MessageLogger::new(OBSERVER_COMPONENT_ID, "observer.", MESSAGES)),
            observers: RwLock::new(HashMap::new()),
            origin: RwLock::new(String::new()),
        }
    }

    /// Register a sink. Registering an id that is already present keeps the
    /// existing sink.
    pub async fn register(&self, observer: Arc<dyn Observer>) -> Result<()> {
        let id = observer.id().to_string();
        let mut observers = self.observers.write().await;
        if observers.contains_key(&id) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(self.settings.queue_capacity);
        let task = tokio::spawn(deliver(
            observer,
            rx,
            self.settings.send_timeout,
            FailureWindow::new(self.settings.failure_window),
            Arc::clone(&self.logger),
            self.scope.clone(),
        )
        .in_current_span());
        observers.insert(
            id.clone(),
            ObserverHandle {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                overflow_warnings: FailureWindow::new(self.settings.failure_window),
                task,
            },
        );
        self.logger
            .log(2001, format_args!("scope={} observer={}", self.scope, id));
        Ok(())
    }

    /// Remove a sink by id. Removing an unknown id is not an error.
    ///
    /// Events already queued for the sink are still delivered.
    pub async fn unregister(&self, id: &str) -> Result<()> {
        if self.observers.write().await.remove(id).is_some() {
            self.logger
                .log(2002, format_args!("scope={} observer={}", self.scope, id));
        }
        Ok(())
    }

    pub async fn is_empty(&self) -> bool {
        self.observers.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.observers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn set_origin(&self, origin: &str) {
        *self.origin.write().await = origin.to_string();
    }

    pub async fn origin(&self) -> String {
        self.origin.read().await.clone()
    }

    /// Events dropped for `id` because its queue was full.
    pub async fn dropped(&self, id: &str) -> u64 {
        self.observers
            .read()
            .await
            .get(id)
            .map(|h| h.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Queue an event for every sink without waiting on any of them.
    pub async fn notify(&self, event: ObserverEvent) {
        let observers = self.observers.read().await;
        if observers.is_empty() {
            return;
        }
        let event = Arc::new(event);
        for (id, handle) in observers.iter() {
            match handle.tx.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = handle.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if handle.overflow_warnings.should_warn() {
                        self.logger.log(
                            3002,
                            format_args!("scope={} observer={} dropped={}", self.scope, id, dropped),
                        );
                    }
                }
                // Delivery task gone; the handle is removed on unregister.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Stop accepting events and wait for queued events to drain.
    pub async fn shutdown(&self) {
        let handles: Vec<ObserverHandle> = self.observers.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            drop(handle.tx);
            let _ = handle.task.await;
        }
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("scope", &self.scope)
            .field("settings", &self.settings)
            .finish()
    }
}

async fn deliver(
    observer: Arc<dyn Observer>,
    mut rx: mpsc::Receiver<Arc<ObserverEvent>>,
    send_timeout: Duration,
    failures: FailureWindow,
    logger: Arc<MessageLogger>,
    scope: String,
) {
    let mut failed: u64 = 0;
    while let Some(event) = rx.recv().await {
        let error = match tokio::time::timeout(send_timeout, observer.update(&event)).await {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("timed out after {:?}", send_timeout),
        };
        failed += 1;
        if failures.should_warn() {
            logger.log(
                3001,
                format_args!(
                    "scope={} observer={} failures={} error={}",
                    scope,
                    observer.id(),
                    failed,
                    error
                ),
            );
        }
    }
}
