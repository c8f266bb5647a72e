//! Plumbing shared by the subdomain handlers: call tracing, blocking
//! dispatch, error annotation and observer notification.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::Status;

use crate::engine::{EngineBinding, EngineLifecycle};
use crate::observability::{CallTrace, LogLevel, MessageLogger};
use crate::observer::{Observer, ObserverEvent, ObserverRegistry};
use crate::types::{CorrelationId, Error, Result, ResultExt};

/// Enter numbers of the control methods every handler carries.
pub(crate) const SET_LOG_LEVEL: u32 = 901;
pub(crate) const REGISTER_OBSERVER: u32 = 903;
pub(crate) const UNREGISTER_OBSERVER: u32 = 905;
pub(crate) const SET_OBSERVER_ORIGIN: u32 = 907;
pub(crate) const GET_OBSERVER_ORIGIN: u32 = 909;

/// Observer events reuse the method's trace slot in the 8000 range.
const EVENT_BASE: u32 = 8000;

/// Messages common to every handler logger.
pub(crate) const HANDLER_MESSAGES: &[(u32, &str)] = &[
    (1001, "Engine call failed"),
    (2001, "Log level changed"),
    (2002, "Observer registered"),
    (2003, "Observer unregistered"),
];

/// Logger and engine binding of one handler.
pub(crate) struct ServiceCore<T: ?Sized> {
    logger: Arc<MessageLogger>,
    binding: Arc<EngineBinding<T>>,
}

impl<T: ?Sized + EngineLifecycle + 'static> ServiceCore<T> {
    pub fn new(logger: MessageLogger, binding: Arc<EngineBinding<T>>) -> Self {
        Self {
            logger: Arc::new(logger),
            binding,
        }
    }

    pub fn logger(&self) -> &Arc<MessageLogger> {
        &self.logger
    }

    pub fn binding(&self) -> &Arc<EngineBinding<T>> {
        &self.binding
    }

    pub fn site(&self, method: &str) -> String {
        format!("{}{}", self.logger.prefix(), method)
    }

    /// Run a data-plane engine call on the blocking pool.
    pub async fn call<R, F>(
        &self,
        enter_number: u32,
        method: &'static str,
        request: impl fmt::Debug,
        subject: Value,
        f: F,
    ) -> std::result::Result<R, Status>
    where
        F: FnOnce(&T) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let binding = Arc::clone(&self.binding);
        self.run(enter_number, method, request, subject, move || {
            let engine = binding.get()?;
            f(&*engine)
        })
        .await
    }

    /// Run a lifecycle-class engine call (reinitialize, purge) under the
    /// process lifecycle lock.
    pub async fn call_lifecycle<R, F>(
        &self,
        enter_number: u32,
        method: &'static str,
        request: impl fmt::Debug,
        subject: Value,
        f: F,
    ) -> std::result::Result<R, Status>
    where
        F: FnOnce(&T) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let binding = Arc::clone(&self.binding);
        self.run(enter_number, method, request, subject, move || binding.with_lifecycle(f))
            .await
    }

    async fn run<R, G>(
        &self,
        enter_number: u32,
        method: &'static str,
        request: impl fmt::Debug,
        subject: Value,
        job: G,
    ) -> std::result::Result<R, Status>
    where
        G: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let trace = CallTrace::enter(
            Arc::clone(&self.logger),
            enter_number,
            method,
            CorrelationId::new(),
            request,
        );
        let started = Instant::now();
        let result = match tokio::task::spawn_blocking(job).await {
            Ok(result) => result,
            Err(join) => Err(Error::from(join)),
        }
        .site(&self.site(method));

        let correlation_id = trace.correlation_id().clone();
        match &result {
            Ok(_) => trace.finish("ok"),
            Err(err) => {
                self.logger.log(
                    1001,
                    format_args!("correlation_id={} kind={} error={}", correlation_id, err.kind(), err),
                );
                trace.finish(format!("{}: {}", err.kind(), err.message()));
            }
        }

        notify(
            &self.logger,
            self.binding.observers(),
            EventContext {
                enter_number,
                method,
                correlation_id: &correlation_id,
                elapsed: started.elapsed(),
                error: result.as_ref().err(),
            },
            subject,
        )
        .await;
        result.map_err(Status::from)
    }
}

impl<T: ?Sized> fmt::Debug for ServiceCore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCore")
            .field("logger", &self.logger)
            .finish_non_exhaustive()
    }
}

pub(crate) struct EventContext<'a> {
    pub enter_number: u32,
    pub method: &'a str,
    pub correlation_id: &'a CorrelationId,
    pub elapsed: Duration,
    pub error: Option<&'a Error>,
}

/// Queue one event for the subdomain's observers, if there are any.
pub(crate) async fn notify(
    logger: &MessageLogger,
    observers: &ObserverRegistry,
    context: EventContext<'_>,
    mut subject: Value,
) {
    if observers.is_empty().await {
        return;
    }
    if let Value::Object(fields) = &mut subject {
        let elapsed = u64::try_from(context.elapsed.as_micros()).unwrap_or(u64::MAX);
        fields.insert("durationUs".to_string(), Value::from(elapsed));
        if let Some(err) = context.error {
            fields.insert("errorKind".to_string(), Value::from(err.kind()));
        }
    }
    observers
        .notify(ObserverEvent {
            component_id: logger.component_id(),
            message_id: logger.message_id(EVENT_BASE + (context.enter_number + 1) / 2),
            method: context.method.to_string(),
            correlation_id: context.correlation_id.to_string(),
            origin: observers.origin().await,
            subject,
            timestamp: Utc::now(),
        })
        .await;
}

/// Control surface every subdomain handler exposes besides its RPCs.
#[async_trait]
pub trait SubdomainService: Send + Sync {
    fn logger(&self) -> &Arc<MessageLogger>;

    fn observers(&self) -> &ObserverRegistry;

    /// Change the handler's log level. Unknown names are `bad-input`.
    fn set_log_level(&self, name: &str) -> Result<LogLevel> {
        let logger = self.logger();
        let trace = CallTrace::enter(
            Arc::clone(logger),
            SET_LOG_LEVEL,
            "SetLogLevel",
            CorrelationId::new(),
            name,
        );
        let result = logger
            .set_log_level(name)
            .site(&format!("{}SetLogLevel", logger.prefix()));
        match &result {
            Ok(level) => {
                trace.finish("ok");
                logger.log(2001, format_args!("level={}", level));
            }
            Err(err) => trace.finish(err.kind()),
        }
        result
    }

    async fn register_observer(&self, observer: Arc<dyn Observer>) -> Result<()> {
        let logger = self.logger();
        let id = observer.id().to_string();
        let trace = CallTrace::enter(
            Arc::clone(logger),
            REGISTER_OBSERVER,
            "RegisterObserver",
            CorrelationId::new(),
            &id,
        );
        self.observers().register(observer).await?;
        logger.log(2002, format_args!("observer={}", id));
        trace.finish("ok");
        Ok(())
    }

    async fn unregister_observer(&self, id: &str) -> Result<()> {
        let logger = self.logger();
        let trace = CallTrace::enter(
            Arc::clone(logger),
            UNREGISTER_OBSERVER,
            "UnregisterObserver",
            CorrelationId::new(),
            id,
        );
        self.observers().unregister(id).await?;
        logger.log(2003, format_args!("observer={}", id));
        trace.finish("ok");
        Ok(())
    }

    async fn set_observer_origin(&self, origin: &str) {
        let trace = CallTrace::enter(
            Arc::clone(self.logger()),
            SET_OBSERVER_ORIGIN,
            "SetObserverOrigin",
            CorrelationId::new(),
            origin,
        );
        self.observers().set_origin(origin).await;
        trace.finish("ok");
    }

    async fn get_observer_origin(&self) -> String {
        let trace = CallTrace::enter(
            Arc::clone(self.logger()),
            GET_OBSERVER_ORIGIN,
            "GetObserverOrigin",
            CorrelationId::new(),
            (),
        );
        let origin = self.observers().origin().await;
        trace.finish("ok");
        origin
    }
}

/// Convert a wire id into a typed id; non-positive values are `bad-input`.
pub(crate) fn wire_id<I>(value: i64, parse: impl FnOnce(i64) -> std::result::Result<I, String>) -> Result<I> {
    parse(value).map_err(Error::bad_input)
}
