//! Lifecycle-owned engine singletons.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{EngineLifecycle, InitArgs};
use crate::observer::ObserverRegistry;
use crate::types::{Error, ObserverSettings, Result, Subdomain};

/// Serializes lifecycle operations (initialize, destroy, reinitialize, purge)
/// across all subdomains of one process.
#[derive(Debug, Clone, Default)]
pub struct LifecycleLock(Arc<Mutex<()>>);

impl LifecycleLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Uninitialized,
    Initialized,
    Destroyed,
}

/// One engine subdomain with its lifecycle state, observers and origin.
pub struct EngineBinding<T: ?Sized> {
    subdomain: Subdomain,
    engine: Arc<T>,
    state: Mutex<BindingState>,
    lifecycle: LifecycleLock,
    observers: ObserverRegistry,
}

impl<T: ?Sized + EngineLifecycle> EngineBinding<T> {
    pub fn new(
        subdomain: Subdomain,
        engine: Arc<T>,
        lifecycle: LifecycleLock,
        observer_settings: ObserverSettings,
    ) -> Self {
        Self {
            subdomain,
            engine,
            state: Mutex::new(BindingState::Uninitialized),
            lifecycle,
            observers: ObserverRegistry::new(subdomain.as_str(), observer_settings),
        }
    }

    pub fn subdomain(&self) -> Subdomain {
        self.subdomain
    }

    pub fn state(&self) -> BindingState {
        *self.state_guard()
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    /// Initialize the engine subdomain. Fails with `conflict` while already
    /// initialized; legal again after [`EngineBinding::destroy`].
    pub fn initialize(&self, args: &InitArgs) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.state() == BindingState::Initialized {
            return Err(Error::conflict(format!("{} is already initialized", self.subdomain)));
        }
        self.engine.initialize(args)?;
        *self.state_guard() = BindingState::Initialized;
        Ok(())
    }

    pub fn destroy(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.state() != BindingState::Initialized {
            return Err(Error::unavailable(format!("{} is not initialized", self.subdomain)));
        }
        let result = self.engine.destroy();
        *self.state_guard() = BindingState::Destroyed;
        result
    }

    /// Borrow the engine for a data-plane call.
    pub fn get(&self) -> Result<Arc<T>> {
        match self.state() {
            BindingState::Initialized => Ok(Arc::clone(&self.engine)),
            BindingState::Uninitialized => Err(Error::unavailable(format!(
                "{} is not initialized",
                self.subdomain
            ))),
            BindingState::Destroyed => Err(Error::unavailable(format!(
                "{} has been destroyed",
                self.subdomain
            ))),
        }
    }

    /// Run a lifecycle-class call (reinitialize, purge) under the lifecycle lock.
    pub fn with_lifecycle<R>(&self, f: impl FnOnce(&T) -> Result<R>) -> Result<R> {
        let _lifecycle = self.lifecycle.lock();
        let engine = self.get()?;
        f(&engine)
    }

    fn state_guard(&self) -> MutexGuard<'_, BindingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: ?Sized> fmt::Debug for EngineBinding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBinding")
            .field("subdomain", &self.subdomain)
            .field("state", &*self.state.lock().unwrap_or_else(PoisonError::into_inner))
            .finish()
    }
}
