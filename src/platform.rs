//! Provides a tiny DI like container to expose all components of the system.
//!
//! The platform is more or less a simple map which keeps all central components as **Arc<T>**
//! around. It also owns the shutdown [CancellationToken] which is cancelled once
//! [Platform::terminate](Platform::terminate) is invoked. Long running tasks (the server, the
//! settings monitor and every refresh started on behalf of the warm-up) observe this token so
//! that they stop promptly.
//!
//! Note that once the shutdown is initiated, the internal map is cleared (so that all Drop
//! handlers run). Therefore code which might run after **terminate** should use
//! [Platform::find](Platform::find) and gracefully handle the **None** case.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use hnproxy::platform::Platform;
//! struct Service {
//!     value : i32
//! }
//!
//! let platform = Platform::new();
//! platform.register::<Service>(Arc::new(Service { value: 42 }));
//! assert_eq!(platform.require::<Service>().value, 42);
//!
//! let token = platform.shutdown_token();
//! assert_eq!(token.is_cancelled(), false);
//!
//! // Once terminated...
//! platform.terminate();
//!
//! // all services are released and every observer of the token is notified...
//! assert_eq!(platform.find::<Service>().is_none(), true);
//! assert_eq!(platform.is_running(), false);
//! assert_eq!(token.is_cancelled(), true);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Provides a container to keep all central services in a single place.
pub struct Platform {
    services: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    shutdown: CancellationToken,
}

impl Platform {
    /// Creates a new platform instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Platform {
            services: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    fn services(&self) -> std::sync::MutexGuard<'_, HashMap<TypeId, Arc<dyn Any + Send + Sync>>> {
        // The map is never left in an inconsistent state, therefore a poisoned lock is still
        // safe to use...
        self.services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a new component.
    ///
    /// A previously registered component of the same type is replaced.
    pub fn register<T>(&self, service: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self.services().insert(TypeId::of::<T>(), service);
    }

    /// Tries to resolve a previously registered service.
    ///
    /// # Examples
    /// ```
    /// # use hnproxy::platform::Platform;
    /// # use std::sync::Arc;
    /// struct Service;
    /// struct UnknownService;
    ///
    /// let platform = Platform::new();
    /// platform.register(Arc::new(Service));
    ///
    /// assert_eq!(platform.find::<Service>().is_some(), true);
    /// assert_eq!(platform.find::<UnknownService>().is_none(), true);
    /// ```
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.services()
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.clone().downcast::<T>().ok())
    }

    /// Resolves a previously registered service.
    ///
    /// # Panics
    /// Panics if the requested service isn't available. Note that this is also the case once
    /// the platform has been terminated.
    ///
    /// ```should_panic
    /// # use hnproxy::platform::Platform;
    /// struct UnknownService;
    ///
    /// let platform = Platform::new();
    /// platform.require::<UnknownService>();
    /// ```
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if !self.is_running() {
            panic!(
                "A required component ({}) has been requested but the system is already shutting down!",
                std::any::type_name::<T>()
            )
        }

        match self.find::<T>() {
            Some(service) => service,
            None => panic!(
                "A required component ({}) was not available in the platform registry!",
                std::any::type_name::<T>()
            ),
        }
    }

    /// Determines if the platform is still running or if [Platform::terminate](Platform::terminate)
    /// has already been called.
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Returns a token which is cancelled once the platform terminates.
    ///
    /// Child tokens can be derived from it to cancel individual operations while still being
    /// cancelled on shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Terminates the platform.
    ///
    /// This will immediately release all services and cancel the
    /// [shutdown token](Platform::shutdown_token).
    pub fn terminate(&self) {
        self.services().clear();
        self.shutdown.cancel();
    }
}
