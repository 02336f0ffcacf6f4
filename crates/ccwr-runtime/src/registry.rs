//! Process-wide registry of supervisors, keyed by normalized endpoint.
//!
//! The registry guarantees at most one [`CompilerService`] per logical
//! endpoint: a second caller asking for the same base URL reuses the
//! existing supervised process instead of spawning a duplicate. It is an
//! explicit object with a caller-driven lifecycle, not a module-level
//! singleton; construct one at process start and tear it down with
//! [`ServiceRegistry::clear`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use ccwr_core::config::ServiceConfig;
use ccwr_core::error::ServiceError;
use ccwr_core::ports::{ProcessLauncher, RuntimeLocator};

use crate::java::JavaLocator;
use crate::launcher::JavaLauncher;
use crate::supervisor::CompilerService;

/// Registry of supervisors, one per normalized endpoint.
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, Arc<CompilerService>>>,
    launcher: Arc<dyn ProcessLauncher>,
    locator: Arc<dyn RuntimeLocator>,
}

impl ServiceRegistry {
    /// Registry using the default OS adapters (Java discovery, real
    /// process spawning).
    pub fn new() -> Self {
        Self::with_ports(Arc::new(JavaLauncher::new()), Arc::new(JavaLocator::new()))
    }

    /// Registry with explicit port implementations. Used by tests and by
    /// embedders that already know their runtime.
    pub fn with_ports(
        launcher: Arc<dyn ProcessLauncher>,
        locator: Arc<dyn RuntimeLocator>,
    ) -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            launcher,
            locator,
        }
    }

    /// Look up or create the supervisor for the configured endpoint.
    ///
    /// The first caller for an endpoint constructs the supervisor with its
    /// configuration; later callers get the existing instance and their
    /// configuration is ignored (first writer wins). Insertion is atomic:
    /// two concurrent first-callers cannot create two supervisors for one
    /// key.
    pub fn get_or_create(
        &self,
        config: &ServiceConfig,
    ) -> Result<Arc<CompilerService>, ServiceError> {
        let key = config.endpoint()?.to_string();

        let mut services = self.services.lock().unwrap();
        if let Some(existing) = services.get(&key) {
            debug!(endpoint = %key, "reusing existing service");
            return Ok(Arc::clone(existing));
        }

        let service = Arc::new(CompilerService::new(
            config,
            Arc::clone(&self.launcher),
            Arc::clone(&self.locator),
        )?);
        services.insert(key.clone(), Arc::clone(&service));
        debug!(endpoint = %key, "created service");
        Ok(service)
    }

    /// The supervisor for an already-registered endpoint, if any.
    pub fn get(&self, config: &ServiceConfig) -> Option<Arc<CompilerService>> {
        let key = config.endpoint().ok()?.to_string();
        self.services.lock().unwrap().get(&key).cloned()
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.services.lock().unwrap().len()
    }

    /// Whether no endpoint has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.services.lock().unwrap().is_empty()
    }

    /// Stop every supervised process, keeping the registrations.
    pub fn shutdown_all(&self, reason: Option<&str>) {
        let services: Vec<Arc<CompilerService>> =
            self.services.lock().unwrap().values().cloned().collect();
        for service in services {
            service.stop(reason);
        }
    }

    /// Tear the registry down: stop every process and drop all
    /// registrations.
    pub fn clear(&self) {
        self.shutdown_all(Some("registry teardown"));
        self.services.lock().unwrap().clear();
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
