use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ManagedService trait
// ---------------------------------------------------------------------------

/// Lifecycle-managed agent service. Operation handlers and the operation
/// service itself implement this.
///
/// Services are registered with a `ServiceRegistry`, started in registration
/// order, and stopped in reverse registration order. The `Any` bound enables
/// type-based lookup via `ServiceRegistry::get::<T>()`.
#[async_trait]
pub trait ManagedService: Send + Sync + Any {
    /// Returns the name of this service, used in logs and error messages.
    fn name(&self) -> &str;

    /// Start the service.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop the service and release its resources.
    async fn stop(&self) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Registry for the agent's top-level services.
///
/// Provides two lookup mechanisms:
/// - **By name** (`get_by_name`): uses the service's `name()` string
/// - **By type** (`get::<T>`): uses `TypeId`
///
/// Services are started in registration order and stopped in reverse order.
pub struct ServiceRegistry {
    by_name: DashMap<String, Arc<dyn ManagedService>>,
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    start_order: RwLock<Vec<String>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            by_type: DashMap::new(),
            start_order: RwLock::new(Vec::new()),
        }
    }

    /// Register a service. The service becomes accessible via both `get::<T>()`
    /// and `get_by_name()`. Registration order determines start/stop sequencing.
    pub fn register<T: ManagedService>(&self, service: T) -> Arc<T> {
        let name = service.name().to_string();
        let arc = Arc::new(service);
        self.by_name.insert(name.clone(), arc.clone());
        self.by_type.insert(TypeId::of::<T>(), arc.clone());
        self.start_order.write().push(name);
        arc
    }

    /// Retrieve a service by its concrete type.
    pub fn get<T: ManagedService>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Retrieve a service by its name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Start all registered services in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first `start()` failure; later services are not started.
    pub async fn start_all(&self) -> anyhow::Result<()> {
        let order = self.start_order.read().clone();
        for name in &order {
            if let Some(service) = self.get_by_name(name) {
                info!(service = %name, "starting service");
                service.start().await?;
            }
        }
        Ok(())
    }

    /// Stop all registered services in reverse registration order.
    ///
    /// Every service is asked to stop even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the last `stop()` failure, after all services were attempted.
    pub async fn stop_all(&self) -> anyhow::Result<()> {
        let order = self.start_order.read().clone();
        let mut result = Ok(());
        for name in order.iter().rev() {
            if let Some(service) = self.get_by_name(name) {
                if let Err(e) = service.stop().await {
                    warn!(service = %name, error = %e, "service failed to stop");
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
