//! Operation service: startup reconciliation, handler lifecycle, and the
//! operation worker.
//!
//! Startup runs these steps in order; a failing step aborts the rest:
//!
//! 1. Validate configuration
//! 2. Reconcile restart operations left EXECUTING by a previous run
//! 3. Reconcile software-update operations left EXECUTING by a previous run
//! 4. Verify handlers (a kind claimed twice is fatal)
//! 5. Start handlers (failures drop the handler, not the service)
//! 6. Publish supported operations (failure rolls back to zero handlers)
//! 7. Start the worker
//!
//! Shutdown stops the worker first, then all active handlers in parallel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use devagent_core::{fragments, Operation, OperationStatus, TypedOperation};
use parking_lot::Mutex;
use tracing::{info, warn};

use super::config::{ConfigError, ConfigSource, OperationServiceConfig};
use super::error::OperationServiceError;
use super::handler::{HandlerRegistry, OperationHandler};
use super::registry::ManagedService;
use super::worker::{OperationWorker, WorkerState};
use crate::shutdown::{stop_all, FORCED_TERMINATION_GRACE};
use crate::traits::{InventoryApi, OperationsApi, SystemPropertiesApi};

/// Name under which the operation service registers itself.
pub const SERVICE_NAME: &str = "operations";

/// Platform collaborators used by the operation service.
#[derive(Clone)]
pub struct Collaborators {
    pub operations: Arc<dyn OperationsApi>,
    /// `None` when the device has no inventory access; publishing then fails
    /// and the service comes up with no active handlers.
    pub inventory: Option<Arc<dyn InventoryApi>>,
    pub system: Arc<dyn SystemPropertiesApi>,
}

// ---------------------------------------------------------------------------
// OperationService
// ---------------------------------------------------------------------------

/// Orchestrates the operation subsystem. Start it exactly once per process.
pub struct OperationService {
    collaborators: Collaborators,
    config: OperationServiceConfig,
    candidates: Mutex<Vec<Arc<dyn OperationHandler>>>,
    active: Mutex<Arc<HandlerRegistry>>,
    worker: Mutex<Option<Arc<OperationWorker>>>,
    started: AtomicBool,
}

impl OperationService {
    /// Creates the service with an explicit handler list.
    #[must_use]
    pub fn new(
        collaborators: Collaborators,
        handlers: Vec<Arc<dyn OperationHandler>>,
        config: OperationServiceConfig,
    ) -> Self {
        Self {
            collaborators,
            config,
            candidates: Mutex::new(handlers),
            active: Mutex::new(Arc::new(HandlerRegistry::empty())),
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Creates the service with configuration read from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required key is missing or invalid.
    pub fn from_source(
        collaborators: Collaborators,
        handlers: Vec<Arc<dyn OperationHandler>>,
        source: &dyn ConfigSource,
    ) -> Result<Self, ConfigError> {
        let config = OperationServiceConfig::from_source(source)?;
        Ok(Self::new(collaborators, handlers, config))
    }

    #[must_use]
    pub fn config(&self) -> &OperationServiceConfig {
        &self.config
    }

    /// Kinds currently served by started handlers.
    #[must_use]
    pub fn active_kinds(&self) -> Vec<String> {
        self.active.lock().kind_names()
    }

    /// State of the worker, or `None` if startup never reached it.
    #[must_use]
    pub fn worker_state(&self) -> Option<WorkerState> {
        self.worker.lock().as_ref().map(|w| w.state())
    }

    /// Runs the startup sequence described in the module docs.
    ///
    /// # Errors
    ///
    /// - [`OperationServiceError::AlreadyStarted`] on a second call.
    /// - [`OperationServiceError::Config`] for invalid configuration.
    /// - [`OperationServiceError::Reconciliation`] if a reconciliation pass
    ///   cannot read or write the platform.
    /// - [`OperationServiceError::DuplicateRegistration`] if two handlers
    ///   claim the same kind.
    pub async fn start(&self) -> Result<(), OperationServiceError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(OperationServiceError::AlreadyStarted);
        }
        self.config.validate()?;

        self.reconcile_restarts()
            .await
            .map_err(|source| OperationServiceError::Reconciliation {
                kind: fragments::RESTART,
                source,
            })?;
        self.reconcile_software_updates()
            .await
            .map_err(|source| OperationServiceError::Reconciliation {
                kind: fragments::SOFTWARE_LIST,
                source,
            })?;

        let candidates = std::mem::take(&mut *self.candidates.lock());
        if candidates.is_empty() {
            info!("no operation handlers available");
        }
        let registry = HandlerRegistry::verify(candidates)?;
        let registry = self.start_handlers(registry).await;
        let registry = self.publish_supported_operations(registry).await;

        let registry = Arc::new(registry);
        *self.active.lock() = Arc::clone(&registry);

        let worker = Arc::new(OperationWorker::new(
            Arc::clone(&self.collaborators.operations),
            registry,
            self.config.poll_interval,
        ));
        worker.start()?;
        *self.worker.lock() = Some(worker);

        info!(kinds = ?self.active_kinds(), "operation service started");
        Ok(())
    }

    /// Stops the worker, then all active handlers.
    ///
    /// The worker gets `shutdown_timeout` to finish its current operation.
    /// After that the loop and the running handler call are cancelled before
    /// any handler is stopped; the operation stays EXECUTING.
    ///
    /// # Errors
    ///
    /// Returns [`OperationServiceError::Shutdown`] if some handler could not
    /// be stopped even after forced termination.
    pub async fn stop(&self) -> Result<(), OperationServiceError> {
        let worker = self.worker.lock().clone();
        if let Some(worker) = worker {
            if tokio::time::timeout(self.config.shutdown_timeout, worker.stop())
                .await
                .is_err()
            {
                warn!("operation worker did not stop in time, aborting");
                if tokio::time::timeout(FORCED_TERMINATION_GRACE, worker.abort())
                    .await
                    .is_err()
                {
                    warn!("operation handler still running after abort");
                }
            }
        }

        let registry = std::mem::replace(
            &mut *self.active.lock(),
            Arc::new(HandlerRegistry::empty()),
        );
        if !registry.is_empty() {
            stop_all(
                &registry.handlers(),
                self.config.handlers_shutdown_timeout,
                true,
            )
            .await?;
        }
        info!("operation service stopped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Every page of EXECUTING operations of `kind`, collected before any is
    /// rewritten so status updates cannot shift later pages.
    async fn executing_operations(&self, kind: &str) -> anyhow::Result<Vec<Operation>> {
        let mut operations = Vec::new();
        let mut page = 0;
        loop {
            let batch = self
                .collaborators
                .operations
                .operations_by_status(
                    kind,
                    OperationStatus::Executing,
                    self.config.result_page_size,
                    page,
                )
                .await?;
            let exhausted = batch.operations.is_empty();
            operations.extend(batch.operations);
            if !batch.has_next || exhausted {
                return Ok(operations);
            }
            page += 1;
        }
    }

    /// An EXECUTING restart means the device restarted and this agent is up
    /// again, so every such operation succeeded.
    async fn reconcile_restarts(&self) -> anyhow::Result<()> {
        for mut op in self.executing_operations(fragments::RESTART).await? {
            op.transition_to(OperationStatus::Successful)?;
            op.failure_reason = None;
            self.collaborators.operations.update_operation(&op).await?;
            metrics::counter!(
                "devagent_reconciled_operations_total",
                "kind" => fragments::RESTART,
                "status" => OperationStatus::Successful.as_str()
            )
            .increment(1);
            info!(operation_id = %op.id, "restart operation reconciled as successful");
        }
        Ok(())
    }

    /// An EXECUTING software update succeeded iff the single installed
    /// software entry is exactly the requested name and version.
    async fn reconcile_software_updates(&self) -> anyhow::Result<()> {
        let pending = self.executing_operations(fragments::SOFTWARE_LIST).await?;
        if pending.is_empty() {
            return Ok(());
        }
        let installed = self.collaborators.system.installed_software().await?;

        for mut op in pending {
            let (status, reason) = match TypedOperation::from_operation(&op, fragments::SOFTWARE_LIST)
            {
                Ok(TypedOperation::SoftwareUpdate(update)) => {
                    match (installed.as_slice(), update.requested()) {
                        ([current], Some(requested)) if current.matches(requested) => {
                            (OperationStatus::Successful, None)
                        }
                        ([current], Some(requested)) => (
                            OperationStatus::Failed,
                            Some(format!(
                                "installed {} {} does not match requested {} {}",
                                current.name, current.version, requested.name, requested.version
                            )),
                        ),
                        ([_], None) => (
                            OperationStatus::Failed,
                            Some("operation requests no software".to_string()),
                        ),
                        (entries, _) => (
                            OperationStatus::Failed,
                            Some(format!(
                                "expected exactly one installed software entry, found {}",
                                entries.len()
                            )),
                        ),
                    }
                }
                Ok(other) => (
                    OperationStatus::Failed,
                    Some(format!("expected a software list, found {}", other.kind())),
                ),
                Err(e) => (
                    OperationStatus::Failed,
                    Some(format!("malformed software list: {e}")),
                ),
            };

            op.transition_to(status)?;
            op.failure_reason = reason;
            self.collaborators.operations.update_operation(&op).await?;
            metrics::counter!(
                "devagent_reconciled_operations_total",
                "kind" => fragments::SOFTWARE_LIST,
                "status" => status.as_str()
            )
            .increment(1);
            info!(operation_id = %op.id, %status, "software update operation reconciled");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Handler lifecycle
    // -----------------------------------------------------------------------

    /// Starts each handler; the ones that fail are dropped from the registry.
    async fn start_handlers(&self, registry: HandlerRegistry) -> HandlerRegistry {
        let mut started = Vec::with_capacity(registry.len());
        for handler in registry.handlers() {
            match handler.start().await {
                Ok(()) => {
                    info!(handler = handler.name(), "operation handler started");
                    started.push(true);
                }
                Err(e) => {
                    warn!(handler = handler.name(), error = %e, "operation handler failed to start");
                    started.push(false);
                }
            }
        }
        let mut flags = started.into_iter();
        registry.retain(|_| flags.next().unwrap_or(false))
    }

    /// Publishes the registry's kinds. On failure the started handlers are
    /// stopped and an empty registry is returned.
    async fn publish_supported_operations(&self, registry: HandlerRegistry) -> HandlerRegistry {
        let kinds = registry.kind_names();
        let published = match &self.collaborators.inventory {
            Some(inventory) => inventory.update_supported_operations(&kinds).await,
            None => Err(anyhow::anyhow!("no inventory collaborator available")),
        };

        match published {
            Ok(()) => {
                info!(?kinds, "supported operations published");
                registry
            }
            Err(e) => {
                warn!(error = %e, "publishing supported operations failed, stopping handlers");
                if !registry.is_empty() {
                    if let Err(e) = stop_all(
                        &registry.handlers(),
                        self.config.handlers_shutdown_timeout,
                        true,
                    )
                    .await
                    {
                        warn!(error = %e, "handlers did not stop cleanly after publish failure");
                    }
                }
                HandlerRegistry::empty()
            }
        }
    }
}

#[async_trait]
impl ManagedService for OperationService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn start(&self) -> anyhow::Result<()> {
        OperationService::start(self).await?;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        OperationService::stop(self).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
