//! Operation handlers and the verified kind -> handler dispatch table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use devagent_core::{OperationStatus, TypedOperation};
use tracing::warn;

use super::error::{HandlerError, OperationServiceError};
use super::registry::ManagedService;

// ---------------------------------------------------------------------------
// OperationHandler trait
// ---------------------------------------------------------------------------

/// Executes one or more kinds of remote operation.
///
/// `execute` returns the terminal status to report. Returning a non-terminal
/// status is a contract violation and is reported as FAILED. An `Err` is also
/// reported as FAILED, with the error message as failure reason.
#[async_trait]
pub trait OperationHandler: ManagedService {
    /// Fragment names of the operation kinds this handler executes.
    fn supported_operations(&self) -> Vec<String>;

    /// Execute a single operation.
    async fn execute(&self, operation: TypedOperation) -> Result<OperationStatus, HandlerError>;
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

struct Registration {
    handler: Arc<dyn OperationHandler>,
    kinds: Vec<String>,
}

/// Verified mapping from operation kind to the single handler that owns it.
///
/// Built once during service startup and read-only afterwards, so the worker
/// shares it through an `Arc` without locking.
#[derive(Default)]
pub struct HandlerRegistry {
    registrations: Vec<Registration>,
    by_kind: HashMap<String, usize>,
}

impl HandlerRegistry {
    /// Creates a registry with no handlers.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Verifies `candidates` in order and builds the dispatch table.
    ///
    /// Handlers declaring no kinds are dropped with a warning. A kind claimed
    /// by two handlers makes the dispatch table ambiguous and is fatal.
    ///
    /// # Errors
    ///
    /// Returns [`OperationServiceError::DuplicateRegistration`] naming the
    /// kind and both handlers.
    pub fn verify(
        candidates: Vec<Arc<dyn OperationHandler>>,
    ) -> Result<Self, OperationServiceError> {
        let mut registry = Self::empty();
        for handler in candidates {
            let mut kinds = handler.supported_operations();
            let mut seen = HashSet::new();
            kinds.retain(|kind| seen.insert(kind.clone()));

            if kinds.is_empty() {
                warn!(handler = handler.name(), "handler declares no supported operations, ignoring");
                continue;
            }

            let index = registry.registrations.len();
            for kind in &kinds {
                if let Some(&owner) = registry.by_kind.get(kind) {
                    return Err(OperationServiceError::DuplicateRegistration {
                        kind: kind.clone(),
                        first: registry.registrations[owner].handler.name().to_string(),
                        second: handler.name().to_string(),
                    });
                }
                registry.by_kind.insert(kind.clone(), index);
            }
            registry.registrations.push(Registration { handler, kinds });
        }
        Ok(registry)
    }

    /// Keeps only the handlers for which `keep` returns `true`.
    #[must_use]
    pub fn retain(self, mut keep: impl FnMut(&Arc<dyn OperationHandler>) -> bool) -> Self {
        let mut registry = Self::empty();
        for registration in self.registrations {
            if !keep(&registration.handler) {
                continue;
            }
            let index = registry.registrations.len();
            for kind in &registration.kinds {
                registry.by_kind.insert(kind.clone(), index);
            }
            registry.registrations.push(registration);
        }
        registry
    }

    /// Returns the handler that owns `kind`.
    #[must_use]
    pub fn handler_for(&self, kind: &str) -> Option<&Arc<dyn OperationHandler>> {
        self.by_kind
            .get(kind)
            .map(|&index| &self.registrations[index].handler)
    }

    /// All registered kinds.
    #[must_use]
    pub fn supported_kinds(&self) -> HashSet<String> {
        self.by_kind.keys().cloned().collect()
    }

    /// All registered kinds in registration order, for publishing.
    #[must_use]
    pub fn kind_names(&self) -> Vec<String> {
        self.registrations
            .iter()
            .flat_map(|r| r.kinds.iter().cloned())
            .collect()
    }

    /// All registered handlers in registration order.
    #[must_use]
    pub fn handlers(&self) -> Vec<Arc<dyn OperationHandler>> {
        self.registrations.iter().map(|r| r.handler.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.registrations
                    .iter()
                    .map(|r| (r.handler.name().to_string(), r.kinds.clone())),
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
