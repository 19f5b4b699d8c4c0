//! In-process implementation of every platform collaborator.
//!
//! [`InMemoryPlatform`] keeps operations in issue order and records every
//! status write, which makes it the backend for tests and for the `agent-sim`
//! binary. Failure injection switches let callers exercise the recovery paths.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use devagent_core::{InstalledSoftware, Operation, OperationStatus};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::traits::{InventoryApi, OperationPage, OperationsApi, SystemPropertiesApi};

/// A single recorded status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWrite {
    pub id: String,
    pub status: OperationStatus,
    pub failure_reason: Option<String>,
}

/// In-memory device-management platform.
#[derive(Debug, Default)]
pub struct InMemoryPlatform {
    operations: Mutex<Vec<Operation>>,
    writes: Mutex<Vec<StatusWrite>>,
    supported: Mutex<Option<Vec<String>>>,
    installed: Mutex<Vec<InstalledSoftware>>,
    polls: AtomicU32,
    failing_polls: AtomicU32,
    failing_status_writes: AtomicU32,
    fail_publish: AtomicBool,
    fail_queries: AtomicBool,
}

impl InMemoryPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an operation as-is (any status).
    pub fn push(&self, operation: Operation) {
        self.operations.lock().push(operation);
    }

    /// Issues a new pending operation with a random id and a single kind
    /// fragment. Returns the id.
    pub fn issue(&self, kind: &str, payload: serde_json::Value) -> String {
        let id = Uuid::new_v4().to_string();
        self.push(Operation::new(id.clone()).with_fragment(kind, payload));
        id
    }

    /// Returns the current state of an operation.
    #[must_use]
    pub fn operation(&self, id: &str) -> Option<Operation> {
        self.operations.lock().iter().find(|op| op.id == id).cloned()
    }

    /// Snapshot of every operation, in issue order.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        self.operations.lock().clone()
    }

    /// All status writes, in the order they were received.
    #[must_use]
    pub fn status_writes(&self) -> Vec<StatusWrite> {
        self.writes.lock().clone()
    }

    /// The statuses written for one operation, in order.
    #[must_use]
    pub fn statuses_for(&self, id: &str) -> Vec<OperationStatus> {
        self.writes
            .lock()
            .iter()
            .filter(|w| w.id == id)
            .map(|w| w.status)
            .collect()
    }

    /// The last published supported-operations list, if any was published.
    #[must_use]
    pub fn supported_operations(&self) -> Option<Vec<String>> {
        self.supported.lock().clone()
    }

    /// Number of `next_pending_operation` calls so far, failed ones included.
    #[must_use]
    pub fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn set_installed_software(&self, software: Vec<InstalledSoftware>) {
        *self.installed.lock() = software;
    }

    /// Makes the next `count` polls fail with a transport error.
    pub fn fail_next_polls(&self, count: u32) {
        self.failing_polls.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` status writes fail with a transport error.
    pub fn fail_next_status_writes(&self, count: u32) {
        self.failing_status_writes.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    fn record(&self, id: &str, status: OperationStatus, failure_reason: Option<String>) {
        self.writes.lock().push(StatusWrite {
            id: id.to_string(),
            status,
            failure_reason,
        });
    }
}

/// Decrements a failure budget, returning `true` if this call should fail.
fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl OperationsApi for InMemoryPlatform {
    async fn next_pending_operation(&self) -> anyhow::Result<Option<Operation>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_polls) {
            anyhow::bail!("platform unreachable");
        }
        Ok(self
            .operations
            .lock()
            .iter()
            .find(|op| op.status == OperationStatus::Pending)
            .cloned())
    }

    async fn update_operation_status(
        &self,
        id: &str,
        status: OperationStatus,
        failure_reason: Option<&str>,
    ) -> anyhow::Result<()> {
        if take_failure(&self.failing_status_writes) {
            anyhow::bail!("platform unreachable");
        }
        {
            let mut operations = self.operations.lock();
            let op = operations
                .iter_mut()
                .find(|op| op.id == id)
                .ok_or_else(|| anyhow::anyhow!("unknown operation {id}"))?;
            op.status = status;
            op.failure_reason = failure_reason.map(str::to_string);
        }
        self.record(id, status, failure_reason.map(str::to_string));
        Ok(())
    }

    async fn operations_by_status(
        &self,
        kind: &str,
        status: OperationStatus,
        page_size: u32,
        page: u32,
    ) -> anyhow::Result<OperationPage> {
        if self.fail_queries.load(Ordering::SeqCst) {
            anyhow::bail!("platform unreachable");
        }
        let page_size = page_size.max(1) as usize;
        let matching: Vec<Operation> = self
            .operations
            .lock()
            .iter()
            .filter(|op| op.status == status && op.has_fragment(kind))
            .cloned()
            .collect();
        let start = (page as usize).saturating_mul(page_size);
        let operations: Vec<Operation> =
            matching.iter().skip(start).take(page_size).cloned().collect();
        let has_next = start.saturating_add(page_size) < matching.len();
        Ok(OperationPage {
            operations,
            has_next,
        })
    }

    async fn update_operation(&self, operation: &Operation) -> anyhow::Result<()> {
        if take_failure(&self.failing_status_writes) {
            anyhow::bail!("platform unreachable");
        }
        {
            let mut operations = self.operations.lock();
            let slot = operations
                .iter_mut()
                .find(|op| op.id == operation.id)
                .ok_or_else(|| anyhow::anyhow!("unknown operation {}", operation.id))?;
            *slot = operation.clone();
        }
        self.record(
            &operation.id,
            operation.status,
            operation.failure_reason.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl InventoryApi for InMemoryPlatform {
    async fn update_supported_operations(&self, kinds: &[String]) -> anyhow::Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            anyhow::bail!("inventory update rejected");
        }
        *self.supported.lock() = Some(kinds.to_vec());
        Ok(())
    }
}

#[async_trait]
impl SystemPropertiesApi for InMemoryPlatform {
    async fn installed_software(&self) -> anyhow::Result<Vec<InstalledSoftware>> {
        Ok(self.installed.lock().clone())
    }
}
