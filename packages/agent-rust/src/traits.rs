//! Contracts for the platform collaborators the operation subsystem consumes.
//!
//! Transport errors are opaque (`anyhow::Error`): the core only decides
//! whether to retry, fail the operation, or abort startup.

use async_trait::async_trait;
use devagent_core::{InstalledSoftware, Operation, OperationStatus};

/// One page of an operation collection query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationPage {
    pub operations: Vec<Operation>,
    /// Whether another page follows this one.
    pub has_next: bool,
}

/// Operation access on the device-management platform.
#[async_trait]
pub trait OperationsApi: Send + Sync {
    /// Returns the next operation in PENDING status for this device, if any.
    async fn next_pending_operation(&self) -> anyhow::Result<Option<Operation>>;

    /// Writes a status (and failure reason, for FAILED) for an operation.
    async fn update_operation_status(
        &self,
        id: &str,
        status: OperationStatus,
        failure_reason: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Lists operations carrying the `kind` fragment in `status`.
    ///
    /// `page` is zero-based; each page holds at most `page_size` operations.
    async fn operations_by_status(
        &self,
        kind: &str,
        status: OperationStatus,
        page_size: u32,
        page: u32,
    ) -> anyhow::Result<OperationPage>;

    /// Writes a full operation back to the platform.
    async fn update_operation(&self, operation: &Operation) -> anyhow::Result<()>;
}

/// Device inventory on the platform.
#[async_trait]
pub trait InventoryApi: Send + Sync {
    /// Publishes the operation kinds this device can execute.
    async fn update_supported_operations(&self, kinds: &[String]) -> anyhow::Result<()>;
}

/// Local system facts.
#[async_trait]
pub trait SystemPropertiesApi: Send + Sync {
    /// Returns the software entries installed on the device.
    async fn installed_software(&self) -> anyhow::Result<Vec<InstalledSoftware>>;
}
