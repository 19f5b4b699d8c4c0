//! Error taxonomy for the operation subsystem.
//!
//! Fatal errors abort `OperationService::start()` or surface from shutdown.
//! Per-operation and per-handler failures never appear here; they become
//! FAILED statuses and log entries instead.

use std::time::Duration;

use super::config::ConfigError;

/// Errors that abort the operation service's startup or shutdown.
#[derive(Debug, thiserror::Error)]
pub enum OperationServiceError {
    #[error("invalid operation service configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("operation kind {kind} claimed by both {first} and {second}")]
    DuplicateRegistration {
        kind: String,
        first: String,
        second: String,
    },
    #[error("operation worker already started")]
    WorkerAlreadyStarted,
    #[error("operation service already started")]
    AlreadyStarted,
    #[error("reconciling {kind} operations failed")]
    Reconciliation {
        kind: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// Errors from [`crate::shutdown::stop_all`].
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("no services to stop")]
    NoServices,
    #[error("shutdown timeout must be positive")]
    InvalidTimeout,
    #[error("{remaining} service(s) did not terminate within {timeout:?}")]
    NotTerminated { remaining: usize, timeout: Duration },
}

/// Errors a handler reports from `execute()`.
///
/// Every variant maps the operation to FAILED; the message becomes the
/// operation's failure reason.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("handler cannot execute operations of kind {kind}")]
    Unsupported { kind: String },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
