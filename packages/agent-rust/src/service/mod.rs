//! Remote operation pipeline.
//!
//! 1. **Configuration** (`config`): `agent.operations.*` keys -> `OperationServiceConfig`
//! 2. **Handlers** (`handler`): `OperationHandler` trait and the verified dispatch table
//! 3. **Worker** (`worker`): poll -> claim -> dispatch -> report loop
//! 4. **Service** (`operations`): startup reconciliation and handler lifecycle
//! 5. **Registry** (`registry`): ordered start/stop of managed services

pub mod config;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod operations;
pub mod registry;
pub mod worker;

// Re-export key types for convenient access.
pub use config::{ConfigError, ConfigSource, MapConfigSource, OperationServiceConfig};
pub use error::{HandlerError, OperationServiceError, ShutdownError};
pub use handler::{HandlerRegistry, OperationHandler};
pub use handlers::RestartHandler;
pub use operations::{Collaborators, OperationService};
pub use registry::{ManagedService, ServiceRegistry};
pub use worker::{OperationWorker, WorkerState};
