//! `devagent` polls the device-management platform for remote operations,
//! dispatches them to registered handlers, and reports their outcome.

pub mod memory;
pub mod service;
pub mod shutdown;
pub mod telemetry;
pub mod traits;

#[cfg(test)]
mod testing;

pub use memory::InMemoryPlatform;
pub use service::{
    Collaborators, HandlerError, ManagedService, OperationHandler, OperationService,
    OperationServiceConfig, OperationServiceError, ServiceRegistry,
};
pub use traits::{InventoryApi, OperationPage, OperationsApi, SystemPropertiesApi};
