//! `devagent` Core: remote operation model, status state machine, and typed
//! conversion.

pub mod factory;
pub mod fragments;
pub mod operation;
pub mod software;
pub mod status;
pub mod typed;

pub use factory::OperationFactory;
pub use operation::{Operation, TransitionError};
pub use software::{InstalledSoftware, SoftwareEntry};
pub use status::{OperationStatus, ParseStatusError};
pub use typed::{
    CustomOperation, OperationHeader, RestartOperation, SoftwareUpdateOperation, TypedOperation,
};
