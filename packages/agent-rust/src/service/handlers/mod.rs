//! Built-in operation handlers.

pub mod restart;

pub use restart::RestartHandler;
