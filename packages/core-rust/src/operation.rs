//! Generic remote operation as delivered by the platform.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::status::OperationStatus;

/// Error returned by [`Operation::transition_to`] for an illegal status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation {id}: illegal status transition {from} -> {to}")]
pub struct TransitionError {
    pub id: String,
    pub from: OperationStatus,
    pub to: OperationStatus,
}

/// A loosely-typed remote command.
///
/// The platform addresses an operation by `id` and describes it through a set
/// of named fragments. Exactly one fragment name identifies what kind of
/// operation it is (see [`crate::fragments`]); the rest is payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Platform-assigned identifier, stable for the operation's lifetime.
    pub id: String,
    /// Current lifecycle status.
    pub status: OperationStatus,
    /// Named fragments. `BTreeMap` keeps serialization order deterministic.
    #[serde(default)]
    pub fragments: BTreeMap<String, serde_json::Value>,
    /// Human-readable reason attached when the operation fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Operation {
    /// Creates a pending operation with no fragments.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: OperationStatus::Pending,
            fragments: BTreeMap::new(),
            failure_reason: None,
        }
    }

    /// Builder-style fragment insertion.
    #[must_use]
    pub fn with_fragment(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fragments.insert(name.into(), value);
        self
    }

    /// Builder-style status override, for operations loaded in a known state.
    #[must_use]
    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn has_fragment(&self, name: &str) -> bool {
        self.fragments.contains_key(name)
    }

    #[must_use]
    pub fn fragment(&self, name: &str) -> Option<&serde_json::Value> {
        self.fragments.get(name)
    }

    pub fn fragment_names(&self) -> impl Iterator<Item = &str> {
        self.fragments.keys().map(String::as_str)
    }

    /// Moves the operation to `next`, enforcing the status state machine.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if `next` is not reachable from the current
    /// status. The operation is left unchanged in that case.
    pub fn transition_to(&mut self, next: OperationStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Marks the operation failed with a reason.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the operation is already terminal.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition_to(OperationStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}
