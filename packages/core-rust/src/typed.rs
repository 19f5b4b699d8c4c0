//! Strongly-typed operation variants.
//!
//! A generic [`Operation`] is turned into a [`TypedOperation`] once its kind is
//! known (see [`crate::factory::OperationFactory`]). Fragments that do not
//! determine the kind travel along in [`OperationHeader::extra`] so the typed
//! value can be turned back into an identical generic operation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::fragments;
use crate::operation::{Operation, TransitionError};
use crate::software::SoftwareEntry;
use crate::status::OperationStatus;

// ---------------------------------------------------------------------------
// OperationHeader
// ---------------------------------------------------------------------------

/// Fields shared by every typed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationHeader {
    pub id: String,
    pub status: OperationStatus,
    pub failure_reason: Option<String>,
    /// Fragments other than the one identifying the kind.
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl OperationHeader {
    fn from_operation(op: &Operation, kind: &str) -> Self {
        let extra = op
            .fragments
            .iter()
            .filter(|(name, _)| name.as_str() != kind)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Self {
            id: op.id.clone(),
            status: op.status,
            failure_reason: op.failure_reason.clone(),
            extra,
        }
    }

    fn into_operation(self, kind: String, payload: serde_json::Value) -> Operation {
        let mut fragments = self.extra;
        fragments.insert(kind, payload);
        Operation {
            id: self.id,
            status: self.status,
            fragments,
            failure_reason: self.failure_reason,
        }
    }
}

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// Device restart.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartOperation {
    pub header: OperationHeader,
}

/// Install or replace software on the device.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftwareUpdateOperation {
    pub header: OperationHeader,
    pub software: Vec<SoftwareEntry>,
}

impl SoftwareUpdateOperation {
    /// The software the operation asks for. The first list entry is
    /// authoritative.
    #[must_use]
    pub fn requested(&self) -> Option<&SoftwareEntry> {
        self.software.first()
    }
}

/// Any kind registered by a handler that has no dedicated variant.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomOperation {
    pub header: OperationHeader,
    pub kind: String,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// TypedOperation
// ---------------------------------------------------------------------------

/// Closed set of operation kinds, discriminated by fragment name.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedOperation {
    Restart(RestartOperation),
    SoftwareUpdate(SoftwareUpdateOperation),
    Custom(CustomOperation),
}

impl TypedOperation {
    /// Builds the variant for `kind` from a generic operation.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the `kind` fragment is missing or
    /// its payload does not have the shape the variant requires.
    pub fn from_operation(op: &Operation, kind: &str) -> Result<Self, serde_json::Error> {
        let payload = op.fragment(kind).cloned().ok_or_else(|| {
            <serde_json::Error as serde::de::Error>::missing_field("kind fragment")
        })?;
        let header = OperationHeader::from_operation(op, kind);

        let typed = match kind {
            fragments::RESTART => Self::Restart(RestartOperation { header }),
            fragments::SOFTWARE_LIST => {
                let software = Vec::<SoftwareEntry>::deserialize(payload)?;
                Self::SoftwareUpdate(SoftwareUpdateOperation { header, software })
            }
            other => Self::Custom(CustomOperation {
                header,
                kind: other.to_string(),
                payload,
            }),
        };
        Ok(typed)
    }

    /// The fragment name identifying this operation's kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Restart(_) => fragments::RESTART,
            Self::SoftwareUpdate(_) => fragments::SOFTWARE_LIST,
            Self::Custom(op) => &op.kind,
        }
    }

    #[must_use]
    pub fn header(&self) -> &OperationHeader {
        match self {
            Self::Restart(op) => &op.header,
            Self::SoftwareUpdate(op) => &op.header,
            Self::Custom(op) => &op.header,
        }
    }

    fn header_mut(&mut self) -> &mut OperationHeader {
        match self {
            Self::Restart(op) => &mut op.header,
            Self::SoftwareUpdate(op) => &mut op.header,
            Self::Custom(op) => &mut op.header,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.header().id
    }

    #[must_use]
    pub fn status(&self) -> OperationStatus {
        self.header().status
    }

    /// Moves the operation to `next`, enforcing the status state machine.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if `next` is not reachable.
    pub fn transition_to(&mut self, next: OperationStatus) -> Result<(), TransitionError> {
        let header = self.header_mut();
        if !header.status.can_transition_to(next) {
            return Err(TransitionError {
                id: header.id.clone(),
                from: header.status,
                to: next,
            });
        }
        header.status = next;
        Ok(())
    }

    /// Converts back into the generic representation.
    #[must_use]
    pub fn into_operation(self) -> Operation {
        match self {
            Self::Restart(op) => op
                .header
                .into_operation(fragments::RESTART.to_string(), serde_json::json!({})),
            Self::SoftwareUpdate(op) => {
                let payload = serde_json::to_value(&op.software)
                    .unwrap_or_else(|_| serde_json::Value::Array(Vec::new()));
                op.header
                    .into_operation(fragments::SOFTWARE_LIST.to_string(), payload)
            }
            Self::Custom(op) => op.header.into_operation(op.kind, op.payload),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
