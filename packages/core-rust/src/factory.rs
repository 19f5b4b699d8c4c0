//! Conversion of generic operations into typed variants.

use std::collections::HashSet;

use tracing::debug;

use crate::operation::Operation;
use crate::typed::TypedOperation;

/// Converts generic operations into [`TypedOperation`] values.
///
/// Conversion is driven by the set of kinds the handler registry currently
/// supports. An operation converts only if exactly one of its fragment names
/// is a supported kind; anything else is "no match", which is an expected
/// outcome rather than an error.
#[derive(Debug, Default, Clone, Copy)]
pub struct OperationFactory;

impl OperationFactory {
    /// Returns the single supported kind carried by `op`, if unambiguous.
    #[must_use]
    pub fn match_kind<'a>(op: &'a Operation, supported: &HashSet<String>) -> Option<&'a str> {
        let mut matches = op.fragment_names().filter(|name| supported.contains(*name));
        let kind = matches.next()?;
        if matches.next().is_some() {
            debug!(operation_id = %op.id, "operation matches more than one supported kind");
            return None;
        }
        Some(kind)
    }

    /// Converts `op` into a typed operation, or `None` if it is unsupported,
    /// ambiguous, or malformed.
    #[must_use]
    pub fn convert(op: &Operation, supported: &HashSet<String>) -> Option<TypedOperation> {
        let kind = Self::match_kind(op, supported)?;
        match TypedOperation::from_operation(op, kind) {
            Ok(typed) => Some(typed),
            Err(e) => {
                debug!(operation_id = %op.id, kind, error = %e, "malformed operation payload");
                None
            }
        }
    }
}
