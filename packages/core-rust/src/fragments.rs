//! Well-known fragment names that identify an operation's kind.

/// Device restart request. The fragment value is an empty object.
pub const RESTART: &str = "c8y_Restart";

/// Software update request. The fragment value is a list of software entries.
pub const SOFTWARE_LIST: &str = "c8y_SoftwareList";
