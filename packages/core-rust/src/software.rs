//! Software requested by update operations and software reported as installed.

use serde::{Deserialize, Serialize};

/// One entry of a software-list fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareEntry {
    pub name: String,
    pub version: String,
    /// Download location of the package, if the platform supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Software currently installed on the device, as reported by the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledSoftware {
    pub name: String,
    pub version: String,
}

impl InstalledSoftware {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Exact, case-sensitive comparison of name and version.
    #[must_use]
    pub fn matches(&self, entry: &SoftwareEntry) -> bool {
        self.name == entry.name && self.version == entry.version
    }
}
