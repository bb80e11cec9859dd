//! Partition naming.
//!
//! Every partition name is `"{version}-{tag}"`, so activating a new version
//! never reads entries written by an older one.

use serde::{Deserialize, Serialize};

/// Logical cache partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionTag {
    /// Precached documents and the pages saved by navigations.
    AppShell,
    /// Styles, scripts, fonts and other same-origin or uncategorized traffic.
    Assets,
    Images,
    /// Third-party data API responses.
    Api,
}

impl PartitionTag {
    pub const ALL: [PartitionTag; 4] = [
        PartitionTag::AppShell,
        PartitionTag::Assets,
        PartitionTag::Images,
        PartitionTag::Api,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionTag::AppShell => "app-shell",
            PartitionTag::Assets => "assets",
            PartitionTag::Images => "images",
            PartitionTag::Api => "api",
        }
    }
}

impl std::fmt::Display for PartitionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partition names for one deployment version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
    version: String,
}

impl PartitionNames {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Name of the partition for `tag` under this version.
    pub fn name(&self, tag: PartitionTag) -> String {
        format!("{}-{}", self.version, tag)
    }

    /// The exact set of names that survive activation.
    pub fn allowlist(&self) -> Vec<String> {
        PartitionTag::ALL.iter().map(|tag| self.name(*tag)).collect()
    }

    /// Whether `name` belongs to this version.
    pub fn is_current(&self, name: &str) -> bool {
        PartitionTag::ALL.iter().any(|tag| self.name(*tag) == name)
    }
}
