//! Persistence Unit Configuration
//!
//! One YAML document describes a unit: cache bounds, slices, placement
//! policies, the executor pool and entity mappings.
//!
//! ```yaml
//! name: orders
//! cache:
//!   max_hard_size: 500
//!   excludes: ["FROM Audit"]
//! slices:
//!   order: [east, west]
//!   entries:
//!     - name: east
//!     - name: west
//!       status: inactive
//! distribution:
//!   policy: hash
//! executor:
//!   kind: fixed
//!   threads: 8
//! entities:
//!   - name: Person
//!     table: person
//!     fields:
//!       - { name: id, columns: [id] }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::CacheSettings;
use crate::error::{Error, Result};
use crate::meta::{EntityMeta, MetadataRepository};
use crate::slice::{ExecutorSettings, SliceConfig};

/// Slice declarations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceSettings {
    /// Explicit slice order; alphabetical when absent
    pub order: Option<Vec<String>>,
    pub entries: Vec<SliceConfig>,
}

/// Policy names, resolved through the policy registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Distribution policy for new non-replicated roots
    pub policy: String,
    /// Replication policy for replicated types
    pub replication: String,
    /// Query target policy
    pub query_target: String,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            policy: "round-robin".to_string(),
            replication: "all".to_string(),
            query_target: "all".to_string(),
        }
    }
}

/// Complete configuration of a persistence unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    pub name: String,
    pub cache: CacheSettings,
    pub slices: SliceSettings,
    pub distribution: PolicySettings,
    pub executor: ExecutorSettings,
    pub entities: Vec<EntityMeta>,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            cache: CacheSettings::default(),
            slices: SliceSettings::default(),
            distribution: PolicySettings::default(),
            executor: ExecutorSettings::default(),
            entities: Vec::new(),
        }
    }
}

impl UnitConfig {
    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: UnitConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked without building the unit
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.executor.validate()?;

        if self.slices.entries.is_empty() {
            return Err(Error::Config("at least one slice must be configured".to_string()));
        }
        let mut names = HashSet::new();
        for entry in &self.slices.entries {
            if !names.insert(entry.name.as_str()) {
                return Err(Error::Config(format!("slice {} declared twice", entry.name)));
            }
        }
        if let Some(order) = &self.slices.order {
            if let Some(unknown) = order.iter().find(|n| !names.contains(n.as_str())) {
                return Err(Error::Config(format!(
                    "slices.order names unknown slice {}",
                    unknown
                )));
            }
        }

        for (what, name) in [
            ("distribution.policy", &self.distribution.policy),
            ("distribution.replication", &self.distribution.replication),
            ("distribution.query_target", &self.distribution.query_target),
        ] {
            if name.trim().is_empty() {
                return Err(Error::Config(format!("{} must name a policy", what)));
            }
        }
        Ok(())
    }

    /// Build the metadata repository from the entity mappings
    pub fn metadata(&self) -> Result<MetadataRepository> {
        MetadataRepository::from_entities(self.entities.iter().cloned())
    }
}
