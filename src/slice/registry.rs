//! Slice Registry
//!
//! The configured slices and their status. Readers take an immutable
//! [`SliceSnapshot`]; every change builds a new snapshot and swaps it in
//! whole, so a reader never sees a half-applied refresh and holders of an
//! older snapshot keep a consistent view.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Availability of a slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceStatus {
    #[default]
    Active,
    Inactive,
    Unknown,
}

impl std::fmt::Display for SliceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SliceStatus::Active => write!(f, "active"),
            SliceStatus::Inactive => write!(f, "inactive"),
            SliceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Configuration of one slice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceConfig {
    /// Unique slice name
    pub name: String,
    /// Initial status
    #[serde(default)]
    pub status: SliceStatus,
    /// Connection properties handed to the slice's store
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl SliceConfig {
    /// Active slice with no properties
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: SliceStatus::Active,
            properties: BTreeMap::new(),
        }
    }
}

/// A configured slice
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slice {
    pub name: String,
    pub status: SliceStatus,
    pub properties: BTreeMap<String, String>,
}

impl Slice {
    pub fn is_active(&self) -> bool {
        self.status == SliceStatus::Active
    }
}

/// Immutable view of the registry at one version
#[derive(Debug, Clone, Serialize)]
pub struct SliceSnapshot {
    version: u64,
    published: DateTime<Utc>,
    /// In registry order
    slices: Vec<Slice>,
}

impl SliceSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn published(&self) -> DateTime<Utc> {
        self.published
    }

    /// Every slice in registry order
    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    /// Names of active slices in registry order
    pub fn active_names(&self) -> Vec<String> {
        self.slices
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.name.clone())
            .collect()
    }

    /// Look up a slice
    pub fn get(&self, name: &str) -> Result<&Slice> {
        self.slices
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::UnknownSlice(name.to_string()))
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.slices.iter().any(|s| s.name == name && s.is_active())
    }
}

/// Registry of slices with atomic snapshot publication
#[derive(Debug)]
pub struct SliceRegistry {
    current: RwLock<Arc<SliceSnapshot>>,
    /// Explicit ordering from configuration; alphabetical when absent
    order: Option<Vec<String>>,
}

impl SliceRegistry {
    /// Build from configuration.
    ///
    /// With an explicit `order`, listed slices come first in that order and
    /// any others follow alphabetically. Duplicate names and order entries
    /// naming unknown slices are configuration errors.
    pub fn new(configs: Vec<SliceConfig>, order: Option<Vec<String>>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for config in &configs {
            if config.name.is_empty() {
                return Err(Error::Config("slice name must not be empty".to_string()));
            }
            if !seen.insert(config.name.as_str()) {
                return Err(Error::Config(format!("slice {} declared twice", config.name)));
            }
        }
        if let Some(order) = &order {
            for name in order {
                if !seen.contains(name.as_str()) {
                    return Err(Error::Config(format!(
                        "slice order names unknown slice {}",
                        name
                    )));
                }
            }
        }

        let slices = configs
            .into_iter()
            .map(|c| Slice {
                name: c.name,
                status: c.status,
                properties: c.properties,
            })
            .collect();
        let snapshot = SliceSnapshot {
            version: 1,
            published: Utc::now(),
            slices: Self::ordered(slices, order.as_deref()),
        };
        info!(
            slices = snapshot.slices.len(),
            active = ?snapshot.active_names(),
            "Slice registry initialized"
        );
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            order,
        })
    }

    fn ordered(mut slices: Vec<Slice>, order: Option<&[String]>) -> Vec<Slice> {
        slices.sort_by(|a, b| a.name.cmp(&b.name));
        let Some(order) = order else {
            return slices;
        };
        let rank = |name: &str| order.iter().position(|o| o == name).unwrap_or(usize::MAX);
        // Stable sort keeps the alphabetical order among unlisted slices
        slices.sort_by_key(|s| rank(&s.name));
        slices
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<SliceSnapshot> {
        self.current.read().clone()
    }

    /// Names of active slices in registry order
    pub fn active_slice_names(&self) -> Vec<String> {
        self.snapshot().active_names()
    }

    /// Look up a slice by name
    pub fn slice(&self, name: &str) -> Result<Slice> {
        self.snapshot().get(name).cloned()
    }

    /// Apply `change` to a copy of the current slices and publish the result.
    fn publish<F>(&self, change: F) -> Result<Arc<SliceSnapshot>>
    where
        F: FnOnce(&mut Vec<Slice>) -> Result<()>,
    {
        let mut current = self.current.write();
        let mut slices = current.slices.clone();
        change(&mut slices)?;
        let next = Arc::new(SliceSnapshot {
            version: current.version + 1,
            published: Utc::now(),
            slices: Self::ordered(slices, self.order.as_deref()),
        });
        *current = Arc::clone(&next);
        Ok(next)
    }

    /// Change one slice's status; returns the previous status
    pub fn set_status(&self, name: &str, status: SliceStatus) -> Result<SliceStatus> {
        let mut previous = status;
        let snapshot = self.publish(|slices| {
            let slice = slices
                .iter_mut()
                .find(|s| s.name == name)
                .ok_or_else(|| Error::UnknownSlice(name.to_string()))?;
            previous = slice.status;
            slice.status = status;
            Ok(())
        })?;
        info!(
            slice = name,
            from = %previous,
            to = %status,
            version = snapshot.version,
            "Slice status changed"
        );
        Ok(previous)
    }

    /// Apply a batch of status changes as one snapshot.
    ///
    /// Nothing is published if any name is unknown.
    pub fn refresh<I>(&self, statuses: I) -> Result<u64>
    where
        I: IntoIterator<Item = (String, SliceStatus)>,
    {
        let updates: Vec<(String, SliceStatus)> = statuses.into_iter().collect();
        let snapshot = self.publish(|slices| {
            for (name, status) in &updates {
                let slice = slices
                    .iter_mut()
                    .find(|s| &s.name == name)
                    .ok_or_else(|| Error::UnknownSlice(name.clone()))?;
                slice.status = *status;
            }
            Ok(())
        })?;
        info!(
            version = snapshot.version,
            active = ?snapshot.active_names(),
            "Slice registry refreshed"
        );
        Ok(snapshot.version)
    }

    /// Register a new slice
    pub fn add_slice(&self, config: SliceConfig) -> Result<()> {
        let name = config.name.clone();
        let snapshot = self.publish(|slices| {
            if config.name.is_empty() {
                return Err(Error::Config("slice name must not be empty".to_string()));
            }
            if slices.iter().any(|s| s.name == config.name) {
                return Err(Error::Config(format!("slice {} declared twice", config.name)));
            }
            slices.push(Slice {
                name: config.name,
                status: config.status,
                properties: config.properties,
            });
            Ok(())
        })?;
        info!(slice = %name, version = snapshot.version, "Slice added");
        Ok(())
    }
}
