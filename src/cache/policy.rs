//! Cache Retention and Exclusion Policies
//!
//! Capacity bounds for each tier and the set of query patterns that must
//! never be cached.

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{DEFAULT_MAX_HARD_SIZE, DEFAULT_MAX_SOFT_SIZE, DEFAULT_MAX_UNCACHABLE};
use crate::error::{Error, Result};

/// Query cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Enable plan caching
    pub enabled: bool,
    /// Maximum plans held in the hard tier
    pub max_hard_size: usize,
    /// Maximum plans held in the soft tier (0 disables demotion)
    pub max_soft_size: usize,
    /// Maximum NOT_CACHEABLE sentinels remembered
    pub max_uncachable: usize,
    /// Regular expressions; matching query texts are never cached
    pub excludes: Vec<String>,
    /// Collect per-query statistics
    pub statistics: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_hard_size: DEFAULT_MAX_HARD_SIZE,
            max_soft_size: DEFAULT_MAX_SOFT_SIZE,
            max_uncachable: DEFAULT_MAX_UNCACHABLE,
            excludes: Vec::new(),
            statistics: true,
        }
    }
}

impl CacheSettings {
    /// Settings with the given hard capacity and a soft tier four times larger
    pub fn with_hard_capacity(max_hard_size: usize) -> Self {
        Self {
            max_hard_size,
            max_soft_size: max_hard_size.saturating_mul(4),
            ..Self::default()
        }
    }

    /// Caching switched off; every prepare compiles
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Check bounds
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.max_hard_size == 0 {
            return Err(Error::Config(
                "cache.max_hard_size must be positive when caching is enabled".to_string(),
            ));
        }
        for pattern in &self.excludes {
            Regex::new(pattern).map_err(|e| {
                Error::Config(format!("invalid cache exclusion pattern {}: {}", pattern, e))
            })?;
        }
        Ok(())
    }
}

/// Compiled exclusion patterns, changeable at runtime
#[derive(Debug, Default)]
pub struct ExclusionPolicy {
    patterns: RwLock<Vec<Regex>>,
}

impl ExclusionPolicy {
    /// Compile the given patterns
    pub fn new(patterns: &[String]) -> Result<Self> {
        let compiled = patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| Error::Config(format!("invalid exclusion pattern {}: {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patterns: RwLock::new(compiled),
        })
    }

    /// The first pattern matching `text`, if any
    pub fn matching(&self, text: &str) -> Option<String> {
        self.patterns
            .read()
            .iter()
            .find(|re| re.is_match(text))
            .map(|re| re.as_str().to_string())
    }

    /// Add a pattern; returns false if it was already present
    pub fn add(&self, pattern: &str) -> Result<bool> {
        let re = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid exclusion pattern {}: {}", pattern, e)))?;
        let mut guard = self.patterns.write();
        if guard.iter().any(|p| p.as_str() == pattern) {
            return Ok(false);
        }
        guard.push(re);
        Ok(true)
    }

    /// Remove a pattern; returns whether it was present
    pub fn remove(&self, pattern: &str) -> bool {
        let mut guard = self.patterns.write();
        let before = guard.len();
        guard.retain(|p| p.as_str() != pattern);
        guard.len() != before
    }

    /// Current patterns
    pub fn patterns(&self) -> Vec<String> {
        self.patterns
            .read()
            .iter()
            .map(|p| p.as_str().to_string())
            .collect()
    }
}

/// Reason string recorded for an excluded query
pub fn excluded_reason(pattern: &str) -> String {
    format!("excluded by pattern {}", pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = CacheSettings::default();
        assert!(settings.enabled);
        assert_eq!(settings.max_hard_size, DEFAULT_MAX_HARD_SIZE);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_hard_capacity_constructor() {
        let settings = CacheSettings::with_hard_capacity(2);
        assert_eq!(settings.max_hard_size, 2);
        assert_eq!(settings.max_soft_size, 8);
    }

    #[test]
    fn test_invalid_settings() {
        let mut settings = CacheSettings::with_hard_capacity(0);
        assert!(settings.validate().is_err());
        settings.max_hard_size = 1;
        settings.excludes = vec!["(".to_string()];
        assert!(settings.validate().is_err());
        assert!(CacheSettings::disabled().validate().is_ok());
    }

    #[test]
    fn test_exclusion_matching_and_updates() {
        let policy = ExclusionPolicy::new(&["FROM Audit".to_string()]).unwrap();
        assert!(policy.matching("SELECT a FROM Audit a").is_some());
        assert!(policy.matching("SELECT p FROM Person p").is_none());

        assert!(policy.add("Person").unwrap());
        assert!(!policy.add("Person").unwrap());
        assert_eq!(policy.matching("SELECT p FROM Person p").as_deref(), Some("Person"));

        assert!(policy.remove("Person"));
        assert!(!policy.remove("Person"));
        assert_eq!(policy.patterns(), vec!["FROM Audit".to_string()]);
    }
}
