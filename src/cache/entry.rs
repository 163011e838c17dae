//! Cache Entry Types
//!
//! Keys, cached values and the per-entry access bookkeeping used for LRU
//! ordering between the hard and soft tiers.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::query::PreparedPlan;

/// Cache key - the literal query text with a pre-computed hash
#[derive(Clone, Debug, Eq)]
pub struct QueryKey {
    /// FxHash of the text (for fast comparison)
    hash: u64,
    /// Full query text
    text: Arc<str>,
}

impl QueryKey {
    /// Create a new cache key
    pub fn new(text: impl AsRef<str>) -> Self {
        let text: Arc<str> = Arc::from(text.as_ref());
        Self {
            hash: Self::fx_hash(text.as_bytes()),
            text,
        }
    }

    #[inline]
    fn fx_hash(bytes: &[u8]) -> u64 {
        let mut hasher = FxHasher::default();
        hasher.write(bytes);
        hasher.finish()
    }

    /// Query text
    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Fast non-cryptographic hasher (FxHash algorithm).
///
/// Output depends only on the bytes written, so it is stable across
/// builds and toolchains.
#[derive(Debug, Clone, Copy)]
pub struct FxHasher {
    hash: u64,
}

impl FxHasher {
    const SEED: u64 = 0x517cc1b727220a95;
}

impl Default for FxHasher {
    fn default() -> Self {
        Self { hash: Self::SEED }
    }
}

impl Hasher for FxHasher {
    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.hash = self.hash.rotate_left(5) ^ (byte as u64);
            self.hash = self.hash.wrapping_mul(Self::SEED);
        }
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        // Fast path: compare hashes first
        if self.hash != other.hash {
            return false;
        }
        // Identical literal text only; no normalisation aliasing
        self.text == other.text
    }
}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// What the cache holds for a key
#[derive(Debug, Clone)]
pub enum CachedQuery {
    /// Reusable compiled plan
    Plan(Arc<PreparedPlan>),
    /// Sentinel: compiling again would not produce a reusable plan
    NotCacheable(Arc<str>),
}

impl CachedQuery {
    /// The plan, if this is not a sentinel
    pub fn plan(&self) -> Option<&Arc<PreparedPlan>> {
        match self {
            CachedQuery::Plan(p) => Some(p),
            CachedQuery::NotCacheable(_) => None,
        }
    }

    /// Whether this is the NOT_CACHEABLE sentinel
    pub fn is_not_cacheable(&self) -> bool {
        matches!(self, CachedQuery::NotCacheable(_))
    }
}

/// Storage level of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Tier {
    /// Retained up to `max_hard_size`
    Hard,
    /// Demoted; reclaimable
    Soft,
    /// Pool of NOT_CACHEABLE sentinels
    Uncachable,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Hard => write!(f, "hard"),
            Tier::Soft => write!(f, "soft"),
            Tier::Uncachable => write!(f, "uncachable"),
        }
    }
}

/// Access bookkeeping for one entry.
///
/// Ticks come from the cache-wide logical clock, so reads under a shared
/// lock can refresh recency without taking the write lock.
#[derive(Debug)]
pub struct EntryMetadata {
    /// Logical time of the last access
    last_access: AtomicU64,
    /// Access count
    access_count: AtomicU32,
}

impl EntryMetadata {
    /// Create metadata stamped with `tick`
    pub fn new(tick: u64) -> Self {
        Self {
            last_access: AtomicU64::new(tick),
            access_count: AtomicU32::new(1),
        }
    }

    /// Record an access and return the new count
    #[inline]
    pub fn record_access(&self, tick: u64) -> u32 {
        self.last_access.fetch_max(tick, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Logical time of the last access
    #[inline]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Access count
    #[inline]
    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }
}

/// Cached value plus bookkeeping
#[derive(Debug)]
pub struct CacheEntry {
    /// Entry metadata
    pub metadata: EntryMetadata,
    /// Cached value
    value: CachedQuery,
}

impl CacheEntry {
    /// Create a new cache entry
    pub fn new(value: CachedQuery, tick: u64) -> Self {
        Self {
            metadata: EntryMetadata::new(tick),
            value,
        }
    }

    /// Cached value
    #[inline]
    pub fn value(&self) -> &CachedQuery {
        &self.value
    }

    /// Record access
    #[inline]
    pub fn touch(&self, tick: u64) -> u32 {
        self.metadata.record_access(tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equality_is_literal() {
        assert_eq!(QueryKey::new("SELECT p FROM P p"), QueryKey::new("SELECT p FROM P p"));
        // Whitespace and case differences are distinct keys
        assert_ne!(QueryKey::new("SELECT p FROM P p"), QueryKey::new("SELECT  p FROM P p"));
        assert_ne!(QueryKey::new("SELECT p FROM P p"), QueryKey::new("select p from P p"));
    }

    #[test]
    fn test_fx_hasher_depends_only_on_bytes() {
        let mut whole = FxHasher::default();
        whole.write(b"region=eu");
        let mut split = FxHasher::default();
        split.write(b"region=");
        split.write(b"eu");
        assert_eq!(whole.finish(), split.finish());
        assert_eq!(FxHasher::default().finish(), 0x517cc1b727220a95);
        assert_ne!(whole.finish(), FxHasher::default().finish());
    }

    #[test]
    fn test_access_tracking() {
        let entry = CacheEntry::new(CachedQuery::NotCacheable(Arc::from("x")), 5);
        assert_eq!(entry.metadata.last_access(), 5);
        assert_eq!(entry.touch(9), 2);
        // Stale ticks never move recency backwards
        entry.touch(7);
        assert_eq!(entry.metadata.last_access(), 9);
        assert_eq!(entry.metadata.access_count(), 3);
        assert!(entry.value().is_not_cacheable());
    }
}
