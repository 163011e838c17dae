//! Tiered Prepared-Query Cache
//!
//! Keeps compiled plans keyed by the literal query text so repeated
//! executions skip compilation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        TieredQueryCache                              │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Hard tier            │  Soft tier            │  Uncachable pool     │
//! │  ┌────────────────┐   │  ┌────────────────┐   │  ┌────────────────┐  │
//! │  │ plans, LRU     │──▶│  │ demoted plans  │   │  │ NOT_CACHEABLE  │  │
//! │  │ max_hard_size  │◀──│  │ max_soft_size  │   │  │ sentinels      │  │
//! │  └────────────────┘   │  └────────────────┘   │  └────────────────┘  │
//! │          demote on overflow / promote on soft hit                    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Failure semantics
//!
//! The cache is best-effort: lookups and stores never return errors. Any
//! condition that prevents caching degrades to a miss and the caller
//! compiles again.

mod entry;
mod metrics;
mod policy;
mod tiered;

#[cfg(test)]
mod proptest;

pub use entry::{CacheEntry, CachedQuery, EntryMetadata, FxHasher, QueryKey, Tier};
pub use metrics::{QueryCounts, QueryStatistics, StatisticsSnapshot};
pub use policy::{excluded_reason, CacheSettings, ExclusionPolicy};
pub use tiered::{Lookup, TieredQueryCache};

/// Default hard-tier capacity (plans)
pub const DEFAULT_MAX_HARD_SIZE: usize = 1000;

/// Default soft-tier capacity (plans)
pub const DEFAULT_MAX_SOFT_SIZE: usize = 4000;

/// Default number of remembered NOT_CACHEABLE sentinels
pub const DEFAULT_MAX_UNCACHABLE: usize = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacities() {
        assert_eq!(DEFAULT_MAX_HARD_SIZE, 1000);
        assert!(DEFAULT_MAX_SOFT_SIZE >= DEFAULT_MAX_HARD_SIZE);
    }
}
