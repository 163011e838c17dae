//! Tiered Query Cache
//!
//! Maps query text to prepared plans across a hard tier (bounded, LRU) and
//! a soft tier (reclaimable, bounded, LRU). NOT_CACHEABLE sentinels live in
//! a separate bounded pool so they never compete with real plans for
//! hard-tier capacity and are never demoted.
//!
//! All three maps sit behind one `RwLock`: every tier move happens inside
//! a single write-side critical section, and readers hold the read side
//! for the whole hard/soft lookup, so a reader sees a key in at most one
//! tier and never observes it mid-move. Hard hits only take the read lock;
//! recency is refreshed through per-entry atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::entry::{CacheEntry, CachedQuery, QueryKey, Tier};
use super::metrics::QueryStatistics;
use super::policy::{excluded_reason, CacheSettings, ExclusionPolicy};
use crate::error::Result;
use crate::query::{Cacheability, PreparedPlan};

/// Result of a cache lookup
#[derive(Debug, Clone)]
pub enum Lookup {
    /// A reusable plan and the tier it was found in
    Hit { plan: Arc<PreparedPlan>, tier: Tier },
    /// The query is known not to produce a reusable plan
    NotCacheable(Arc<str>),
    /// Nothing cached
    Miss,
}

impl Lookup {
    /// The plan on a hit
    pub fn plan(&self) -> Option<&Arc<PreparedPlan>> {
        match self {
            Lookup::Hit { plan, .. } => Some(plan),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Tiers {
    hard: HashMap<QueryKey, CacheEntry>,
    soft: HashMap<QueryKey, CacheEntry>,
    uncachable: HashMap<QueryKey, CacheEntry>,
}

impl Tiers {
    fn least_recent(map: &HashMap<QueryKey, CacheEntry>) -> Option<QueryKey> {
        map.iter()
            .min_by_key(|(_, e)| e.metadata.last_access())
            .map(|(k, _)| k.clone())
    }

    fn tier_of(&self, key: &QueryKey) -> Option<Tier> {
        if self.hard.contains_key(key) {
            Some(Tier::Hard)
        } else if self.soft.contains_key(key) {
            Some(Tier::Soft)
        } else if self.uncachable.contains_key(key) {
            Some(Tier::Uncachable)
        } else {
            None
        }
    }
}

/// Two-tier plan cache with a sentinel pool
pub struct TieredQueryCache {
    tiers: RwLock<Tiers>,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    settings: CacheSettings,
    exclusions: ExclusionPolicy,
    stats: Arc<QueryStatistics>,
}

impl std::fmt::Debug for TieredQueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tiers = self.tiers.read();
        f.debug_struct("TieredQueryCache")
            .field("hard", &tiers.hard.len())
            .field("soft", &tiers.soft.len())
            .field("uncachable", &tiers.uncachable.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl TieredQueryCache {
    /// Create a cache with default settings
    pub fn new() -> Self {
        Self::build(CacheSettings::default(), ExclusionPolicy::default())
    }

    /// Create a cache with custom settings
    pub fn with_settings(settings: CacheSettings) -> Result<Self> {
        settings.validate()?;
        let exclusions = ExclusionPolicy::new(&settings.excludes)?;
        Ok(Self::build(settings, exclusions))
    }

    fn build(settings: CacheSettings, exclusions: ExclusionPolicy) -> Self {
        Self {
            tiers: RwLock::new(Tiers::default()),
            clock: AtomicU64::new(0),
            settings,
            exclusions,
            stats: Arc::new(QueryStatistics::new()),
        }
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether caching is switched on
    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Configuration
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Statistics collector shared with the preparer
    pub fn statistics(&self) -> &Arc<QueryStatistics> {
        &self.stats
    }

    /// Look up a query text.
    ///
    /// A soft-tier hit is promoted back into the hard tier.
    pub fn lookup(&self, text: &str) -> Lookup {
        if !self.settings.enabled {
            return Lookup::Miss;
        }
        let key = QueryKey::new(text);
        let tick = self.tick();

        {
            let tiers = self.tiers.read();
            if let Some(entry) = tiers.uncachable.get(&key) {
                entry.touch(tick);
                if let CachedQuery::NotCacheable(reason) = entry.value() {
                    return Lookup::NotCacheable(Arc::clone(reason));
                }
            }
            if let Some(entry) = tiers.hard.get(&key) {
                entry.touch(tick);
                if let Some(plan) = entry.value().plan() {
                    return Lookup::Hit {
                        plan: Arc::clone(plan),
                        tier: Tier::Hard,
                    };
                }
            }
            if !tiers.soft.contains_key(&key) {
                return Lookup::Miss;
            }
        }

        // Soft hit: re-check under the write lock, the key may have moved
        let mut tiers = self.tiers.write();
        if let Some(entry) = tiers.hard.get(&key) {
            entry.touch(tick);
            if let Some(plan) = entry.value().plan() {
                return Lookup::Hit {
                    plan: Arc::clone(plan),
                    tier: Tier::Hard,
                };
            }
        }
        match tiers.soft.remove(&key) {
            Some(entry) => {
                entry.touch(tick);
                let plan = entry.value().plan().cloned();
                tiers.hard.insert(key.clone(), entry);
                self.stats.record_promotion();
                debug!(query = %key, "Promoted plan from soft to hard tier");
                self.enforce_bounds(&mut tiers, &key);
                match plan {
                    Some(plan) => Lookup::Hit {
                        plan,
                        tier: Tier::Soft,
                    },
                    None => Lookup::Miss,
                }
            }
            None => Lookup::Miss,
        }
    }

    /// Store a plan under its source text.
    ///
    /// Non-cacheable plans and excluded texts are remembered as sentinels
    /// instead. Returns whether the plan itself was stored.
    pub fn store(&self, plan: Arc<PreparedPlan>) -> bool {
        if !self.settings.enabled {
            return false;
        }
        let text = plan.source().to_string();

        if let Cacheability::NotCacheable(reason) = plan.cacheability() {
            if !plan.is_inline() {
                self.mark_uncachable(&text, reason);
            }
            return false;
        }

        let key = QueryKey::new(&text);
        let tick = self.tick();
        let mut tiers = self.tiers.write();
        // Checked under the write lock so a concurrent add_exclusion either
        // sees this plan in its sweep or is seen here
        if let Some(pattern) = self.exclusions.matching(&text) {
            self.mark_locked(&mut tiers, key, &excluded_reason(&pattern), tick);
            return false;
        }
        tiers.soft.remove(&key);
        tiers.uncachable.remove(&key);
        tiers
            .hard
            .insert(key.clone(), CacheEntry::new(CachedQuery::Plan(plan), tick));
        self.enforce_bounds(&mut tiers, &key);
        debug!(query = %key, hard = tiers.hard.len(), "Stored plan");
        true
    }

    /// Demote least-recently-used hard entries, then trim the soft tier.
    /// `keep` is the entry that triggered the call and is never demoted.
    fn enforce_bounds(&self, tiers: &mut Tiers, keep: &QueryKey) {
        while tiers.hard.len() > self.settings.max_hard_size {
            let victim = tiers
                .hard
                .iter()
                .filter(|(k, _)| *k != keep)
                .min_by_key(|(_, e)| e.metadata.last_access())
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            let Some(entry) = tiers.hard.remove(&victim) else {
                warn!(query = %victim, "Demotion victim vanished; skipping");
                break;
            };
            self.stats.record_demotion();
            if self.settings.max_soft_size > 0 {
                debug!(query = %victim, "Demoted plan to soft tier");
                tiers.soft.insert(victim, entry);
            } else {
                debug!(query = %victim, "Discarded plan from hard tier");
            }
        }

        while tiers.soft.len() > self.settings.max_soft_size {
            let Some(victim) = Tiers::least_recent(&tiers.soft) else { break };
            tiers.soft.remove(&victim);
            self.stats.record_soft_eviction();
            debug!(query = %victim, "Evicted plan from soft tier");
        }
    }

    /// Record that `text` must not be cached; any stored plan is dropped.
    /// Returns whether a plan was displaced.
    pub fn mark_uncachable(&self, text: &str, reason: &str) -> bool {
        if !self.settings.enabled {
            return false;
        }
        let key = QueryKey::new(text);
        let tick = self.tick();
        let mut tiers = self.tiers.write();
        self.mark_locked(&mut tiers, key, reason, tick)
    }

    /// Drop any plan for `key` and remember the sentinel if the pool has room
    fn mark_locked(&self, tiers: &mut Tiers, key: QueryKey, reason: &str, tick: u64) -> bool {
        let displaced = tiers.hard.remove(&key).is_some() | tiers.soft.remove(&key).is_some();
        if self.settings.max_uncachable == 0 {
            debug!(query = %key, reason, displaced, "Dropped uncachable query; sentinel pool disabled");
            return displaced;
        }
        tiers.uncachable.insert(
            key.clone(),
            CacheEntry::new(CachedQuery::NotCacheable(Arc::from(reason)), tick),
        );
        while tiers.uncachable.len() > self.settings.max_uncachable {
            let victim = tiers
                .uncachable
                .iter()
                .filter(|(k, _)| **k != key)
                .min_by_key(|(_, e)| e.metadata.last_access())
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            tiers.uncachable.remove(&victim);
        }
        debug!(query = %key, reason, "Marked query uncachable");
        displaced
    }

    /// Whether `text` is remembered as not cacheable
    pub fn is_uncachable(&self, text: &str) -> bool {
        self.tiers.read().uncachable.contains_key(&QueryKey::new(text))
    }

    /// Remove `text` from every tier; returns whether anything was removed
    pub fn invalidate(&self, text: &str) -> bool {
        let key = QueryKey::new(text);
        let mut tiers = self.tiers.write();
        let hard = tiers.hard.remove(&key).is_some();
        let soft = tiers.soft.remove(&key).is_some();
        let marker = tiers.uncachable.remove(&key).is_some();
        hard || soft || marker
    }

    /// Drop every entry in every tier; statistics are kept
    pub fn clear(&self) {
        let mut tiers = self.tiers.write();
        tiers.hard.clear();
        tiers.soft.clear();
        tiers.uncachable.clear();
        debug!("Cleared query cache");
    }

    /// Memory-pressure hook: empty the soft tier, returning how many plans were released
    pub fn release_soft(&self) -> usize {
        let mut tiers = self.tiers.write();
        let released = tiers.soft.len();
        tiers.soft.clear();
        for _ in 0..released {
            self.stats.record_soft_eviction();
        }
        released
    }

    /// Exclude texts matching `pattern`; plans already cached for them become sentinels
    pub fn add_exclusion(&self, pattern: &str) -> Result<bool> {
        if !self.exclusions.add(pattern)? {
            return Ok(false);
        }
        let reason = excluded_reason(pattern);
        let re = regex::Regex::new(pattern).map_err(|e| crate::error::Error::Config(e.to_string()))?;
        let tick = self.tick();
        let mut tiers = self.tiers.write();
        let affected: Vec<QueryKey> = tiers
            .hard
            .keys()
            .chain(tiers.soft.keys())
            .filter(|k| re.is_match(k.text()))
            .cloned()
            .collect();
        for key in affected {
            self.mark_locked(&mut tiers, key, &reason, tick);
        }
        Ok(true)
    }

    /// Lift an exclusion and forget the sentinels it produced
    pub fn remove_exclusion(&self, pattern: &str) -> bool {
        if !self.exclusions.remove(pattern) {
            return false;
        }
        let reason = excluded_reason(pattern);
        let mut tiers = self.tiers.write();
        tiers.uncachable.retain(|_, e| match e.value() {
            CachedQuery::NotCacheable(r) => **r != *reason,
            CachedQuery::Plan(_) => true,
        });
        true
    }

    /// Current exclusion patterns
    pub fn exclusions(&self) -> Vec<String> {
        self.exclusions.patterns()
    }

    /// Tier currently holding `text`
    pub fn tier_of(&self, text: &str) -> Option<Tier> {
        self.tiers.read().tier_of(&QueryKey::new(text))
    }

    /// Plans in the hard tier
    pub fn hard_len(&self) -> usize {
        self.tiers.read().hard.len()
    }

    /// Plans in the soft tier
    pub fn soft_len(&self) -> usize {
        self.tiers.read().soft.len()
    }

    /// Remembered sentinels
    pub fn uncachable_len(&self) -> usize {
        self.tiers.read().uncachable.len()
    }

    /// Consistent snapshot of every key and its tier
    pub fn entries(&self) -> Vec<(String, Tier)> {
        let tiers = self.tiers.read();
        let mut out: Vec<(String, Tier)> = tiers
            .hard
            .keys()
            .map(|k| (k.text().to_string(), Tier::Hard))
            .chain(tiers.soft.keys().map(|k| (k.text().to_string(), Tier::Soft)))
            .chain(
                tiers
                    .uncachable
                    .keys()
                    .map(|k| (k.text().to_string(), Tier::Uncachable)),
            )
            .collect();
        out.sort();
        out
    }
}

impl Default for TieredQueryCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::query::{ParamStyle, SqlStatement, StatementRole};
    use assert_matches::assert_matches;

    pub(crate) fn plan(text: &str, statements: usize) -> Arc<PreparedPlan> {
        let stmts = (0..statements)
            .map(|i| SqlStatement {
                sql: format!("SELECT {} /* {} */", i, text),
                table: "t".to_string(),
                columns: vec![],
                filters: vec![],
                order_by: vec![],
                slots: vec![],
                role: if i == 0 {
                    StatementRole::Primary
                } else {
                    StatementRole::EagerFetch {
                        relation: "r".to_string(),
                        owner_columns: vec!["r_id".to_string()],
                        target_columns: vec!["id".to_string()],
                    }
                },
            })
            .collect();
        Arc::new(PreparedPlan::new(text, "T", stmts, vec![], ParamStyle::None, false))
    }

    fn cache(hard: usize, soft: usize) -> TieredQueryCache {
        TieredQueryCache::with_settings(CacheSettings {
            max_hard_size: hard,
            max_soft_size: soft,
            ..CacheSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_store_and_lookup() {
        let cache = cache(10, 10);
        assert_matches!(cache.lookup("q"), Lookup::Miss);
        assert!(cache.store(plan("q", 1)));
        let hit = cache.lookup("q");
        assert_matches!(&hit, Lookup::Hit { tier: Tier::Hard, .. });
        assert_eq!(hit.plan().unwrap().source(), "q");
    }

    #[test]
    fn test_lru_demotion_and_soft_promotion() {
        let cache = cache(2, 10);
        cache.store(plan("a", 1));
        cache.store(plan("b", 1));
        cache.lookup("a"); // b is now least recent
        cache.store(plan("c", 1));

        assert_eq!(cache.tier_of("b"), Some(Tier::Soft));
        assert_eq!(cache.tier_of("a"), Some(Tier::Hard));
        assert_eq!(cache.hard_len(), 2);

        // Soft hit promotes b and demotes the LRU hard entry (a)
        let hit = cache.lookup("b");
        assert_matches!(&hit, Lookup::Hit { tier: Tier::Soft, .. });
        assert_eq!(hit.plan().unwrap().source(), "b");
        assert_eq!(cache.tier_of("b"), Some(Tier::Hard));
        assert_eq!(cache.tier_of("a"), Some(Tier::Soft));
        assert_eq!(cache.tier_of("c"), Some(Tier::Hard));

        let snap = cache.statistics().snapshot();
        assert_eq!(snap.promotions, 1);
        assert_eq!(snap.demotions, 2);
    }

    #[test]
    fn test_soft_tier_bound_discards_oldest() {
        let cache = cache(1, 1);
        cache.store(plan("a", 1));
        cache.store(plan("b", 1));
        cache.store(plan("c", 1));
        assert_eq!(cache.tier_of("a"), None);
        assert_eq!(cache.tier_of("b"), Some(Tier::Soft));
        assert_eq!(cache.tier_of("c"), Some(Tier::Hard));
        assert_eq!(cache.statistics().snapshot().soft_evictions, 1);
    }

    #[test]
    fn test_zero_soft_size_discards_on_demotion() {
        let cache = cache(1, 0);
        cache.store(plan("a", 1));
        cache.store(plan("b", 1));
        assert_eq!(cache.tier_of("a"), None);
        assert_eq!(cache.soft_len(), 0);
    }

    #[test]
    fn test_multi_statement_plan_becomes_sentinel() {
        let cache = cache(1, 1);
        assert!(!cache.store(plan("eager", 2)));
        assert_matches!(cache.lookup("eager"), Lookup::NotCacheable(r) if r.contains("2 SQL"));
        assert_eq!(cache.tier_of("eager"), Some(Tier::Uncachable));

        // Sentinels do not consume hard capacity
        cache.store(plan("a", 1));
        assert_eq!(cache.tier_of("a"), Some(Tier::Hard));
        assert_eq!(cache.tier_of("eager"), Some(Tier::Uncachable));
    }

    #[test]
    fn test_sentinel_pool_is_bounded() {
        let cache = TieredQueryCache::with_settings(CacheSettings {
            max_uncachable: 2,
            ..CacheSettings::default()
        })
        .unwrap();
        cache.mark_uncachable("x", "r");
        cache.mark_uncachable("y", "r");
        cache.lookup("x");
        cache.mark_uncachable("z", "r");
        assert_eq!(cache.uncachable_len(), 2);
        assert!(cache.is_uncachable("x"));
        assert!(!cache.is_uncachable("y"));
    }

    #[test]
    fn test_mark_uncachable_displaces_plan() {
        let cache = cache(4, 4);
        cache.store(plan("q", 1));
        assert!(cache.mark_uncachable("q", "user request"));
        assert_matches!(cache.lookup("q"), Lookup::NotCacheable(_));

        // Storing a cacheable plan again replaces the sentinel
        assert!(cache.store(plan("q", 1)));
        assert_eq!(cache.tier_of("q"), Some(Tier::Hard));
    }

    #[test]
    fn test_exclusions() {
        let cache = TieredQueryCache::with_settings(CacheSettings {
            excludes: vec!["Audit".to_string()],
            ..CacheSettings::default()
        })
        .unwrap();
        assert!(!cache.store(plan("SELECT a FROM Audit a", 1)));
        assert!(cache.is_uncachable("SELECT a FROM Audit a"));

        cache.store(plan("SELECT p FROM Person p", 1));
        assert!(cache.add_exclusion("Person").unwrap());
        assert!(cache.is_uncachable("SELECT p FROM Person p"));

        assert!(cache.remove_exclusion("Person"));
        assert_eq!(cache.tier_of("SELECT p FROM Person p"), None);
        assert!(cache.is_uncachable("SELECT a FROM Audit a"));
    }

    #[test]
    fn test_exclusion_without_sentinel_pool_still_evicts() {
        let cache = TieredQueryCache::with_settings(CacheSettings {
            max_uncachable: 0,
            ..CacheSettings::default()
        })
        .unwrap();

        cache.store(plan("SELECT p FROM Person p", 1));
        assert!(cache.add_exclusion("Person").unwrap());
        assert_matches!(cache.lookup("SELECT p FROM Person p"), Lookup::Miss);
        assert_eq!(cache.tier_of("SELECT p FROM Person p"), None);
        assert!(!cache.store(plan("SELECT p FROM Person p", 1)));
        assert_matches!(cache.lookup("SELECT p FROM Person p"), Lookup::Miss);

        cache.store(plan("q", 1));
        assert!(cache.mark_uncachable("q", "manual"));
        assert_matches!(cache.lookup("q"), Lookup::Miss);
        assert_eq!(cache.uncachable_len(), 0);
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn test_exclusion_racing_store_never_leaves_plan_cached() {
        let cache = Arc::new(TieredQueryCache::new());
        let texts: Vec<String> = (0..200).map(|i| format!("SELECT a FROM Audit a WHERE a.id = {}", i)).collect();

        let writer = {
            let cache = Arc::clone(&cache);
            let texts = texts.clone();
            std::thread::spawn(move || {
                for text in &texts {
                    cache.store(plan(text, 1));
                }
            })
        };
        cache.add_exclusion("Audit").unwrap();
        writer.join().unwrap();

        for text in &texts {
            assert_matches!(cache.lookup(text), Lookup::NotCacheable(_) | Lookup::Miss);
        }
        assert_eq!(cache.hard_len(), 0);
    }

    #[test]
    fn test_invalidate_clear_and_release() {
        let cache = cache(1, 4);
        cache.store(plan("a", 1));
        cache.store(plan("b", 1));
        assert!(cache.invalidate("b"));
        assert!(!cache.invalidate("b"));

        assert_eq!(cache.release_soft(), 1);
        assert_eq!(cache.tier_of("a"), None);

        cache.store(plan("c", 1));
        cache.mark_uncachable("d", "r");
        cache.clear();
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let cache = TieredQueryCache::with_settings(CacheSettings::disabled()).unwrap();
        assert!(!cache.store(plan("q", 1)));
        assert_matches!(cache.lookup("q"), Lookup::Miss);
    }

    #[test]
    fn test_concurrent_store_and_lookup_keep_tiers_disjoint() {
        let cache = Arc::new(cache(4, 8));
        let handles: Vec<_> = (0..24)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..300 {
                        let text = format!("q{}", (t * 7 + i) % 16);
                        match cache.lookup(&text) {
                            Lookup::Hit { plan, .. } => assert_eq!(plan.source(), text),
                            Lookup::Miss => {
                                cache.store(plan(&text, 1));
                            }
                            Lookup::NotCacheable(_) => unreachable!(),
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let entries = cache.entries();
        let mut keys: Vec<&String> = entries.iter().map(|(k, _)| k).collect();
        let total = keys.len();
        keys.dedup();
        assert_eq!(keys.len(), total, "a key appeared in two tiers");
        assert!(cache.hard_len() <= 4);
        assert!(cache.soft_len() <= 8);
    }
}
