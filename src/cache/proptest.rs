//! Property-Based Tests for the Tiered Query Cache
//!
//! Random operation sequences against small capacities.
//!
//! # Test Properties
//!
//! 1. **Tier Consistency**: a key is in at most one of hard/soft/uncachable
//! 2. **Capacity**: hard and soft tiers never exceed their bounds
//! 3. **No Aliasing**: a hit always returns the plan stored for that exact text
//! 4. **Freshness**: a lookup right after a store of a cacheable plan hits the hard tier

#![cfg(test)]

use proptest::prelude::*;

use super::tiered::tests::plan;
use super::{CacheSettings, Lookup, Tier, TieredQueryCache};

#[derive(Debug, Clone)]
enum Op {
    Store { key: u8, statements: usize },
    Lookup(u8),
    Invalidate(u8),
    ReleaseSoft,
    Clear,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u8..12, 1usize..=2).prop_map(|(key, statements)| Op::Store { key, statements }),
        6 => (0u8..12).prop_map(Op::Lookup),
        1 => (0u8..12).prop_map(Op::Invalidate),
        1 => Just(Op::ReleaseSoft),
        1 => Just(Op::Clear),
    ]
}

fn text(key: u8) -> String {
    format!("SELECT q FROM Q{} q", key)
}

fn assert_consistent(cache: &TieredQueryCache, hard: usize, soft: usize) {
    let entries = cache.entries();
    let mut keys: Vec<&String> = entries.iter().map(|(k, _)| k).collect();
    let total = keys.len();
    keys.dedup();
    assert_eq!(keys.len(), total, "key present in more than one tier: {:?}", entries);
    assert!(cache.hard_len() <= hard);
    assert!(cache.soft_len() <= soft);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_tiers_stay_disjoint_and_bounded(
        hard in 1usize..=4,
        soft in 0usize..=4,
        ops in prop::collection::vec(op_strategy(), 1..120),
    ) {
        let cache = TieredQueryCache::with_settings(CacheSettings {
            max_hard_size: hard,
            max_soft_size: soft,
            ..CacheSettings::default()
        }).unwrap();

        for op in ops {
            match op {
                Op::Store { key, statements } => {
                    let stored = cache.store(plan(&text(key), statements));
                    prop_assert_eq!(stored, statements == 1);
                    if stored {
                        // Freshness: the stored plan is immediately visible in hard
                        prop_assert_eq!(cache.tier_of(&text(key)), Some(Tier::Hard));
                    } else {
                        prop_assert_eq!(cache.tier_of(&text(key)), Some(Tier::Uncachable));
                    }
                }
                Op::Lookup(key) => {
                    let expected = text(key);
                    if let Lookup::Hit { plan, .. } = cache.lookup(&expected) {
                        prop_assert_eq!(plan.source(), expected.as_str());
                    }
                }
                Op::Invalidate(key) => {
                    cache.invalidate(&text(key));
                    prop_assert_eq!(cache.tier_of(&text(key)), None);
                }
                Op::ReleaseSoft => {
                    cache.release_soft();
                    prop_assert_eq!(cache.soft_len(), 0);
                }
                Op::Clear => {
                    cache.clear();
                    prop_assert!(cache.entries().is_empty());
                }
            }
            assert_consistent(&cache, hard, soft);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_recently_used_plan_survives_one_store(
        keys in prop::collection::vec(0u8..12, 2..30),
    ) {
        // With capacity 2, the entry touched just before a store is never the victim
        let cache = TieredQueryCache::with_settings(CacheSettings::with_hard_capacity(2)).unwrap();
        let mut last: Option<u8> = None;
        for key in keys {
            if let Some(prev) = last {
                if prev != key {
                    cache.lookup(&text(prev));
                    cache.store(plan(&text(key), 1));
                    prop_assert_eq!(cache.tier_of(&text(prev)), Some(Tier::Hard));
                }
            } else {
                cache.store(plan(&text(key), 1));
            }
            last = Some(key);
        }
    }
}
