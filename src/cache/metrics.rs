//! Query Statistics
//!
//! Execution and hit counts keyed by query text, kept both since start and
//! since the last reset, for external monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

/// Counters for one query text
#[derive(Debug, Default)]
struct Counters {
    executions: AtomicU64,
    hits: AtomicU64,
    executions_since_reset: AtomicU64,
    hits_since_reset: AtomicU64,
}

/// Per-query and aggregate statistics
#[derive(Debug)]
pub struct QueryStatistics {
    per_query: DashMap<String, Counters>,
    total_executions: AtomicU64,
    total_hits: AtomicU64,
    executions_since_reset: AtomicU64,
    hits_since_reset: AtomicU64,

    // Promotion/demotion metrics
    demotions: AtomicU64,
    promotions: AtomicU64,
    soft_evictions: AtomicU64,

    started: DateTime<Utc>,
    last_reset: RwLock<DateTime<Utc>>,
}

impl Default for QueryStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryStatistics {
    /// Create a new statistics collector
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            per_query: DashMap::new(),
            total_executions: AtomicU64::new(0),
            total_hits: AtomicU64::new(0),
            executions_since_reset: AtomicU64::new(0),
            hits_since_reset: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            soft_evictions: AtomicU64::new(0),
            started: now,
            last_reset: RwLock::new(now),
        }
    }

    /// Record one execution of `query`, a hit when the plan came from the cache
    pub fn record_execution(&self, query: &str, hit: bool) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        self.executions_since_reset.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.total_hits.fetch_add(1, Ordering::Relaxed);
            self.hits_since_reset.fetch_add(1, Ordering::Relaxed);
        }

        let counters = match self.per_query.get(query) {
            Some(c) => c,
            None => self.per_query.entry(query.to_string()).or_default().downgrade(),
        };
        counters.executions.fetch_add(1, Ordering::Relaxed);
        counters
            .executions_since_reset
            .fetch_add(1, Ordering::Relaxed);
        if hit {
            counters.hits.fetch_add(1, Ordering::Relaxed);
            counters.hits_since_reset.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_demotion(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_soft_eviction(&self) {
        self.soft_evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Executions of `query` since start
    pub fn execution_count(&self, query: &str) -> u64 {
        self.per_query
            .get(query)
            .map(|c| c.executions.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Cache hits for `query` since start
    pub fn hit_count(&self, query: &str) -> u64 {
        self.per_query
            .get(query)
            .map(|c| c.hits.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Executions across all queries since start
    pub fn total_execution_count(&self) -> u64 {
        self.total_executions.load(Ordering::Relaxed)
    }

    /// Hits across all queries since start
    pub fn total_hit_count(&self) -> u64 {
        self.total_hits.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let total = self.total_execution_count() as f64;
        if total == 0.0 {
            0.0
        } else {
            self.total_hit_count() as f64 / total
        }
    }

    /// Zero the since-reset counters
    pub fn reset(&self) {
        self.executions_since_reset.store(0, Ordering::Relaxed);
        self.hits_since_reset.store(0, Ordering::Relaxed);
        for counters in self.per_query.iter() {
            counters.executions_since_reset.store(0, Ordering::Relaxed);
            counters.hits_since_reset.store(0, Ordering::Relaxed);
        }
        *self.last_reset.write() = Utc::now();
    }

    /// Drop the counters of one query
    pub fn forget(&self, query: &str) {
        self.per_query.remove(query);
    }

    /// Get a snapshot of all statistics
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let mut queries: Vec<QueryCounts> = self
            .per_query
            .iter()
            .map(|e| QueryCounts {
                query: e.key().clone(),
                executions: e.executions.load(Ordering::Relaxed),
                hits: e.hits.load(Ordering::Relaxed),
                executions_since_reset: e.executions_since_reset.load(Ordering::Relaxed),
                hits_since_reset: e.hits_since_reset.load(Ordering::Relaxed),
            })
            .collect();
        queries.sort_by(|a, b| a.query.cmp(&b.query));

        StatisticsSnapshot {
            started: self.started,
            last_reset: *self.last_reset.read(),
            total_executions: self.total_execution_count(),
            total_hits: self.total_hit_count(),
            executions_since_reset: self.executions_since_reset.load(Ordering::Relaxed),
            hits_since_reset: self.hits_since_reset.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            soft_evictions: self.soft_evictions.load(Ordering::Relaxed),
            queries,
        }
    }
}

/// Counts for one query text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryCounts {
    pub query: String,
    pub executions: u64,
    pub hits: u64,
    pub executions_since_reset: u64,
    pub hits_since_reset: u64,
}

/// Point-in-time statistics
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub started: DateTime<Utc>,
    pub last_reset: DateTime<Utc>,
    pub total_executions: u64,
    pub total_hits: u64,
    pub executions_since_reset: u64,
    pub hits_since_reset: u64,
    pub demotions: u64,
    pub promotions: u64,
    pub soft_evictions: u64,
    pub queries: Vec<QueryCounts>,
}

impl StatisticsSnapshot {
    /// Counts for one query, if it ran
    pub fn query(&self, text: &str) -> Option<&QueryCounts> {
        self.queries.iter().find(|q| q.query == text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_query_counts() {
        let stats = QueryStatistics::new();
        stats.record_execution("q1", false);
        stats.record_execution("q1", true);
        stats.record_execution("q1", true);
        stats.record_execution("q2", false);

        assert_eq!(stats.execution_count("q1"), 3);
        assert_eq!(stats.hit_count("q1"), 2);
        assert_eq!(stats.execution_count("q2"), 1);
        assert_eq!(stats.hit_count("q2"), 0);
        assert_eq!(stats.total_execution_count(), 4);
        assert_eq!(stats.total_hit_count(), 2);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reset_keeps_since_start_counts() {
        let stats = QueryStatistics::new();
        stats.record_execution("q", true);
        stats.reset();
        stats.record_execution("q", false);

        let snap = stats.snapshot();
        let q = snap.query("q").unwrap();
        assert_eq!(q.executions, 2);
        assert_eq!(q.hits, 1);
        assert_eq!(q.executions_since_reset, 1);
        assert_eq!(q.hits_since_reset, 0);
        assert_eq!(snap.executions_since_reset, 1);
        assert!(snap.last_reset >= snap.started);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = QueryStatistics::new();
        stats.record_execution("q", true);
        stats.record_demotion();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"demotions\":1"));
        assert!(json.contains("\"query\":\"q\""));
    }

    #[test]
    fn test_concurrent_recording() {
        let stats = std::sync::Arc::new(QueryStatistics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_execution("q", true);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.execution_count("q"), 8000);
        assert_eq!(stats.hit_count("q"), 8000);
    }
}
