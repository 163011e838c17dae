//! Placement Policies
//!
//! User-pluggable decisions about where data lives and where queries run.
//! Policies are looked up by name in a [`PolicyRegistry`], so configuration
//! only ever names them.
//!
//! | Kind         | Built-ins              | Returns                       |
//! |--------------|------------------------|-------------------------------|
//! | distribution | `round-robin`, `hash`  | exactly one active slice      |
//! | replication  | `all`                  | non-empty subset of actives   |
//! | query target | `all`                  | non-empty subset of actives   |

use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use super::instance::Entity;
use crate::cache::FxHasher;
use crate::error::{Error, Result};
use crate::query::{Args, Value};

/// Opaque context handed to every policy call unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingContext {
    /// Broker issuing the call
    pub broker: Option<Uuid>,
    /// Caller-defined attributes
    pub attributes: BTreeMap<String, Value>,
}

impl RoutingContext {
    pub fn for_broker(broker: Uuid) -> Self {
        Self {
            broker: Some(broker),
            attributes: BTreeMap::new(),
        }
    }
}

/// Chooses the single slice a new non-replicated root instance is stored in
pub trait DistributionPolicy: Send + Sync {
    /// Name reported in errors
    fn name(&self) -> &str;

    fn distribute(&self, instance: &Entity, active: &[String], ctx: &RoutingContext) -> Result<String>;
}

/// Chooses the slices a replicated instance is copied to
pub trait ReplicationPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn replicate(
        &self,
        instance: &Entity,
        active: &[String],
        ctx: &RoutingContext,
    ) -> Result<Vec<String>>;
}

/// Chooses the slices a query runs on
pub trait QueryTargetPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn targets(
        &self,
        query: &str,
        args: &Args,
        active: &[String],
        ctx: &RoutingContext,
    ) -> Result<Vec<String>>;
}

// =============================================================================
// Built-in Policies
// =============================================================================

/// Cycles through the active slices
#[derive(Debug, Default)]
pub struct RoundRobinDistribution {
    next: AtomicUsize,
}

impl DistributionPolicy for RoundRobinDistribution {
    fn name(&self) -> &str {
        "round-robin"
    }

    fn distribute(&self, _instance: &Entity, active: &[String], _ctx: &RoutingContext) -> Result<String> {
        if active.is_empty() {
            return Err(Error::Config("no active slices".to_string()));
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(active[i % active.len()].clone())
    }
}

/// Places an instance by the hash of one field, or of its identity when the
/// field is unset
#[derive(Debug, Clone)]
pub struct HashDistribution {
    field: String,
}

impl HashDistribution {
    pub fn on_field(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl Default for HashDistribution {
    fn default() -> Self {
        Self::on_field("id")
    }
}

impl DistributionPolicy for HashDistribution {
    fn name(&self) -> &str {
        "hash"
    }

    fn distribute(&self, instance: &Entity, active: &[String], _ctx: &RoutingContext) -> Result<String> {
        if active.is_empty() {
            return Err(Error::Config("no active slices".to_string()));
        }
        let mut hasher = FxHasher::default();
        match instance.field(&self.field) {
            Some(value) => feed(value, &mut hasher),
            None => hasher.write(instance.id().as_uuid().as_bytes()),
        }
        Ok(active[(hasher.finish() % active.len() as u64) as usize].clone())
    }
}

/// Explicit byte encoding of a value, so placement does not depend on
/// how `Hash` is derived.
fn feed(value: &Value, hasher: &mut FxHasher) {
    match value {
        Value::Null => hasher.write(&[0]),
        Value::Bool(b) => hasher.write(&[1, *b as u8]),
        Value::Int(n) => {
            hasher.write(&[2]);
            hasher.write(&n.to_le_bytes());
        }
        Value::Text(s) => {
            hasher.write(&[3]);
            hasher.write(s.as_bytes());
            hasher.write(&[0xff]);
        }
        Value::Composite(parts) => {
            hasher.write(&[4]);
            for (name, part) in parts {
                hasher.write(name.as_bytes());
                hasher.write(&[0xff]);
                feed(part, hasher);
            }
        }
        Value::List(items) => {
            hasher.write(&[5]);
            hasher.write(&(items.len() as u64).to_le_bytes());
            for item in items {
                feed(item, hasher);
            }
        }
    }
}

/// Replicates to every active slice
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplicateAll;

impl ReplicationPolicy for ReplicateAll {
    fn name(&self) -> &str {
        "all"
    }

    fn replicate(&self, _instance: &Entity, active: &[String], _ctx: &RoutingContext) -> Result<Vec<String>> {
        Ok(active.to_vec())
    }
}

/// Queries every active slice
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryAll;

impl QueryTargetPolicy for QueryAll {
    fn name(&self) -> &str {
        "all"
    }

    fn targets(&self, _query: &str, _args: &Args, active: &[String], _ctx: &RoutingContext) -> Result<Vec<String>> {
        Ok(active.to_vec())
    }
}

// =============================================================================
// Registry
// =============================================================================

type Factory<T> = Arc<dyn Fn() -> Arc<T> + Send + Sync>;

/// Name-to-factory lookup for every policy kind
#[derive(Clone)]
pub struct PolicyRegistry {
    distribution: HashMap<String, Factory<dyn DistributionPolicy>>,
    replication: HashMap<String, Factory<dyn ReplicationPolicy>>,
    query_target: HashMap<String, Factory<dyn QueryTargetPolicy>>,
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |m: Vec<&String>| {
            let mut v: Vec<String> = m.into_iter().cloned().collect();
            v.sort();
            v
        };
        f.debug_struct("PolicyRegistry")
            .field("distribution", &names(self.distribution.keys().collect()))
            .field("replication", &names(self.replication.keys().collect()))
            .field("query_target", &names(self.query_target.keys().collect()))
            .finish()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl PolicyRegistry {
    /// Registry with no policies
    pub fn empty() -> Self {
        Self {
            distribution: HashMap::new(),
            replication: HashMap::new(),
            query_target: HashMap::new(),
        }
    }

    /// Registry holding the built-in policies
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register_distribution("round-robin", || Arc::new(RoundRobinDistribution::default()));
        registry.register_distribution("hash", || Arc::new(HashDistribution::default()));
        registry.register_replication("all", || Arc::new(ReplicateAll));
        registry.register_query_target("all", || Arc::new(QueryAll));
        registry
    }

    pub fn register_distribution<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn DistributionPolicy> + Send + Sync + 'static,
    {
        self.distribution.insert(name.into(), Arc::new(factory));
    }

    pub fn register_replication<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn ReplicationPolicy> + Send + Sync + 'static,
    {
        self.replication.insert(name.into(), Arc::new(factory));
    }

    pub fn register_query_target<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn QueryTargetPolicy> + Send + Sync + 'static,
    {
        self.query_target.insert(name.into(), Arc::new(factory));
    }

    /// Instantiate a distribution policy by name
    pub fn distribution(&self, name: &str) -> Result<Arc<dyn DistributionPolicy>> {
        self.distribution
            .get(name)
            .map(|f| f())
            .ok_or_else(|| Error::Config(format!("unknown distribution policy {}", name)))
    }

    /// Instantiate a replication policy by name
    pub fn replication(&self, name: &str) -> Result<Arc<dyn ReplicationPolicy>> {
        self.replication
            .get(name)
            .map(|f| f())
            .ok_or_else(|| Error::Config(format!("unknown replication policy {}", name)))
    }

    /// Instantiate a query target policy by name
    pub fn query_target(&self, name: &str) -> Result<Arc<dyn QueryTargetPolicy>> {
        self.query_target
            .get(name)
            .map(|f| f())
            .ok_or_else(|| Error::Config(format!("unknown query target policy {}", name)))
    }
}
