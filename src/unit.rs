//! Persistence Unit
//!
//! Owns everything shared by the brokers of one configuration: metadata,
//! the query cache and preparer, the slice registry and stores, the
//! router and the executor pool. Nothing lives in process-wide statics;
//! two units never share state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::cache::{QueryStatistics, TieredQueryCache};
use crate::config::UnitConfig;
use crate::error::{Error, Result};
use crate::meta::MetadataRepository;
use crate::query::{JpqlCompiler, QueryCompiler, QueryPreparer};
use crate::slice::{
    BrokerServices, DistributedBroker, DistributionRouter, InMemorySliceStore, PolicyRegistry,
    SliceConfig, SliceExecutor, SliceRegistry, SliceStore,
};

/// Creates the data store of a configured slice
pub type StoreFactory = Arc<dyn Fn(&SliceConfig) -> Result<Arc<dyn SliceStore>> + Send + Sync>;

/// A configured, running persistence unit
pub struct PersistenceUnit {
    config: UnitConfig,
    cache: Arc<TieredQueryCache>,
    services: BrokerServices,
    store_factory: StoreFactory,
    closed: AtomicBool,
}

impl std::fmt::Debug for PersistenceUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceUnit")
            .field("name", &self.config.name)
            .field("cache", &self.cache)
            .field("services", &self.services)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PersistenceUnit {
    /// Open a unit with the built-in policies and in-memory slice stores
    pub fn open(config: UnitConfig) -> Result<Self> {
        let factory: StoreFactory = Arc::new(|slice: &SliceConfig| -> Result<Arc<dyn SliceStore>> {
            Ok(Arc::new(InMemorySliceStore::new(&slice.name)))
        });
        Self::open_with(config, &PolicyRegistry::with_builtins(), factory)
    }

    /// Open a unit with custom policies and stores
    pub fn open_with(config: UnitConfig, policies: &PolicyRegistry, store_factory: StoreFactory) -> Result<Self> {
        config.validate()?;

        let metadata = Arc::new(config.metadata()?);
        let cache = Arc::new(TieredQueryCache::with_settings(config.cache.clone())?);
        let compiler: Arc<dyn QueryCompiler> = Arc::new(JpqlCompiler::new(Arc::clone(&metadata)));
        let preparer = Arc::new(QueryPreparer::new(Arc::clone(&cache), compiler));

        let registry = Arc::new(SliceRegistry::new(
            config.slices.entries.clone(),
            config.slices.order.clone(),
        )?);
        let router = Arc::new(DistributionRouter::new(
            Arc::clone(&metadata),
            policies.distribution(&config.distribution.policy)?,
            policies.replication(&config.distribution.replication)?,
            policies.query_target(&config.distribution.query_target)?,
        ));

        let stores = DashMap::new();
        for slice in &config.slices.entries {
            stores.insert(slice.name.clone(), store_factory(slice)?);
        }
        let executor = Arc::new(SliceExecutor::new(config.executor.clone())?);

        info!(
            unit = %config.name,
            entities = metadata.len(),
            slices = registry.snapshot().slices().len(),
            active = ?registry.active_slice_names(),
            distribution = router.distribution_policy(),
            "Persistence unit opened"
        );

        Ok(Self {
            cache,
            services: BrokerServices {
                metadata,
                registry,
                router,
                preparer,
                executor,
                stores: Arc::new(stores),
            },
            config,
            store_factory,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    /// New persistence context
    pub fn new_broker(&self) -> Result<DistributedBroker> {
        self.check_open()?;
        Ok(DistributedBroker::new(self.services.clone()))
    }

    pub fn cache(&self) -> &Arc<TieredQueryCache> {
        &self.cache
    }

    pub fn statistics(&self) -> &Arc<QueryStatistics> {
        self.cache.statistics()
    }

    pub fn preparer(&self) -> &Arc<QueryPreparer> {
        &self.services.preparer
    }

    pub fn registry(&self) -> &Arc<SliceRegistry> {
        &self.services.registry
    }

    pub fn metadata(&self) -> &Arc<MetadataRepository> {
        &self.services.metadata
    }

    pub fn router(&self) -> &Arc<DistributionRouter> {
        &self.services.router
    }

    pub fn executor(&self) -> &Arc<SliceExecutor> {
        &self.services.executor
    }

    /// Data store of a slice
    pub fn store(&self, slice: &str) -> Result<Arc<dyn SliceStore>> {
        self.services
            .stores
            .get(slice)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::UnknownSlice(slice.to_string()))
    }

    /// Bring a new slice online at runtime
    pub fn add_slice(&self, slice: SliceConfig) -> Result<()> {
        self.check_open()?;
        let store = (self.store_factory)(&slice)?;
        let name = slice.name.clone();
        self.services.registry.add_slice(slice)?;
        self.services.stores.insert(name, store);
        Ok(())
    }

    /// Drop cached plans and stop the executor. Brokers created earlier
    /// fail on their next fan-out.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cache.clear();
        self.services.executor.shutdown();
        info!(unit = %self.config.name, "Persistence unit closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Internal(format!(
                "persistence unit {} is closed",
                self.config.name
            )));
        }
        Ok(())
    }
}

impl Drop for PersistenceUnit {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Args;
    use crate::slice::{Entity, QueryOptions, SliceStatus};
    use assert_matches::assert_matches;

    fn config() -> UnitConfig {
        UnitConfig::from_yaml_str(
            r#"
name: test
slices:
  entries:
    - name: east
    - name: west
entities:
  - name: Person
    table: person
    fields:
      - { name: id, columns: [id] }
      - { name: first, columns: [first_name] }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_open_and_roundtrip() {
        let unit = PersistenceUnit::open(config()).unwrap();
        assert_eq!(unit.registry().active_slice_names(), vec!["east", "west"]);

        let mut broker = unit.new_broker().unwrap();
        broker.begin().unwrap();
        broker
            .persist(Arc::new(Entity::new("Person").with_field("id", 1).with_field("first", "Ann")))
            .unwrap();
        broker.commit().unwrap();

        let result = broker
            .query(
                "SELECT p FROM Person p WHERE p.id = :id",
                &Args::new().named("id", 1),
                &QueryOptions::default(),
            )
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(unit.statistics().execution_count("SELECT p FROM Person p WHERE p.id = :id"), 1);
    }

    #[test]
    fn test_units_are_isolated() {
        let one = PersistenceUnit::open(config()).unwrap();
        let two = PersistenceUnit::open(config()).unwrap();
        one.preparer()
            .prepare("SELECT p FROM Person p", &Args::new())
            .unwrap();
        assert_eq!(one.cache().hard_len(), 1);
        assert_eq!(two.cache().hard_len(), 0);
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let mut config = config();
        config.distribution.policy = "random".to_string();
        assert_matches!(PersistenceUnit::open(config), Err(Error::Config(_)));
    }

    #[test]
    fn test_add_slice_at_runtime() {
        let unit = PersistenceUnit::open(config()).unwrap();
        unit.add_slice(SliceConfig::new("north")).unwrap();
        assert_eq!(unit.registry().active_slice_names(), vec!["east", "north", "west"]);
        assert!(unit.store("north").is_ok());
        unit.registry().set_status("north", SliceStatus::Inactive).unwrap();
        assert_eq!(unit.registry().active_slice_names(), vec!["east", "west"]);
    }

    #[test]
    fn test_close() {
        let unit = PersistenceUnit::open(config()).unwrap();
        let mut broker = unit.new_broker().unwrap();
        unit.preparer()
            .prepare("SELECT p FROM Person p", &Args::new())
            .unwrap();
        unit.close();
        assert!(unit.is_closed());
        assert_eq!(unit.cache().hard_len(), 0);
        assert!(unit.new_broker().is_err());

        broker.begin().unwrap();
        broker.persist(Arc::new(Entity::new("Person").with_field("id", 1))).unwrap();
        assert!(broker.commit().is_err());
    }
}
