//! Distributed Broker
//!
//! A persistence context spanning every slice. It decides where new
//! instances live, keeps a cascaded object graph together, flushes on
//! commit and fans queries out.
//!
//! # Cascade State Machine
//!
//! ```text
//!                 persist(root)                      nested persist(child)
//!  ┌──────────────────┐  route root   ┌─────────────┐  reuse root target
//!  │ NoActiveCascade  │──────────────►│  InCascade  │◄───────────────┐
//!  └──────────────────┘               └─────────────┘────────────────┘
//!           ▲          outermost persist returns │
//!           └────────────────────────────────────┘
//! ```
//!
//! The operating set holds the instances visited by the current outermost
//! persist call; it being empty is what makes the next call a root call.
//! An instance whose state manager already carries [`SliceInfo`] is never
//! routed again.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::executor::{SliceExecutor, SliceTask};
use super::instance::{Entity, InstanceId, Row};
use super::policy::RoutingContext;
use super::registry::SliceRegistry;
use super::router::{DistributionRouter, SliceInfo};
use super::store::{compare_rows, SliceStore};
use crate::error::{Error, Result};
use crate::meta::MetadataRepository;
use crate::query::{Args, PlanOrigin, QueryPreparer, StatementRole, Value};

/// Shared collaborators every broker of a unit uses
#[derive(Clone)]
pub struct BrokerServices {
    pub metadata: Arc<MetadataRepository>,
    pub registry: Arc<SliceRegistry>,
    pub router: Arc<DistributionRouter>,
    pub preparer: Arc<QueryPreparer>,
    pub executor: Arc<SliceExecutor>,
    pub stores: Arc<DashMap<String, Arc<dyn SliceStore>>>,
}

impl std::fmt::Debug for BrokerServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerServices")
            .field("router", &self.router)
            .field("executor", &self.executor)
            .field("stores", &self.stores.len())
            .finish_non_exhaustive()
    }
}

/// Whether a persist call is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CascadeState {
    NoActiveCascade,
    InCascade,
}

/// Per-instance bookkeeping; `slice_info` is the implementation data
#[derive(Debug)]
struct StateManager {
    entity: Arc<Entity>,
    slice_info: Option<SliceInfo>,
    flushed: bool,
}

/// Options for a distributed query
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Run on exactly these slices instead of asking the query target policy
    pub targets: Option<Vec<String>>,
}

impl QueryOptions {
    pub fn on<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: Some(targets.into_iter().map(Into::into).collect()),
        }
    }
}

/// Rows merged across slices
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    /// Primary rows, in slice order or by the query's ORDER BY
    pub rows: Vec<Row>,
    /// Slices the query ran on
    pub slices: Vec<String>,
    /// Rows of eagerly fetched relations, by relation name
    pub related: BTreeMap<String, Vec<Row>>,
    /// How the plan was obtained
    pub origin: PlanOrigin,
}

/// Outcome of a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    /// Instances flushed
    pub instances: usize,
    /// Rows written per slice
    pub rows: BTreeMap<String, usize>,
}

/// Persistence context over all slices. Used by one thread at a time.
pub struct DistributedBroker {
    id: Uuid,
    services: BrokerServices,
    context: RoutingContext,
    managed: HashMap<InstanceId, StateManager>,
    /// Unflushed instances in persist order
    pending: Vec<InstanceId>,
    /// Instances visited by the current outermost persist
    operating: HashSet<InstanceId>,
    /// Target of the current non-replicated root
    root_target: Option<SliceInfo>,
    in_transaction: bool,
}

impl std::fmt::Debug for DistributedBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedBroker")
            .field("id", &self.id)
            .field("managed", &self.managed.len())
            .field("pending", &self.pending.len())
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl DistributedBroker {
    pub fn new(services: BrokerServices) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            services,
            context: RoutingContext::for_broker(id),
            managed: HashMap::new(),
            pending: Vec::new(),
            operating: HashSet::new(),
            root_target: None,
            in_transaction: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Context passed to every policy call
    pub fn context_mut(&mut self) -> &mut RoutingContext {
        &mut self.context
    }

    pub fn cascade_state(&self) -> CascadeState {
        if self.operating.is_empty() {
            CascadeState::NoActiveCascade
        } else {
            CascadeState::InCascade
        }
    }

    // =========================================================================
    // Persist
    // =========================================================================

    /// Make `entity` and everything it cascades to persistent.
    ///
    /// A root call routes the root through the distribution router; every
    /// unassigned non-replicated instance reached by cascade gets the
    /// root's slice. Replicated instances are routed on their own. Policy
    /// errors abort the call; assignments made before the failure stay
    /// until the transaction rolls back.
    #[instrument(skip(self, entity), fields(broker = %self.id, instance = %entity))]
    pub fn persist(&mut self, entity: Arc<Entity>) -> Result<SliceInfo> {
        if !self.in_transaction {
            return Err(Error::TransactionState(
                "persist requires an active transaction".to_string(),
            ));
        }
        let root_call = self.operating.is_empty();
        if root_call {
            self.root_target = None;
        }
        let result = self.persist_cascade(&entity, root_call);
        if root_call {
            self.operating.clear();
            self.root_target = None;
        }
        result
    }

    fn persist_cascade(&mut self, entity: &Arc<Entity>, root: bool) -> Result<SliceInfo> {
        let id = entity.id();
        if !self.operating.insert(id) {
            // Reached again through a cycle; it was assigned on first visit
            return self.slice_info(id).cloned().ok_or_else(|| {
                Error::Internal(format!("{} revisited before assignment", entity))
            });
        }

        let metadata = Arc::clone(&self.services.metadata);
        let meta = metadata.entity(entity.type_name())?;

        let existing = self.managed.get(&id).and_then(|sm| sm.slice_info.clone());
        let info = match existing {
            Some(info) => info,
            None => {
                let info = match &self.root_target {
                    Some(target) if !meta.replicated => target.clone(),
                    _ => {
                        let active = self.services.registry.active_slice_names();
                        self.services.router.route(entity, &active, &self.context)?
                    }
                };
                debug!(instance = %entity, targets = ?info.targets(), root, "Assigned slice");
                let manager = self.managed.entry(id).or_insert_with(|| StateManager {
                    entity: Arc::clone(entity),
                    slice_info: None,
                    flushed: false,
                });
                manager.slice_info = Some(info.clone());
                if !manager.flushed && !self.pending.contains(&id) {
                    self.pending.push(id);
                }
                info
            }
        };

        if root && !info.is_replicated() {
            self.root_target = Some(info.clone());
        }

        for (relation, child) in entity.related() {
            let rel = meta.relation(relation).ok_or_else(|| Error::UnknownField {
                entity: meta.name.clone(),
                field: relation.clone(),
            })?;
            if rel.cascade_persist {
                self.persist_cascade(child, false)?;
            }
        }
        Ok(info)
    }

    // =========================================================================
    // Instance Lifecycle
    // =========================================================================

    /// Assignment carried by a managed instance
    pub fn slice_info(&self, id: InstanceId) -> Option<&SliceInfo> {
        self.managed.get(&id).and_then(|sm| sm.slice_info.as_ref())
    }

    pub fn is_managed(&self, id: InstanceId) -> bool {
        self.managed.contains_key(&id)
    }

    pub fn managed_count(&self) -> usize {
        self.managed.len()
    }

    /// Stop managing an instance; an unflushed instance will not be written.
    /// Returns the assignment it carried.
    pub fn detach(&mut self, id: InstanceId) -> Option<SliceInfo> {
        self.pending.retain(|p| *p != id);
        self.managed.remove(&id).and_then(|sm| sm.slice_info)
    }

    /// Drop a flushed instance from the context. New instances are kept.
    pub fn evict(&mut self, id: InstanceId) -> bool {
        match self.managed.get(&id) {
            Some(sm) if sm.flushed => {
                self.managed.remove(&id);
                true
            }
            _ => false,
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn is_active(&self) -> bool {
        self.in_transaction
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(Error::TransactionState("transaction already active".to_string()));
        }
        self.in_transaction = true;
        Ok(())
    }

    /// Flush new instances to their slices in parallel.
    ///
    /// Replicated instances are written to every target. On failure the
    /// transaction stays active so the caller can roll back; there is no
    /// two-phase commit, so slices that succeeded keep their rows.
    #[instrument(skip(self), fields(broker = %self.id))]
    pub fn commit(&mut self) -> Result<CommitSummary> {
        if !self.in_transaction {
            return Err(Error::TransactionState("no active transaction".to_string()));
        }

        let snapshot = self.services.registry.snapshot();
        let mut by_slice: BTreeMap<String, BTreeMap<String, Vec<Row>>> = BTreeMap::new();
        for id in &self.pending {
            let Some(sm) = self.managed.get(id) else { continue };
            let Some(info) = &sm.slice_info else { continue };
            let meta = self.services.metadata.entity(sm.entity.type_name())?;
            let row = sm.entity.to_row(meta, &self.services.metadata)?;
            for slice in info.targets() {
                by_slice
                    .entry(slice.clone())
                    .or_default()
                    .entry(meta.table.clone())
                    .or_default()
                    .push(row.clone());
            }
        }

        let mut tasks: Vec<(String, SliceTask<usize>)> = Vec::with_capacity(by_slice.len());
        for (slice, tables) in by_slice {
            if !snapshot.get(&slice)?.is_active() {
                return Err(Error::SliceInactive(slice));
            }
            let store = self.store(&slice)?;
            let task: SliceTask<usize> = Box::pin(async move {
                let mut written = 0;
                for (table, rows) in tables {
                    written += store.insert(&table, rows).await?;
                }
                Ok(written)
            });
            tasks.push((slice, task));
        }

        let written = self.services.executor.execute_all("commit", tasks)?;

        let instances = self.pending.len();
        for id in self.pending.drain(..) {
            if let Some(sm) = self.managed.get_mut(&id) {
                sm.flushed = true;
            }
        }
        self.in_transaction = false;
        let summary = CommitSummary {
            instances,
            rows: written.into_iter().collect(),
        };
        info!(instances, rows = ?summary.rows, "Transaction committed");
        Ok(summary)
    }

    /// Discard every instance persisted in this transaction, together with
    /// its slice assignment. Returns how many were discarded.
    pub fn rollback(&mut self) -> Result<usize> {
        if !self.in_transaction {
            return Err(Error::TransactionState("no active transaction".to_string()));
        }
        let discarded = self.pending.len();
        for id in self.pending.drain(..) {
            self.managed.remove(&id);
        }
        self.operating.clear();
        self.root_target = None;
        self.in_transaction = false;
        debug!(broker = %self.id, discarded, "Transaction rolled back");
        Ok(discarded)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Prepare, bind and run a query on its target slices, merging results.
    #[instrument(skip(self, args, options), fields(broker = %self.id))]
    pub fn query(&self, text: &str, args: &Args, options: &QueryOptions) -> Result<QueryResult> {
        let handle = self.services.preparer.prepare(text, args)?;
        let bound = handle.bind(args)?;

        let snapshot = self.services.registry.snapshot();
        let targets = match &options.targets {
            Some(explicit) => {
                let mut targets: Vec<String> = Vec::with_capacity(explicit.len());
                for name in explicit {
                    if !snapshot.get(name)?.is_active() {
                        return Err(Error::SliceInactive(name.clone()));
                    }
                    if !targets.contains(name) {
                        targets.push(name.clone());
                    }
                }
                if targets.is_empty() {
                    return Err(Error::Config("explicit query target list is empty".to_string()));
                }
                targets
            }
            None => self.services.router.query_targets(
                text,
                args,
                handle.plan().candidate(),
                &snapshot.active_names(),
                &self.context,
            )?,
        };

        let mut tasks: Vec<(String, SliceTask<Vec<Vec<Row>>>)> = Vec::with_capacity(targets.len());
        for slice in &targets {
            let store = self.store(slice)?;
            let statements = bound.clone();
            let task: SliceTask<Vec<Vec<Row>>> = Box::pin(async move {
                let mut results = Vec::with_capacity(statements.len());
                for statement in &statements {
                    results.push(store.select(statement).await?);
                }
                Ok(results)
            });
            tasks.push((slice.clone(), task));
        }

        let per_slice = self.services.executor.execute_all("query", tasks)?;

        let mut rows = Vec::new();
        let mut fetched: Vec<Vec<Row>> = vec![Vec::new(); bound.len()];
        for (_, results) in per_slice {
            for (index, result) in results.into_iter().enumerate() {
                match bound[index].statement().role {
                    StatementRole::Primary => rows.extend(result),
                    StatementRole::EagerFetch { .. } => fetched[index].extend(result),
                }
            }
        }

        // Secondary selects return the whole target table; keep the rows the
        // primary rows' foreign keys point at
        let mut related: BTreeMap<String, Vec<Row>> = BTreeMap::new();
        for (statement, candidates) in bound.iter().zip(fetched) {
            let StatementRole::EagerFetch {
                relation,
                owner_columns,
                target_columns,
            } = &statement.statement().role
            else {
                continue;
            };
            let keys: HashSet<Vec<Value>> = rows
                .iter()
                .filter_map(|row| join_key(row, owner_columns))
                .collect();
            let kept = related.entry(relation.clone()).or_default();
            for row in candidates {
                let matches = join_key(&row, target_columns).is_some_and(|key| keys.contains(&key));
                if matches && !kept.contains(&row) {
                    kept.push(row);
                }
            }
        }
        if let Some(primary) = bound.first() {
            let order_by = &primary.statement().order_by;
            if !order_by.is_empty() {
                rows.sort_by(|a, b| compare_rows(a, b, order_by));
            }
        }

        debug!(query = text, slices = ?targets, rows = rows.len(), "Query completed");
        Ok(QueryResult {
            rows,
            slices: targets,
            related,
            origin: handle.origin(),
        })
    }

    fn store(&self, slice: &str) -> Result<Arc<dyn SliceStore>> {
        self.services
            .stores
            .get(slice)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::UnknownSlice(slice.to_string()))
    }
}

/// Values of `columns` in `row`; `None` when any is missing or `NULL`
fn join_key(row: &Row, columns: &[String]) -> Option<Vec<Value>> {
    columns
        .iter()
        .map(|column| match row.get(column) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.clone()),
        })
        .collect()
}
