//! Slices
//!
//! Routing of persistent instances and queries across several physical
//! data stores.
//!
//! ```text
//!   DistributedBroker ──persist──► DistributionRouter ──► Distribution/ReplicationPolicy
//!          │                              │
//!          │ commit / query               └── validated against SliceRegistry actives
//!          ▼
//!    SliceExecutor ──► SliceStore (east) │ SliceStore (west) │ ...
//! ```

pub mod broker;
pub mod executor;
pub mod instance;
pub mod policy;
pub mod registry;
pub mod router;
pub mod store;

pub use broker::{
    BrokerServices, CascadeState, CommitSummary, DistributedBroker, QueryOptions, QueryResult,
};
pub use executor::{ExecutorSettings, ExecutorStats, PoolKind, SliceExecutor, SliceTask};
pub use instance::{Entity, InstanceId, Row};
pub use policy::{
    DistributionPolicy, HashDistribution, PolicyRegistry, QueryAll, QueryTargetPolicy,
    ReplicateAll, ReplicationPolicy, RoundRobinDistribution, RoutingContext,
};
pub use registry::{Slice, SliceConfig, SliceRegistry, SliceSnapshot, SliceStatus};
pub use router::{DistributionRouter, SliceInfo};
pub use store::{InMemorySliceStore, SliceStore, StoreStats};
