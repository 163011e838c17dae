//! slicequery - Prepared-Query Cache and Slice-Routing Broker Core
//!
//! Compiles object queries into reusable SQL plans, caches them across a
//! hard and a soft tier, and routes persistent instances and queries over
//! several physical data stores ("slices").
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        PersistenceUnit                              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  QueryPreparer ──► TieredQueryCache        SliceRegistry            │
//! │       │                                         │                   │
//! │  JpqlCompiler / ParameterBinder      DistributionRouter + policies  │
//! │                          ╲                 ╱                        │
//! │                        DistributedBroker (per context)              │
//! │                                  │                                  │
//! │                          SliceExecutor ──► SliceStore per slice     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiered prepared-query cache and statistics
//! - [`config`] - Persistence unit configuration
//! - [`error`] - Error types
//! - [`meta`] - Entity mapping metadata
//! - [`query`] - Compilation, plans, parameter binding and preparation
//! - [`slice`] - Slice registry, placement policies, broker and executor
//! - [`unit`] - Persistence unit wiring

pub mod cache;
pub mod config;
pub mod error;
pub mod meta;
pub mod query;
pub mod slice;
pub mod unit;

// Re-export commonly used types
pub use cache::{CacheSettings, Lookup, Tier, TieredQueryCache};
pub use config::UnitConfig;
pub use error::{Error, Result};
pub use query::{Args, BoundStatement, ExecutionHandle, PreparedPlan, QueryPreparer, Value};
pub use slice::{DistributedBroker, Entity, QueryOptions, SliceInfo, SliceRegistry};
pub use unit::PersistenceUnit;
