//! Query Preparer
//!
//! Looks a query text up in the tiered cache, compiles on a miss, decides
//! cacheability and hands back an [`ExecutionHandle`] that binds arguments
//! without touching the shared plan.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use super::binder::{Args, BoundStatement, ParameterBinder};
use super::compiler::{BindMode, QueryCompiler};
use super::plan::PreparedPlan;
use crate::cache::{Lookup, Tier, TieredQueryCache};
use crate::error::Result;

/// Where a handle's plan came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrigin {
    /// Found in the hard tier
    HardHit,
    /// Found in the soft tier and promoted
    SoftHit,
    /// Compiled on a miss
    Compiled,
    /// Compiled because the text is known not to be cacheable
    Uncachable,
    /// Compiled with arguments embedded as literals
    Inline,
}

impl PlanOrigin {
    /// Whether the plan was reused from the cache
    pub fn is_hit(self) -> bool {
        matches!(self, PlanOrigin::HardHit | PlanOrigin::SoftHit)
    }
}

/// A prepared plan ready to bind
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    plan: Arc<PreparedPlan>,
    origin: PlanOrigin,
}

impl ExecutionHandle {
    /// The (possibly shared) plan
    pub fn plan(&self) -> &Arc<PreparedPlan> {
        &self.plan
    }

    pub fn origin(&self) -> PlanOrigin {
        self.origin
    }

    /// Bind arguments, producing one statement per SQL statement of the plan
    pub fn bind(&self, args: &Args) -> Result<Vec<BoundStatement>> {
        ParameterBinder::bind(&self.plan, args)
    }
}

/// Cache-aware front end of the query compiler
pub struct QueryPreparer {
    cache: Arc<TieredQueryCache>,
    compiler: Arc<dyn QueryCompiler>,
}

impl std::fmt::Debug for QueryPreparer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPreparer")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl QueryPreparer {
    /// Create a preparer over a shared cache
    pub fn new(cache: Arc<TieredQueryCache>, compiler: Arc<dyn QueryCompiler>) -> Self {
        Self { cache, compiler }
    }

    /// The cache this preparer reads and fills
    pub fn cache(&self) -> &Arc<TieredQueryCache> {
        &self.cache
    }

    /// Prepare `text` for execution.
    ///
    /// `args` are only consulted on a compile, where collection arguments
    /// fix the number of `IN` placeholder groups. A cached plan is returned
    /// as-is; binding it with differently sized collections fails with a
    /// rebind mismatch.
    pub fn prepare(&self, text: &str, args: &Args) -> Result<ExecutionHandle> {
        let handle = match self.cache.lookup(text) {
            Lookup::Hit { plan, tier } => {
                trace!(query = text, %tier, "Query cache hit");
                ExecutionHandle {
                    plan,
                    origin: match tier {
                        Tier::Soft => PlanOrigin::SoftHit,
                        _ => PlanOrigin::HardHit,
                    },
                }
            }
            Lookup::NotCacheable(reason) => {
                trace!(query = text, reason = %reason, "Query is not cacheable; compiling");
                ExecutionHandle {
                    plan: Arc::new(self.compiler.compile(text, args, BindMode::Parameters)?),
                    origin: PlanOrigin::Uncachable,
                }
            }
            Lookup::Miss => {
                let plan = Arc::new(self.compiler.compile(text, args, BindMode::Parameters)?);
                let stored = self.cache.store(Arc::clone(&plan));
                debug!(query = text, stored, statements = plan.statements().len(), "Compiled query");
                ExecutionHandle {
                    origin: if stored || plan.is_cacheable() {
                        PlanOrigin::Compiled
                    } else {
                        PlanOrigin::Uncachable
                    },
                    plan,
                }
            }
        };

        if self.cache.settings().statistics {
            self.cache
                .statistics()
                .record_execution(text, handle.origin.is_hit());
        }
        Ok(handle)
    }

    /// Prepare and bind in one step
    pub fn prepare_and_bind(&self, text: &str, args: &Args) -> Result<Vec<BoundStatement>> {
        self.prepare(text, args)?.bind(args)
    }

    /// Compile with every argument embedded as a literal. Never cached.
    pub fn prepare_inline(&self, text: &str, args: &Args) -> Result<ExecutionHandle> {
        let plan = self.compiler.compile(text, args, BindMode::Literals)?;
        Ok(ExecutionHandle {
            plan: Arc::new(plan),
            origin: PlanOrigin::Inline,
        })
    }
}
