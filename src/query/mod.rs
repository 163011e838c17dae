//! Query Preparation
//!
//! Turns query text into reusable plans and binds call-site arguments onto
//! them.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      QueryPreparer                         │
//! │   prepare(text, args) ──► TieredQueryCache ── hit ──┐      │
//! │            │ miss / not cacheable                   │      │
//! │            ▼                                        ▼      │
//! │      QueryCompiler ──► PreparedPlan ──► ParameterBinder    │
//! │                          (stored if                │       │
//! │                           cacheable)               ▼       │
//! │                                            BoundStatement  │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod binder;
pub mod compiler;
pub mod plan;
pub mod preparer;
pub mod value;

pub use binder::{Args, BoundStatement, ParameterBinder};
pub use compiler::{BindMode, JpqlCompiler, QueryCompiler};
pub use plan::{
    Cacheability, Filter, FilterOp, Operand, ParamKey, ParamShape, ParamSpec, ParamStyle,
    PreparedPlan, Slot, SqlStatement, StatementRole,
};
pub use preparer::{ExecutionHandle, PlanOrigin, QueryPreparer};
pub use value::{decompose, Value};
