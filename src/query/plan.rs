//! Prepared Plans
//!
//! Immutable compiled form of one query: the SQL statement(s), their
//! placeholder slots and the parameter layout needed to rebind them.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::value::Value;

/// Identifies a caller-supplied parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ParamKey {
    /// `?n`
    Positional(u32),
    /// `:name`
    Named(String),
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKey::Positional(n) => write!(f, "?{}", n),
            ParamKey::Named(name) => write!(f, ":{}", name),
        }
    }
}

/// Parameter convention used by a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParamStyle {
    /// Query takes no parameters
    None,
    Positional,
    Named,
}

/// Shape a parameter was compiled against
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ParamShape {
    /// Single-column value
    Scalar,
    /// Composite key split into the listed components
    Composite { components: Vec<String> },
    /// Collection expanded to `len` placeholder groups; components empty for scalar elements
    Collection { len: usize, components: Vec<String> },
}

impl ParamShape {
    /// Components per value (or per collection element)
    pub fn components(&self) -> &[String] {
        match self {
            ParamShape::Scalar => &[],
            ParamShape::Composite { components } | ParamShape::Collection { components, .. } => {
                components
            }
        }
    }
}

/// One parameter of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    pub key: ParamKey,
    pub shape: ParamShape,
}

/// Binding instruction for one SQL placeholder (`?`), in ordinal order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    /// Index into [`PreparedPlan::parameters`]
    pub param: usize,
    /// Collection element, for expanded `IN` parameters
    pub element: Option<usize>,
    /// Composite component index
    pub component: Option<usize>,
}

/// Right-hand side of a filter column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Operand {
    /// Placeholder ordinal within the statement
    Slot(usize),
    /// Value embedded in the SQL text
    Literal(Value),
}

/// Comparison kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FilterOp {
    Eq,
    In,
}

/// Conjunct of a WHERE clause over one field.
///
/// `groups` holds one operand per column; `Eq` has exactly one group and
/// `In` matches when any group matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Filter {
    pub columns: Vec<String>,
    pub op: FilterOp,
    pub groups: Vec<Vec<Operand>>,
}

/// Why a statement is part of the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StatementRole {
    Primary,
    /// Secondary select loading an eager relation. Only rows whose
    /// `target_columns` match a primary row's `owner_columns` belong to it.
    EagerFetch {
        relation: String,
        owner_columns: Vec<String>,
        target_columns: Vec<String>,
    },
}

/// One generated SQL statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqlStatement {
    /// SQL text with `?` placeholders
    pub sql: String,
    /// Table read by the statement
    pub table: String,
    /// Projected columns
    pub columns: Vec<String>,
    /// WHERE conjuncts
    pub filters: Vec<Filter>,
    /// ORDER BY columns, `true` for ascending
    pub order_by: Vec<(String, bool)>,
    /// Placeholder slots in ordinal order
    pub slots: Vec<Slot>,
    pub role: StatementRole,
}

impl SqlStatement {
    /// Number of `?` placeholders
    pub fn placeholder_count(&self) -> usize {
        self.slots.len()
    }
}

/// Cacheability verdict for a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Cacheability {
    Cacheable,
    NotCacheable(String),
}

/// Compiled, immutable, reusable translation of one query text
#[derive(Debug, Clone, Serialize)]
pub struct PreparedPlan {
    source: String,
    candidate: String,
    statements: Vec<Arc<SqlStatement>>,
    parameters: Vec<ParamSpec>,
    style: ParamStyle,
    inline: bool,
    cacheability: Cacheability,
}

impl PreparedPlan {
    /// Assemble a plan and classify it.
    ///
    /// Only a single primary statement compiled with placeholders is
    /// reusable; inline-literal plans and multi-statement plans are not.
    pub fn new(
        source: impl Into<String>,
        candidate: impl Into<String>,
        statements: Vec<SqlStatement>,
        parameters: Vec<ParamSpec>,
        style: ParamStyle,
        inline: bool,
    ) -> Self {
        let cacheability = if inline {
            Cacheability::NotCacheable("arguments embedded as literals".to_string())
        } else if statements.len() != 1 {
            Cacheability::NotCacheable(format!(
                "compiles to {} SQL statements",
                statements.len()
            ))
        } else {
            Cacheability::Cacheable
        };

        Self {
            source: source.into(),
            candidate: candidate.into(),
            statements: statements.into_iter().map(Arc::new).collect(),
            parameters,
            style,
            inline,
            cacheability,
        }
    }

    /// Original query text (the cache key)
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Candidate entity name
    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    /// Generated statements, primary first
    pub fn statements(&self) -> &[Arc<SqlStatement>] {
        &self.statements
    }

    /// Parameter layout
    pub fn parameters(&self) -> &[ParamSpec] {
        &self.parameters
    }

    /// Parameter convention
    pub fn style(&self) -> ParamStyle {
        self.style
    }

    /// Whether arguments were embedded into the SQL text
    pub fn is_inline(&self) -> bool {
        self.inline
    }

    /// Cacheability verdict
    pub fn cacheability(&self) -> &Cacheability {
        &self.cacheability
    }

    /// Shorthand for a `Cacheable` verdict
    pub fn is_cacheable(&self) -> bool {
        self.cacheability == Cacheability::Cacheable
    }

    /// SQL text of every statement
    pub fn sql(&self) -> Vec<&str> {
        self.statements.iter().map(|s| s.sql.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(sql: &str, role: StatementRole) -> SqlStatement {
        SqlStatement {
            sql: sql.to_string(),
            table: "t".to_string(),
            columns: vec!["id".to_string()],
            filters: vec![],
            order_by: vec![],
            slots: vec![],
            role,
        }
    }

    #[test]
    fn test_single_statement_plan_is_cacheable() {
        let plan = PreparedPlan::new(
            "q",
            "T",
            vec![statement("SELECT t0.id FROM t t0", StatementRole::Primary)],
            vec![],
            ParamStyle::None,
            false,
        );
        assert!(plan.is_cacheable());
        assert_eq!(plan.sql(), vec!["SELECT t0.id FROM t t0"]);
    }

    #[test]
    fn test_multi_statement_plan_is_not_cacheable() {
        let plan = PreparedPlan::new(
            "q",
            "T",
            vec![
                statement("SELECT t0.id FROM t t0", StatementRole::Primary),
                statement(
                    "SELECT t1.id FROM u t1",
                    StatementRole::EagerFetch {
                        relation: "u".to_string(),
                        owner_columns: vec!["u_id".to_string()],
                        target_columns: vec!["id".to_string()],
                    },
                ),
            ],
            vec![],
            ParamStyle::None,
            false,
        );
        assert!(!plan.is_cacheable());
        assert!(matches!(plan.cacheability(), Cacheability::NotCacheable(r) if r.contains("2 SQL")));
    }

    #[test]
    fn test_inline_plan_is_not_cacheable() {
        let plan = PreparedPlan::new(
            "q",
            "T",
            vec![statement("SELECT t0.id FROM t t0 WHERE t0.id = 1", StatementRole::Primary)],
            vec![],
            ParamStyle::None,
            true,
        );
        assert!(!plan.is_cacheable());
    }

    #[test]
    fn test_param_key_display() {
        assert_eq!(ParamKey::Positional(2).to_string(), "?2");
        assert_eq!(ParamKey::Named("id".to_string()).to_string(), ":id");
    }
}
