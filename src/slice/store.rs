//! Slice Data Stores
//!
//! The port a slice's data source implements, plus an in-memory adapter
//! that evaluates bound statements directly against stored rows.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::instance::Row;
use crate::error::{Error, Result};
use crate::query::{BoundStatement, Filter, FilterOp, Value};

/// Data source of one slice
#[async_trait]
pub trait SliceStore: Send + Sync {
    /// Name of the slice this store serves
    fn slice(&self) -> &str;

    /// Append rows to a table; returns the number written
    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<usize>;

    /// Execute a bound select
    async fn select(&self, statement: &BoundStatement) -> Result<Vec<Row>>;

    /// Store statistics
    fn stats(&self) -> StoreStats;
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Rows held across all tables
    pub rows: u64,
    /// Select operations
    pub selects: u64,
    /// Insert operations
    pub inserts: u64,
}

/// In-memory store for tests and the CLI
#[derive(Debug)]
pub struct InMemorySliceStore {
    slice: String,
    tables: RwLock<HashMap<String, Vec<Row>>>,
    /// Simulated outage
    offline: AtomicBool,
    rows: AtomicU64,
    selects: AtomicU64,
    inserts: AtomicU64,
}

impl InMemorySliceStore {
    /// Create an empty store for `slice`
    pub fn new(slice: impl Into<String>) -> Self {
        Self {
            slice: slice.into(),
            tables: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
            rows: AtomicU64::new(0),
            selects: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        }
    }

    /// Make every operation fail until set back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Rows currently held in `table`
    pub fn table_len(&self, table: &str) -> usize {
        self.tables.read().get(table).map(Vec::len).unwrap_or(0)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Store {
                slice: self.slice.clone(),
                reason: "slice is offline".to_string(),
            });
        }
        Ok(())
    }

    fn matches(row: &Row, filter: &Filter, statement: &BoundStatement) -> bool {
        let group_matches = |group: &Vec<crate::query::Operand>| {
            filter.columns.iter().zip(group).all(|(column, operand)| {
                let expected = statement.operand_value(operand);
                match row.get(column) {
                    // NULL never compares equal
                    None | Some(Value::Null) => false,
                    Some(actual) => !matches!(expected, Value::Null) && actual == expected,
                }
            })
        };
        match filter.op {
            FilterOp::Eq => filter.groups.first().map(group_matches).unwrap_or(false),
            FilterOp::In => filter.groups.iter().any(group_matches),
        }
    }
}

#[async_trait]
impl SliceStore for InMemorySliceStore {
    fn slice(&self) -> &str {
        &self.slice
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<usize> {
        self.check_online()?;
        self.inserts.fetch_add(1, Ordering::Relaxed);
        let count = rows.len();
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
        self.rows.fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }

    async fn select(&self, statement: &BoundStatement) -> Result<Vec<Row>> {
        self.check_online()?;
        self.selects.fetch_add(1, Ordering::Relaxed);
        let template = statement.statement();

        let mut rows: Vec<Row> = {
            let tables = self.tables.read();
            let Some(table) = tables.get(&template.table) else {
                return Ok(Vec::new());
            };
            table
                .iter()
                .filter(|row| {
                    template
                        .filters
                        .iter()
                        .all(|f| Self::matches(row, f, statement))
                })
                .map(|row| {
                    template
                        .columns
                        .iter()
                        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                        .collect()
                })
                .collect()
        };

        if !template.order_by.is_empty() {
            rows.sort_by(|a, b| compare_rows(a, b, &template.order_by));
        }
        Ok(rows)
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            rows: self.rows.load(Ordering::Relaxed),
            selects: self.selects.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
        }
    }
}

/// Order two rows by `(column, ascending)` keys
pub fn compare_rows(a: &Row, b: &Row, order_by: &[(String, bool)]) -> CmpOrdering {
    for (column, ascending) in order_by {
        let left = a.get(column).unwrap_or(&Value::Null);
        let right = b.get(column).unwrap_or(&Value::Null);
        let ord = left.compare(right);
        let ord = if *ascending { ord } else { ord.reverse() };
        if ord != CmpOrdering::Equal {
            return ord;
        }
    }
    CmpOrdering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::fixtures::sample_repository;
    use crate::query::{Args, BindMode, JpqlCompiler, ParameterBinder, QueryCompiler};
    use std::sync::Arc;

    fn row(id: i64, first: &str, last: &str) -> Row {
        [
            ("id".to_string(), Value::Int(id)),
            ("first_name".to_string(), Value::from(first)),
            ("last_name".to_string(), Value::from(last)),
        ]
        .into_iter()
        .collect()
    }

    fn bound(text: &str, args: &Args) -> BoundStatement {
        let compiler = JpqlCompiler::new(Arc::new(sample_repository()));
        let plan = compiler.compile(text, args, BindMode::Parameters).unwrap();
        ParameterBinder::bind(&plan, args).unwrap().remove(0)
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().build().unwrap()
    }

    #[test]
    fn test_select_filters_and_orders() {
        let store = InMemorySliceStore::new("east");
        rt().block_on(async {
            store
                .insert(
                    "person",
                    vec![row(1, "Ann", "Lee"), row(2, "Bob", "Lee"), row(3, "Cy", "Ng")],
                )
                .await
                .unwrap();

            let args = Args::new().named("last", "Lee");
            let rows = store
                .select(&bound(
                    "SELECT p FROM Person p WHERE p.last = :last ORDER BY p.first DESC",
                    &args,
                ))
                .await
                .unwrap();
            let firsts: Vec<&Value> = rows.iter().map(|r| &r["first_name"]).collect();
            assert_eq!(firsts, vec![&Value::from("Bob"), &Value::from("Ann")]);

            let args = Args::new().named("ids", vec![1, 3]);
            let rows = store
                .select(&bound("SELECT p FROM Person p WHERE p.id IN :ids", &args))
                .await
                .unwrap();
            assert_eq!(rows.len(), 2);
        });
        assert_eq!(store.stats().rows, 3);
        assert_eq!(store.stats().selects, 2);
    }

    #[test]
    fn test_composite_in_matches_column_groups() {
        let store = InMemorySliceStore::new("east");
        let account = |region: &str, no: i64| -> Row {
            [
                ("acct_region".to_string(), Value::from(region)),
                ("acct_no".to_string(), Value::Int(no)),
                ("owner".to_string(), Value::from("x")),
            ]
            .into_iter()
            .collect()
        };
        let key = |region: &str, no: i64| {
            Value::composite([("region", Value::from(region)), ("number", Value::Int(no))])
        };
        rt().block_on(async {
            store
                .insert("account", vec![account("eu", 1), account("eu", 2), account("us", 1)])
                .await
                .unwrap();
            let args = Args::new().named("keys", vec![key("eu", 2), key("us", 1)]);
            let rows = store
                .select(&bound("SELECT a FROM Account a WHERE a.key IN :keys", &args))
                .await
                .unwrap();
            assert_eq!(rows.len(), 2);
            assert!(rows.iter().all(|r| r["acct_region"] != Value::from("eu") || r["acct_no"] == Value::Int(2)));
        });
    }

    #[test]
    fn test_offline_store_fails() {
        let store = InMemorySliceStore::new("east");
        store.set_offline(true);
        let result = rt().block_on(store.insert("person", vec![row(1, "a", "b")]));
        assert!(matches!(result, Err(Error::Store { slice, .. }) if slice == "east"));
        assert_eq!(store.table_len("person"), 0);
    }
}
