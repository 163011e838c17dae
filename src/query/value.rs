//! Query Values
//!
//! Scalar, composite-key and collection values flowing through binding,
//! literal rendering and the slice stores.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A value bound to a query parameter or stored in a row column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    /// Multi-column key value, addressed by component name
    Composite(BTreeMap<String, Value>),
    /// Collection argument for `IN` predicates
    List(Vec<Value>),
}

impl Value {
    /// Build a composite key from `(component, value)` pairs.
    pub fn composite<K, I>(parts: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Composite(parts.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Short name of the value kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Text(_) => "text",
            Value::Composite(_) => "composite",
            Value::List(_) => "list",
        }
    }

    /// Render as an SQL literal.
    ///
    /// Composite and list values have no single-literal form; callers
    /// decompose them first.
    pub fn to_sql_literal(&self) -> Result<String> {
        match self {
            Value::Null => Ok("NULL".to_string()),
            Value::Bool(true) => Ok("TRUE".to_string()),
            Value::Bool(false) => Ok("FALSE".to_string()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Text(s) => Ok(format!("'{}'", s.replace('\'', "''"))),
            other => Err(Error::Internal(format!(
                "{} value has no scalar literal form",
                other.kind()
            ))),
        }
    }

    /// Parse a command-line style argument (`42`, `true`, `a,b`, `text`).
    pub fn parse_arg(raw: &str) -> Self {
        if raw.contains(',') {
            return Value::List(raw.split(',').map(|s| Value::parse_arg(s.trim())).collect());
        }
        match raw {
            "true" | "TRUE" => Value::Bool(true),
            "false" | "FALSE" => Value::Bool(false),
            "null" | "NULL" => Value::Null,
            _ => raw
                .parse::<i64>()
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Text(raw.to_string())),
        }
    }

    /// Total order used by stores for `ORDER BY`. Nulls sort first.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (a, b) => a.kind().cmp(b.kind()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

/// Split a value into its column values, in the declared component order.
///
/// A single-column field (no components) passes its value through. A
/// composite field yields one value per component, looked up by name, so
/// the column order never depends on how the caller assembled the key.
/// Both the binder and literal compilation go through here.
pub fn decompose(value: &Value, components: &[String]) -> Result<Vec<Value>> {
    if components.is_empty() {
        return match value {
            Value::Composite(_) | Value::List(_) => Err(Error::rebind(
                "value",
                format!("expected a scalar, got {}", value.kind()),
            )),
            scalar => Ok(vec![scalar.clone()]),
        };
    }

    match value {
        Value::Composite(parts) => {
            if parts.len() != components.len() {
                return Err(Error::rebind(
                    "value",
                    format!(
                        "composite key has {} component(s), expected {}",
                        parts.len(),
                        components.len()
                    ),
                ));
            }
            components
                .iter()
                .map(|c| {
                    parts.get(c).cloned().ok_or_else(|| {
                        Error::rebind("value", format!("composite key lacks component '{}'", c))
                    })
                })
                .collect()
        }
        other => Err(Error::rebind(
            "value",
            format!(
                "expected a composite key of {:?}, got {}",
                components,
                other.kind()
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_literal_rendering() {
        assert_eq!(Value::Int(42).to_sql_literal().unwrap(), "42");
        assert_eq!(Value::from("O'Brien").to_sql_literal().unwrap(), "'O''Brien'");
        assert_eq!(Value::Bool(true).to_sql_literal().unwrap(), "TRUE");
        assert_eq!(Value::Null.to_sql_literal().unwrap(), "NULL");
        assert!(Value::List(vec![]).to_sql_literal().is_err());
    }

    #[test]
    fn test_decompose_follows_declared_order() {
        // Components inserted in reverse still come out in declared order
        let key = Value::composite([("region", Value::from("eu")), ("id", Value::Int(7))]);
        let parts = decompose(&key, &comps(&["id", "region"])).unwrap();
        assert_eq!(parts, vec![Value::Int(7), Value::from("eu")]);
    }

    #[test]
    fn test_decompose_rejects_shape_mismatch() {
        let key = Value::composite([("id", Value::Int(7))]);
        assert!(decompose(&key, &comps(&["id", "region"])).is_err());
        assert!(decompose(&Value::Int(7), &comps(&["id", "region"])).is_err());
        assert!(decompose(&key, &[]).is_err());
    }

    #[test]
    fn test_decompose_scalar_passthrough() {
        assert_eq!(decompose(&Value::Int(3), &[]).unwrap(), vec![Value::Int(3)]);
    }

    #[test]
    fn test_parse_arg() {
        assert_eq!(Value::parse_arg("12"), Value::Int(12));
        assert_eq!(Value::parse_arg("true"), Value::Bool(true));
        assert_eq!(Value::parse_arg("abc"), Value::from("abc"));
        assert_eq!(
            Value::parse_arg("1,2"),
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_compare_orders_nulls_first() {
        assert_eq!(Value::Null.compare(&Value::Int(1)), Ordering::Less);
        assert_eq!(Value::Int(2).compare(&Value::Int(1)), Ordering::Greater);
        assert_eq!(Value::from("a").compare(&Value::from("b")), Ordering::Less);
    }
}
