//! Parameter Binding
//!
//! Maps positional (`?n`) or named (`:name`) call-site arguments onto the
//! ordinal `?` slots of a prepared plan's SQL. Binding never mutates the
//! plan; every call produces fresh [`BoundStatement`]s, so one cached plan
//! can be bound by many threads at once.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::plan::{Operand, ParamKey, ParamShape, ParamSpec, ParamStyle, PreparedPlan, SqlStatement};
use super::value::{decompose, Value};
use crate::error::{Error, Result};

/// Call-site arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    values: BTreeMap<ParamKey, Value>,
}

impl Args {
    /// No arguments
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a positional argument (`?n`)
    pub fn positional(mut self, position: u32, value: impl Into<Value>) -> Self {
        self.values
            .insert(ParamKey::Positional(position), value.into());
        self
    }

    /// Add a named argument (`:name`)
    pub fn named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(ParamKey::Named(name.into()), value.into());
        self
    }

    /// Insert by key
    pub fn insert(&mut self, key: ParamKey, value: Value) {
        self.values.insert(key, value);
    }

    /// Look up an argument
    pub fn get(&self, key: &ParamKey) -> Option<&Value> {
        self.values.get(key)
    }

    /// Iterate arguments in key order
    pub fn iter(&self) -> impl Iterator<Item = (&ParamKey, &Value)> {
        self.values.iter()
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no arguments were supplied
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A statement with concrete values for every placeholder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundStatement {
    statement: Arc<SqlStatement>,
    params: Vec<Value>,
}

impl BoundStatement {
    /// The shared statement template
    pub fn statement(&self) -> &Arc<SqlStatement> {
        &self.statement
    }

    /// SQL text with `?` placeholders
    pub fn sql(&self) -> &str {
        &self.statement.sql
    }

    /// Values in placeholder order
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Concrete value of a filter operand
    pub fn operand_value<'a>(&'a self, operand: &'a Operand) -> &'a Value {
        match operand {
            Operand::Slot(i) => &self.params[*i],
            Operand::Literal(v) => v,
        }
    }

    /// SQL text with every placeholder replaced by its literal.
    ///
    /// Placeholders inside quoted literals are left alone.
    pub fn render_inline(&self) -> Result<String> {
        let mut out = String::with_capacity(self.statement.sql.len() + self.params.len() * 4);
        let mut params = self.params.iter();
        let mut in_quote = false;
        for ch in self.statement.sql.chars() {
            match ch {
                '\'' => {
                    in_quote = !in_quote;
                    out.push(ch);
                }
                '?' if !in_quote => {
                    let value = params.next().ok_or_else(|| {
                        Error::Internal("more placeholders than bound values".to_string())
                    })?;
                    out.push_str(&value.to_sql_literal()?);
                }
                _ => out.push(ch),
            }
        }
        Ok(out)
    }
}

/// Stateless binder of arguments onto plans
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterBinder;

impl ParameterBinder {
    /// Bind `args` onto every statement of `plan`.
    ///
    /// Fails with [`Error::RebindMismatch`] when the arguments do not fit the
    /// compiled layout: wrong convention, missing or undeclared parameters,
    /// composite keys lacking components, or collections whose size differs
    /// from the number of placeholder groups compiled into the SQL.
    pub fn bind(plan: &PreparedPlan, args: &Args) -> Result<Vec<BoundStatement>> {
        Self::check_declared(plan, args)?;

        // Column values per parameter, per element
        let resolved = plan
            .parameters()
            .iter()
            .map(|spec| Self::resolve(spec, args))
            .collect::<Result<Vec<_>>>()?;

        plan.statements()
            .iter()
            .map(|statement| {
                let params = statement
                    .slots
                    .iter()
                    .map(|slot| {
                        let elements = &resolved[slot.param];
                        elements
                            .get(slot.element.unwrap_or(0))
                            .and_then(|cols| cols.get(slot.component.unwrap_or(0)))
                            .cloned()
                            .ok_or_else(|| {
                                Error::rebind(
                                    &plan.parameters()[slot.param].key,
                                    "placeholder has no corresponding argument value",
                                )
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(BoundStatement {
                    statement: Arc::clone(statement),
                    params,
                })
            })
            .collect()
    }

    fn check_declared(plan: &PreparedPlan, args: &Args) -> Result<()> {
        for (key, _) in args.iter() {
            let style_ok = matches!(
                (plan.style(), key),
                (ParamStyle::Positional, ParamKey::Positional(_))
                    | (ParamStyle::Named, ParamKey::Named(_))
            );
            if !style_ok {
                return Err(Error::rebind(
                    key,
                    format!("query uses {:?} parameters", plan.style()),
                ));
            }
            if !plan.parameters().iter().any(|p| &p.key == key) {
                return Err(Error::rebind(key, "parameter is not declared by the query"));
            }
        }
        Ok(())
    }

    /// Decompose one argument into `elements x columns` values.
    pub(crate) fn resolve(spec: &ParamSpec, args: &Args) -> Result<Vec<Vec<Value>>> {
        let value = args
            .get(&spec.key)
            .ok_or_else(|| Error::rebind(&spec.key, "no value supplied"))?;
        let named = |e: Error| match e {
            Error::RebindMismatch { reason, .. } => Error::rebind(&spec.key, reason),
            other => other,
        };

        match &spec.shape {
            ParamShape::Scalar => Ok(vec![decompose(value, &[]).map_err(named)?]),
            ParamShape::Composite { components } => {
                Ok(vec![decompose(value, components).map_err(named)?])
            }
            ParamShape::Collection { len, components } => {
                let Value::List(items) = value else {
                    return Err(Error::rebind(
                        &spec.key,
                        format!("expected a collection, got {}", value.kind()),
                    ));
                };
                if items.len() != *len {
                    return Err(Error::rebind(
                        &spec.key,
                        format!(
                            "collection has {} element(s) but the compiled SQL has {} placeholder group(s)",
                            items.len(),
                            len
                        ),
                    ));
                }
                items
                    .iter()
                    .map(|item| decompose(item, components).map_err(named))
                    .collect()
            }
        }
    }
}
