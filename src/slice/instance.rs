//! Persistent Instances
//!
//! The broker manages plain entity values: a type name, field values and
//! related instances reachable for cascade.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::meta::{EntityMeta, MetadataRepository};
use crate::query::{decompose, Value};

/// Identity of a managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Fresh random identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A column-name to value row
pub type Row = BTreeMap<String, Value>;

/// An entity instance
#[derive(Debug, Clone)]
pub struct Entity {
    id: InstanceId,
    type_name: String,
    fields: BTreeMap<String, Value>,
    related: Vec<(String, Arc<Entity>)>,
}

impl Entity {
    /// New instance of `type_name` with no field values
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            id: InstanceId::new(),
            type_name: type_name.into(),
            fields: BTreeMap::new(),
            related: Vec::new(),
        }
    }

    /// Set a field value
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Attach a related instance under `relation`
    pub fn with_related(mut self, relation: impl Into<String>, target: Arc<Entity>) -> Self {
        self.related.push((relation.into(), target));
        self
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Related instances in attachment order
    pub fn related(&self) -> &[(String, Arc<Entity>)] {
        &self.related
    }

    /// Flatten field values into a table row.
    ///
    /// Composite fields are split into their columns in declared component
    /// order; unset fields become `NULL`. Each relation contributes its
    /// foreign key columns, taken from the attached instance's referenced
    /// field.
    pub fn to_row(&self, meta: &EntityMeta, metadata: &MetadataRepository) -> Result<Row> {
        if meta.name != self.type_name {
            return Err(Error::Internal(format!(
                "{} mapped with metadata for {}",
                self, meta.name
            )));
        }
        let mut row = Row::new();
        for field in &meta.fields {
            put(&mut row, &field.columns, &field.components, self.fields.get(&field.name))?;
        }
        for relation in &meta.relations {
            let join = metadata.join_columns(meta, relation)?;
            let key = self
                .related
                .iter()
                .find(|(name, _)| name == &relation.name)
                .and_then(|(_, target)| target.field(&join.target_field));
            put(&mut row, &join.owner, &join.components, key)?;
        }
        Ok(row)
    }
}

fn put(row: &mut Row, columns: &[String], components: &[String], value: Option<&Value>) -> Result<()> {
    match value {
        None | Some(Value::Null) => {
            for column in columns {
                row.insert(column.clone(), Value::Null);
            }
        }
        Some(value) => {
            let parts = decompose(value, components)?;
            for (column, part) in columns.iter().zip(parts) {
                row.insert(column.clone(), part);
            }
        }
    }
    Ok(())
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_name, self.id)
    }
}
