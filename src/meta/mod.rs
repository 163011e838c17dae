//! Entity Metadata
//!
//! Mapping information the compiler, binder and broker consume: entity to
//! table, field to column(s), composite key components, relations and
//! replication. Populated once from configuration; read-only afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fetch strategy for a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Loaded by a secondary select issued with the owning query
    Eager,
    /// Loaded on access
    #[default]
    Lazy,
}

/// A persistent field mapped to one or more columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    /// Field name as used in queries (`e.<name>`)
    pub name: String,
    /// Column names, in key order
    pub columns: Vec<String>,
    /// Composite component names matching `columns`; empty for single-column fields
    #[serde(default)]
    pub components: Vec<String>,
}

impl FieldMeta {
    /// Single-column field
    pub fn simple(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: vec![column.into()],
            components: Vec::new(),
        }
    }

    /// Composite field; each `(component, column)` pair in key order
    pub fn composite<N, C>(name: impl Into<String>, parts: impl IntoIterator<Item = (N, C)>) -> Self
    where
        N: Into<String>,
        C: Into<String>,
    {
        let (components, columns) = parts
            .into_iter()
            .map(|(n, c)| (n.into(), c.into()))
            .unzip();
        Self {
            name: name.into(),
            columns,
            components,
        }
    }

    /// True when the field spans more than one column
    pub fn is_composite(&self) -> bool {
        !self.components.is_empty()
    }
}

/// Relation from one entity to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationMeta {
    /// Relation name
    pub name: String,
    /// Target entity name
    pub target: String,
    /// Fetch strategy
    #[serde(default)]
    pub fetch: FetchMode,
    /// Whether persist() cascades across this relation
    #[serde(default)]
    pub cascade_persist: bool,
    /// Foreign key columns in the owner's table; `<relation>_<column>` for
    /// each referenced column when empty
    #[serde(default)]
    pub columns: Vec<String>,
    /// Target field the foreign key references; `id` when absent
    #[serde(default)]
    pub references: Option<String>,
}

impl RelationMeta {
    /// Lazy, non-cascading relation with derived join columns
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            fetch: FetchMode::Lazy,
            cascade_persist: false,
            columns: Vec::new(),
            references: None,
        }
    }

    pub fn eager(mut self) -> Self {
        self.fetch = FetchMode::Eager;
        self
    }

    pub fn cascading(mut self) -> Self {
        self.cascade_persist = true;
        self
    }

    /// Referenced target field name
    pub fn target_field(&self) -> &str {
        self.references.as_deref().unwrap_or("id")
    }
}

/// Resolved foreign key of a relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinColumns {
    /// Foreign key columns in the owner's table
    pub owner: Vec<String>,
    /// Referenced columns in the target's table, paired with `owner`
    pub target: Vec<String>,
    /// Referenced target field
    pub target_field: String,
    /// Composite components of the referenced field; empty for one column
    pub components: Vec<String>,
}

/// Mapping for one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Entity name as used in queries
    pub name: String,
    /// Table name
    pub table: String,
    /// Instances are copied to several slices
    #[serde(default)]
    pub replicated: bool,
    /// Persistent fields
    pub fields: Vec<FieldMeta>,
    /// Relations
    #[serde(default)]
    pub relations: Vec<RelationMeta>,
}

impl EntityMeta {
    /// Look up a field by name
    pub fn field(&self, name: &str) -> Result<&FieldMeta> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::UnknownField {
                entity: self.name.clone(),
                field: name.to_string(),
            })
    }

    /// Look up a relation by name
    pub fn relation(&self, name: &str) -> Option<&RelationMeta> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// All columns in field declaration order
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .flat_map(|f| f.columns.iter().map(String::as_str))
    }

    /// Relations loaded eagerly
    pub fn eager_relations(&self) -> impl Iterator<Item = &RelationMeta> {
        self.relations
            .iter()
            .filter(|r| r.fetch == FetchMode::Eager)
    }
}

/// Repository of entity mappings, keyed by entity name
#[derive(Debug, Clone, Default)]
pub struct MetadataRepository {
    entities: HashMap<String, EntityMeta>,
}

impl MetadataRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list of mappings, checking cross references.
    pub fn from_entities(entities: impl IntoIterator<Item = EntityMeta>) -> Result<Self> {
        let mut repo = Self::new();
        for meta in entities {
            repo.register(meta)?;
        }
        repo.validate()?;
        Ok(repo)
    }

    /// Register a mapping
    pub fn register(&mut self, meta: EntityMeta) -> Result<()> {
        for field in &meta.fields {
            if field.columns.is_empty() {
                return Err(Error::Config(format!(
                    "field {}.{} maps no columns",
                    meta.name, field.name
                )));
            }
            if field.is_composite() && field.components.len() != field.columns.len() {
                return Err(Error::Config(format!(
                    "field {}.{} has {} components for {} columns",
                    meta.name,
                    field.name,
                    field.components.len(),
                    field.columns.len()
                )));
            }
        }
        if self.entities.contains_key(&meta.name) {
            return Err(Error::Config(format!("entity {} declared twice", meta.name)));
        }
        self.entities.insert(meta.name.clone(), meta);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for meta in self.entities.values() {
            for rel in &meta.relations {
                if !self.entities.contains_key(&rel.target) {
                    return Err(Error::Config(format!(
                        "relation {}.{} targets unknown entity {}",
                        meta.name, rel.name, rel.target
                    )));
                }
                self.join_columns(meta, rel)?;
            }
        }
        Ok(())
    }

    /// Foreign key layout of `relation` owned by `owner`
    pub fn join_columns(&self, owner: &EntityMeta, relation: &RelationMeta) -> Result<JoinColumns> {
        let target = self.entity(&relation.target)?;
        let field = target.field(relation.target_field()).map_err(|_| {
            Error::Config(format!(
                "relation {}.{} references unknown field {}.{}",
                owner.name,
                relation.name,
                target.name,
                relation.target_field()
            ))
        })?;
        let owner_columns = if relation.columns.is_empty() {
            field
                .columns
                .iter()
                .map(|c| format!("{}_{}", relation.name, c))
                .collect()
        } else {
            relation.columns.clone()
        };
        if owner_columns.len() != field.columns.len() {
            return Err(Error::Config(format!(
                "relation {}.{} maps {} columns onto {} referenced columns",
                owner.name,
                relation.name,
                owner_columns.len(),
                field.columns.len()
            )));
        }
        Ok(JoinColumns {
            owner: owner_columns,
            target: field.columns.clone(),
            target_field: field.name.clone(),
            components: field.components.clone(),
        })
    }

    /// Look up an entity mapping
    pub fn entity(&self, name: &str) -> Result<&EntityMeta> {
        self.entities
            .get(name)
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    /// Whether instances of the type are replicated
    pub fn is_replicated(&self, name: &str) -> bool {
        self.entities.get(name).map(|m| m.replicated).unwrap_or(false)
    }

    /// Number of registered entities
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no entities are registered
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_field_pairs_components_with_columns() {
        let field = FieldMeta::composite("key", [("region", "acct_region"), ("number", "acct_no")]);
        assert!(field.is_composite());
        assert_eq!(field.components, vec!["region", "number"]);
        assert_eq!(field.columns, vec!["acct_region", "acct_no"]);
    }

    #[test]
    fn test_lookup_and_replication_flag() {
        let repo = fixtures::sample_repository();
        assert_eq!(repo.len(), 5);
        assert!(repo.is_replicated("Country"));
        assert!(!repo.is_replicated("Person"));
        assert!(repo.entity("Nope").is_err());
        assert!(repo.entity("Person").unwrap().field("nope").is_err());
    }

    #[test]
    fn test_dangling_relation_rejected() {
        let result = MetadataRepository::from_entities([EntityMeta {
            name: "A".to_string(),
            table: "a".to_string(),
            replicated: false,
            fields: vec![FieldMeta::simple("id", "id")],
            relations: vec![RelationMeta::new("b", "B")],
        }]);
        assert!(result.is_err());
    }

    #[test]
    fn test_join_columns_default_and_explicit() {
        let repo = fixtures::sample_repository();
        let order = repo.entity("Order").unwrap();
        let join = repo.join_columns(order, &order.relations[0]).unwrap();
        assert_eq!(join.owner, vec!["address_id"]);
        assert_eq!(join.target, vec!["id"]);
        assert_eq!(join.target_field, "id");

        let owner = EntityMeta {
            name: "Loan".to_string(),
            table: "loan".to_string(),
            replicated: false,
            fields: vec![FieldMeta::simple("id", "id")],
            relations: vec![RelationMeta {
                columns: vec!["acct_r".to_string(), "acct_n".to_string()],
                references: Some("key".to_string()),
                ..RelationMeta::new("account", "Account")
            }],
        };
        let join = repo.join_columns(&owner, &owner.relations[0]).unwrap();
        assert_eq!(join.target, vec!["acct_region", "acct_no"]);
        assert_eq!(join.components, vec!["region", "number"]);

        let bad = RelationMeta {
            columns: vec!["only_one".to_string()],
            references: Some("key".to_string()),
            ..RelationMeta::new("account", "Account")
        };
        assert!(matches!(repo.join_columns(&owner, &bad), Err(Error::Config(_))));
        let missing = RelationMeta {
            references: Some("nope".to_string()),
            ..RelationMeta::new("account", "Account")
        };
        assert!(matches!(repo.join_columns(&owner, &missing), Err(Error::Config(_))));
    }

    #[test]
    fn test_component_column_count_mismatch_rejected() {
        let mut repo = MetadataRepository::new();
        let result = repo.register(EntityMeta {
            name: "A".to_string(),
            table: "a".to_string(),
            replicated: false,
            fields: vec![FieldMeta {
                name: "id".to_string(),
                columns: vec!["x".to_string(), "y".to_string()],
                components: vec!["x".to_string()],
            }],
            relations: vec![],
        });
        assert!(result.is_err());
    }
}
