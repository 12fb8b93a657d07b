//! Static per-entity mapping description.
//!
//! # Responsibility
//! - Describe how one entity type maps onto a table: columns, primary key
//!   and relations.
//! - Resolve field names to SQL column identifiers.
//!
//! # Invariants
//! - Field lookups are case-sensitive; emitted SQL identifiers are lower-cased.
//! - Registered metadata has exactly one primary-key column and is never
//!   mutated afterwards.

use crate::entity::Entity;
use crate::error::{OrmError, OrmResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::{BitOr, BitOrAssign};

/// Association cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    ManyToOne,
    ManyToMany,
    OneToOne,
    OneToMany,
}

impl RelationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ManyToOne => "ManyToOne",
            Self::ManyToMany => "ManyToMany",
            Self::OneToOne => "OneToOne",
            Self::OneToMany => "OneToMany",
        }
    }
}

/// Bitmask of operations propagated through a relation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cascade(u8);

impl Cascade {
    pub const NONE: Cascade = Cascade(0);
    /// Persisting the owner persists related entities.
    pub const PERSIST: Cascade = Cascade(0x01);
    /// Removing the owner removes related entities first.
    pub const REMOVE: Cascade = Cascade(0x02);

    pub fn contains(self, other: Cascade) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Cascade {
    type Output = Cascade;

    fn bitor(self, rhs: Cascade) -> Cascade {
        Cascade(self.0 | rhs.0)
    }
}

impl BitOrAssign for Cascade {
    fn bitor_assign(&mut self, rhs: Cascade) {
        self.0 |= rhs.0;
    }
}

/// When related entities are loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fetch {
    #[default]
    Lazy,
    ExtraLazy,
    Eager,
}

/// One mapped column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    #[serde(default)]
    pub id: bool,
    pub field: String,
    /// SQL column name; defaults to `field`.
    #[serde(default)]
    pub name: Option<String>,
}

impl Column {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            id: false,
            field: field.into(),
            name: None,
        }
    }

    /// Creates the primary-key column.
    pub fn id(field: impl Into<String>) -> Self {
        Self {
            id: true,
            ..Self::new(field)
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// SQL identifier for this column, lower-cased.
    pub fn column_name(&self) -> String {
        self.name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(self.field.as_str())
            .to_lowercase()
    }
}

/// Association between two entities.
///
/// `foreign_key` names the field holding the key:
/// - `OneToMany` / `OneToOne`: field on the target pointing at this entity.
/// - `ManyToOne`: field on this entity pointing at the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub kind: RelationKind,
    pub target_entity: String,
    /// Field of this entity receiving the related entities.
    pub field: String,
    pub foreign_key: String,
    #[serde(default)]
    pub mapped_by: Option<String>,
    #[serde(default)]
    pub cascade: Cascade,
    #[serde(default)]
    pub fetch: Fetch,
}

impl Relation {
    pub fn new(
        kind: RelationKind,
        field: impl Into<String>,
        target_entity: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            target_entity: target_entity.into(),
            field: field.into(),
            foreign_key: foreign_key.into(),
            mapped_by: None,
            cascade: Cascade::NONE,
            fetch: Fetch::Lazy,
        }
    }

    pub fn one_to_many(
        field: impl Into<String>,
        target_entity: impl Into<String>,
        indexed_by: impl Into<String>,
    ) -> Self {
        Self::new(RelationKind::OneToMany, field, target_entity, indexed_by)
    }

    pub fn one_to_one(
        field: impl Into<String>,
        target_entity: impl Into<String>,
        indexed_by: impl Into<String>,
    ) -> Self {
        Self::new(RelationKind::OneToOne, field, target_entity, indexed_by)
    }

    pub fn many_to_one(
        field: impl Into<String>,
        target_entity: impl Into<String>,
        join_field: impl Into<String>,
    ) -> Self {
        Self::new(RelationKind::ManyToOne, field, target_entity, join_field)
    }

    pub fn mapped_by(mut self, field: impl Into<String>) -> Self {
        self.mapped_by = Some(field.into());
        self
    }

    pub fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn fetch(mut self, fetch: Fetch) -> Self {
        self.fetch = fetch;
        self
    }

    /// Returns whether the target holds the foreign key.
    pub fn is_inverse_side(&self) -> bool {
        matches!(self.kind, RelationKind::OneToMany | RelationKind::OneToOne)
    }
}

/// Mapping description for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub entity: String,
    pub table: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

impl Metadata {
    pub fn new(entity: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            table: table.into(),
            columns: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Parses metadata from its JSON description.
    pub fn from_json(json: &str) -> OrmResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    /// Physical table name, lower-cased.
    pub fn table_name(&self) -> String {
        self.table.to_lowercase()
    }

    /// First column flagged as primary key.
    pub fn find_primary_key_column(&self) -> Option<&Column> {
        self.columns.iter().find(|column| column.id)
    }

    pub fn primary_key_field(&self) -> OrmResult<&str> {
        self.find_primary_key_column()
            .map(|column| column.field.as_str())
            .ok_or_else(|| OrmError::MissingPrimaryKey(self.entity.clone()))
    }

    pub fn primary_key_column(&self) -> OrmResult<String> {
        self.find_primary_key_column()
            .map(Column::column_name)
            .ok_or_else(|| OrmError::MissingPrimaryKey(self.entity.clone()))
    }

    pub fn find_column_for_field(&self, field: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.field == field)
    }

    /// Column identifier for a field, or `None` when the field is unmapped.
    pub fn resolve_column_name_for_field(&self, field: &str) -> Option<String> {
        self.find_column_for_field(field).map(Column::column_name)
    }

    /// Like `resolve_column_name_for_field`, failing with `UnresolvedField`.
    pub fn require_column_name(&self, field: &str) -> OrmResult<String> {
        self.resolve_column_name_for_field(field)
            .ok_or_else(|| OrmError::UnresolvedField {
                entity: self.entity.clone(),
                field: field.to_string(),
            })
    }

    /// Fully qualified `table.column` identifier for a field.
    pub fn qualified_column(&self, field: &str) -> OrmResult<String> {
        Ok(format!("{}.{}", self.table_name(), self.require_column_name(field)?))
    }

    pub fn resolve_relation_for_field(&self, field: &str) -> Option<&Relation> {
        self.relations.iter().find(|relation| relation.field == field)
    }

    pub fn resolve_relation_for_target_entity(&self, entity: &str) -> Option<&Relation> {
        let entity = entity.trim();
        if entity.is_empty() {
            return None;
        }
        self.relations
            .iter()
            .find(|relation| relation.target_entity == entity)
    }

    /// Reads every mapped field of `entity`, in column order.
    ///
    /// # Errors
    /// - `FieldNotFound` when the entity cannot produce a mapped field.
    pub fn build_field_value_map(&self, entity: &dyn Entity) -> OrmResult<Vec<(String, Value)>> {
        self.columns
            .iter()
            .map(|column| {
                entity
                    .field_value(&column.field)
                    .map(|value| (column.field.clone(), value))
                    .ok_or_else(|| OrmError::FieldNotFound {
                        entity: self.entity.clone(),
                        field: column.field.clone(),
                    })
            })
            .collect()
    }

    /// Checks the structural invariants required at registration.
    pub fn validate(&self) -> OrmResult<()> {
        if self.entity.trim().is_empty() {
            return Err(OrmError::InvalidMetadata {
                entity: self.entity.clone(),
                reason: "entity name must not be empty".to_string(),
            });
        }
        if self.table.trim().is_empty() {
            return Err(OrmError::InvalidMetadata {
                entity: self.entity.clone(),
                reason: "table name must not be empty".to_string(),
            });
        }

        let id_columns = self.columns.iter().filter(|column| column.id).count();
        match id_columns {
            0 => return Err(OrmError::MissingPrimaryKey(self.entity.clone())),
            1 => {}
            n => {
                return Err(OrmError::InvalidMetadata {
                    entity: self.entity.clone(),
                    reason: format!("expected one primary-key column, found {n}"),
                })
            }
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.field.as_str()) {
                return Err(OrmError::InvalidMetadata {
                    entity: self.entity.clone(),
                    reason: format!("field `{}` is mapped twice", column.field),
                });
            }
        }

        for relation in &self.relations {
            if relation.field.trim().is_empty() || relation.target_entity.trim().is_empty() {
                return Err(OrmError::InvalidMetadata {
                    entity: self.entity.clone(),
                    reason: "relations need a field and a target entity".to_string(),
                });
            }
        }

        Ok(())
    }
}
