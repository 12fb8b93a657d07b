//! Per-entity read access and direct statement execution.
//!
//! # Responsibility
//! - Run SELECT queries for one registered entity and decode rows.
//! - Resolve eager relations with one batched query per relation.
//! - Execute ad-hoc statements outside the unit of work.
//! - Update selected fields or delete one entity immediately.
//!
//! # Invariants
//! - Loading `n` entities with `m` eager relations issues at most `1 + m`
//!   SELECTs; zero loaded entities issue no relation queries.
//! - Relation batches load one level deep; related entities do not trigger
//!   their own eager relations.
//! - A statement the query builder rejects is never sent to the connection.

use crate::connection::ExecResult;
use crate::entity::{downcast_all, Entity, EntityRef, Shared};
use crate::error::{OrmError, OrmResult};
use crate::metadata::{Fetch, Metadata, Relation, RelationKind};
use crate::orm::{Orm, Registration};
use crate::query::{Aggregate, Order, Query, StatementKind};
use crate::value::{is_unsaved_key, FromValue, Record, Value, ValueKey};
use log::debug;
use std::any::{type_name, TypeId};
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::time::Instant;

const COUNT_ALIAS: &str = "total";

/// Untyped repository over one registered entity.
#[derive(Clone, Copy)]
pub struct Repository<'orm> {
    orm: &'orm Orm,
    registration: &'orm Registration,
}

impl<'orm> Repository<'orm> {
    pub(crate) fn new(orm: &'orm Orm, registration: &'orm Registration) -> Self {
        Self { orm, registration }
    }

    pub fn metadata(&self) -> &'orm Metadata {
        self.registration.metadata()
    }

    /// Typed view of this repository.
    ///
    /// # Errors
    /// - `TypeMismatch` when `T` is not the registered type.
    pub fn typed<T: Entity>(self) -> OrmResult<EntityRepository<'orm, T>> {
        if self.registration.type_id() != TypeId::of::<T>() {
            return Err(OrmError::TypeMismatch {
                expected: self.registration.type_name().to_string(),
                found: type_name::<T>().to_string(),
            });
        }
        Ok(EntityRepository {
            inner: self,
            _entity: PhantomData,
        })
    }

    /// Loads one entity by primary key.
    ///
    /// # Errors
    /// - `NotFound` when no row has this key.
    pub fn find(&self, id: impl Into<Value>) -> OrmResult<EntityRef> {
        let primary_key = self.metadata().primary_key_field()?;
        self.find_one_by(Query::new().filter([primary_key, "=", "?"]).param(id))
    }

    /// Loads the first entity matching `query`.
    ///
    /// # Errors
    /// - `NotFound` when nothing matches.
    pub fn find_one_by(&self, query: Query) -> OrmResult<EntityRef> {
        self.find_by(query.limit(1))?
            .into_iter()
            .next()
            .ok_or(OrmError::NotFound)
    }

    /// Loads every entity matching `query`, with eager relations attached.
    pub fn find_by(&self, query: Query) -> OrmResult<Vec<EntityRef>> {
        let entities = self.fetch(&query)?;
        self.load_eager(&entities)?;
        Ok(entities)
    }

    pub fn all(&self) -> OrmResult<Vec<EntityRef>> {
        self.find_by(Query::new())
    }

    /// Counts rows matching the filter of `query` as one scalar; grouping,
    /// ordering and paging are dropped.
    pub fn count(&self, query: Query) -> OrmResult<i64> {
        let primary_key = self.metadata().primary_key_field()?;
        let query = Query {
            kind: StatementKind::Select,
            select: vec![String::new()],
            aggregates: vec![Aggregate::count(primary_key, COUNT_ALIAS)],
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: 0,
            offset: 0,
            ..query
        };
        let statement = query.build(self.metadata(), self.orm.registry())?;
        let record = self
            .orm
            .connection()
            .get(&statement.sql, &statement.params)?;
        i64::from_value(
            COUNT_ALIAS,
            record.get(COUNT_ALIAS).cloned().unwrap_or(Value::Null),
        )
    }

    /// Deletes every row of the table, bypassing the unit of work.
    pub fn delete_all(&self) -> OrmResult<ExecResult> {
        self.execute(Query::delete())
    }

    /// Runs an INSERT, UPDATE or DELETE query immediately.
    ///
    /// # Errors
    /// - `UnsupportedStatement` for SELECT queries; use `find_by`.
    pub fn execute(&self, query: Query) -> OrmResult<ExecResult> {
        if query.kind == StatementKind::Select {
            return Err(OrmError::UnsupportedStatement(
                "execute expects INSERT, UPDATE or DELETE".to_string(),
            ));
        }
        let started_at = Instant::now();
        let statement = query.build(self.metadata(), self.orm.registry())?;
        let result = self
            .orm
            .connection()
            .exec(&statement.sql, &statement.params)?;
        debug!(
            "event=repo_execute module=repository status=ok entity={} rows_affected={} duration_ms={}",
            self.metadata().entity,
            result.rows_affected,
            started_at.elapsed().as_millis()
        );
        Ok(result)
    }

    /// Writes `fields` of a persisted entity immediately, bypassing the unit
    /// of work, then re-reads the row into `entity`.
    ///
    /// # Errors
    /// - `UnresolvedField` for a field that is not a column.
    /// - `InvalidValue` when `entity` has no persisted key or `fields` only
    ///   names the primary key.
    /// - `NotFound` when the row no longer exists.
    pub fn update_attributes(
        &self,
        entity: &EntityRef,
        fields: &[(&str, Value)],
    ) -> OrmResult<()> {
        self.require_registered_type(entity)?;
        let metadata = self.metadata();
        let primary_key = metadata.primary_key_field()?;
        let set: Vec<(String, Value)> = fields
            .iter()
            .map(|(field, value)| (field.to_string(), value.clone()))
            .collect();
        if set.iter().all(|(field, _)| field == primary_key) {
            return Err(OrmError::InvalidValue {
                field: primary_key.to_string(),
                reason: "update_attributes needs at least one non-key field".to_string(),
            });
        }

        let id = persisted_key(metadata, entity)?;
        let result = self.execute(
            Query::update(set)
                .filter([primary_key, "=", "?"])
                .param(id.clone()),
        )?;
        if result.rows_affected == 0 {
            return Err(OrmError::NotFound);
        }
        self.refresh(entity, id)
    }

    /// Deletes one persisted entity immediately, bypassing the unit of work.
    ///
    /// # Errors
    /// - `NotFound` when no row was deleted.
    pub fn destroy(&self, entity: &EntityRef) -> OrmResult<()> {
        self.require_registered_type(entity)?;
        let primary_key = self.metadata().primary_key_field()?;
        let id = persisted_key(self.metadata(), entity)?;
        let result = self.execute(Query::delete().filter([primary_key, "=", "?"]).param(id))?;
        if result.rows_affected == 0 {
            return Err(OrmError::NotFound);
        }
        Ok(())
    }

    /// Loads one relation of `entity` on demand and attaches it.
    ///
    /// # Errors
    /// - `UnresolvedRelation` when `field` is not a relation of this entity.
    /// - `TypeMismatch` when `entity` is not of the registered type.
    pub fn load_relation(&self, entity: &EntityRef, field: &str) -> OrmResult<Vec<EntityRef>> {
        self.require_registered_type(entity)?;
        let relation = self
            .metadata()
            .resolve_relation_for_field(field)
            .ok_or_else(|| OrmError::UnresolvedRelation {
                entity: self.metadata().entity.clone(),
                relation: field.to_string(),
            })?;
        let sources = [entity.clone()];
        let mut loaded = self.load_relation_batch(relation, &sources)?;
        Ok(loaded.pop().unwrap_or_default())
    }

    fn require_registered_type(&self, entity: &EntityRef) -> OrmResult<()> {
        if entity.entity_type_id() != self.registration.type_id() {
            return Err(OrmError::TypeMismatch {
                expected: self.registration.type_name().to_string(),
                found: entity.entity_type_name().to_string(),
            });
        }
        Ok(())
    }

    /// Copies the stored columns and eager relations of row `id` into
    /// `entity`.
    fn refresh(&self, entity: &EntityRef, id: Value) -> OrmResult<()> {
        let fresh = self.find(id)?;
        let metadata = self.metadata();
        let fresh = fresh.borrow();
        let mut target = entity.borrow_mut();
        for column in &metadata.columns {
            if let Some(value) = fresh.field_value(&column.field) {
                target.set_field_value(&column.field, value)?;
            }
        }
        for relation in metadata
            .relations
            .iter()
            .filter(|relation| relation.fetch == Fetch::Eager)
        {
            target.attach_related(&relation.field, fresh.related(&relation.field))?;
        }
        Ok(())
    }

    fn fetch(&self, query: &Query) -> OrmResult<Vec<EntityRef>> {
        if query.kind != StatementKind::Select {
            return Err(OrmError::UnsupportedStatement(
                "find expects a SELECT query".to_string(),
            ));
        }
        let started_at = Instant::now();
        let statement = query.build(self.metadata(), self.orm.registry())?;
        let records = self
            .orm
            .connection()
            .select(&statement.sql, &statement.params)?;
        let entities = records
            .into_iter()
            .map(|record| self.decode(record))
            .collect::<OrmResult<Vec<_>>>()?;
        debug!(
            "event=repo_find module=repository status=ok entity={} rows={} duration_ms={}",
            self.metadata().entity,
            entities.len(),
            started_at.elapsed().as_millis()
        );
        Ok(entities)
    }

    fn decode(&self, record: Record) -> OrmResult<EntityRef> {
        let metadata = self.metadata();
        let entity = self.registration.instantiate();
        {
            let mut target = entity.borrow_mut();
            for (alias, value) in record {
                if metadata.find_column_for_field(&alias).is_none() {
                    if self.orm.config().strict_decoding {
                        return Err(OrmError::FieldNotFound {
                            entity: metadata.entity.clone(),
                            field: alias,
                        });
                    }
                    continue;
                }
                target.set_field_value(&alias, value)?;
            }
        }
        Ok(entity)
    }

    fn load_eager(&self, entities: &[EntityRef]) -> OrmResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        for relation in self
            .metadata()
            .relations
            .iter()
            .filter(|relation| relation.fetch == Fetch::Eager)
        {
            self.load_relation_batch(relation, entities)?;
        }
        Ok(())
    }

    /// Loads `relation` for every source with one query and attaches the
    /// results; returns them aligned with `sources`.
    fn load_relation_batch(
        &self,
        relation: &Relation,
        sources: &[EntityRef],
    ) -> OrmResult<Vec<Vec<EntityRef>>> {
        let target = Repository::new(
            self.orm,
            self.orm
                .registry()
                .require_entity_name(&relation.target_entity)?,
        );

        let loaded = match relation.kind {
            RelationKind::OneToMany | RelationKind::OneToOne => {
                let primary_key = self.metadata().primary_key_field()?;
                let keys = field_values(sources, primary_key);
                let target_primary_key = target.metadata().primary_key_field()?;
                let related = target.fetch_in(
                    &relation.foreign_key,
                    &keys,
                    &[relation.foreign_key.as_str(), target_primary_key],
                )?;
                let grouped = group_by_field(related, &relation.foreign_key);
                let limit = match relation.kind {
                    RelationKind::OneToOne => 1,
                    _ => usize::MAX,
                };
                keys.iter()
                    .map(|key| matches_for(&grouped, key, limit))
                    .collect::<Vec<_>>()
            }
            RelationKind::ManyToOne => {
                let keys = field_values(sources, &relation.foreign_key);
                let target_primary_key = target.metadata().primary_key_field()?;
                let related = target.fetch_in(target_primary_key, &keys, &[target_primary_key])?;
                let grouped = group_by_field(related, target_primary_key);
                keys.iter()
                    .map(|key| matches_for(&grouped, key, 1))
                    .collect::<Vec<_>>()
            }
            RelationKind::ManyToMany => {
                return Err(OrmError::UnsupportedRelation {
                    entity: self.metadata().entity.clone(),
                    relation: relation.field.clone(),
                })
            }
        };

        for (source, related) in sources.iter().zip(&loaded) {
            source
                .borrow_mut()
                .attach_related(&relation.field, related.clone())?;
        }
        debug!(
            "event=relation_load module=repository status=ok entity={} relation={} sources={}",
            self.metadata().entity,
            relation.field,
            sources.len()
        );
        Ok(loaded)
    }

    /// `SELECT ... WHERE field IN (keys)` without eager relations; no query
    /// when there are no non-NULL keys.
    fn fetch_in(
        &self,
        field: &str,
        keys: &[Option<Value>],
        order_by: &[&str],
    ) -> OrmResult<Vec<EntityRef>> {
        let mut seen = HashSet::new();
        let distinct: Vec<Value> = keys
            .iter()
            .flatten()
            .filter(|key| ValueKey::from_value(key).is_some_and(|key| seen.insert(key)))
            .cloned()
            .collect();
        if distinct.is_empty() {
            return Ok(Vec::new());
        }

        let mut tokens = vec![field.to_string(), "IN".to_string(), "(".to_string()];
        for index in 0..distinct.len() {
            if index > 0 {
                tokens.push(",".to_string());
            }
            tokens.push("?".to_string());
        }
        tokens.push(")".to_string());

        let query = order_by.iter().fold(
            Query::new().filter(tokens).params(distinct),
            |query, field| query.order_by(*field, Order::Asc),
        );
        self.fetch(&query)
    }
}

/// Repository returning typed handles.
pub struct EntityRepository<'orm, T> {
    inner: Repository<'orm>,
    _entity: PhantomData<fn() -> T>,
}

impl<'orm, T: Entity> EntityRepository<'orm, T> {
    pub fn untyped(&self) -> Repository<'orm> {
        self.inner
    }

    pub fn metadata(&self) -> &'orm Metadata {
        self.inner.metadata()
    }

    pub fn find(&self, id: impl Into<Value>) -> OrmResult<Shared<T>> {
        self.downcast(self.inner.find(id)?)
    }

    pub fn find_one_by(&self, query: Query) -> OrmResult<Shared<T>> {
        self.downcast(self.inner.find_one_by(query)?)
    }

    pub fn find_by(&self, query: Query) -> OrmResult<Vec<Shared<T>>> {
        downcast_all(self.inner.find_by(query)?)
    }

    pub fn all(&self) -> OrmResult<Vec<Shared<T>>> {
        downcast_all(self.inner.all()?)
    }

    pub fn count(&self, query: Query) -> OrmResult<i64> {
        self.inner.count(query)
    }

    pub fn delete_all(&self) -> OrmResult<ExecResult> {
        self.inner.delete_all()
    }

    pub fn execute(&self, query: Query) -> OrmResult<ExecResult> {
        self.inner.execute(query)
    }

    pub fn load_relation(&self, entity: &Shared<T>, field: &str) -> OrmResult<Vec<EntityRef>> {
        self.inner.load_relation(&EntityRef::new(entity), field)
    }

    pub fn update_attributes(
        &self,
        entity: &Shared<T>,
        fields: &[(&str, Value)],
    ) -> OrmResult<()> {
        self.inner.update_attributes(&EntityRef::new(entity), fields)
    }

    pub fn destroy(&self, entity: &Shared<T>) -> OrmResult<()> {
        self.inner.destroy(&EntityRef::new(entity))
    }

    fn downcast(&self, entity: EntityRef) -> OrmResult<Shared<T>> {
        entity.downcast::<T>().ok_or_else(|| OrmError::TypeMismatch {
            expected: type_name::<T>().to_string(),
            found: entity.entity_type_name().to_string(),
        })
    }
}

fn persisted_key(metadata: &Metadata, entity: &EntityRef) -> OrmResult<Value> {
    let primary_key = metadata.primary_key_field()?;
    let value = entity
        .borrow()
        .field_value(primary_key)
        .unwrap_or(Value::Null);
    if is_unsaved_key(&value) {
        return Err(OrmError::InvalidValue {
            field: primary_key.to_string(),
            reason: format!("{} has no persisted primary key", metadata.entity),
        });
    }
    Ok(value)
}

fn field_values(entities: &[EntityRef], field: &str) -> Vec<Option<Value>> {
    entities
        .iter()
        .map(|entity| entity.borrow().field_value(field))
        .collect()
}

fn group_by_field(entities: Vec<EntityRef>, field: &str) -> HashMap<ValueKey, Vec<EntityRef>> {
    let mut grouped: HashMap<ValueKey, Vec<EntityRef>> = HashMap::new();
    for entity in entities {
        let key = entity
            .borrow()
            .field_value(field)
            .as_ref()
            .and_then(ValueKey::from_value);
        if let Some(key) = key {
            grouped.entry(key).or_default().push(entity);
        }
    }
    grouped
}

fn matches_for(
    grouped: &HashMap<ValueKey, Vec<EntityRef>>,
    key: &Option<Value>,
    limit: usize,
) -> Vec<EntityRef> {
    key.as_ref()
        .and_then(ValueKey::from_value)
        .and_then(|key| grouped.get(&key))
        .map(|matches| matches.iter().take(limit).cloned().collect())
        .unwrap_or_default()
}
