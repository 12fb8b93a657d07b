//! Pending writes committed atomically.
//!
//! # Responsibility
//! - Track entities scheduled for create, update and delete.
//! - Apply every pending write inside one transaction on `flush`.
//! - Write generated primary keys back into caller-owned entities.
//!
//! # Invariants
//! - An entity is pending in at most one set, at most once.
//! - A failed flush leaves the database, the pending sets and every key
//!   written during the flush as they were before it started.
//! - Sets are cleared only after a successful commit.
//! - A generated key propagated to a dependent row that was already inserted
//!   in the same flush is written to that row too.

use crate::connection::{Connection, Transaction};
use crate::entity::EntityRef;
use crate::error::{OrmError, OrmResult};
use crate::metadata::Metadata;
use crate::orm::Registry;
use crate::query::Query;
use crate::value::{is_unsaved_key, Value};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::time::Instant;

/// Pending create/update/delete sets.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    creates: Vec<EntityRef>,
    updates: Vec<EntityRef>,
    deletes: Vec<EntityRef>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules an INSERT.
    pub fn create(&mut self, entity: EntityRef) {
        remove_from(&mut self.updates, &entity);
        remove_from(&mut self.deletes, &entity);
        push_unique(&mut self.creates, entity);
    }

    /// Schedules an UPDATE keyed by primary key.
    pub fn update(&mut self, entity: EntityRef) {
        remove_from(&mut self.creates, &entity);
        remove_from(&mut self.deletes, &entity);
        push_unique(&mut self.updates, entity);
    }

    /// Schedules a DELETE keyed by primary key.
    ///
    /// An entity still pending creation is only detached; there is no row to
    /// delete.
    pub fn remove(&mut self, entity: EntityRef) {
        if remove_from(&mut self.creates, &entity) {
            return;
        }
        remove_from(&mut self.updates, &entity);
        push_unique(&mut self.deletes, entity);
    }

    /// Drops `entity` from every pending set.
    pub fn detach(&mut self, entity: &EntityRef) {
        remove_from(&mut self.creates, entity);
        remove_from(&mut self.updates, entity);
        remove_from(&mut self.deletes, entity);
    }

    pub fn pending_creates(&self) -> &[EntityRef] {
        &self.creates
    }

    pub fn pending_updates(&self) -> &[EntityRef] {
        &self.updates
    }

    pub fn pending_deletes(&self) -> &[EntityRef] {
        &self.deletes
    }

    pub fn is_pending_create(&self, entity: &EntityRef) -> bool {
        contains(&self.creates, entity)
    }

    pub fn is_pending_update(&self, entity: &EntityRef) -> bool {
        contains(&self.updates, entity)
    }

    pub fn is_pending_delete(&self, entity: &EntityRef) -> bool {
        contains(&self.deletes, entity)
    }

    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn clear(&mut self) {
        self.creates.clear();
        self.updates.clear();
        self.deletes.clear();
    }

    /// Applies every pending write in one transaction.
    ///
    /// # Errors
    /// - Any build, hook, type or database error; the transaction is rolled
    ///   back and the pending sets are kept.
    pub fn flush(&mut self, registry: &Registry, connection: &dyn Connection) -> OrmResult<()> {
        if self.is_empty() {
            debug!("event=uow_flush module=unit_of_work status=skipped reason=empty");
            return Ok(());
        }

        let started_at = Instant::now();
        info!(
            "event=uow_flush module=unit_of_work status=start creates={} updates={} deletes={}",
            self.creates.len(),
            self.updates.len(),
            self.deletes.len()
        );

        let mut tx = connection.begin_transaction()?;
        let mut journal = KeyJournal::default();
        let applied = self.apply(registry, tx.as_mut(), &mut journal);

        let outcome = match applied {
            Ok(()) => tx.commit(),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    error!(
                        "event=uow_rollback module=unit_of_work status=error error={}",
                        rollback_err
                    );
                }
                Err(err)
            }
        };

        match outcome {
            Ok(()) => {
                info!(
                    "event=uow_flush module=unit_of_work status=ok creates={} updates={} deletes={} duration_ms={}",
                    self.creates.len(),
                    self.updates.len(),
                    self.deletes.len(),
                    started_at.elapsed().as_millis()
                );
                self.clear();
                Ok(())
            }
            Err(err) => {
                journal.restore();
                error!(
                    "event=uow_flush module=unit_of_work status=error duration_ms={} error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    fn apply(
        &self,
        registry: &Registry,
        tx: &mut dyn Transaction,
        journal: &mut KeyJournal,
    ) -> OrmResult<()> {
        for entity in &self.creates {
            let metadata = registry.require_entity(entity)?.metadata();
            insert(metadata, registry, tx, journal, entity)?;
        }
        for entity in &self.updates {
            let metadata = registry.require_entity(entity)?.metadata();
            update(metadata, registry, tx, entity)?;
        }
        for entity in &self.deletes {
            let metadata = registry.require_entity(entity)?.metadata();
            delete(metadata, registry, tx, entity)?;
        }
        Ok(())
    }
}

fn insert(
    metadata: &Metadata,
    registry: &Registry,
    tx: &mut dyn Transaction,
    journal: &mut KeyJournal,
    entity: &EntityRef,
) -> OrmResult<()> {
    {
        let mut guard = entity.borrow_mut();
        if let Some(hook) = guard.as_before_create() {
            hook.before_create().map_err(|source| OrmError::Hook {
                entity: metadata.entity.clone(),
                source,
            })?;
        }
    }

    let fields = metadata.build_field_value_map(&*entity.borrow())?;
    let statement = Query::insert(fields).build(metadata, registry)?;
    let result = tx.exec(&statement.sql, &statement.params)?;
    let id = Value::Integer(result.last_insert_id);

    journal.write(entity, metadata.primary_key_field()?, id.clone())?;
    journal.mark_inserted(entity);
    debug!(
        "event=uow_insert module=unit_of_work status=ok entity={}",
        metadata.entity
    );

    for relation in metadata
        .relations
        .iter()
        .filter(|relation| relation.is_inverse_side())
    {
        let dependents = entity.borrow().related(&relation.field);
        for dependent in &dependents {
            journal.write(dependent, &relation.foreign_key, id.clone())?;
            if journal.was_inserted(dependent) {
                relink(registry, tx, dependent, &relation.foreign_key, id.clone())?;
            }
        }
    }
    Ok(())
}

/// Writes `foreign_key` of a row inserted earlier in this flush, before its
/// owner had a key.
fn relink(
    registry: &Registry,
    tx: &mut dyn Transaction,
    dependent: &EntityRef,
    foreign_key: &str,
    id: Value,
) -> OrmResult<()> {
    let metadata = registry.require_entity(dependent)?.metadata();
    let primary_key = metadata.primary_key_field()?;
    let statement = Query::update(vec![(foreign_key.to_string(), id)])
        .filter([primary_key, "=", "?"])
        .param(primary_key_value(metadata, dependent)?)
        .build(metadata, registry)?;
    tx.exec(&statement.sql, &statement.params)?;
    debug!(
        "event=uow_relink module=unit_of_work status=ok entity={} field={}",
        metadata.entity, foreign_key
    );
    Ok(())
}

fn update(
    metadata: &Metadata,
    registry: &Registry,
    tx: &mut dyn Transaction,
    entity: &EntityRef,
) -> OrmResult<()> {
    {
        let mut guard = entity.borrow_mut();
        if let Some(hook) = guard.as_before_update() {
            hook.before_update().map_err(|source| OrmError::Hook {
                entity: metadata.entity.clone(),
                source,
            })?;
        }
    }

    let primary_key = metadata.primary_key_field()?;
    let fields = metadata.build_field_value_map(&*entity.borrow())?;
    let statement = Query::update(fields)
        .filter([primary_key, "=", "?"])
        .param(primary_key_value(metadata, entity)?)
        .build(metadata, registry)?;
    tx.exec(&statement.sql, &statement.params)?;
    debug!(
        "event=uow_update module=unit_of_work status=ok entity={}",
        metadata.entity
    );
    Ok(())
}

fn delete(
    metadata: &Metadata,
    registry: &Registry,
    tx: &mut dyn Transaction,
    entity: &EntityRef,
) -> OrmResult<()> {
    let primary_key = metadata.primary_key_field()?;
    let statement = Query::delete()
        .filter([primary_key, "=", "?"])
        .param(primary_key_value(metadata, entity)?)
        .build(metadata, registry)?;
    tx.exec(&statement.sql, &statement.params)?;
    debug!(
        "event=uow_delete module=unit_of_work status=ok entity={}",
        metadata.entity
    );
    Ok(())
}

fn primary_key_value(metadata: &Metadata, entity: &EntityRef) -> OrmResult<Value> {
    let primary_key = metadata.primary_key_field()?;
    let value = entity
        .borrow()
        .field_value(primary_key)
        .ok_or_else(|| OrmError::FieldNotFound {
            entity: metadata.entity.clone(),
            field: primary_key.to_string(),
        })?;
    if is_unsaved_key(&value) {
        return Err(OrmError::InvalidValue {
            field: primary_key.to_string(),
            reason: format!("{} has no persisted primary key", metadata.entity),
        });
    }
    Ok(value)
}

/// Field writes made during a flush, undone when it fails.
#[derive(Default)]
struct KeyJournal {
    entries: Vec<(EntityRef, String, Value)>,
    inserted: HashSet<usize>,
}

impl KeyJournal {
    fn mark_inserted(&mut self, entity: &EntityRef) {
        self.inserted.insert(entity.identity());
    }

    fn was_inserted(&self, entity: &EntityRef) -> bool {
        self.inserted.contains(&entity.identity())
    }

    fn write(&mut self, entity: &EntityRef, field: &str, value: Value) -> OrmResult<()> {
        let previous = entity
            .borrow()
            .field_value(field)
            .ok_or_else(|| OrmError::FieldNotFound {
                entity: entity.entity_type_name().to_string(),
                field: field.to_string(),
            })?;
        entity.borrow_mut().set_field_value(field, value)?;
        self.entries.push((entity.clone(), field.to_string(), previous));
        Ok(())
    }

    fn restore(self) {
        for (entity, field, previous) in self.entries.into_iter().rev() {
            if let Err(err) = entity.borrow_mut().set_field_value(&field, previous) {
                warn!(
                    "event=uow_restore module=unit_of_work status=error field={} error={}",
                    field, err
                );
            }
        }
    }
}

fn contains(set: &[EntityRef], entity: &EntityRef) -> bool {
    set.iter().any(|pending| pending.ptr_eq(entity))
}

fn push_unique(set: &mut Vec<EntityRef>, entity: EntityRef) {
    if !contains(set, &entity) {
        set.push(entity);
    }
}

fn remove_from(set: &mut Vec<EntityRef>, entity: &EntityRef) -> bool {
    let before = set.len();
    set.retain(|pending| !pending.ptr_eq(entity));
    set.len() != before
}
