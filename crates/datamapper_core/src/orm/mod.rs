//! ORM root: registry, connection and unit of work.
//!
//! # Responsibility
//! - Own the entity registry, the connection and the pending unit of work.
//! - Hand out repositories by type, entity name or table name.
//! - Schedule persist/remove with cascades over related entities.
//!
//! # Invariants
//! - Cascades visit each instance at most once per call, including across
//!   the entities of one batch, so cyclic graphs terminate.
//! - `persist`/`remove` either schedule the whole cascade or nothing.
//! - Remove cascades schedule dependents before their owner.

mod registry;

pub use registry::{Registration, Registry};

use crate::config::OrmConfig;
use crate::connection::Connection;
use crate::entity::{Entity, EntityRef, Shared};
use crate::error::OrmResult;
use crate::metadata::{Cascade, Metadata, Relation, RelationKind};
use crate::repository::{EntityRepository, Repository};
use crate::unit_of_work::UnitOfWork;
use crate::value::{is_unsaved_key, Value};
use log::{debug, info};
use std::collections::HashSet;

/// Entry point tying metadata, connection and pending writes together.
pub struct Orm {
    registry: Registry,
    connection: Box<dyn Connection>,
    config: OrmConfig,
    unit_of_work: UnitOfWork,
}

impl Orm {
    pub fn new(connection: impl Connection + 'static) -> Self {
        Self::with_config(connection, OrmConfig::default())
    }

    pub fn with_config(connection: impl Connection + 'static, config: OrmConfig) -> Self {
        Self {
            registry: Registry::new(),
            connection: Box::new(connection),
            config,
            unit_of_work: UnitOfWork::new(),
        }
    }

    /// Registers entity type `T`.
    ///
    /// # Errors
    /// - See `Registry::register`.
    pub fn register<T: Entity + Default>(&mut self) -> OrmResult<()> {
        let registration = self.registry.register::<T>()?;
        info!(
            "event=entity_register module=orm status=ok entity={} table={}",
            registration.metadata().entity,
            registration.metadata().table_name()
        );
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    pub fn config(&self) -> &OrmConfig {
        &self.config
    }

    /// Pending writes, for inspection.
    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.unit_of_work
    }

    pub fn metadata_for<T: Entity>(&self) -> OrmResult<&Metadata> {
        Ok(self.registry.require_type::<T>()?.metadata())
    }

    pub fn metadata_by_entity_name(&self, entity: &str) -> OrmResult<&Metadata> {
        Ok(self.registry.require_entity_name(entity)?.metadata())
    }

    pub fn get_repository<T: Entity>(&self) -> OrmResult<EntityRepository<'_, T>> {
        Repository::new(self, self.registry.require_type::<T>()?).typed::<T>()
    }

    pub fn get_repository_by_entity_name(&self, entity: &str) -> OrmResult<Repository<'_>> {
        Ok(Repository::new(self, self.registry.require_entity_name(entity)?))
    }

    pub fn get_repository_by_table_name(&self, table: &str) -> OrmResult<Repository<'_>> {
        Ok(Repository::new(self, self.registry.require_table_name(table)?))
    }

    /// Schedules `entity` for insert (unsaved key) or update, cascading
    /// over `Cascade::PERSIST` relations.
    pub fn persist<T: Entity>(&mut self, entity: &Shared<T>) -> OrmResult<()> {
        self.persist_ref(EntityRef::new(entity))
    }

    pub fn persist_ref(&mut self, entity: EntityRef) -> OrmResult<()> {
        self.persist_refs(vec![entity])
    }

    /// Schedules several entities at once; an entity reachable from more
    /// than one of them is scheduled once.
    pub fn persist_all<T: Entity>(&mut self, entities: &[Shared<T>]) -> OrmResult<()> {
        self.persist_refs(entities.iter().map(EntityRef::new).collect())
    }

    pub fn persist_refs(&mut self, entities: Vec<EntityRef>) -> OrmResult<()> {
        let mut plan = Vec::new();
        let mut visited = HashSet::new();
        for entity in entities {
            plan_persist(&self.registry, entity, &mut visited, &mut plan)?;
        }
        debug!(
            "event=orm_persist module=orm status=ok scheduled={}",
            plan.len()
        );
        for (entity, create) in plan {
            if create {
                self.unit_of_work.create(entity);
            } else {
                self.unit_of_work.update(entity);
            }
        }
        Ok(())
    }

    /// Schedules `entity` for delete after its `Cascade::REMOVE` dependents.
    pub fn remove<T: Entity>(&mut self, entity: &Shared<T>) -> OrmResult<()> {
        self.remove_ref(EntityRef::new(entity))
    }

    pub fn remove_ref(&mut self, entity: EntityRef) -> OrmResult<()> {
        self.remove_refs(vec![entity])
    }

    pub fn remove_all<T: Entity>(&mut self, entities: &[Shared<T>]) -> OrmResult<()> {
        self.remove_refs(entities.iter().map(EntityRef::new).collect())
    }

    pub fn remove_refs(&mut self, entities: Vec<EntityRef>) -> OrmResult<()> {
        let mut plan = Vec::new();
        let mut visited = HashSet::new();
        for entity in entities {
            plan_remove(&self.registry, entity, &mut visited, &mut plan)?;
        }
        debug!(
            "event=orm_remove module=orm status=ok scheduled={}",
            plan.len()
        );
        for entity in plan {
            self.unit_of_work.remove(entity);
        }
        Ok(())
    }

    /// Drops `entity` from every pending set without touching relations.
    pub fn detach<T: Entity>(&mut self, entity: &Shared<T>) {
        self.unit_of_work.detach(&EntityRef::new(entity));
    }

    /// Commits every pending write in one transaction.
    pub fn flush(&mut self) -> OrmResult<()> {
        self.unit_of_work
            .flush(&self.registry, self.connection.as_ref())
    }

    /// `persist` followed by `flush`.
    pub fn save<T: Entity>(&mut self, entity: &Shared<T>) -> OrmResult<()> {
        self.persist(entity)?;
        self.flush()
    }
}

/// Pre-order walk: owners are scheduled before the dependents that need
/// their generated key.
fn plan_persist(
    registry: &Registry,
    entity: EntityRef,
    visited: &mut HashSet<usize>,
    plan: &mut Vec<(EntityRef, bool)>,
) -> OrmResult<()> {
    if !visited.insert(entity.identity()) {
        return Ok(());
    }
    let metadata = registry.require_entity(&entity)?.metadata();
    let primary_key = entity
        .borrow()
        .field_value(metadata.primary_key_field()?)
        .unwrap_or(Value::Null);
    plan.push((entity.clone(), is_unsaved_key(&primary_key)));

    for relation in cascading(metadata, Cascade::PERSIST) {
        let dependents = entity.borrow().related(&relation.field);
        for dependent in dependents {
            plan_persist(registry, dependent, visited, plan)?;
        }
    }
    Ok(())
}

/// Post-order walk: dependents are scheduled before their owner.
fn plan_remove(
    registry: &Registry,
    entity: EntityRef,
    visited: &mut HashSet<usize>,
    plan: &mut Vec<EntityRef>,
) -> OrmResult<()> {
    if !visited.insert(entity.identity()) {
        return Ok(());
    }
    let metadata = registry.require_entity(&entity)?.metadata();

    for relation in cascading(metadata, Cascade::REMOVE) {
        let dependents = entity.borrow().related(&relation.field);
        for dependent in dependents {
            plan_remove(registry, dependent, visited, plan)?;
        }
    }
    plan.push(entity);
    Ok(())
}

fn cascading(metadata: &Metadata, cascade: Cascade) -> impl Iterator<Item = &Relation> {
    metadata.relations.iter().filter(move |relation| {
        relation.cascade.contains(cascade)
            && matches!(
                relation.kind,
                RelationKind::OneToMany | RelationKind::OneToOne
            )
    })
}
