//! Entity type registrations.

use crate::entity::{shared, Entity, EntityRef};
use crate::error::{OrmError, OrmResult};
use crate::metadata::Metadata;
use crate::query::MetadataSource;
use std::any::{type_name, TypeId};
use std::collections::{BTreeMap, HashMap};

/// Metadata of one entity type plus a constructor for decoded rows.
#[derive(Debug)]
pub struct Registration {
    metadata: Metadata,
    type_id: TypeId,
    type_name: &'static str,
    factory: fn() -> EntityRef,
}

impl Registration {
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Creates a default-initialized instance to decode a row into.
    pub fn instantiate(&self) -> EntityRef {
        (self.factory)()
    }
}

fn instantiate<T: Entity + Default>() -> EntityRef {
    EntityRef::new(&shared(T::default()))
}

/// Registrations keyed by entity name, with a type index.
#[derive(Debug, Default)]
pub struct Registry {
    entries: BTreeMap<String, Registration>,
    by_type: HashMap<TypeId, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` with its validated metadata.
    ///
    /// # Errors
    /// - `MissingPrimaryKey` / `InvalidMetadata` for malformed metadata.
    /// - `DuplicateEntity` when the type or entity name is already registered.
    pub fn register<T: Entity + Default>(&mut self) -> OrmResult<&Registration> {
        let metadata = T::metadata();
        metadata.validate()?;

        let type_id = TypeId::of::<T>();
        if self.by_type.contains_key(&type_id) || self.entries.contains_key(&metadata.entity) {
            return Err(OrmError::DuplicateEntity(metadata.entity));
        }

        let entity = metadata.entity.clone();
        self.by_type.insert(type_id, entity.clone());
        let registration = self.entries.entry(entity).or_insert(Registration {
            metadata,
            type_id,
            type_name: type_name::<T>(),
            factory: instantiate::<T>,
        });
        Ok(registration)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns sorted entity names.
    pub fn entity_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn by_type_id(&self, type_id: TypeId) -> Option<&Registration> {
        self.by_type
            .get(&type_id)
            .and_then(|entity| self.entries.get(entity))
    }

    pub fn by_entity_name(&self, entity: &str) -> Option<&Registration> {
        self.entries.get(entity.trim())
    }

    /// Table lookup is case-insensitive, matching the lower-cased SQL name.
    pub fn by_table_name(&self, table: &str) -> Option<&Registration> {
        let table = table.trim().to_lowercase();
        self.entries
            .values()
            .find(|registration| registration.metadata.table_name() == table)
    }

    pub fn require_type<T: Entity>(&self) -> OrmResult<&Registration> {
        self.by_type_id(TypeId::of::<T>())
            .ok_or_else(|| OrmError::EntityNotRegistered(type_name::<T>().to_string()))
    }

    /// Registration of the concrete type behind a handle.
    pub fn require_entity(&self, entity: &EntityRef) -> OrmResult<&Registration> {
        self.by_type_id(entity.entity_type_id())
            .ok_or_else(|| OrmError::EntityNotRegistered(entity.entity_type_name().to_string()))
    }

    pub fn require_entity_name(&self, entity: &str) -> OrmResult<&Registration> {
        self.by_entity_name(entity)
            .ok_or_else(|| OrmError::EntityNotRegistered(entity.trim().to_string()))
    }

    pub fn require_table_name(&self, table: &str) -> OrmResult<&Registration> {
        self.by_table_name(table)
            .ok_or_else(|| OrmError::EntityNotRegistered(table.trim().to_string()))
    }
}

impl MetadataSource for Registry {
    fn metadata_by_entity_name(&self, entity: &str) -> Option<&Metadata> {
        self.by_entity_name(entity).map(Registration::metadata)
    }
}
