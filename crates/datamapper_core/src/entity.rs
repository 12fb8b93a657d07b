//! Entity provider contract and shared entity handles.
//!
//! # Responsibility
//! - Define how entity types expose metadata and fields by name.
//! - Provide shared handles so the unit of work can write generated keys back
//!   into caller-owned instances.
//! - Declare optional lifecycle capabilities.
//!
//! # Invariants
//! - Entity identity inside the ORM is pointer identity of the shared handle.
//! - `EntityRef` always downcasts to the exact type it was created from.

use crate::error::{HookError, OrmError, OrmResult};
use crate::metadata::Metadata;
use crate::value::Value;
use std::any::{type_name, Any, TypeId};
use std::cell::{Ref, RefCell, RefMut};
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

/// Caller-visible handle of a managed entity.
pub type Shared<T> = Rc<RefCell<T>>;

/// Wraps a value into a managed entity handle.
pub fn shared<T>(value: T) -> Shared<T> {
    Rc::new(RefCell::new(value))
}

/// Record type persisted by the ORM.
///
/// Implementations map field names (as declared in `Metadata` columns and
/// relations) onto struct fields.
pub trait Entity: Any {
    /// Mapping description for this type.
    fn metadata() -> Metadata
    where
        Self: Sized;

    /// Reads a mapped column field; `None` when the field does not exist.
    fn field_value(&self, field: &str) -> Option<Value>;

    /// Writes a mapped column field.
    ///
    /// # Errors
    /// - `FieldNotFound` for unknown fields.
    /// - `InvalidValue` when `value` cannot be stored in the field.
    fn set_field_value(&mut self, field: &str, value: Value) -> OrmResult<()>;

    /// Entities currently held by a relation field, for cascades.
    fn related(&self, _field: &str) -> Vec<EntityRef> {
        Vec::new()
    }

    /// Replaces a relation field with loaded entities.
    fn attach_related(&mut self, field: &str, _related: Vec<EntityRef>) -> OrmResult<()> {
        Err(OrmError::FieldNotFound {
            entity: type_name::<Self>().to_string(),
            field: field.to_string(),
        })
    }

    fn as_before_create(&mut self) -> Option<&mut dyn BeforeCreate> {
        None
    }

    fn as_before_update(&mut self) -> Option<&mut dyn BeforeUpdate> {
        None
    }
}

/// Capability invoked before an entity is inserted.
pub trait BeforeCreate {
    fn before_create(&mut self) -> Result<(), HookError>;
}

/// Capability invoked before an entity is updated.
pub trait BeforeUpdate {
    fn before_update(&mut self) -> Result<(), HookError>;
}

/// Type-erased handle of a managed entity.
#[derive(Clone)]
pub struct EntityRef {
    cell: Rc<RefCell<dyn Entity>>,
    any: Rc<dyn Any>,
    type_id: TypeId,
    type_name: &'static str,
}

impl EntityRef {
    pub fn new<T: Entity>(entity: &Shared<T>) -> Self {
        let cell: Rc<RefCell<dyn Entity>> = entity.clone();
        let any: Rc<dyn Any> = entity.clone();
        Self {
            cell,
            any,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    pub fn entity_type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn entity_type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn borrow(&self) -> Ref<'_, dyn Entity> {
        self.cell.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, dyn Entity> {
        self.cell.borrow_mut()
    }

    /// Recovers the typed handle; `None` when `T` is not the entity type.
    pub fn downcast<T: Entity>(&self) -> Option<Shared<T>> {
        self.any.clone().downcast::<RefCell<T>>().ok()
    }

    /// Returns whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.any), Rc::as_ptr(&other.any))
    }

    /// Stable address of the instance, usable as a visited-set key.
    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.any).cast::<()>() as usize
    }
}

impl<T: Entity> From<&Shared<T>> for EntityRef {
    fn from(value: &Shared<T>) -> Self {
        EntityRef::new(value)
    }
}

impl Debug for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRef")
            .field("type", &self.type_name)
            .field("identity", &self.identity())
            .finish()
    }
}

/// Downcasts loaded relation entities for `Entity::attach_related`.
pub fn downcast_all<T: Entity>(related: Vec<EntityRef>) -> OrmResult<Vec<Shared<T>>> {
    related
        .into_iter()
        .map(|entity| {
            entity.downcast::<T>().ok_or_else(|| OrmError::TypeMismatch {
                expected: type_name::<T>().to_string(),
                found: entity.entity_type_name().to_string(),
            })
        })
        .collect()
}

/// Downcasts at most one loaded relation entity.
pub fn downcast_one<T: Entity>(related: Vec<EntityRef>) -> OrmResult<Option<Shared<T>>> {
    Ok(downcast_all::<T>(related)?.into_iter().next())
}

/// Error for `Entity::field_value` / `set_field_value` fallthrough arms.
pub fn unknown_field<T: Entity>(field: &str) -> OrmError {
    OrmError::FieldNotFound {
        entity: type_name::<T>().to_string(),
        field: field.to_string(),
    }
}
