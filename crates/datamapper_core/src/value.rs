//! Dynamic SQL values and decoded rows.
//!
//! # Responsibility
//! - Carry bound parameters and fetched cells without knowing entity types.
//! - Convert between cells and the Rust field types entities use.
//!
//! # Invariants
//! - `Record` keeps column order exactly as returned by the statement.
//! - A primary key is "unsaved" when it is NULL, integer zero or empty text.

use crate::error::{OrmError, OrmResult};

pub use rusqlite::types::Value;

/// One decoded row: ordered `(column alias, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    columns: Vec<(String, Value)>,
}

impl Record {
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        Self { columns }
    }

    /// Returns the value of the first column named `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    /// Returns the first column value; used for scalar results.
    pub fn first(&self) -> Option<&Value> {
        self.columns.first().map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(|(column, value)| (column.as_str(), value))
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.into_iter()
    }
}

/// Hashable projection of a `Value`, used to group rows by key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Integer(i64),
    Real(u64),
    Text(String),
    Blob(Vec<u8>),
}

impl ValueKey {
    /// Returns `None` for NULL, which never matches a key.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Integer(v) => Some(Self::Integer(*v)),
            Value::Real(v) => Some(Self::Real(v.to_bits())),
            Value::Text(v) => Some(Self::Text(v.clone())),
            Value::Blob(v) => Some(Self::Blob(v.clone())),
        }
    }
}

/// Returns whether a primary-key value marks a not-yet-persisted entity.
pub fn is_unsaved_key(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Integer(v) => *v == 0,
        Value::Text(v) => v.is_empty(),
        Value::Real(_) | Value::Blob(_) => false,
    }
}

/// Converts a fetched cell into a Rust field type.
///
/// Entities call this from `Entity::set_field_value`.
pub trait FromValue: Sized {
    fn from_value(field: &str, value: Value) -> OrmResult<Self>;
}

fn invalid(field: &str, expected: &str, value: &Value) -> OrmError {
    OrmError::InvalidValue {
        field: field.to_string(),
        reason: format!("expected {expected}, got {}", value.data_type()),
    }
}

impl FromValue for i64 {
    fn from_value(field: &str, value: Value) -> OrmResult<Self> {
        match value {
            Value::Integer(v) => Ok(v),
            other => Err(invalid(field, "integer", &other)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(field: &str, value: Value) -> OrmResult<Self> {
        let wide = i64::from_value(field, value)?;
        i32::try_from(wide).map_err(|_| OrmError::InvalidValue {
            field: field.to_string(),
            reason: format!("{wide} does not fit in i32"),
        })
    }
}

impl FromValue for f64 {
    fn from_value(field: &str, value: Value) -> OrmResult<Self> {
        match value {
            Value::Real(v) => Ok(v),
            Value::Integer(v) => Ok(v as f64),
            other => Err(invalid(field, "real", &other)),
        }
    }
}

impl FromValue for bool {
    fn from_value(field: &str, value: Value) -> OrmResult<Self> {
        match value {
            Value::Integer(0) => Ok(false),
            Value::Integer(1) => Ok(true),
            other => Err(invalid(field, "0 or 1", &other)),
        }
    }
}

impl FromValue for String {
    fn from_value(field: &str, value: Value) -> OrmResult<Self> {
        match value {
            Value::Text(v) => Ok(v),
            other => Err(invalid(field, "text", &other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(field: &str, value: Value) -> OrmResult<Self> {
        match value {
            Value::Blob(v) => Ok(v),
            other => Err(invalid(field, "blob", &other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(field: &str, value: Value) -> OrmResult<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(field, other).map(Some),
        }
    }
}
