//! Error taxonomy shared by every ORM layer.
//!
//! # Responsibility
//! - Give registration, query-build, execution, type and lifecycle failures
//!   one semantic error type.
//! - Keep "no rows" distinguishable from transport failures.
//!
//! # Invariants
//! - Builder errors are returned before any statement reaches the connection.
//! - Errors are never swallowed; callers decide whether to retry.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub type OrmResult<T> = Result<T, OrmError>;

/// Error returned by lifecycle hooks (`BeforeCreate` / `BeforeUpdate`).
pub type HookError = Box<dyn Error + Send + Sync + 'static>;

/// Semantic error for metadata, query building and persistence.
#[derive(Debug)]
pub enum OrmError {
    /// Metadata declares no primary-key column.
    MissingPrimaryKey(String),
    /// Metadata is structurally invalid (empty names, duplicate fields, ...).
    InvalidMetadata { entity: String, reason: String },
    /// Another type already registered the same entity name.
    DuplicateEntity(String),
    /// No metadata registered for a type, entity name or table name.
    EntityNotRegistered(String),
    /// Field name has no column in the entity metadata.
    UnresolvedField { entity: String, field: String },
    /// Relation cannot be resolved for a join, eager load or lazy load.
    UnresolvedRelation { entity: String, relation: String },
    /// Relation kind is not supported by the requested operation.
    UnsupportedRelation { entity: String, relation: String },
    /// `?` placeholders and bound params disagree.
    PlaceholderMismatch { placeholders: usize, params: usize },
    /// Token cannot appear at this position of a WHERE sequence.
    UnexpectedToken { token: String, index: usize },
    /// Statement cannot be rendered (missing FROM, empty SET, ...).
    UnsupportedStatement(String),
    /// Single-row fetch matched zero rows.
    NotFound,
    /// Underlying SQLite error.
    Db(rusqlite::Error),
    /// Non-SQLite connection failure reported by a custom `Connection`.
    Connection(String),
    /// Typed access does not match the registered Rust type.
    TypeMismatch { expected: String, found: String },
    /// Entity cannot read or write the named field.
    FieldNotFound { entity: String, field: String },
    /// Value cannot be stored in the target field.
    InvalidValue { field: String, reason: String },
    /// `BeforeCreate` / `BeforeUpdate` hook aborted a flush.
    Hook { entity: String, source: HookError },
    /// JSON metadata could not be parsed.
    Metadata(serde_json::Error),
    /// File logging could not be started.
    Logging(String),
}

impl Display for OrmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingPrimaryKey(entity) => {
                write!(f, "entity `{entity}` declares no primary-key column")
            }
            Self::InvalidMetadata { entity, reason } => {
                write!(f, "invalid metadata for entity `{entity}`: {reason}")
            }
            Self::DuplicateEntity(entity) => {
                write!(f, "entity `{entity}` is already registered")
            }
            Self::EntityNotRegistered(name) => {
                write!(f, "no metadata registered for `{name}`")
            }
            Self::UnresolvedField { entity, field } => {
                write!(f, "no column found for field `{field}` in entity `{entity}`")
            }
            Self::UnresolvedRelation { entity, relation } => {
                write!(f, "unresolved relation `{relation}` on entity `{entity}`")
            }
            Self::UnsupportedRelation { entity, relation } => write!(
                f,
                "relation `{relation}` on entity `{entity}` is not supported here"
            ),
            Self::PlaceholderMismatch {
                placeholders,
                params,
            } => write!(
                f,
                "query has {placeholders} `?` placeholders but {params} params were supplied"
            ),
            Self::UnexpectedToken { token, index } => {
                write!(f, "unexpected token `{token}` at index {index} in WHERE")
            }
            Self::UnsupportedStatement(reason) => write!(f, "cannot build statement: {reason}"),
            Self::NotFound => write!(f, "no rows returned"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Connection(message) => write!(f, "connection error: {message}"),
            Self::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected `{expected}`, found `{found}`")
            }
            Self::FieldNotFound { entity, field } => {
                write!(f, "entity `{entity}` has no field `{field}`")
            }
            Self::InvalidValue { field, reason } => {
                write!(f, "invalid value for field `{field}`: {reason}")
            }
            Self::Hook { entity, source } => {
                write!(f, "lifecycle hook failed for `{entity}`: {source}")
            }
            Self::Metadata(err) => write!(f, "invalid metadata json: {err}"),
            Self::Logging(message) => write!(f, "logging setup failed: {message}"),
        }
    }
}

impl Error for OrmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Hook { source, .. } => Some(source.as_ref()),
            Self::Metadata(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for OrmError {
    fn from(value: rusqlite::Error) -> Self {
        match value {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound,
            other => Self::Db(other),
        }
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(value: serde_json::Error) -> Self {
        Self::Metadata(value)
    }
}

impl OrmError {
    /// Returns whether this error means "no matching row".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
