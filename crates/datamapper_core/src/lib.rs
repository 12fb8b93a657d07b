//! Data mapper ORM over SQLite.
//! Entities describe their table mapping through `Metadata`; repositories
//! read them back and the unit of work writes them in one transaction.

pub mod config;
pub mod connection;
pub mod entity;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod orm;
pub mod query;
pub mod repository;
pub mod unit_of_work;
pub mod value;

pub use config::OrmConfig;
pub use connection::{Connection, ExecResult, SqliteConnection, Transaction};
pub use entity::{
    downcast_all, downcast_one, shared, unknown_field, BeforeCreate, BeforeUpdate, Entity,
    EntityRef, Shared,
};
pub use error::{HookError, OrmError, OrmResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingConfig};
pub use metadata::{Cascade, Column, Fetch, Metadata, Relation, RelationKind};
pub use orm::{Orm, Registration, Registry};
pub use query::{
    Aggregate, AggregateFunction, Builder, Join, MetadataSource, Order, Query, Statement,
    StatementKind,
};
pub use repository::{EntityRepository, Repository};
pub use unit_of_work::UnitOfWork;
pub use value::{FromValue, Record, Value};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
