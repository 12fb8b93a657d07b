//! Connection boundary and the SQLite implementation.
//!
//! # Responsibility
//! - Abstract statement execution behind `Connection` / `Transaction`.
//! - Open SQLite connections with the pragmas the ORM relies on.
//! - Decode result rows into ordered `Record`s keyed by column alias.
//!
//! # Invariants
//! - Connections opened here have `foreign_keys=ON` unless disabled in config.
//! - Statement text is logged at debug level; parameters are never logged.
//!
//! # See also
//! - `unit_of_work` for transaction usage.

use crate::config::OrmConfig;
use crate::error::{OrmError, OrmResult};
use crate::value::{Record, Value};
use log::{debug, error, info};
use rusqlite::params_from_iter;
use std::path::Path;
use std::time::Instant;

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub last_insert_id: i64,
    pub rows_affected: usize,
}

/// Statement executor used by repositories and the unit of work.
pub trait Connection {
    fn exec(&self, sql: &str, params: &[Value]) -> OrmResult<ExecResult>;

    fn select(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Record>>;

    /// Fetches the first row.
    ///
    /// # Errors
    /// - `NotFound` when the statement returns no rows.
    fn get(&self, sql: &str, params: &[Value]) -> OrmResult<Record> {
        self.select(sql, params)?
            .into_iter()
            .next()
            .ok_or(OrmError::NotFound)
    }

    fn begin_transaction(&self) -> OrmResult<Box<dyn Transaction + '_>>;
}

/// Open transaction; dropping it without commit rolls back.
pub trait Transaction {
    fn exec(&mut self, sql: &str, params: &[Value]) -> OrmResult<ExecResult>;

    fn commit(self: Box<Self>) -> OrmResult<()>;

    fn rollback(self: Box<Self>) -> OrmResult<()>;
}

/// `Connection` over a single `rusqlite` connection.
#[derive(Debug)]
pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl SqliteConnection {
    /// Opens a SQLite database file with default settings.
    ///
    /// # Side effects
    /// - Emits `db_open` logging events with duration and status.
    pub fn open(path: impl AsRef<Path>) -> OrmResult<Self> {
        Self::open_with_config(path, &OrmConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: &OrmConfig) -> OrmResult<Self> {
        open_logged("file", config, || rusqlite::Connection::open(path))
    }

    /// Opens an in-memory SQLite database with default settings.
    pub fn open_in_memory() -> OrmResult<Self> {
        Self::open_in_memory_with_config(&OrmConfig::default())
    }

    pub fn open_in_memory_with_config(config: &OrmConfig) -> OrmResult<Self> {
        open_logged("memory", config, rusqlite::Connection::open_in_memory)
    }

    /// Runs a multi-statement script such as a schema definition.
    pub fn execute_batch(&self, sql: &str) -> OrmResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Underlying `rusqlite` connection, for host-level setup.
    pub fn raw(&self) -> &rusqlite::Connection {
        &self.conn
    }
}

fn open_logged<F>(mode: &str, config: &OrmConfig, open: F) -> OrmResult<SqliteConnection>
where
    F: FnOnce() -> rusqlite::Result<rusqlite::Connection>,
{
    let started_at = Instant::now();
    info!("event=db_open module=connection status=start mode={mode}");

    let conn = match open() {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=connection status=error mode={mode} duration_ms={} error_code=db_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    match bootstrap_connection(&conn, config) {
        Ok(()) => {
            info!(
                "event=db_open module=connection status=ok mode={mode} duration_ms={}",
                started_at.elapsed().as_millis()
            );
            Ok(SqliteConnection { conn })
        }
        Err(err) => {
            error!(
                "event=db_open module=connection status=error mode={mode} duration_ms={} error_code=db_bootstrap_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn bootstrap_connection(conn: &rusqlite::Connection, config: &OrmConfig) -> OrmResult<()> {
    if config.foreign_keys {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    }
    conn.busy_timeout(config.busy_timeout())?;
    Ok(())
}

fn exec_on(conn: &rusqlite::Connection, sql: &str, params: &[Value]) -> OrmResult<ExecResult> {
    let started_at = Instant::now();
    debug!("event=sql_exec module=connection status=start sql={sql}");
    let rows_affected = conn.execute(sql, params_from_iter(params.iter()))?;
    let result = ExecResult {
        last_insert_id: conn.last_insert_rowid(),
        rows_affected,
    };
    debug!(
        "event=sql_exec module=connection status=ok rows_affected={} duration_ms={}",
        result.rows_affected,
        started_at.elapsed().as_millis()
    );
    Ok(result)
}

fn select_on(conn: &rusqlite::Connection, sql: &str, params: &[Value]) -> OrmResult<Vec<Record>> {
    let started_at = Instant::now();
    debug!("event=sql_select module=connection status=start sql={sql}");
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut columns = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            columns.push((name.clone(), row.get::<_, Value>(index)?));
        }
        records.push(Record::new(columns));
    }

    debug!(
        "event=sql_select module=connection status=ok rows={} duration_ms={}",
        records.len(),
        started_at.elapsed().as_millis()
    );
    Ok(records)
}

impl Connection for SqliteConnection {
    fn exec(&self, sql: &str, params: &[Value]) -> OrmResult<ExecResult> {
        exec_on(&self.conn, sql, params)
    }

    fn select(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Record>> {
        select_on(&self.conn, sql, params)
    }

    fn begin_transaction(&self) -> OrmResult<Box<dyn Transaction + '_>> {
        let tx = self.conn.unchecked_transaction()?;
        debug!("event=tx_begin module=connection status=ok");
        Ok(Box::new(SqliteTransaction { tx }))
    }
}

struct SqliteTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl Transaction for SqliteTransaction<'_> {
    fn exec(&mut self, sql: &str, params: &[Value]) -> OrmResult<ExecResult> {
        exec_on(&self.tx, sql, params)
    }

    fn commit(self: Box<Self>) -> OrmResult<()> {
        self.tx.commit()?;
        debug!("event=tx_commit module=connection status=ok");
        Ok(())
    }

    fn rollback(self: Box<Self>) -> OrmResult<()> {
        self.tx.rollback()?;
        debug!("event=tx_rollback module=connection status=ok");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Connection, SqliteConnection};
    use crate::config::OrmConfig;
    use crate::error::OrmError;
    use crate::value::Value;

    fn open_with_table() -> SqliteConnection {
        let conn = SqliteConnection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT NOT NULL);")
            .expect("create table");
        conn
    }

    #[test]
    fn foreign_keys_follow_config() {
        let conn = SqliteConnection::open_in_memory().expect("open in-memory db");
        let enabled: i64 = conn
            .raw()
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("read pragma");
        assert_eq!(enabled, 1);

        let config = OrmConfig {
            foreign_keys: false,
            ..OrmConfig::default()
        };
        let conn = SqliteConnection::open_in_memory_with_config(&config).expect("open in-memory db");
        let enabled: i64 = conn
            .raw()
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("read pragma");
        assert_eq!(enabled, 0);
    }

    #[test]
    fn exec_reports_insert_id_and_select_keeps_aliases() {
        let conn = open_with_table();
        let result = conn
            .exec(
                "INSERT INTO items(label) VALUES(?) ;",
                &[Value::Text("first".to_string())],
            )
            .expect("insert");
        assert_eq!(result.last_insert_id, 1);
        assert_eq!(result.rows_affected, 1);

        let rows = conn
            .select("SELECT items.id AS id, items.label AS label FROM items ;", &[])
            .expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("label"), Some(&Value::Text("first".to_string())));
    }

    #[test]
    fn get_without_rows_is_not_found() {
        let conn = open_with_table();
        let err = conn
            .get("SELECT id FROM items WHERE id = ? ;", &[Value::Integer(9)])
            .expect_err("no rows");
        assert!(matches!(err, OrmError::NotFound));
    }

    #[test]
    fn rollback_discards_and_commit_keeps() {
        let conn = open_with_table();
        {
            let mut tx = conn.begin_transaction().expect("begin");
            tx.exec(
                "INSERT INTO items(label) VALUES(?) ;",
                &[Value::Text("draft".to_string())],
            )
            .expect("insert");
            tx.rollback().expect("rollback");
        }
        let rows = conn.select("SELECT id FROM items ;", &[]).expect("select");
        assert!(rows.is_empty());

        let mut tx = conn.begin_transaction().expect("begin");
        tx.exec(
            "INSERT INTO items(label) VALUES(?) ;",
            &[Value::Text("kept".to_string())],
        )
        .expect("insert");
        tx.commit().expect("commit");
        let rows = conn.select("SELECT id FROM items ;", &[]).expect("select");
        assert_eq!(rows.len(), 1);
    }
}
