//! Embedded SQL engine host backed by SQLite.
//!
//! Implements [`SqlStorage`] over a single `rusqlite` connection. Results
//! are produced in the row-batch shape; the persistence layer's
//! normalization accepts the other driver shapes from hosts that emit them.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection};

use super::{RowBatch, SqlOutcome, SqlStorage, SqlValue};
use crate::error::{StorageError, StorageResult};

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Integer(n) => ToSqlOutput::Owned(Value::Integer(*n)),
            Self::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// SQLite-backed host storage.
///
/// The connection is shared behind a mutex; the unit is single-threaded,
/// so the lock is uncontended and exists only to satisfy `Sync`.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

impl SqliteStorage {
    /// Open a database file, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path).map_err(map_sqlite_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot allocate the database.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::query_failed("connection mutex poisoned"))?;
        f(&conn)
    }
}

#[async_trait]
impl SqlStorage for SqliteStorage {
    async fn exec(&self, sql: &str, binds: Vec<SqlValue>) -> StorageResult<SqlOutcome> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;

            if stmt.column_count() == 0 {
                stmt.execute(params_from_iter(binds.iter()))
                    .map_err(map_sqlite_error)?;
                return Ok(SqlOutcome::Batches(Vec::new()));
            }

            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            let column_count = columns.len();

            let mut out = Vec::new();
            let mut rows = stmt
                .query(params_from_iter(binds.iter()))
                .map_err(map_sqlite_error)?;
            while let Some(row) = rows.next().map_err(map_sqlite_error)? {
                let mut values = Vec::with_capacity(column_count);
                for idx in 0..column_count {
                    let value = row.get_ref(idx).map_err(map_sqlite_error)?;
                    values.push(value_from_ref(value));
                }
                out.push(values);
            }

            Ok(SqlOutcome::Batches(vec![RowBatch { columns, rows: out }]))
        })
    }
}

fn value_from_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(n) => SqlValue::Integer(n),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            SqlValue::Text(String::from_utf8_lossy(t).into_owned())
        }
    }
}

fn map_sqlite_error(err: rusqlite::Error) -> StorageError {
    if let rusqlite::Error::SqliteFailure(code, message) = &err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            let reason = message.clone().unwrap_or_else(|| code.to_string());
            return StorageError::constraint_violation(reason);
        }
    }
    StorageError::query_failed(err.to_string())
}
