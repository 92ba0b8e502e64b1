//! SQL-backed persistence for alarms, actor metadata, and snapshots.
//!
//! Every operation lazily bootstraps the schema on first use; the
//! bootstrap runs exactly once per store instance and is a cheap flag
//! check afterwards. Statements use positional `?` placeholders with
//! binds passed as individual scalars, and result sets are normalized
//! from any of the three driver shapes into uniform column-keyed rows.
//!
//! Payloads cross this layer as raw JSON strings; parsing happens at the
//! manager boundary.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::error;

use super::AlarmKind;
use crate::error::{StorageError, StorageResult};
use crate::platform::{SqlOutcome, SqlStorage, SqlValue};

const SCHEMA_STATEMENTS: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS alarms (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        scheduled_at INTEGER NOT NULL,
        repeat_interval INTEGER,
        payload TEXT,
        created_at INTEGER NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_alarms_scheduled_at ON alarms (scheduled_at)",
    r"CREATE TABLE IF NOT EXISTS actor_meta (
        actor_id TEXT PRIMARY KEY,
        machine_id TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS snapshots (
        actor_id TEXT NOT NULL,
        snapshot TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_snapshots_actor ON snapshots (actor_id, created_at)",
];

const ALARM_COLUMNS: &str = "id, type, scheduled_at, repeat_interval, payload, created_at";

/// Raw alarm row as stored; `payload` is the transported JSON string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmRow {
    pub id: String,
    pub kind: AlarmKind,
    pub scheduled_at: i64,
    pub repeat_interval: Option<i64>,
    pub payload: Option<String>,
    pub created_at: i64,
}

/// In-place mutation of an existing alarm row.
///
/// This is the intentional upsert channel: updating an absent id is a
/// no-op, never an insert.
#[derive(Debug, Clone)]
pub struct UpdateAlarm {
    pub id: String,
    pub scheduled_at: i64,
    pub repeat_interval: Option<i64>,
    pub payload: Option<String>,
}

/// Metadata row for the hosted actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorMetaRow {
    pub actor_id: String,
    pub machine_id: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One persisted machine snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub actor_id: String,
    pub snapshot: String,
    pub created_at: i64,
}

/// A normalized result row, column-keyed.
#[derive(Debug, Clone)]
struct SqlRecord {
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl SqlRecord {
    fn get(&self, name: &str) -> Option<&SqlValue> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx)
    }

    fn text(&self, name: &str) -> StorageResult<String> {
        match self.get(name) {
            Some(SqlValue::Text(s)) => Ok(s.clone()),
            other => Err(StorageError::row_decode_failed(format!(
                "column '{name}' expected text, found {other:?}"
            ))),
        }
    }

    fn opt_text(&self, name: &str) -> StorageResult<Option<String>> {
        match self.get(name) {
            Some(SqlValue::Text(s)) => Ok(Some(s.clone())),
            Some(SqlValue::Null) | None => Ok(None),
            other => Err(StorageError::row_decode_failed(format!(
                "column '{name}' expected text or null, found {other:?}"
            ))),
        }
    }

    fn integer(&self, name: &str) -> StorageResult<i64> {
        match self.get(name) {
            Some(SqlValue::Integer(n)) => Ok(*n),
            other => Err(StorageError::row_decode_failed(format!(
                "column '{name}' expected integer, found {other:?}"
            ))),
        }
    }

    fn opt_integer(&self, name: &str) -> StorageResult<Option<i64>> {
        match self.get(name) {
            Some(SqlValue::Integer(n)) => Ok(Some(*n)),
            Some(SqlValue::Null) | None => Ok(None),
            other => Err(StorageError::row_decode_failed(format!(
                "column '{name}' expected integer or null, found {other:?}"
            ))),
        }
    }
}

/// Fold any driver result shape into a uniform row sequence.
async fn collect_records(outcome: SqlOutcome) -> StorageResult<Vec<SqlRecord>> {
    match outcome {
        SqlOutcome::Batches(batches) => {
            let mut records = Vec::new();
            for batch in batches {
                let columns = Arc::new(batch.columns);
                for values in batch.rows {
                    records.push(SqlRecord {
                        columns: Arc::clone(&columns),
                        values,
                    });
                }
            }
            Ok(records)
        }
        SqlOutcome::Columnar {
            column_names,
            results,
        } => {
            let columns = Arc::new(column_names);
            Ok(results
                .into_iter()
                .map(|values| SqlRecord {
                    columns: Arc::clone(&columns),
                    values,
                })
                .collect())
        }
        SqlOutcome::Cursor(mut cursor) => {
            let columns = Arc::new(cursor.columns().to_vec());
            let mut records = Vec::new();
            while let Some(values) = cursor.next_row().await? {
                records.push(SqlRecord {
                    columns: Arc::clone(&columns),
                    values,
                });
            }
            Ok(records)
        }
    }
}

fn alarm_from_record(record: &SqlRecord) -> StorageResult<AlarmRow> {
    Ok(AlarmRow {
        id: record.text("id")?,
        kind: AlarmKind::from_tag(&record.text("type")?),
        scheduled_at: record.integer("scheduled_at")?,
        repeat_interval: record.opt_integer("repeat_interval")?,
        payload: record.opt_text("payload")?,
        created_at: record.integer("created_at")?,
    })
}

fn meta_from_record(record: &SqlRecord) -> StorageResult<ActorMetaRow> {
    Ok(ActorMetaRow {
        actor_id: record.text("actor_id")?,
        machine_id: record.text("machine_id")?,
        status: record.text("status")?,
        created_at: record.integer("created_at")?,
        updated_at: record.integer("updated_at")?,
    })
}

fn snapshot_from_record(record: &SqlRecord) -> StorageResult<SnapshotRow> {
    Ok(SnapshotRow {
        actor_id: record.text("actor_id")?,
        snapshot: record.text("snapshot")?,
        created_at: record.integer("created_at")?,
    })
}

/// SQL-backed store for the unit's durable state.
#[derive(Clone)]
pub struct AlarmStore {
    sql: Arc<dyn SqlStorage>,
    bootstrapped: Arc<OnceCell<()>>,
}

impl std::fmt::Debug for AlarmStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmStore")
            .field("bootstrapped", &self.bootstrapped.initialized())
            .finish_non_exhaustive()
    }
}

impl AlarmStore {
    /// Create a store over the host's SQL primitive.
    #[must_use]
    pub fn new(sql: Arc<dyn SqlStorage>) -> Self {
        Self {
            sql,
            bootstrapped: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> StorageResult<()> {
        self.bootstrapped
            .get_or_try_init(|| async {
                for statement in SCHEMA_STATEMENTS {
                    self.sql.exec(statement, Vec::new()).await.map_err(|err| {
                        error!(error = %err, "schema bootstrap failed");
                        StorageError::schema_init_failed(err.to_string())
                    })?;
                }
                Ok(())
            })
            .await
            .map(|&()| ())
    }

    async fn query(&self, sql: &str, binds: Vec<SqlValue>) -> StorageResult<Vec<SqlRecord>> {
        self.ensure_schema().await?;
        let outcome = self.sql.exec(sql, binds).await?;
        collect_records(outcome).await
    }

    async fn execute(&self, sql: &str, binds: Vec<SqlValue>) -> StorageResult<()> {
        self.ensure_schema().await?;
        self.sql.exec(sql, binds).await.map(|_| ())
    }

    /// All alarm rows, earliest deadline first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or row decoding fails.
    pub async fn list_alarms(&self) -> StorageResult<Vec<AlarmRow>> {
        let records = self
            .query(
                &format!(
                    "SELECT {ALARM_COLUMNS} FROM alarms \
                     ORDER BY scheduled_at ASC, created_at ASC"
                ),
                Vec::new(),
            )
            .await?;
        records.iter().map(alarm_from_record).collect()
    }

    /// Alarm rows with `scheduled_at <= before`, earliest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or row decoding fails.
    pub async fn due_alarms(&self, before: i64) -> StorageResult<Vec<AlarmRow>> {
        let records = self
            .query(
                &format!(
                    "SELECT {ALARM_COLUMNS} FROM alarms WHERE scheduled_at <= ? \
                     ORDER BY scheduled_at ASC, created_at ASC"
                ),
                vec![SqlValue::Integer(before)],
            )
            .await?;
        records.iter().map(alarm_from_record).collect()
    }

    /// The row with the minimum deadline, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or row decoding fails.
    pub async fn earliest_alarm(&self) -> StorageResult<Option<AlarmRow>> {
        let records = self
            .query(
                &format!(
                    "SELECT {ALARM_COLUMNS} FROM alarms \
                     ORDER BY scheduled_at ASC, created_at ASC LIMIT 1"
                ),
                Vec::new(),
            )
            .await?;
        records.first().map(alarm_from_record).transpose()
    }

    /// Insert exactly one alarm row.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateAlarmId`] if the id exists; there
    /// is no silent upsert.
    pub async fn insert_alarm(&self, row: &AlarmRow) -> StorageResult<()> {
        self.execute(
            "INSERT INTO alarms (id, type, scheduled_at, repeat_interval, payload, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
            vec![
                SqlValue::from(row.id.clone()),
                SqlValue::from(row.kind.as_tag()),
                SqlValue::Integer(row.scheduled_at),
                SqlValue::from(row.repeat_interval),
                SqlValue::from(row.payload.clone()),
                SqlValue::Integer(row.created_at),
            ],
        )
        .await
        .map_err(|err| match err {
            StorageError::ConstraintViolation { .. } => {
                StorageError::duplicate_alarm_id(row.id.clone())
            }
            other => other,
        })
    }

    /// Mutate deadline, recurrence, and payload of an existing row.
    ///
    /// A missing id is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn update_alarm(&self, update: &UpdateAlarm) -> StorageResult<()> {
        self.execute(
            "UPDATE alarms SET scheduled_at = ?, repeat_interval = ?, payload = ? WHERE id = ?",
            vec![
                SqlValue::Integer(update.scheduled_at),
                SqlValue::from(update.repeat_interval),
                SqlValue::from(update.payload.clone()),
                SqlValue::from(update.id.clone()),
            ],
        )
        .await
    }

    /// Remove a row if present; absent ids are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn delete_alarm(&self, id: &str) -> StorageResult<()> {
        self.execute(
            "DELETE FROM alarms WHERE id = ?",
            vec![SqlValue::from(id)],
        )
        .await
    }

    /// Remove every row with the given kind tag in one statement.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn delete_alarms_by_kind(&self, kind: &AlarmKind) -> StorageResult<()> {
        self.execute(
            "DELETE FROM alarms WHERE type = ?",
            vec![SqlValue::from(kind.as_tag())],
        )
        .await
    }

    /// Metadata for the hosted actor, if recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or row decoding fails.
    pub async fn get_actor_meta(&self, actor_id: &str) -> StorageResult<Option<ActorMetaRow>> {
        let records = self
            .query(
                "SELECT actor_id, machine_id, status, created_at, updated_at \
                 FROM actor_meta WHERE actor_id = ?",
                vec![SqlValue::from(actor_id)],
            )
            .await?;
        records.first().map(meta_from_record).transpose()
    }

    /// Write actor metadata, updating the row in place if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn put_actor_meta(&self, meta: &ActorMetaRow) -> StorageResult<()> {
        self.execute(
            "INSERT INTO actor_meta (actor_id, machine_id, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(actor_id) DO UPDATE SET \
             machine_id = excluded.machine_id, \
             status = excluded.status, \
             updated_at = excluded.updated_at",
            vec![
                SqlValue::from(meta.actor_id.clone()),
                SqlValue::from(meta.machine_id.clone()),
                SqlValue::from(meta.status.clone()),
                SqlValue::Integer(meta.created_at),
                SqlValue::Integer(meta.updated_at),
            ],
        )
        .await
    }

    /// Append a snapshot row.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn put_snapshot(&self, snapshot: &SnapshotRow) -> StorageResult<()> {
        self.execute(
            "INSERT INTO snapshots (actor_id, snapshot, created_at) VALUES (?, ?, ?)",
            vec![
                SqlValue::from(snapshot.actor_id.clone()),
                SqlValue::from(snapshot.snapshot.clone()),
                SqlValue::Integer(snapshot.created_at),
            ],
        )
        .await
    }

    /// The most recent snapshot for an actor, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or row decoding fails.
    pub async fn latest_snapshot(&self, actor_id: &str) -> StorageResult<Option<SnapshotRow>> {
        let records = self
            .query(
                "SELECT actor_id, snapshot, created_at FROM snapshots \
                 WHERE actor_id = ? ORDER BY created_at DESC LIMIT 1",
                vec![SqlValue::from(actor_id)],
            )
            .await?;
        records.first().map(snapshot_from_record).transpose()
    }

    /// Delete snapshots older than the cutoff, keeping each actor's newest.
    ///
    /// Idempotent; re-running with the same cutoff deletes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn prune_snapshots(&self, cutoff_ms: i64) -> StorageResult<()> {
        self.execute(
            "DELETE FROM snapshots WHERE created_at < ? AND created_at < \
             (SELECT MAX(s.created_at) FROM snapshots s WHERE s.actor_id = snapshots.actor_id)",
            vec![SqlValue::Integer(cutoff_ms)],
        )
        .await
    }
}
