//! Host platform collaborators.
//!
//! The compute unit consumes three capabilities from its host:
//!
//! - **SQL storage**: a `exec(query, ...binds)` primitive over the embedded
//!   engine. Depending on the driver generation, results arrive as row
//!   batches, as a columnar pair, or as an async cursor; the persistence
//!   layer normalizes all three.
//! - **Wakeup slot**: the unit's single platform timer, armed at an
//!   absolute wall-clock deadline. There is no disarm primitive.
//! - **Clock**: wall-clock millisecond reader.
//!
//! Reference implementations live alongside the traits: [`SqliteStorage`]
//! (the embedded engine), [`SystemClock`], [`ManualClock`], and
//! [`MemoryWakeupSlot`] for tests and simulations.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{RuntimeError, RuntimeResult, StorageResult};

pub mod sqlite;

pub use sqlite::SqliteStorage;

/// Scalar value bound to a positional `?` placeholder.
///
/// Binds travel as individual scalars; there is deliberately no aggregate
/// variant, so a bind list can never be wrapped into a single array value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Integer content, if this value is an integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Text content, if this value is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value is SQL `NULL`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(value: Option<i64>) -> Self {
        value.map_or(Self::Null, Self::Integer)
    }
}

impl From<Option<String>> for SqlValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(Self::Null, Self::Text)
    }
}

/// One batch of rows sharing a column header.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    /// Column names in declared order.
    pub columns: Vec<String>,
    /// Row values, positionally matching `columns`.
    pub rows: Vec<Vec<SqlValue>>,
}

/// Async row cursor, the third driver result shape.
#[async_trait]
pub trait RowCursor: Send {
    /// Column names in declared order.
    fn columns(&self) -> &[String];

    /// Next row, or `None` when the cursor is exhausted.
    async fn next_row(&mut self) -> StorageResult<Option<Vec<SqlValue>>>;
}

/// Result of one `exec` call, in whichever shape the driver produced.
pub enum SqlOutcome {
    /// An array of row batches.
    Batches(Vec<RowBatch>),
    /// A single columnar result set.
    Columnar {
        column_names: Vec<String>,
        results: Vec<Vec<SqlValue>>,
    },
    /// An asynchronously iterable cursor.
    Cursor(Box<dyn RowCursor>),
}

impl std::fmt::Debug for SqlOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batches(batches) => f.debug_tuple("Batches").field(batches).finish(),
            Self::Columnar {
                column_names,
                results,
            } => f
                .debug_struct("Columnar")
                .field("column_names", column_names)
                .field("results", results)
                .finish(),
            Self::Cursor(_) => f.debug_tuple("Cursor").finish(),
        }
    }
}

/// The host's SQL primitive.
///
/// Placeholders are positional `?`; binds are individual scalars in
/// placeholder order.
#[async_trait]
pub trait SqlStorage: Send + Sync {
    /// Execute one statement and return its result set.
    async fn exec(&self, sql: &str, binds: Vec<SqlValue>) -> StorageResult<SqlOutcome>;
}

/// The unit's single platform wakeup slot.
///
/// Armed at an absolute wall-clock deadline in milliseconds. The platform
/// offers no disarm; a stale deadline simply fires into an empty drain.
#[async_trait]
pub trait WakeupSlot: Send + Sync {
    /// Arm the slot. Re-arming replaces the previous deadline.
    async fn set_wakeup(&self, deadline_ms: i64) -> RuntimeResult<()>;
}

/// Wall-clock millisecond reader.
pub trait Clock: Send + Sync {
    /// Current wall-clock time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at the given instant.
    #[must_use]
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute instant.
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Wakeup slot that records every armed deadline.
///
/// The latest entry is the deadline the platform would honor.
#[derive(Debug, Default)]
pub struct MemoryWakeupSlot {
    history: RwLock<Vec<i64>>,
}

impl MemoryWakeupSlot {
    /// Create an unarmed slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently armed deadline, if the slot was ever armed.
    pub async fn armed_deadline(&self) -> Option<i64> {
        self.history.read().await.last().copied()
    }

    /// How many times the slot has been armed.
    pub async fn arm_count(&self) -> usize {
        self.history.read().await.len()
    }

    /// Every deadline ever armed, oldest first.
    pub async fn history(&self) -> Vec<i64> {
        self.history.read().await.clone()
    }
}

#[async_trait]
impl WakeupSlot for MemoryWakeupSlot {
    async fn set_wakeup(&self, deadline_ms: i64) -> RuntimeResult<()> {
        if deadline_ms < 0 {
            return Err(RuntimeError::wakeup_failed("deadline before the epoch"));
        }
        self.history.write().await.push(deadline_ms);
        Ok(())
    }
}
