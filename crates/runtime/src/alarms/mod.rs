//! Durable delayed-event scheduling.
//!
//! This module multiplexes a persistent queue of scheduled alarms onto
//! the unit's single platform wakeup slot, so that delayed machine
//! transitions survive hibernation and restart.
//!
//! # Architecture
//!
//! The subsystem is four collaborating layers, leaves first:
//!
//! 1. [`AlarmStore`]: SQL-backed persistence for alarms, actor metadata,
//!    and snapshots
//! 2. [`AlarmManager`]: the logical queue plus the wakeup slot, always
//!    armed for the earliest pending deadline
//! 3. [`AlarmScheduler`]: adapts the machine library's timer contract to
//!    persisted alarms, with an in-memory index rebuilt on cold start
//! 4. [`WakeupHandler`]: drains due alarms when the slot fires and routes
//!    each to its handler
//!
//! # Key Types
//!
//! - [`Alarm`]: one scheduled wakeup with an opaque JSON payload
//! - [`AlarmKind`]: the open tag set an alarm is dispatched on
//! - [`DrainRecord`]: the per-alarm outcome of one drain

mod adapter;
mod manager;
mod store;
mod wakeup;

pub use adapter::{
    AlarmScheduler, DelayedEventScheduler, ScheduledEventRef, XStateAlarmData,
    MACHINE_DELAY_ID_PREFIX,
};
pub use manager::{AlarmHandler, AlarmManager, ArmedWakeup};
pub use store::{ActorMetaRow, AlarmRow, AlarmStore, SnapshotRow, UpdateAlarm};
pub use wakeup::WakeupHandler;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// The kind tag an alarm is dispatched on.
///
/// The tag set is open for extension but closed for dispatch: anything
/// that is not a machine delay or the internal cleanup tick is handed to
/// the user handler verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AlarmKind {
    /// A delayed machine transition.
    MachineDelay,
    /// The internal recurring snapshot-retention tick.
    CacheCleanup,
    /// A user-defined alarm.
    Custom,
    /// Any other tag, carried verbatim.
    Other(String),
}

impl AlarmKind {
    /// The persisted tag for this kind.
    #[must_use]
    pub fn as_tag(&self) -> &str {
        match self {
            Self::MachineDelay => "xstate-delay",
            Self::CacheCleanup => "cache-cleanup",
            Self::Custom => "custom",
            Self::Other(tag) => tag,
        }
    }

    /// Parse a persisted tag. Unknown tags round-trip through [`Self::Other`].
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "xstate-delay" => Self::MachineDelay,
            "cache-cleanup" => Self::CacheCleanup,
            "custom" => Self::Custom,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this is a delayed machine transition.
    #[must_use]
    pub fn is_machine_delay(&self) -> bool {
        matches!(self, Self::MachineDelay)
    }

    /// Whether this is the internal cleanup tick.
    #[must_use]
    pub fn is_cache_cleanup(&self) -> bool {
        matches!(self, Self::CacheCleanup)
    }
}

impl std::fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_tag())
    }
}

impl Serialize for AlarmKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_tag())
    }
}

impl<'de> Deserialize<'de> for AlarmKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        if tag.is_empty() {
            return Err(D::Error::custom("empty alarm kind tag"));
        }
        Ok(Self::from_tag(&tag))
    }
}

/// One scheduled wakeup, payload parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Alarm {
    /// Client-supplied unique identifier.
    pub id: String,
    /// Dispatch tag.
    pub kind: AlarmKind,
    /// Absolute wall-clock deadline, milliseconds since the epoch.
    pub scheduled_at: i64,
    /// When set, firing reschedules at `now + repeat_interval` instead of
    /// deleting.
    pub repeat_interval: Option<i64>,
    /// Opaque payload, carried through intact to the handler.
    pub payload: Value,
    /// Insertion timestamp, informational.
    pub created_at: i64,
}

/// Request to schedule an alarm.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    /// Unique identifier; scheduling fails if it already exists.
    pub id: String,
    /// Dispatch tag.
    pub kind: AlarmKind,
    /// Absolute wall-clock deadline, milliseconds since the epoch.
    pub scheduled_at: i64,
    /// Optional recurrence period, strictly positive.
    pub repeat_interval: Option<i64>,
    /// Opaque payload.
    pub payload: Value,
}

impl ScheduleRequest {
    /// Create a request with no recurrence and a null payload.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: AlarmKind, scheduled_at: i64) -> Self {
        Self {
            id: id.into(),
            kind,
            scheduled_at,
            repeat_interval: None,
            payload: Value::Null,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Make the alarm recurring.
    #[must_use]
    pub fn with_repeat_interval(mut self, interval_ms: i64) -> Self {
        self.repeat_interval = Some(interval_ms);
        self
    }
}

/// Per-alarm outcome of a drain, in drain order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainRecord {
    /// The drained alarm's id.
    pub id: String,
    /// The drained alarm's kind.
    pub kind: AlarmKind,
    /// True when the alarm was recurring and its row was advanced.
    pub rescheduled: bool,
    /// True when the row was removed.
    pub deleted: bool,
}
