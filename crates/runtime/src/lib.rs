//! # Burrow Runtime
//!
//! Durable delayed-event scheduling for a hibernating compute unit that
//! hosts one long-lived state machine.
//!
//! The platform may evict the unit from memory at any moment and
//! re-instantiate it later. Delayed and recurring machine transitions
//! therefore live in a persistent alarm queue, multiplexed onto the
//! unit's single platform wakeup slot.
//!
//! # Architecture
//!
//! - **Store**: SQL-backed rows for alarms, actor metadata, and snapshots,
//!   with idempotent schema bootstrap and driver result normalization
//! - **Manager**: arms the wakeup slot for the earliest pending deadline
//!   and drains due alarms with at-most-once delivery
//! - **Adapter**: fulfils the machine library's timer contract against the
//!   queue, with an in-memory index rebuilt on cold start
//! - **Wakeup handler**: routes each drained alarm to machine delivery,
//!   the snapshot retention sweep, or a user handler

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub use burrow_core::{Error, Result};

/// Durable alarm queue: store, manager, timer adapter, wakeup handler.
pub mod alarms;

/// Construction-time configuration.
pub mod config;

/// Error taxonomy for storage and runtime operations.
pub mod error;

/// Collaborator seam to the hosted state-machine library.
pub mod machine;

/// Host platform collaborators: SQL storage, wakeup slot, clock.
pub mod platform;

/// Unit wiring and hibernation recovery.
pub mod runtime;

pub use alarms::{
    Alarm, AlarmHandler, AlarmKind, AlarmManager, AlarmScheduler, AlarmStore, ArmedWakeup,
    DelayedEventScheduler, DrainRecord, ScheduleRequest, ScheduledEventRef, WakeupHandler,
    XStateAlarmData,
};
pub use config::RuntimeConfig;
pub use error::{RuntimeError, RuntimeResult, StorageError, StorageResult};
pub use machine::{MachineClock, MachineHandle, MachineSystem, NoopClock, NOOP_CLOCK};
pub use platform::{Clock, SqlStorage, SqliteStorage, SystemClock, WakeupSlot};
pub use runtime::{MachineHost, UnitRuntime, CACHE_CLEANUP_ALARM_ID};
