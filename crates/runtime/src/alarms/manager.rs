//! Alarm queue management over the persistent store and the wakeup slot.
//!
//! The manager owns the union of the persisted alarm queue and the unit's
//! single platform wakeup slot, multiplexing any number of logical alarms
//! onto that one slot by always arming it for the earliest pending
//! deadline.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use super::store::{AlarmRow, AlarmStore, UpdateAlarm};
use super::{Alarm, DrainRecord, ScheduleRequest};
use crate::error::{RuntimeResult, StorageError, StorageResult};
use crate::platform::{Clock, WakeupSlot};

/// The slot's last-requested state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedWakeup {
    /// Id of the alarm the slot was armed for.
    pub id: String,
    /// Deadline the slot was armed at.
    pub scheduled_at: i64,
}

/// Callback invoked for each due alarm during a drain.
#[async_trait]
pub trait AlarmHandler: Send + Sync {
    /// Handle one due alarm.
    ///
    /// Errors are logged and swallowed by the drain; by the time the
    /// handler runs, the row has already been deleted or rescheduled.
    ///
    /// # Errors
    ///
    /// Returns an error if handling fails; the drain continues regardless.
    async fn handle(&self, alarm: &Alarm) -> RuntimeResult<()>;
}

/// Owns the logical alarm queue and the platform wakeup slot.
pub struct AlarmManager {
    store: AlarmStore,
    slot: Arc<dyn WakeupSlot>,
    clock: Arc<dyn Clock>,
    armed: RwLock<Option<ArmedWakeup>>,
}

impl AlarmManager {
    /// Create a manager over the given store, slot, and clock.
    #[must_use]
    pub fn new(store: AlarmStore, slot: Arc<dyn WakeupSlot>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            slot,
            clock,
            armed: RwLock::new(None),
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &AlarmStore {
        &self.store
    }

    /// Current wall-clock milliseconds.
    #[must_use]
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Insert an alarm and rearm the slot.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidAlarm`] when the request violates an
    /// invariant, [`StorageError::DuplicateAlarmId`] when the id exists,
    /// or any storage failure.
    pub async fn schedule(&self, request: ScheduleRequest) -> RuntimeResult<()> {
        validate(&request)?;

        let row = AlarmRow {
            id: request.id,
            kind: request.kind,
            scheduled_at: request.scheduled_at,
            repeat_interval: request.repeat_interval,
            payload: Some(request.payload.to_string()),
            created_at: self.clock.now_ms(),
        };
        self.store.insert_alarm(&row).await?;
        self.rearm().await
    }

    /// Remove an alarm by id.
    ///
    /// Rearms only when the removed alarm is the one the slot was armed
    /// for; other cancellations are cheap.
    ///
    /// # Errors
    ///
    /// Returns an error if storage or rearming fails.
    pub async fn cancel(&self, id: &str) -> RuntimeResult<()> {
        self.store.delete_alarm(id).await?;

        let was_armed = {
            let armed = self.armed.read().await;
            armed.as_ref().is_some_and(|a| a.id == id)
        };
        if was_armed {
            self.rearm().await?;
        }
        Ok(())
    }

    /// Remove every alarm of a kind, then rearm unconditionally.
    ///
    /// # Errors
    ///
    /// Returns an error if storage or rearming fails.
    pub async fn cancel_by_kind(&self, kind: &super::AlarmKind) -> RuntimeResult<()> {
        self.store.delete_alarms_by_kind(kind).await?;
        self.rearm().await
    }

    /// Every pending alarm with its payload parsed. Read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn list_pending(&self) -> RuntimeResult<Vec<Alarm>> {
        let rows = self.store.list_alarms().await?;
        Ok(parse_rows_skipping_corrupt(rows))
    }

    /// Every alarm due now. Read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn list_due(&self) -> RuntimeResult<Vec<Alarm>> {
        self.list_due_before(self.clock.now_ms()).await
    }

    /// Every alarm with `scheduled_at <= before`. Read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails.
    pub async fn list_due_before(&self, before: i64) -> RuntimeResult<Vec<Alarm>> {
        let rows = self.store.due_alarms(before).await?;
        Ok(parse_rows_skipping_corrupt(rows))
    }

    /// Drain every alarm due at entry time.
    ///
    /// For each due alarm, in ascending deadline order, the row is first
    /// rescheduled (recurring) or deleted (one-shot), and only then is the
    /// handler invoked: a crash inside the handler cannot cause a
    /// redelivery. Handler errors are logged and do not abort the drain.
    /// Alarms inserted by the handler are not part of this drain; the
    /// closing rearm sees them.
    ///
    /// # Errors
    ///
    /// Returns an error if a storage mutation or the closing rearm fails.
    pub async fn handle_due(&self, handler: &dyn AlarmHandler) -> RuntimeResult<Vec<DrainRecord>> {
        let now = self.clock.now_ms();
        let due = self.store.due_alarms(now).await?;
        let mut records = Vec::with_capacity(due.len());

        for row in due {
            let alarm = match alarm_from_row(&row) {
                Ok(alarm) => alarm,
                Err(err) => {
                    error!(alarm_id = %row.id, error = %err, "deleting alarm with corrupt payload");
                    self.store.delete_alarm(&row.id).await?;
                    records.push(DrainRecord {
                        id: row.id,
                        kind: row.kind,
                        rescheduled: false,
                        deleted: true,
                    });
                    continue;
                }
            };

            let record = if let Some(interval) = alarm.repeat_interval {
                // Skew, not catch-up: one reschedule regardless of how many
                // intervals elapsed while hibernated.
                let next = now + interval;
                self.store
                    .update_alarm(&UpdateAlarm {
                        id: alarm.id.clone(),
                        scheduled_at: next,
                        repeat_interval: Some(interval),
                        payload: row.payload.clone(),
                    })
                    .await?;
                DrainRecord {
                    id: alarm.id.clone(),
                    kind: alarm.kind.clone(),
                    rescheduled: true,
                    deleted: false,
                }
            } else {
                self.store.delete_alarm(&alarm.id).await?;
                DrainRecord {
                    id: alarm.id.clone(),
                    kind: alarm.kind.clone(),
                    rescheduled: false,
                    deleted: true,
                }
            };

            if let Err(err) = handler.handle(&alarm).await {
                error!(alarm_id = %alarm.id, error = %err, "alarm handler failed");
            }
            records.push(record);
        }

        self.rearm().await?;
        Ok(records)
    }

    /// Arm the slot for the earliest pending alarm.
    ///
    /// With an empty queue the volatile state is cleared and the slot left
    /// as-is: the platform offers no disarm, and a stale fire drains
    /// nothing. An unchanged earliest alarm issues no slot request.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read or the slot request fails.
    pub async fn rearm(&self) -> RuntimeResult<()> {
        let earliest = self.store.earliest_alarm().await?;
        let mut armed = self.armed.write().await;

        match earliest {
            None => {
                *armed = None;
            }
            Some(row) => {
                let unchanged = armed
                    .as_ref()
                    .is_some_and(|a| a.id == row.id && a.scheduled_at == row.scheduled_at);
                if !unchanged {
                    debug!(alarm_id = %row.id, deadline = row.scheduled_at, "arming wakeup slot");
                    self.slot.set_wakeup(row.scheduled_at).await?;
                    *armed = Some(ArmedWakeup {
                        id: row.id,
                        scheduled_at: row.scheduled_at,
                    });
                }
            }
        }
        Ok(())
    }

    /// The slot's last-requested state.
    pub async fn current_armed(&self) -> Option<ArmedWakeup> {
        self.armed.read().await.clone()
    }
}

fn validate(request: &ScheduleRequest) -> StorageResult<()> {
    if request.id.is_empty() {
        return Err(StorageError::invalid_alarm("id must not be empty"));
    }
    if request.scheduled_at < 0 {
        return Err(StorageError::invalid_alarm(
            "scheduled_at must not precede the epoch",
        ));
    }
    if let Some(interval) = request.repeat_interval {
        if interval <= 0 {
            return Err(StorageError::invalid_alarm(
                "repeat_interval must be positive",
            ));
        }
    }
    Ok(())
}

fn alarm_from_row(row: &AlarmRow) -> StorageResult<Alarm> {
    let payload = match &row.payload {
        None => Value::Null,
        Some(raw) => serde_json::from_str(raw)
            .map_err(|err| StorageError::corrupt_payload(row.id.clone(), err.to_string()))?,
    };
    Ok(Alarm {
        id: row.id.clone(),
        kind: row.kind.clone(),
        scheduled_at: row.scheduled_at,
        repeat_interval: row.repeat_interval,
        payload,
        created_at: row.created_at,
    })
}

fn parse_rows_skipping_corrupt(rows: Vec<AlarmRow>) -> Vec<Alarm> {
    rows.iter()
        .filter_map(|row| match alarm_from_row(row) {
            Ok(alarm) => Some(alarm),
            Err(err) => {
                warn!(alarm_id = %row.id, error = %err, "skipping alarm with corrupt payload");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::alarms::AlarmKind;
    use crate::platform::{ManualClock, MemoryWakeupSlot, SqliteStorage};

    struct CountingHandler {
        invocations: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                invocations: AtomicUsize::new(0),
            }
        }

        fn count(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AlarmHandler for CountingHandler {
        async fn handle(&self, _alarm: &Alarm) -> RuntimeResult<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn parts(start_ms: i64) -> (AlarmManager, Arc<ManualClock>, Arc<MemoryWakeupSlot>) {
        let storage = match SqliteStorage::open_in_memory() {
            Ok(s) => s,
            Err(e) => panic!("in-memory open should succeed: {e}"),
        };
        let clock = Arc::new(ManualClock::new(start_ms));
        let slot = Arc::new(MemoryWakeupSlot::new());
        let manager = AlarmManager::new(
            AlarmStore::new(Arc::new(storage)),
            Arc::clone(&slot) as Arc<dyn WakeupSlot>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (manager, clock, slot)
    }

    #[tokio::test]
    async fn test_schedule_rejects_invalid_requests() {
        let (manager, _clock, _slot) = parts(0);

        let negative = manager
            .schedule(ScheduleRequest::new("A", AlarmKind::Custom, -1))
            .await;
        assert!(negative.is_err());

        let zero_interval = manager
            .schedule(
                ScheduleRequest::new("B", AlarmKind::Custom, 100).with_repeat_interval(0),
            )
            .await;
        assert!(zero_interval.is_err());

        let empty_id = manager
            .schedule(ScheduleRequest::new("", AlarmKind::Custom, 100))
            .await;
        assert!(empty_id.is_err());
    }

    #[tokio::test]
    async fn test_schedule_arms_the_slot_for_the_earliest() {
        let (manager, _clock, slot) = parts(0);

        let scheduled = manager
            .schedule(ScheduleRequest::new("late", AlarmKind::Custom, 2_000))
            .await;
        assert!(scheduled.is_ok());
        assert_eq!(slot.armed_deadline().await, Some(2_000));

        let scheduled = manager
            .schedule(ScheduleRequest::new("early", AlarmKind::Custom, 500))
            .await;
        assert!(scheduled.is_ok());
        assert_eq!(slot.armed_deadline().await, Some(500));

        match manager.current_armed().await {
            Some(armed) => {
                assert_eq!(armed.id, "early");
                assert_eq!(armed.scheduled_at, 500);
            }
            None => panic!("slot should be armed"),
        }
    }

    #[tokio::test]
    async fn test_rearm_twice_issues_one_wakeup() {
        let (manager, _clock, slot) = parts(0);
        let scheduled = manager
            .schedule(ScheduleRequest::new("A", AlarmKind::Custom, 1_000))
            .await;
        assert!(scheduled.is_ok());
        let after_schedule = slot.arm_count().await;

        let rearmed = manager.rearm().await;
        assert!(rearmed.is_ok());
        let rearmed = manager.rearm().await;
        assert!(rearmed.is_ok());

        assert_eq!(slot.arm_count().await, after_schedule);
    }

    #[tokio::test]
    async fn test_cancel_of_unarmed_alarm_does_not_touch_the_slot() {
        let (manager, _clock, slot) = parts(0);
        for (id, at) in [("first", 100), ("second", 200)] {
            let scheduled = manager
                .schedule(ScheduleRequest::new(id, AlarmKind::Custom, at))
                .await;
            assert!(scheduled.is_ok());
        }
        let before = slot.arm_count().await;

        let cancelled = manager.cancel("second").await;
        assert!(cancelled.is_ok());

        assert_eq!(slot.arm_count().await, before);
        assert!(matches!(manager.current_armed().await, Some(a) if a.id == "first"));
    }

    #[tokio::test]
    async fn test_cancel_of_armed_alarm_rearms_for_the_next() {
        let (manager, _clock, slot) = parts(0);
        for (id, at) in [("first", 100), ("second", 200)] {
            let scheduled = manager
                .schedule(ScheduleRequest::new(id, AlarmKind::Custom, at))
                .await;
            assert!(scheduled.is_ok());
        }

        let cancelled = manager.cancel("first").await;
        assert!(cancelled.is_ok());

        assert_eq!(slot.armed_deadline().await, Some(200));
        assert!(matches!(manager.current_armed().await, Some(a) if a.id == "second"));
    }

    #[tokio::test]
    async fn test_drain_deletes_one_shot_and_reschedules_recurring() {
        let (manager, clock, _slot) = parts(0);
        let scheduled = manager
            .schedule(ScheduleRequest::new("once", AlarmKind::Custom, 100))
            .await;
        assert!(scheduled.is_ok());
        let scheduled = manager
            .schedule(
                ScheduleRequest::new("tick", AlarmKind::CacheCleanup, 150)
                    .with_repeat_interval(500),
            )
            .await;
        assert!(scheduled.is_ok());

        clock.set(200);
        let handler = CountingHandler::new();
        let records = manager.handle_due(&handler).await;

        match records {
            Ok(records) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0].id, "once");
                assert!(records[0].deleted);
                assert!(!records[0].rescheduled);
                assert_eq!(records[1].id, "tick");
                assert!(records[1].rescheduled);
                assert!(!records[1].deleted);
            }
            Err(e) => panic!("drain should succeed: {e}"),
        }
        assert_eq!(handler.count(), 2);

        // The recurring row advanced to now + interval.
        match manager.list_pending().await {
            Ok(pending) => {
                assert_eq!(pending.len(), 1);
                assert_eq!(pending[0].id, "tick");
                assert_eq!(pending[0].scheduled_at, 200 + 500);
            }
            Err(e) => panic!("list should succeed: {e}"),
        }
    }

    #[tokio::test]
    async fn test_drain_with_empty_queue_is_safe() {
        let (manager, _clock, _slot) = parts(0);
        let handler = CountingHandler::new();

        let records = manager.handle_due(&handler).await;

        assert!(matches!(records, Ok(records) if records.is_empty()));
        assert_eq!(handler.count(), 0);
    }

    #[tokio::test]
    async fn test_drain_deletes_corrupt_payload_without_dispatch() {
        let (manager, clock, _slot) = parts(0);
        // Bypass the manager to plant a row whose payload is not JSON.
        let planted = manager
            .store()
            .insert_alarm(&AlarmRow {
                id: "bad".to_string(),
                kind: AlarmKind::Custom,
                scheduled_at: 50,
                repeat_interval: None,
                payload: Some("{not-json".to_string()),
                created_at: 0,
            })
            .await;
        assert!(planted.is_ok());

        clock.set(100);
        let handler = CountingHandler::new();
        let records = manager.handle_due(&handler).await;

        match records {
            Ok(records) => {
                assert_eq!(records.len(), 1);
                assert!(records[0].deleted);
            }
            Err(e) => panic!("drain should succeed: {e}"),
        }
        assert_eq!(handler.count(), 0);
        assert!(matches!(manager.list_pending().await, Ok(p) if p.is_empty()));
    }

    #[tokio::test]
    async fn test_list_due_is_inclusive_of_the_boundary() {
        let (manager, clock, _slot) = parts(0);
        let scheduled = manager
            .schedule(ScheduleRequest::new("edge", AlarmKind::Custom, 1_000))
            .await;
        assert!(scheduled.is_ok());

        clock.set(1_000);
        match manager.list_due().await {
            Ok(due) => assert_eq!(due.len(), 1),
            Err(e) => panic!("list_due should succeed: {e}"),
        }
    }
}
