//! Adapter between the machine library's timer contract and the alarm queue.
//!
//! Each in-memory scheduling call becomes a persisted alarm keyed by
//! `{session_id}.{event_key}`, and a side index maps those keys back to
//! the event payloads the machine will receive on fire. The index is a
//! cache over the alarms table: it is rebuilt on cold start and the table
//! wins on any inconsistency.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use burrow_core::{Error, ResultExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use super::manager::AlarmManager;
use super::{Alarm, AlarmKind, ScheduleRequest};
use crate::error::RuntimeResult;
use crate::machine::{MachineHandle, MachineSystem, RelayOutcome};

/// Prefix of every persisted machine-delay alarm id.
pub const MACHINE_DELAY_ID_PREFIX: &str = "xstate-";

/// The machine library's pluggable timer contract.
#[async_trait]
pub trait DelayedEventScheduler: Send + Sync {
    /// Schedule `event` for delivery to `target` after `delay_ms`.
    ///
    /// `event_key` is the library-supplied opaque key; when absent a short
    /// random key is synthesized (such events cannot be cancelled by key).
    ///
    /// # Errors
    ///
    /// Returns an error if the alarm cannot be persisted.
    async fn schedule(
        &self,
        source: &dyn MachineHandle,
        target: &dyn MachineHandle,
        event: Value,
        delay_ms: i64,
        event_key: Option<&str>,
    ) -> RuntimeResult<()>;

    /// Cancel the delayed event derived from `(source, event_key)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue removal fails.
    async fn cancel(&self, source: &dyn MachineHandle, event_key: &str) -> RuntimeResult<()>;

    /// Cancel every delayed event whose source is `actor`.
    ///
    /// # Errors
    ///
    /// Returns an error if a queue removal fails.
    async fn cancel_all(&self, actor: &dyn MachineHandle) -> RuntimeResult<()>;
}

/// Entry in the scheduled-event index.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEventRef {
    pub source_session_id: String,
    pub target_session_id: String,
    pub event: Value,
    pub delay_ms: i64,
    pub started_at_ms: i64,
}

/// Payload persisted for a delayed machine transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XStateAlarmData {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source_session_id: String,
    pub target_session_id: String,
    pub event: Value,
    pub composed_id: String,
    pub alarm_id: String,
    pub delay: i64,
    pub started_at: i64,
}

/// Fulfils the timer contract against the durable queue.
pub struct AlarmScheduler {
    manager: Arc<AlarmManager>,
    system: Arc<dyn MachineSystem>,
    index: RwLock<HashMap<String, ScheduledEventRef>>,
}

impl AlarmScheduler {
    /// Create the adapter over a manager and the surrounding actor system.
    #[must_use]
    pub fn new(manager: Arc<AlarmManager>, system: Arc<dyn MachineSystem>) -> Self {
        Self {
            manager,
            system,
            index: RwLock::new(HashMap::new()),
        }
    }

    fn composed_id(session_id: &str, event_key: &str) -> String {
        format!("{session_id}.{event_key}")
    }

    fn alarm_id(composed_id: &str) -> String {
        format!("{MACHINE_DELAY_ID_PREFIX}{composed_id}")
    }

    fn synthesize_event_key() -> String {
        let mut key = uuid::Uuid::new_v4().simple().to_string();
        key.truncate(8);
        key
    }

    /// The index entry for a composed id, if present.
    pub async fn scheduled_event(&self, composed_id: &str) -> Option<ScheduledEventRef> {
        self.index.read().await.get(composed_id).cloned()
    }

    /// Number of indexed scheduled events.
    pub async fn scheduled_count(&self) -> usize {
        self.index.read().await.len()
    }

    /// Rebuild the index from persisted machine-delay alarms.
    ///
    /// Only alarms whose deadline is still in the future are indexed;
    /// past-due rows are left for the next drain to deliver. Returns the
    /// number of entries restored.
    pub async fn restore_scheduled_events(&self, alarms: &[Alarm]) -> usize {
        let now = self.manager.now_ms();
        let mut index = self.index.write().await;
        let mut restored = 0;

        for alarm in alarms {
            if !alarm.kind.is_machine_delay() || alarm.scheduled_at <= now {
                continue;
            }
            let parsed = serde_json::from_value::<XStateAlarmData>(alarm.payload.clone())
                .map_err(|err| Error::json_parse_failed(err.to_string()))
                .inspect_error(
                    |err| warn!(alarm_id = %alarm.id, error = %err, "skipping unrestorable alarm"),
                );
            if let Ok(data) = parsed {
                index.insert(
                    data.composed_id.clone(),
                    ScheduledEventRef {
                        source_session_id: data.source_session_id,
                        target_session_id: data.target_session_id,
                        event: data.event,
                        delay_ms: data.delay,
                        started_at_ms: data.started_at,
                    },
                );
                restored += 1;
            }
        }

        debug!(restored, "scheduled-event index rebuilt");
        restored
    }

    /// Deliver a fired machine-delay alarm to the target actor.
    ///
    /// The index entry is removed first; delivery then goes through the
    /// system relay when available, else the actor's public send. Failures
    /// are logged, never retried.
    pub async fn deliver(&self, data: &XStateAlarmData, target: &dyn MachineHandle) {
        self.index.write().await.remove(&data.composed_id);

        match self.system.relay(target, target, data.event.clone()) {
            RelayOutcome::Delivered => {}
            RelayOutcome::Unsupported => {
                let _ = target.send(data.event.clone()).inspect_error(|err| {
                    error!(
                        composed_id = %data.composed_id,
                        error = %err,
                        "delayed event delivery failed"
                    );
                });
            }
            RelayOutcome::Failed(err) => {
                error!(
                    composed_id = %data.composed_id,
                    error = %err,
                    "delayed event relay failed"
                );
            }
        }
    }
}

#[async_trait]
impl DelayedEventScheduler for AlarmScheduler {
    async fn schedule(
        &self,
        source: &dyn MachineHandle,
        target: &dyn MachineHandle,
        event: Value,
        delay_ms: i64,
        event_key: Option<&str>,
    ) -> RuntimeResult<()> {
        let key = event_key.map_or_else(Self::synthesize_event_key, str::to_string);
        let composed_id = Self::composed_id(source.session_id(), &key);
        let alarm_id = Self::alarm_id(&composed_id);
        let now = self.manager.now_ms();

        self.index.write().await.insert(
            composed_id.clone(),
            ScheduledEventRef {
                source_session_id: source.session_id().to_string(),
                target_session_id: target.session_id().to_string(),
                event: event.clone(),
                delay_ms,
                started_at_ms: now,
            },
        );

        let data = XStateAlarmData {
            event_type: AlarmKind::MachineDelay.as_tag().to_string(),
            source_session_id: source.session_id().to_string(),
            target_session_id: target.session_id().to_string(),
            event,
            composed_id: composed_id.clone(),
            alarm_id: alarm_id.clone(),
            delay: delay_ms,
            started_at: now,
        };
        let payload = serde_json::to_value(&data)
            .map_err(|err| Error::json_encode_failed(err.to_string()))?;

        let request = ScheduleRequest::new(alarm_id.clone(), AlarmKind::MachineDelay, now + delay_ms)
            .with_payload(payload);
        if let Err(err) = self.manager.schedule(request).await {
            error!(alarm_id = %alarm_id, error = %err, "failed to persist delayed event");
            self.index.write().await.remove(&composed_id);
            return Err(err);
        }
        Ok(())
    }

    async fn cancel(&self, source: &dyn MachineHandle, event_key: &str) -> RuntimeResult<()> {
        let composed_id = Self::composed_id(source.session_id(), event_key);
        self.index.write().await.remove(&composed_id);
        self.manager.cancel(&Self::alarm_id(&composed_id)).await
    }

    async fn cancel_all(&self, actor: &dyn MachineHandle) -> RuntimeResult<()> {
        let composed_ids: Vec<String> = {
            let mut index = self.index.write().await;
            let matching: Vec<String> = index
                .iter()
                .filter(|(_, entry)| entry.source_session_id == actor.session_id())
                .map(|(composed_id, _)| composed_id.clone())
                .collect();
            for composed_id in &matching {
                index.remove(composed_id);
            }
            matching
        };

        for composed_id in composed_ids {
            self.manager.cancel(&Self::alarm_id(&composed_id)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::alarms::AlarmStore;
    use crate::error::{RuntimeError, StorageError};
    use crate::machine::SendOnlySystem;
    use crate::platform::{Clock, ManualClock, MemoryWakeupSlot, SqliteStorage, WakeupSlot};

    struct MockMachine {
        session_id: String,
        received: Mutex<Vec<Value>>,
    }

    impl MockMachine {
        fn new(session_id: &str) -> Self {
            Self {
                session_id: session_id.to_string(),
                received: Mutex::new(Vec::new()),
            }
        }

        fn received(&self) -> Vec<Value> {
            match self.received.lock() {
                Ok(events) => events.clone(),
                Err(_) => panic!("event log poisoned"),
            }
        }
    }

    impl MachineHandle for MockMachine {
        fn session_id(&self) -> &str {
            &self.session_id
        }

        fn send(&self, event: Value) -> burrow_core::Result<()> {
            match self.received.lock() {
                Ok(mut events) => {
                    events.push(event);
                    Ok(())
                }
                Err(_) => Err(Error::delivery_failed(&self.session_id, "event log poisoned")),
            }
        }
    }

    /// System whose relay accepts everything and records it.
    struct RelaySystem {
        relayed: Mutex<Vec<Value>>,
    }

    impl RelaySystem {
        fn new() -> Self {
            Self {
                relayed: Mutex::new(Vec::new()),
            }
        }

        fn relayed(&self) -> Vec<Value> {
            match self.relayed.lock() {
                Ok(events) => events.clone(),
                Err(_) => panic!("relay log poisoned"),
            }
        }
    }

    impl MachineSystem for RelaySystem {
        fn relay(
            &self,
            _source: &dyn MachineHandle,
            _target: &dyn MachineHandle,
            event: Value,
        ) -> RelayOutcome {
            match self.relayed.lock() {
                Ok(mut events) => {
                    events.push(event);
                    RelayOutcome::Delivered
                }
                Err(_) => RelayOutcome::Failed(Error::Unknown("relay log poisoned".to_string())),
            }
        }
    }

    fn scheduler_with(system: Arc<dyn MachineSystem>) -> (AlarmScheduler, Arc<AlarmManager>) {
        let storage = match SqliteStorage::open_in_memory() {
            Ok(s) => s,
            Err(e) => panic!("in-memory open should succeed: {e}"),
        };
        let manager = Arc::new(AlarmManager::new(
            AlarmStore::new(Arc::new(storage)),
            Arc::new(MemoryWakeupSlot::new()) as Arc<dyn WakeupSlot>,
            Arc::new(ManualClock::new(1_000)) as Arc<dyn Clock>,
        ));
        (
            AlarmScheduler::new(Arc::clone(&manager), system),
            manager,
        )
    }

    fn scheduler() -> (AlarmScheduler, Arc<AlarmManager>) {
        scheduler_with(Arc::new(SendOnlySystem))
    }

    #[tokio::test]
    async fn test_schedule_forms_the_derived_alarm_id() {
        let (adapter, manager) = scheduler();
        let source = MockMachine::new("s1");

        let scheduled = adapter
            .schedule(&source, &source, serde_json::json!({"type": "TICK"}), 500, Some("after.500"))
            .await;
        assert!(scheduled.is_ok());

        match manager.list_pending().await {
            Ok(pending) => {
                assert_eq!(pending.len(), 1);
                assert_eq!(pending[0].id, "xstate-s1.after.500");
                assert_eq!(pending[0].kind, AlarmKind::MachineDelay);
                assert_eq!(pending[0].scheduled_at, 1_500);
            }
            Err(e) => panic!("list should succeed: {e}"),
        }
        assert!(adapter.scheduled_event("s1.after.500").await.is_some());
    }

    #[tokio::test]
    async fn test_schedule_without_key_synthesizes_one() {
        let (adapter, manager) = scheduler();
        let source = MockMachine::new("s1");

        let scheduled = adapter
            .schedule(&source, &source, Value::Null, 100, None)
            .await;
        assert!(scheduled.is_ok());

        assert_eq!(adapter.scheduled_count().await, 1);
        match manager.list_pending().await {
            Ok(pending) => {
                assert_eq!(pending.len(), 1);
                assert!(pending[0].id.starts_with("xstate-s1."));
            }
            Err(e) => panic!("list should succeed: {e}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_removes_row_and_index_entry() {
        let (adapter, manager) = scheduler();
        let source = MockMachine::new("s1");

        let scheduled = adapter
            .schedule(&source, &source, Value::Null, 500, Some("k"))
            .await;
        assert!(scheduled.is_ok());

        let cancelled = adapter.cancel(&source, "k").await;
        assert!(cancelled.is_ok());

        assert_eq!(adapter.scheduled_count().await, 0);
        assert!(matches!(manager.list_pending().await, Ok(p) if p.is_empty()));
    }

    #[tokio::test]
    async fn test_cancel_all_touches_only_the_given_session() {
        let (adapter, manager) = scheduler();
        let mine = MockMachine::new("s1");
        let other = MockMachine::new("s2");

        for (machine, key) in [(&mine, "a"), (&mine, "b"), (&other, "c")] {
            let scheduled = adapter
                .schedule(machine, machine, Value::Null, 500, Some(key))
                .await;
            assert!(scheduled.is_ok());
        }

        let cancelled = adapter.cancel_all(&mine).await;
        assert!(cancelled.is_ok());

        assert_eq!(adapter.scheduled_count().await, 1);
        match manager.list_pending().await {
            Ok(pending) => {
                assert_eq!(pending.len(), 1);
                assert_eq!(pending[0].id, "xstate-s2.c");
            }
            Err(e) => panic!("list should succeed: {e}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_schedule_rolls_back_the_index_entry() {
        let (adapter, _manager) = scheduler();
        let source = MockMachine::new("s1");

        let first = adapter
            .schedule(&source, &source, Value::Null, 500, Some("k"))
            .await;
        assert!(first.is_ok());

        let second = adapter
            .schedule(&source, &source, Value::Null, 900, Some("k"))
            .await;
        assert!(matches!(
            second,
            Err(RuntimeError::Storage(StorageError::DuplicateAlarmId { .. }))
        ));

        // The failed attempt must not leave its overwrite in the index.
        assert_eq!(adapter.scheduled_count().await, 0);
    }

    #[tokio::test]
    async fn test_restore_indexes_only_future_machine_delays() {
        let (adapter, manager) = scheduler();
        let source = MockMachine::new("s1");

        for (key, delay) in [("future", 500), ("past", -100)] {
            let scheduled = adapter
                .schedule(&source, &source, Value::Null, delay, Some(key))
                .await;
            assert!(scheduled.is_ok());
        }

        // Simulate eviction: a fresh adapter with an empty index.
        let fresh = AlarmScheduler::new(Arc::clone(&manager), Arc::new(SendOnlySystem));
        let pending = match manager.list_pending().await {
            Ok(pending) => pending,
            Err(e) => panic!("list should succeed: {e}"),
        };
        let restored = fresh.restore_scheduled_events(&pending).await;

        assert_eq!(restored, 1);
        assert!(fresh.scheduled_event("s1.future").await.is_some());
        assert!(fresh.scheduled_event("s1.past").await.is_none());
    }

    #[tokio::test]
    async fn test_deliver_falls_back_to_send_without_relay() {
        let (adapter, _manager) = scheduler();
        let target = MockMachine::new("s1");
        let scheduled = adapter
            .schedule(&target, &target, serde_json::json!({"type": "TICK"}), 100, Some("k"))
            .await;
        assert!(scheduled.is_ok());

        let data = XStateAlarmData {
            event_type: "xstate-delay".to_string(),
            source_session_id: "s1".to_string(),
            target_session_id: "s1".to_string(),
            event: serde_json::json!({"type": "TICK"}),
            composed_id: "s1.k".to_string(),
            alarm_id: "xstate-s1.k".to_string(),
            delay: 100,
            started_at: 1_000,
        };
        adapter.deliver(&data, &target).await;

        assert_eq!(target.received(), vec![serde_json::json!({"type": "TICK"})]);
        // The index entry goes first, before delivery.
        assert_eq!(adapter.scheduled_count().await, 0);
    }

    #[tokio::test]
    async fn test_deliver_prefers_the_system_relay() {
        let relay = Arc::new(RelaySystem::new());
        let (adapter, _manager) = scheduler_with(Arc::clone(&relay) as Arc<dyn MachineSystem>);
        let target = MockMachine::new("s1");

        let data = XStateAlarmData {
            event_type: "xstate-delay".to_string(),
            source_session_id: "s1".to_string(),
            target_session_id: "s1".to_string(),
            event: serde_json::json!({"type": "GO"}),
            composed_id: "s1.k".to_string(),
            alarm_id: "xstate-s1.k".to_string(),
            delay: 100,
            started_at: 1_000,
        };
        adapter.deliver(&data, &target).await;

        assert_eq!(relay.relayed(), vec![serde_json::json!({"type": "GO"})]);
        assert!(target.received().is_empty());
    }

    #[tokio::test]
    async fn test_payload_round_trips_through_serde() {
        let data = XStateAlarmData {
            event_type: "xstate-delay".to_string(),
            source_session_id: "s1".to_string(),
            target_session_id: "s2".to_string(),
            event: serde_json::json!({"type": "TICK", "n": 3}),
            composed_id: "s1.after.1000".to_string(),
            alarm_id: "xstate-s1.after.1000".to_string(),
            delay: 1_000,
            started_at: 42,
        };

        let value = match serde_json::to_value(&data) {
            Ok(v) => v,
            Err(e) => panic!("encode should succeed: {e}"),
        };
        assert_eq!(value["type"], "xstate-delay");
        assert_eq!(value["sourceSessionId"], "s1");
        assert_eq!(value["composedId"], "s1.after.1000");

        let back: Result<XStateAlarmData, _> = serde_json::from_value(value);
        assert!(matches!(back, Ok(parsed) if parsed == data));
    }
}
