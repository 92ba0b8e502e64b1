//! Dispatch of drained alarms when the platform wakeup slot fires.
//!
//! The handler drains every due alarm through the manager and routes each
//! by kind: machine delays go to the adapter, the internal cleanup tick
//! runs the snapshot retention sweep, and everything else goes to the
//! user handler registered at construction (or is logged and dropped).
//!
//! The platform guarantees a single in-flight wakeup per unit; nothing
//! here re-enters the drain.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::adapter::{AlarmScheduler, XStateAlarmData};
use super::manager::{AlarmHandler, AlarmManager};
use super::{Alarm, AlarmKind, DrainRecord};
use crate::error::{RuntimeResult, StorageError};
use crate::machine::MachineHandle;

/// Routes drained alarms to their handlers.
pub struct WakeupHandler {
    manager: Arc<AlarmManager>,
    scheduler: Arc<AlarmScheduler>,
    machine: Arc<dyn MachineHandle>,
    user_handler: Option<Arc<dyn AlarmHandler>>,
    retention_interval_ms: i64,
}

impl WakeupHandler {
    /// Create a handler for the unit's machine actor.
    #[must_use]
    pub fn new(
        manager: Arc<AlarmManager>,
        scheduler: Arc<AlarmScheduler>,
        machine: Arc<dyn MachineHandle>,
        retention_interval_ms: i64,
    ) -> Self {
        Self {
            manager,
            scheduler,
            machine,
            user_handler: None,
            retention_interval_ms,
        }
    }

    /// Register a handler for custom and unknown alarm kinds.
    #[must_use]
    pub fn with_user_handler(mut self, handler: Arc<dyn AlarmHandler>) -> Self {
        self.user_handler = Some(handler);
        self
    }

    /// Entry point invoked by the platform when the armed slot fires.
    ///
    /// Drains all due alarms, dispatches each, rearms the slot, and
    /// returns the drain records unchanged. Handlers may schedule further
    /// alarms synchronously; those are seen by the closing rearm, not by
    /// this drain. Safe under an empty queue (spurious fires).
    ///
    /// # Errors
    ///
    /// Returns an error only for storage or rearm failures; per-alarm
    /// handler failures are logged and swallowed.
    pub async fn on_wakeup(&self) -> RuntimeResult<Vec<DrainRecord>> {
        self.manager.handle_due(self).await
    }

    async fn sweep_snapshots(&self) -> RuntimeResult<()> {
        let cutoff = self.manager.now_ms() - self.retention_interval_ms;
        self.manager.store().prune_snapshots(cutoff).await?;
        Ok(())
    }
}

#[async_trait]
impl AlarmHandler for WakeupHandler {
    async fn handle(&self, alarm: &Alarm) -> RuntimeResult<()> {
        match &alarm.kind {
            AlarmKind::MachineDelay => {
                let data: XStateAlarmData = serde_json::from_value(alarm.payload.clone())
                    .map_err(|err| {
                        StorageError::corrupt_payload(alarm.id.clone(), err.to_string())
                    })?;
                self.scheduler.deliver(&data, self.machine.as_ref()).await;
                Ok(())
            }
            AlarmKind::CacheCleanup => self.sweep_snapshots().await,
            _ => match &self.user_handler {
                Some(handler) => handler.handle(alarm).await,
                None => {
                    warn!(alarm_id = %alarm.id, kind = %alarm.kind, "no handler for alarm kind, dropping");
                    Ok(())
                }
            },
        }
    }
}
