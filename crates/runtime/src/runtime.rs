//! Compute-unit runtime wiring and hibernation recovery.
//!
//! A unit hosts exactly one long-lived machine actor. The platform may
//! evict the unit between any two suspension points; on wake, everything
//! volatile is reconstructed from storage before new work is accepted:
//!
//! 1. read actor metadata and the latest snapshot, rehydrate the machine
//! 2. scan persisted machine-delay alarms, rebuild the adapter index
//! 3. rearm the wakeup slot

use std::sync::Arc;

use tracing::{debug, info};

use crate::alarms::{
    ActorMetaRow, AlarmHandler, AlarmKind, AlarmManager, AlarmScheduler, AlarmStore, DrainRecord,
    ScheduleRequest, SnapshotRow, WakeupHandler,
};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult, StorageError};
use crate::machine::{MachineHandle, MachineSystem};
use crate::platform::{Clock, SqlStorage, WakeupSlot};

/// Id of the recurring snapshot-retention alarm.
pub const CACHE_CLEANUP_ALARM_ID: &str = "cache-cleanup";

/// Collaborator that creates the hosted machine from persisted state.
pub trait MachineHost: Send + Sync {
    /// Stable identity of the unit's actor row.
    fn actor_id(&self) -> &str;

    /// Identity of the machine definition being hosted.
    fn machine_id(&self) -> &str;

    /// Rehydrate the machine from metadata and snapshot, or create it
    /// fresh when neither exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the machine cannot be constructed.
    fn rehydrate(
        &self,
        meta: Option<&ActorMetaRow>,
        snapshot: Option<&SnapshotRow>,
    ) -> burrow_core::Result<Arc<dyn MachineHandle>>;
}

struct Hosted {
    machine: Arc<dyn MachineHandle>,
    scheduler: Option<Arc<AlarmScheduler>>,
    wakeup: Option<Arc<WakeupHandler>>,
}

/// One hibernating compute unit: storage, alarm queue, and hosted machine.
pub struct UnitRuntime {
    config: RuntimeConfig,
    manager: Arc<AlarmManager>,
    system: Arc<dyn MachineSystem>,
    host: Arc<dyn MachineHost>,
    user_handler: Option<Arc<dyn AlarmHandler>>,
    hosted: Option<Hosted>,
}

impl UnitRuntime {
    /// Wire a runtime over the host platform capabilities.
    #[must_use]
    pub fn new(
        config: RuntimeConfig,
        sql: Arc<dyn SqlStorage>,
        slot: Arc<dyn WakeupSlot>,
        clock: Arc<dyn Clock>,
        system: Arc<dyn MachineSystem>,
        host: Arc<dyn MachineHost>,
    ) -> Self {
        let store = AlarmStore::new(sql);
        let manager = Arc::new(AlarmManager::new(store, slot, clock));
        Self {
            config,
            manager,
            system,
            host,
            user_handler: None,
            hosted: None,
        }
    }

    /// Register a handler for custom and unknown alarm kinds.
    #[must_use]
    pub fn with_user_handler(mut self, handler: Arc<dyn AlarmHandler>) -> Self {
        self.user_handler = Some(handler);
        self
    }

    /// The alarm manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<AlarmManager> {
        &self.manager
    }

    /// The hosted machine, once recovered.
    #[must_use]
    pub fn machine(&self) -> Option<Arc<dyn MachineHandle>> {
        self.hosted.as_ref().map(|h| Arc::clone(&h.machine))
    }

    /// The timer adapter, once recovered with alarms enabled.
    #[must_use]
    pub fn scheduler(&self) -> Option<Arc<AlarmScheduler>> {
        self.hosted.as_ref().and_then(|h| h.scheduler.clone())
    }

    /// Reconstruct all volatile state from storage.
    ///
    /// Must complete before any new work is accepted. Idempotent: calling
    /// again re-runs the same sequence against current storage.
    ///
    /// # Errors
    ///
    /// Returns an error if storage, rehydration, or rearming fails.
    pub async fn recover(&mut self) -> RuntimeResult<()> {
        let store = self.manager.store().clone();
        let actor_id = self.host.actor_id().to_string();

        let meta = store.get_actor_meta(&actor_id).await?;
        let snapshot = store.latest_snapshot(&actor_id).await?;
        let machine = self.host.rehydrate(meta.as_ref(), snapshot.as_ref())?;
        info!(actor_id = %actor_id, session_id = %machine.session_id(), "machine rehydrated");

        let now = self.manager.now_ms();
        store
            .put_actor_meta(&ActorMetaRow {
                actor_id,
                machine_id: self.host.machine_id().to_string(),
                status: "active".to_string(),
                created_at: now,
                updated_at: now,
            })
            .await?;

        if !self.config.enable_alarms {
            debug!("durable alarms disabled, native machine timer applies");
            self.hosted = Some(Hosted {
                machine,
                scheduler: None,
                wakeup: None,
            });
            return Ok(());
        }

        let scheduler = Arc::new(AlarmScheduler::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.system),
        ));
        let pending = self.manager.list_pending().await?;
        scheduler.restore_scheduled_events(&pending).await;

        let mut wakeup = WakeupHandler::new(
            Arc::clone(&self.manager),
            Arc::clone(&scheduler),
            Arc::clone(&machine),
            self.config.retention_interval_ms,
        );
        if let Some(handler) = &self.user_handler {
            wakeup = wakeup.with_user_handler(Arc::clone(handler));
        }

        self.install_cleanup_alarm(now).await?;
        self.manager.rearm().await?;

        self.hosted = Some(Hosted {
            machine,
            scheduler: Some(scheduler),
            wakeup: Some(Arc::new(wakeup)),
        });
        Ok(())
    }

    /// Entry point for the platform's wakeup firing.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MachineUnavailable`] before recovery;
    /// otherwise any drain failure.
    pub async fn on_wakeup(&self) -> RuntimeResult<Vec<DrainRecord>> {
        let hosted = self.hosted.as_ref().ok_or(RuntimeError::MachineUnavailable)?;
        match &hosted.wakeup {
            Some(wakeup) => wakeup.on_wakeup().await,
            // Alarms disabled: nothing scheduled through the queue.
            None => Ok(Vec::new()),
        }
    }

    /// Persist a machine snapshot, honoring the `persisted` option.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn persist_snapshot(&self, snapshot: &serde_json::Value) -> RuntimeResult<()> {
        if !self.config.persisted {
            return Ok(());
        }
        self.manager
            .store()
            .put_snapshot(&SnapshotRow {
                actor_id: self.host.actor_id().to_string(),
                snapshot: snapshot.to_string(),
                created_at: self.manager.now_ms(),
            })
            .await?;
        Ok(())
    }

    async fn install_cleanup_alarm(&self, now: i64) -> RuntimeResult<()> {
        let interval = self.config.retention_interval_ms;
        let request = ScheduleRequest::new(
            CACHE_CLEANUP_ALARM_ID,
            AlarmKind::CacheCleanup,
            now + interval,
        )
        .with_repeat_interval(interval)
        .with_payload(serde_json::json!({}));

        match self.manager.schedule(request).await {
            // A live row survived hibernation; keep its cadence.
            Err(RuntimeError::Storage(StorageError::DuplicateAlarmId { .. })) => {
                debug!("cleanup alarm already installed");
                Ok(())
            }
            other => other,
        }
    }
}
