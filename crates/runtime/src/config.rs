//! Construction-time configuration for the unit runtime.

/// Options recognized when a unit runtime is constructed.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// When false the durable queue is bypassed entirely and the machine
    /// library's native timer applies.
    pub enable_alarms: bool,
    /// Whether machine snapshots are written to storage.
    pub persisted: bool,
    /// Period of the recurring snapshot-retention alarm, in milliseconds.
    pub retention_interval_ms: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enable_alarms: true,
            persisted: true,
            retention_interval_ms: 300_000, // 5 minutes
        }
    }
}

impl RuntimeConfig {
    /// Disable the durable queue.
    #[must_use]
    pub fn without_alarms(mut self) -> Self {
        self.enable_alarms = false;
        self
    }

    /// Set whether snapshots are persisted.
    #[must_use]
    pub fn with_persistence(mut self, persisted: bool) -> Self {
        self.persisted = persisted;
        self
    }

    /// Set the retention sweep period.
    #[must_use]
    pub fn with_retention_interval(mut self, interval_ms: i64) -> Self {
        self.retention_interval_ms = interval_ms;
        self
    }
}
