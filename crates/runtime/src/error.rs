//! Error types for the alarm subsystem.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Query execution failed
    #[error("query failed: {reason}")]
    QueryFailed { reason: String },

    /// Schema bootstrap failed
    #[error("schema bootstrap failed: {reason}")]
    SchemaInitFailed { reason: String },

    /// The engine rejected a statement on a constraint
    #[error("constraint violation: {reason}")]
    ConstraintViolation { reason: String },

    /// An alarm with this id already exists
    #[error("alarm already exists: '{id}'")]
    DuplicateAlarmId { id: String },

    /// A result row could not be decoded into the expected columns
    #[error("failed to decode row: {reason}")]
    RowDecodeFailed { reason: String },

    /// A persisted alarm payload is not valid JSON
    #[error("corrupt payload for alarm '{id}': {reason}")]
    CorruptPayload { id: String, reason: String },

    /// A schedule request violates an alarm invariant
    #[error("invalid alarm: {reason}")]
    InvalidAlarm { reason: String },
}

impl StorageError {
    /// Create a query failed error.
    pub fn query_failed(reason: impl Into<String>) -> Self {
        Self::QueryFailed {
            reason: reason.into(),
        }
    }

    /// Create a schema bootstrap error.
    pub fn schema_init_failed(reason: impl Into<String>) -> Self {
        Self::SchemaInitFailed {
            reason: reason.into(),
        }
    }

    /// Create a constraint violation error.
    pub fn constraint_violation(reason: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            reason: reason.into(),
        }
    }

    /// Create a duplicate alarm id error.
    pub fn duplicate_alarm_id(id: impl Into<String>) -> Self {
        Self::DuplicateAlarmId { id: id.into() }
    }

    /// Create a row decode error.
    pub fn row_decode_failed(reason: impl Into<String>) -> Self {
        Self::RowDecodeFailed {
            reason: reason.into(),
        }
    }

    /// Create a corrupt payload error.
    pub fn corrupt_payload(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptPayload {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid alarm error.
    pub fn invalid_alarm(reason: impl Into<String>) -> Self {
        Self::InvalidAlarm {
            reason: reason.into(),
        }
    }
}

/// The standard Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the alarm manager, adapter, or wakeup path.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A storage operation failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A foundation-level failure (payload encoding, machine collaborator)
    #[error(transparent)]
    Core(#[from] burrow_core::Error),

    /// The platform rejected a wakeup slot request
    #[error("failed to arm wakeup slot: {reason}")]
    WakeupFailed { reason: String },

    /// The hosted machine has not been rehydrated yet
    #[error("machine actor unavailable")]
    MachineUnavailable,
}

impl RuntimeError {
    /// Create a wakeup slot error.
    pub fn wakeup_failed(reason: impl Into<String>) -> Self {
        Self::WakeupFailed {
            reason: reason.into(),
        }
    }
}

/// The standard Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
