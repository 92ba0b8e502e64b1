//! Core error types for burrow operations using Railway-Oriented Programming.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use thiserror::Error;

/// Core error type for burrow operations.
#[derive(Debug, Error)]
pub enum Error {
    // Payload errors
    #[error("JSON parse error: {reason}")]
    JsonParseFailed { reason: String },

    #[error("JSON encode error: {reason}")]
    JsonEncodeFailed { reason: String },

    // Machine collaborator errors
    #[error("event delivery to session '{session_id}' failed: {reason}")]
    DeliveryFailed { session_id: String, reason: String },

    #[error("machine rehydration failed: {reason}")]
    RehydrationFailed { reason: String },

    // Generic errors
    #[error("invalid record: {reason}")]
    InvalidRecord { reason: String },

    #[error("unknown error: {0}")]
    Unknown(String),

    // Generic I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a JSON parse error.
    pub fn json_parse_failed(reason: impl Into<String>) -> Self {
        Self::JsonParseFailed {
            reason: reason.into(),
        }
    }

    /// Create a JSON encode error.
    pub fn json_encode_failed(reason: impl Into<String>) -> Self {
        Self::JsonEncodeFailed {
            reason: reason.into(),
        }
    }

    /// Create a delivery failure error.
    pub fn delivery_failed(session_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeliveryFailed {
            session_id: session_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a rehydration failure error.
    pub fn rehydration_failed(reason: impl Into<String>) -> Self {
        Self::RehydrationFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid record error.
    pub fn invalid_record(reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            reason: reason.into(),
        }
    }
}
