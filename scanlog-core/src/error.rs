//! Error types for scanlog-core

use std::time::Duration;

use thiserror::Error;

use crate::types::ScanStatus;

/// Main error type for the scanlog-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Raw decode refused by the capture pipeline
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Scan record not found
    #[error("scan record not found: {0}")]
    RecordNotFound(String),

    /// Status change not allowed by the record lifecycle
    #[error("scan record {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ScanStatus,
        to: ScanStatus,
    },

    /// Request never produced a response (DNS, connect, reset)
    #[error("network error: {0}")]
    Network(String),

    /// No response within the per-call timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Server answered with a non-2xx status
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
}

impl Error {
    /// Whether a sync attempt that failed with this error should be retried.
    ///
    /// Every failure of the batch request itself is transient: the whole
    /// batch goes back to `Pending` and the idempotency key covers a request
    /// the server may already have applied.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout(_) | Error::Api { .. }
        )
    }
}

/// Reasons a raw decode is refused before it reaches the store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Empty, malformed or oversized decode
    #[error("invalid scan payload: {0}")]
    InvalidPayload(String),

    /// Same content read again by the same device inside the duplicate window
    #[error("duplicate read of an existing scan ({existing_id})")]
    DuplicateRead { existing_id: String },
}

/// Result type alias for scanlog-core
pub type Result<T> = std::result::Result<T, Error>;
