//! Capture pipeline
//!
//! Turns a raw decode into a validated [`ScanRecord`] and appends it to the
//! store. One successful `capture` call is exactly one appended record; a
//! refused decode is returned to the caller as a [`CaptureError`] and leaves
//! the store untouched.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use crate::config::CaptureConfig;
use crate::db::Database;
use crate::error::{CaptureError, Result};
use crate::sync::SyncWaker;
use crate::types::{compute_fingerprint, RawDecode, ScanPayload, ScanRecord, Symbology};

/// Validated pieces of a raw decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidDecode {
    pub content: String,
    pub symbology: Option<Symbology>,
}

/// Check a raw decode without touching the store.
pub fn validate_decode(
    raw: &RawDecode,
    max_content_len: usize,
) -> std::result::Result<ValidDecode, CaptureError> {
    let content = raw.content.trim();

    if content.is_empty() {
        return Err(CaptureError::InvalidPayload("empty content".to_string()));
    }
    if content.chars().any(char::is_control) {
        return Err(CaptureError::InvalidPayload(
            "content contains control characters".to_string(),
        ));
    }
    let len = content.chars().count();
    if len > max_content_len {
        return Err(CaptureError::InvalidPayload(format!(
            "content is {} characters, limit is {}",
            len, max_content_len
        )));
    }

    let symbology = match raw.symbology.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(name) => Some(
            name.parse::<Symbology>()
                .map_err(CaptureError::InvalidPayload)?,
        ),
    };

    Ok(ValidDecode {
        content: content.to_string(),
        symbology,
    })
}

/// Validates decodes and appends them to the store
pub struct CapturePipeline {
    db: Arc<Database>,
    device_id: String,
    config: CaptureConfig,
    waker: Option<SyncWaker>,
}

impl CapturePipeline {
    pub fn new(db: Arc<Database>, device_id: impl Into<String>, config: CaptureConfig) -> Self {
        Self {
            db,
            device_id: device_id.into(),
            config,
            waker: None,
        }
    }

    /// Nudge this sync engine after every successful capture
    pub fn with_waker(mut self, waker: SyncWaker) -> Self {
        self.waker = Some(waker);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Validate `raw`, create a `Pending` record and append it.
    pub fn capture(&self, raw: RawDecode) -> Result<ScanRecord> {
        let valid = match validate_decode(&raw, self.config.max_content_len) {
            Ok(valid) => valid,
            Err(e) => {
                tracing::warn!(error = %e, "Refused scan");
                return Err(e.into());
            }
        };

        let captured_at = raw.decoded_at.unwrap_or_else(Utc::now);

        if self.config.duplicate_window_ms > 0 {
            let fingerprint = compute_fingerprint(valid.symbology, &valid.content);
            let window = ChronoDuration::milliseconds(self.config.duplicate_window_ms as i64);
            let since = captured_at - window;
            if let Some(existing_id) =
                self.db
                    .find_recent_by_fingerprint(&fingerprint, &self.device_id, since)?
            {
                tracing::info!(existing_id = %existing_id, "Ignored duplicate read");
                return Err(CaptureError::DuplicateRead { existing_id }.into());
            }
        }

        let session_id = raw
            .session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let record = ScanRecord::new(ScanPayload {
            content: valid.content,
            symbology: valid.symbology,
            device_id: self.device_id.clone(),
            session_id,
            captured_at,
        });

        self.db.append(&record)?;
        // Re-read so the caller sees the store-assigned sequence
        let record = self.db.get(&record.id)?.unwrap_or(record);

        tracing::info!(
            id = %record.id,
            seq = record.seq,
            symbology = ?record.payload.symbology,
            "Captured scan"
        );

        if let Some(waker) = &self.waker {
            waker.wake();
        }

        Ok(record)
    }
}
