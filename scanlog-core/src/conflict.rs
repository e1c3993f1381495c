//! Conflict resolution
//!
//! When the server answers a record with `Conflict`, the resolver decides
//! whether the server's view stands (`AcceptServer`), the local scan is
//! resubmitted (`KeepLocal`), or a person has to decide (`Manual`). Manual
//! cases are never resolved automatically; they wait in `Conflicted` until
//! [`resolve_manually`] is called.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConflictConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{ScanRecord, ScanStatus};

/// What the server found when it refused to apply a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// The scan was already ingested
    Duplicate,
    /// The same physical item is already in a different logistics state
    ContentMismatch,
    /// The server holds newer or older state for the item than this scan
    Stale,
}

/// Conflict details attached to a `Conflict` outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub kind: ConflictKind,
    /// Server-side record the scan collided with
    #[serde(default)]
    pub existing_id: Option<String>,
    /// Fingerprint of the existing record's content
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// Device that produced the existing record
    #[serde(default)]
    pub device_id: Option<String>,
    /// When the server last changed the item's state
    #[serde(default)]
    pub server_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl ConflictInfo {
    pub fn new(kind: ConflictKind) -> Self {
        Self {
            kind,
            existing_id: None,
            fingerprint: None,
            device_id: None,
            server_updated_at: None,
            detail: None,
        }
    }

    /// One-line description stored as the record's `last_error`
    pub fn describe(&self) -> String {
        let mut text = match self.kind {
            ConflictKind::Duplicate => "duplicate of an existing scan".to_string(),
            ConflictKind::ContentMismatch => "item already recorded with different content".to_string(),
            ConflictKind::Stale => "server holds a different state for this item".to_string(),
        };
        if let Some(existing) = &self.existing_id {
            text.push_str(&format!(" (existing {})", existing));
        }
        if let Some(detail) = &self.detail {
            text.push_str(": ");
            text.push_str(detail);
        }
        text
    }
}

/// Decision for a conflicting record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The server already holds this scan; treat it as confirmed
    AcceptServer,
    /// Local scan is newer; send it again
    KeepLocal,
    /// Needs a person
    Manual,
}

/// Default conflict policy
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    max_resubmits: u32,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(&ConflictConfig::default())
    }
}

impl ConflictResolver {
    pub fn new(config: &ConflictConfig) -> Self {
        Self {
            max_resubmits: config.max_resubmits,
        }
    }

    /// Decide what happens to `record` given the server's conflict report.
    ///
    /// `record.attempts` must include the submission that produced the report.
    pub fn resolve(&self, record: &ScanRecord, info: Option<&ConflictInfo>) -> Resolution {
        let Some(info) = info else {
            return Resolution::Manual;
        };

        match info.kind {
            ConflictKind::Duplicate => {
                // Exact duplicate: same logical content from the same source.
                // Absent fields are the server vouching for the match.
                let same_content = info
                    .fingerprint
                    .as_deref()
                    .map_or(true, |fp| fp == record.fingerprint);
                let same_source = info
                    .device_id
                    .as_deref()
                    .map_or(true, |device| device == record.payload.device_id);

                if same_content && same_source {
                    Resolution::AcceptServer
                } else {
                    Resolution::Manual
                }
            }
            ConflictKind::ContentMismatch => Resolution::Manual,
            ConflictKind::Stale => match info.server_updated_at {
                Some(server_at)
                    if server_at < record.payload.captured_at
                        && record.attempts < self.max_resubmits =>
                {
                    Resolution::KeepLocal
                }
                _ => Resolution::Manual,
            },
        }
    }
}

/// Explicit user decisions for records that need attention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualAction {
    /// Put a `Conflicted` or `Failed` record back in the sync queue
    Retry,
    /// Accept the server's state for a `Conflicted` record
    AcceptServer,
}

/// Apply a manual decision. Returns the record's new status.
pub fn resolve_manually(db: &Database, id: &str, action: ManualAction) -> Result<ScanStatus> {
    let record = db
        .get(id)?
        .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;

    let target = match action {
        ManualAction::Retry => ScanStatus::Pending,
        ManualAction::AcceptServer => ScanStatus::Confirmed,
    };

    // Syncing -> Pending is reserved for the engine and recovery
    if !record.status.needs_attention() {
        return Err(Error::InvalidTransition {
            id: id.to_string(),
            from: record.status,
            to: target,
        });
    }

    db.update_status(id, target, None)?;
    tracing::info!(id = %id, from = %record.status, to = %target, ?action, "Manually resolved scan");
    Ok(target)
}
