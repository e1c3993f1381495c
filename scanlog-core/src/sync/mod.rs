//! Background synchronization
//!
//! - [`api`]: wire format and the HTTP client for the logistics API
//! - [`backoff`]: retry delay schedule
//! - [`engine`]: the single-flight sync state machine

pub mod api;
pub mod backoff;
pub mod engine;

pub use api::{HttpScanApi, RecordOutcome, RecordResult, ScanApi, ScanSubmission, SubmissionPayload};
pub use backoff::Backoff;
pub use engine::{AttemptOutcome, BatchReport, DrainSummary, SyncEngine, SyncPhase, SyncStats};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Handle used to nudge the sync engine after a capture
///
/// Wakes are coalesced: any number of `wake` calls before the engine looks
/// count as one.
#[derive(Debug, Clone, Default)]
pub struct SyncWaker {
    notify: Arc<Notify>,
    pending: Arc<AtomicBool>,
}

impl SyncWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Consume a pending wake, if there is one
    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Resolve on the next wake, or immediately if one is stored
    pub async fn notified(&self) {
        self.notify.notified().await;
        self.take_pending();
    }
}
