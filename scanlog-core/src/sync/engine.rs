//! Sync engine
//!
//! Moves `Pending` records to the server in insertion order, one batch at a
//! time:
//!
//! ```text
//! Idle ──► Collecting ──► Sending ──► Applying ──► Idle
//!               │             │
//!               │             └──► Retrying ──(backoff)──► Idle
//!               └──(went offline)──► Idle
//! ```
//!
//! The engine owns every `Pending -> Syncing -> *` transition. Only one
//! batch is ever in flight: `sync_once` takes `&mut self`, and the run loop
//! is a single task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::conflict::{ConflictResolver, Resolution};
use crate::connectivity::ConnectivityState;
use crate::db::{Database, SyncAttemptLog};
use crate::error::{Error, Result};
use crate::format::format_delay;
use crate::types::{RecordId, ScanRecord, ScanStatus};

use super::api::{RecordOutcome, RecordResult, ScanApi, ScanSubmission};
use super::backoff::Backoff;
use super::SyncWaker;

/// Observable engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    /// Claiming the next batch from the store
    Collecting,
    /// Batch submitted, waiting for the server
    Sending,
    /// Writing per-record outcomes back to the store
    Applying,
    /// Last attempt failed transiently; waiting out the backoff delay
    Retrying,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Collecting => "collecting",
            SyncPhase::Sending => "sending",
            SyncPhase::Applying => "applying",
            SyncPhase::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-record outcome counts for one answered batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_size: usize,
    pub confirmed: usize,
    pub conflicted: usize,
    pub failed: usize,
    /// Back to `Pending`: missing from the response or resubmitted by policy
    pub requeued: usize,
}

impl BatchReport {
    fn absorb(&mut self, other: &BatchReport) {
        self.batch_size += other.batch_size;
        self.confirmed += other.confirmed;
        self.conflicted += other.conflicted;
        self.failed += other.failed;
        self.requeued += other.requeued;
    }

    /// Records whose status moved past `Pending`
    pub fn settled(&self) -> usize {
        self.confirmed + self.conflicted + self.failed
    }
}

/// Result of one pass through the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Offline; the store was not touched
    Offline,
    NothingPending,
    /// Connectivity dropped before sending; the batch went back to `Pending`
    Suspended { batch_size: usize },
    Completed(BatchReport),
    /// Transient failure; the batch went back to `Pending`
    Retrying {
        batch_size: usize,
        delay: Duration,
        error: String,
    },
}

/// Totals since the engine was created
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub batches_sent: usize,
    pub records_confirmed: usize,
    pub records_conflicted: usize,
    pub records_failed: usize,
    pub records_requeued: usize,
    pub transient_failures: usize,
    pub purged: usize,
}

/// What `drain` achieved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub batches: usize,
    pub report: BatchReport,
    /// Why draining stopped before the queue was empty
    pub stopped_by: Option<AttemptOutcome>,
}

enum Trigger {
    Shutdown,
    Nudge,
    Connectivity,
    Tick,
}

pub struct SyncEngine {
    db: Arc<Database>,
    api: Arc<dyn ScanApi>,
    resolver: ConflictResolver,
    backoff: Backoff,
    batch_size: usize,
    tick_interval: Duration,
    retention: Duration,
    request_timeout: Duration,
    connectivity: watch::Receiver<ConnectivityState>,
    waker: SyncWaker,
    phase: watch::Sender<SyncPhase>,
    stats: SyncStats,
}

impl SyncEngine {
    pub fn new(
        db: Arc<Database>,
        api: Arc<dyn ScanApi>,
        connectivity: watch::Receiver<ConnectivityState>,
        config: &Config,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            db,
            api,
            resolver: ConflictResolver::new(&config.conflict),
            backoff: Backoff::from_config(&config.sync),
            batch_size: config.sync.batch_size.max(1),
            tick_interval: config.sync.tick_interval(),
            retention: config.sync.retention(),
            request_timeout: config.api.timeout(),
            connectivity,
            waker: SyncWaker::new(),
            phase,
            stats: SyncStats::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Handle for the capture pipeline
    pub fn waker(&self) -> SyncWaker {
        self.waker.clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    fn is_online(&self) -> bool {
        self.connectivity.borrow().is_online()
    }

    fn set_phase(&self, phase: SyncPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::trace!(from = %previous, to = %phase, "Sync phase");
        }
    }

    /// Run one attempt: claim a batch, submit it, apply the answer.
    ///
    /// Transient failures are not errors here; they come back as
    /// [`AttemptOutcome::Retrying`] with the delay to wait. `Err` means the
    /// store failed or the API returned a non-transient error, and the
    /// batch (if any) was put back to `Pending`.
    pub async fn sync_once(&mut self) -> Result<AttemptOutcome> {
        if !self.is_online() {
            return Ok(AttemptOutcome::Offline);
        }

        let started_at = Utc::now();
        let clock = Instant::now();

        let batch = self.collect()?;
        if batch.is_empty() {
            return Ok(AttemptOutcome::NothingPending);
        }
        self.send(batch, started_at, clock).await
    }

    /// Claim the oldest `Pending` records as `Syncing`.
    fn collect(&self) -> Result<Vec<ScanRecord>> {
        self.set_phase(SyncPhase::Collecting);
        match self.db.claim_pending_batch(self.batch_size) {
            Ok(batch) => {
                if batch.is_empty() {
                    self.set_phase(SyncPhase::Idle);
                }
                Ok(batch)
            }
            Err(e) => {
                self.set_phase(SyncPhase::Idle);
                Err(e)
            }
        }
    }

    /// Submit a claimed batch and apply the answer.
    async fn send(
        &mut self,
        mut batch: Vec<ScanRecord>,
        started_at: DateTime<Utc>,
        clock: Instant,
    ) -> Result<AttemptOutcome> {
        let ids: Vec<RecordId> = batch.iter().map(|r| r.id.clone()).collect();

        // Last point where the batch can be abandoned without a network effect
        if !self.is_online() {
            self.db.revert_to_pending(&ids, None)?;
            self.set_phase(SyncPhase::Idle);
            tracing::info!(batch_size = ids.len(), "Went offline before sending, batch suspended");
            self.log_attempt(started_at, clock, ids.len(), "suspended", None, None);
            return Ok(AttemptOutcome::Suspended {
                batch_size: ids.len(),
            });
        }

        self.set_phase(SyncPhase::Sending);
        if let Err(e) = self.db.record_attempt(&ids) {
            self.abandon(&ids, &e);
            return Err(e);
        }
        for record in &mut batch {
            record.attempts += 1;
        }

        let submissions: Vec<ScanSubmission> = batch.iter().map(ScanSubmission::from).collect();
        tracing::debug!(
            batch_size = submissions.len(),
            first_seq = batch[0].seq,
            "Submitting batch"
        );
        self.stats.batches_sent += 1;

        let result =
            match tokio::time::timeout(self.request_timeout, self.api.submit_batch(&submissions))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(self.request_timeout)),
            };

        match result {
            Ok(results) => {
                self.set_phase(SyncPhase::Applying);
                let report = match self.apply(&batch, results) {
                    Ok(report) => report,
                    Err(e) => {
                        self.abandon(&ids, &e);
                        return Err(e);
                    }
                };
                self.record_stats(&report);
                self.log_attempt(started_at, clock, batch.len(), "completed", Some(&report), None);
                self.set_phase(SyncPhase::Idle);

                tracing::info!(
                    batch_size = report.batch_size,
                    confirmed = report.confirmed,
                    conflicted = report.conflicted,
                    failed = report.failed,
                    requeued = report.requeued,
                    "Batch applied"
                );
                Ok(AttemptOutcome::Completed(report))
            }
            Err(e) if e.is_transient() => {
                self.set_phase(SyncPhase::Retrying);
                let message = e.to_string();
                self.db.revert_to_pending(&ids, Some(&message))?;

                let attempts = batch.iter().map(|r| r.attempts).max().unwrap_or(1);
                let delay = self.backoff.delay(attempts);
                self.stats.transient_failures += 1;

                tracing::warn!(
                    batch_size = ids.len(),
                    attempts,
                    retry_in = %format_delay(delay),
                    error = %message,
                    "Sync attempt failed, will retry"
                );
                self.log_attempt(
                    started_at,
                    clock,
                    ids.len(),
                    "retrying",
                    None,
                    Some(message.clone()),
                );
                Ok(AttemptOutcome::Retrying {
                    batch_size: ids.len(),
                    delay,
                    error: message,
                })
            }
            Err(e) => {
                self.abandon(&ids, &e);
                Err(e)
            }
        }
    }

    /// Put a claimed batch back after an unexpected error.
    fn abandon(&self, ids: &[RecordId], error: &Error) {
        let message = error.to_string();
        if let Err(revert_error) = self.db.revert_to_pending(ids, Some(&message)) {
            // Left in Syncing; recovery at next startup picks them up
            tracing::error!(error = %revert_error, "Failed to release batch");
        }
        self.set_phase(SyncPhase::Idle);
        tracing::error!(error = %message, batch_size = ids.len(), "Sync attempt aborted");
        self.log_attempt(Utc::now(), Instant::now(), ids.len(), "aborted", None, Some(message));
    }

    /// Write the server's per-record answers back to the store.
    fn apply(&self, batch: &[ScanRecord], results: Vec<RecordResult>) -> Result<BatchReport> {
        let mut by_id: HashMap<String, RecordResult> =
            results.into_iter().map(|r| (r.id.clone(), r)).collect();
        let mut report = BatchReport {
            batch_size: batch.len(),
            ..Default::default()
        };

        for record in batch {
            let Some(result) = by_id.remove(&record.id) else {
                self.db
                    .revert_to_pending(std::slice::from_ref(&record.id), Some("missing from server response"))?;
                report.requeued += 1;
                continue;
            };

            match result.outcome {
                RecordOutcome::Confirmed => {
                    self.db.update_status(&record.id, ScanStatus::Confirmed, None)?;
                    report.confirmed += 1;
                }
                RecordOutcome::Rejected => {
                    let reason = result
                        .reason
                        .unwrap_or_else(|| "rejected by server".to_string());
                    tracing::warn!(id = %record.id, reason = %reason, "Scan rejected");
                    self.db
                        .update_status(&record.id, ScanStatus::Failed, Some(&reason))?;
                    report.failed += 1;
                }
                RecordOutcome::Conflict => {
                    let info = result.conflict.as_ref();
                    let description = info
                        .map(|i| i.describe())
                        .unwrap_or_else(|| "conflict reported without details".to_string());

                    match self.resolver.resolve(record, info) {
                        Resolution::AcceptServer => {
                            tracing::info!(id = %record.id, "Server already holds scan");
                            self.db.update_status(&record.id, ScanStatus::Confirmed, None)?;
                            report.confirmed += 1;
                        }
                        Resolution::KeepLocal => {
                            tracing::info!(id = %record.id, conflict = %description, "Resubmitting scan");
                            self.db.revert_to_pending(
                                std::slice::from_ref(&record.id),
                                Some(&description),
                            )?;
                            report.requeued += 1;
                        }
                        Resolution::Manual => {
                            tracing::warn!(id = %record.id, conflict = %description, "Scan needs manual resolution");
                            self.db.update_status(
                                &record.id,
                                ScanStatus::Conflicted,
                                Some(&description),
                            )?;
                            report.conflicted += 1;
                        }
                    }
                }
            }
        }

        if !by_id.is_empty() {
            tracing::warn!(
                count = by_id.len(),
                "Server answered for records that were not in the batch"
            );
        }

        Ok(report)
    }

    fn record_stats(&mut self, report: &BatchReport) {
        self.stats.records_confirmed += report.confirmed;
        self.stats.records_conflicted += report.conflicted;
        self.stats.records_failed += report.failed;
        self.stats.records_requeued += report.requeued;
    }

    fn log_attempt(
        &self,
        started_at: DateTime<Utc>,
        clock: Instant,
        batch_size: usize,
        outcome: &str,
        report: Option<&BatchReport>,
        error_message: Option<String>,
    ) {
        let report = report.copied().unwrap_or_default();
        let log = SyncAttemptLog {
            id: 0,
            started_at,
            duration_ms: clock.elapsed().as_millis() as i64,
            batch_size,
            outcome: outcome.to_string(),
            confirmed: report.confirmed,
            conflicted: report.conflicted,
            failed: report.failed,
            requeued: report.requeued,
            error_message,
        };
        if let Err(e) = self.db.insert_sync_attempt(&log) {
            tracing::warn!(error = %e, "Failed to record sync attempt");
        }
    }

    /// Send batches until the queue is empty or an attempt cannot complete.
    ///
    /// Stops early when offline, on a transient failure, or when a batch
    /// settles nothing (every record came back to `Pending`).
    pub async fn drain(&mut self) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();

        loop {
            match self.sync_once().await? {
                AttemptOutcome::NothingPending => break,
                AttemptOutcome::Completed(report) => {
                    summary.batches += 1;
                    summary.report.absorb(&report);
                    if report.settled() == 0 {
                        break;
                    }
                }
                other => {
                    if matches!(other, AttemptOutcome::Retrying { .. }) {
                        self.set_phase(SyncPhase::Idle);
                    }
                    summary.stopped_by = Some(other);
                    break;
                }
            }
        }

        Ok(summary)
    }

    /// Delete `Confirmed` records older than the retention window.
    pub fn purge_expired(&mut self) -> Result<usize> {
        let purged = self.db.purge_confirmed_older_than(self.retention)?;
        if purged > 0 {
            tracing::info!(purged, "Purged confirmed scans past retention");
        }
        self.stats.purged += purged;
        Ok(purged)
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Attempts start on a capture nudge, a transition to online, the end of
    /// a backoff delay, or the periodic tick. During a backoff delay only a
    /// transition to online or shutdown ends the wait early; captures made
    /// meanwhile go out with the next attempt. Errors never stop the loop:
    /// a failed attempt is logged and retried after a backoff delay.
    /// Returns the accumulated stats.
    pub async fn run(mut self, shutdown: CancellationToken) -> SyncStats {
        tracing::info!(
            batch_size = self.batch_size,
            tick = %format_delay(self.tick_interval),
            "Sync engine started"
        );
        let mut retry_delay: Option<Duration> = None;
        let mut consecutive_errors: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Some(delay) = retry_delay.take() {
                let keep_running = self.wait_for_retry(delay, &shutdown).await;
                self.set_phase(SyncPhase::Idle);
                if !keep_running {
                    break;
                }
                continue;
            }

            if self.is_online() {
                match self.sync_once().await {
                    Ok(outcome) => {
                        consecutive_errors = 0;
                        match outcome {
                            AttemptOutcome::Completed(report)
                                if report.batch_size >= self.batch_size
                                    && report.settled() > 0 =>
                            {
                                // Queue may hold more
                                continue;
                            }
                            AttemptOutcome::Retrying { delay, .. } => {
                                retry_delay = Some(delay);
                                continue;
                            }
                            _ => {}
                        }
                    }
                    Err(e) => {
                        consecutive_errors = consecutive_errors.saturating_add(1);
                        let delay = self.backoff.delay(consecutive_errors);
                        tracing::error!(
                            error = %e,
                            consecutive_errors,
                            retry_in = %format_delay(delay),
                            "Sync attempt failed"
                        );
                        retry_delay = Some(delay);
                        continue;
                    }
                }
            }

            let trigger = tokio::select! {
                _ = shutdown.cancelled() => Trigger::Shutdown,
                _ = self.waker.notified() => Trigger::Nudge,
                _ = changed(&mut self.connectivity) => Trigger::Connectivity,
                _ = tokio::time::sleep(self.tick_interval) => Trigger::Tick,
            };

            match trigger {
                Trigger::Shutdown => break,
                Trigger::Nudge | Trigger::Connectivity => {}
                Trigger::Tick => {
                    if let Err(e) = self.purge_expired() {
                        tracing::warn!(error = %e, "Retention purge failed");
                    }
                }
            }
        }

        self.set_phase(SyncPhase::Idle);
        tracing::info!(
            batches = self.stats.batches_sent,
            confirmed = self.stats.records_confirmed,
            "Sync engine stopped"
        );
        self.stats
    }

    /// Sleep out a backoff delay. Returns `false` on shutdown.
    ///
    /// Nudges are absorbed without restarting the timer. Going offline keeps
    /// waiting; coming back online ends the wait.
    async fn wait_for_retry(&mut self, delay: Duration, shutdown: &CancellationToken) -> bool {
        let sleep = tokio::time::sleep_until(tokio::time::Instant::now() + delay);
        tokio::pin!(sleep);

        loop {
            let trigger = tokio::select! {
                _ = shutdown.cancelled() => Trigger::Shutdown,
                _ = &mut sleep => Trigger::Tick,
                _ = self.waker.notified() => Trigger::Nudge,
                _ = changed(&mut self.connectivity) => Trigger::Connectivity,
            };

            match trigger {
                Trigger::Shutdown => return false,
                Trigger::Tick => return true,
                Trigger::Nudge => {
                    tracing::trace!("Capture during backoff, deferred to next attempt");
                }
                Trigger::Connectivity => {
                    if self.is_online() {
                        tracing::debug!("Back online, retrying before backoff ends");
                        return true;
                    }
                }
            }
        }
    }
}

/// Wait for a connectivity change; never resolves once the monitor is gone.
async fn changed(rx: &mut watch::Receiver<ConnectivityState>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConflictConfig;
    use crate::conflict::{ConflictInfo, ConflictKind};
    use crate::connectivity::ConnectivityMonitor;
    use crate::types::{ScanPayload, Symbology};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted server: pops one canned reply per call, confirms by default.
    #[derive(Default)]
    struct ScriptedApi {
        replies: Mutex<VecDeque<Result<Vec<RecordResult>>>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedApi {
        fn push(&self, reply: Result<Vec<RecordResult>>) {
            self.replies.lock().unwrap().push_back(reply);
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ScanApi for ScriptedApi {
        async fn submit_batch(&self, scans: &[ScanSubmission]) -> Result<Vec<RecordResult>> {
            let ids: Vec<String> = scans.iter().map(|s| s.id.clone()).collect();
            self.calls.lock().unwrap().push(ids.clone());
            match self.replies.lock().unwrap().pop_front() {
                Some(reply) => reply,
                None => Ok(ids.into_iter().map(RecordResult::confirmed).collect()),
            }
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.sync.batch_size = 10;
        config.sync.backoff_base_ms = 100;
        config.sync.backoff_max_ms = 1_000;
        config
    }

    fn setup(
        state: ConnectivityState,
    ) -> (Arc<Database>, Arc<ScriptedApi>, ConnectivityMonitor, SyncEngine) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        let api = Arc::new(ScriptedApi::default());
        let monitor = ConnectivityMonitor::new(state);
        let engine = SyncEngine::new(db.clone(), api.clone(), monitor.subscribe(), &config());
        (db, api, monitor, engine)
    }

    fn add(db: &Database, content: &str) -> ScanRecord {
        let record = ScanRecord::new(ScanPayload {
            content: content.to_string(),
            symbology: Some(Symbology::Code128),
            device_id: "dock-1".to_string(),
            session_id: None,
            captured_at: Utc::now(),
        });
        db.append(&record).unwrap();
        record
    }

    #[tokio::test]
    async fn test_offline_does_nothing() {
        let (db, api, _monitor, mut engine) = setup(ConnectivityState::Offline);
        add(&db, "PKG-1");

        assert_eq!(engine.sync_once().await.unwrap(), AttemptOutcome::Offline);
        assert!(api.calls().is_empty());
        assert_eq!(db.count_by_status().unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_batch_is_sent_in_capture_order() {
        let (db, api, _monitor, mut engine) = setup(ConnectivityState::Online);
        let ids: Vec<String> = (0..3).map(|i| add(&db, &format!("PKG-{i}")).id).collect();

        let outcome = engine.sync_once().await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Completed(r) if r.confirmed == 3));
        assert_eq!(api.calls(), vec![ids.clone()]);
        for id in &ids {
            let record = db.get(id).unwrap().unwrap();
            assert_eq!(record.status, ScanStatus::Confirmed);
            assert_eq!(record.attempts, 1);
        }
        assert_eq!(engine.phase(), SyncPhase::Idle);
        assert_eq!(engine.sync_once().await.unwrap(), AttemptOutcome::NothingPending);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_with_backoff() {
        let (db, api, _monitor, mut engine) = setup(ConnectivityState::Online);
        let record = add(&db, "PKG-1");
        api.push(Err(Error::Network("connection reset".to_string())));

        match engine.sync_once().await.unwrap() {
            AttemptOutcome::Retrying { delay, batch_size, .. } => {
                assert_eq!(batch_size, 1);
                assert_eq!(delay, Duration::from_millis(200));
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(engine.phase(), SyncPhase::Retrying);

        let stored = db.get(&record.id).unwrap().unwrap();
        assert_eq!(stored.status, ScanStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert!(stored.last_error.unwrap().contains("connection reset"));

        // Second failure backs off further
        api.push(Err(Error::Api { status: 503, body: String::new() }));
        match engine.sync_once().await.unwrap() {
            AttemptOutcome::Retrying { delay, .. } => assert_eq!(delay, Duration::from_millis(400)),
            other => panic!("expected retry, got {other:?}"),
        }

        engine.sync_once().await.unwrap();
        let stored = db.get(&record.id).unwrap().unwrap();
        assert_eq!(stored.status, ScanStatus::Confirmed);
        assert_eq!(stored.attempts, 3);
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn test_mixed_outcomes() {
        let (db, api, _monitor, mut engine) = setup(ConnectivityState::Online);
        let ok = add(&db, "PKG-1");
        let rejected = add(&db, "PKG-2");
        let duplicate = add(&db, "PKG-3");
        let mismatch = add(&db, "PKG-4");
        let missing = add(&db, "PKG-5");

        api.push(Ok(vec![
            RecordResult::confirmed(&ok.id),
            RecordResult::rejected(&rejected.id, "unknown parcel"),
            RecordResult::conflict(&duplicate.id, ConflictInfo::new(ConflictKind::Duplicate)),
            RecordResult::conflict(&mismatch.id, ConflictInfo::new(ConflictKind::ContentMismatch)),
        ]));

        let report = match engine.sync_once().await.unwrap() {
            AttemptOutcome::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(
            report,
            BatchReport {
                batch_size: 5,
                confirmed: 2,
                conflicted: 1,
                failed: 1,
                requeued: 1,
            }
        );

        let status = |id: &str| db.get(id).unwrap().unwrap().status;
        assert_eq!(status(&ok.id), ScanStatus::Confirmed);
        assert_eq!(status(&rejected.id), ScanStatus::Failed);
        assert_eq!(status(&duplicate.id), ScanStatus::Confirmed);
        assert_eq!(status(&mismatch.id), ScanStatus::Conflicted);
        assert_eq!(status(&missing.id), ScanStatus::Pending);

        // Only the requeued record goes out next time
        engine.sync_once().await.unwrap();
        assert_eq!(api.calls()[1], vec![missing.id.clone()]);
    }

    #[tokio::test]
    async fn test_non_transient_error_releases_batch() {
        let (db, api, _monitor, mut engine) = setup(ConnectivityState::Online);
        add(&db, "PKG-1");
        api.push(Err(Error::Config("bad".to_string())));

        assert!(engine.sync_once().await.is_err());
        assert_eq!(db.count_by_status().unwrap().pending, 1);
        assert_eq!(engine.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_drain_sends_multiple_batches() {
        let (db, api, _monitor, mut engine) = setup(ConnectivityState::Online);
        for i in 0..25 {
            add(&db, &format!("PKG-{i}"));
        }

        let summary = engine.drain().await.unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.report.confirmed, 25);
        assert!(summary.stopped_by.is_none());
        assert_eq!(api.calls().iter().map(Vec::len).collect::<Vec<_>>(), vec![10, 10, 5]);
        assert_eq!(engine.stats().records_confirmed, 25);
    }

    #[tokio::test]
    async fn test_attempt_history_is_recorded() {
        let (db, api, _monitor, mut engine) = setup(ConnectivityState::Online);
        add(&db, "PKG-1");
        api.push(Err(Error::Timeout(Duration::from_secs(1))));

        engine.sync_once().await.unwrap();
        let log = db.last_sync_attempt().unwrap().unwrap();
        assert_eq!(log.outcome, "retrying");
        assert_eq!(log.batch_size, 1);

        engine.sync_once().await.unwrap();
        let log = db.last_sync_attempt().unwrap().unwrap();
        assert_eq!(log.outcome, "completed");
        assert_eq!(log.confirmed, 1);
    }

    #[tokio::test]
    async fn test_run_wakes_on_capture_and_stops_on_shutdown() {
        let (db, api, _monitor, engine) = setup(ConnectivityState::Online);
        let waker = engine.waker();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(engine.run(shutdown.clone()));

        let record = add(&db, "PKG-1");
        waker.wake();

        let deadline = Instant::now() + Duration::from_secs(5);
        while db.get(&record.id).unwrap().unwrap().status != ScanStatus::Confirmed {
            assert!(Instant::now() < deadline, "record was not synced");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.records_confirmed, 1);
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_after_claim_suspends_batch() {
        let (db, api, monitor, mut engine) = setup(ConnectivityState::Online);
        let record = add(&db, "PKG-1");

        let batch = engine.collect().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(db.get(&record.id).unwrap().unwrap().status, ScanStatus::Syncing);

        monitor.report(ConnectivityState::Offline);
        let outcome = engine.send(batch, Utc::now(), Instant::now()).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Suspended { batch_size: 1 });

        assert!(api.calls().is_empty());
        let stored = db.get(&record.id).unwrap().unwrap();
        assert_eq!(stored.status, ScanStatus::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(engine.phase(), SyncPhase::Idle);
        assert_eq!(db.last_sync_attempt().unwrap().unwrap().outcome, "suspended");
    }

    #[tokio::test]
    async fn test_custom_resolver_escalates_stale_conflict() {
        let (db, api, _monitor, engine) = setup(ConnectivityState::Online);
        let mut engine =
            engine.with_resolver(ConflictResolver::new(&ConflictConfig { max_resubmits: 1 }));
        let record = add(&db, "PKG-1");

        let mut info = ConflictInfo::new(ConflictKind::Stale);
        info.server_updated_at = Some(record.payload.captured_at - chrono::Duration::hours(1));
        api.push(Ok(vec![RecordResult::conflict(&record.id, info)]));

        engine.sync_once().await.unwrap();
        // Default policy would resubmit; one allowed attempt is already spent
        assert_eq!(db.get(&record.id).unwrap().unwrap().status, ScanStatus::Conflicted);
    }

    #[tokio::test]
    async fn test_captures_during_backoff_wait_for_the_delay() {
        let mut config = config();
        config.sync.batch_size = 50;
        config.sync.backoff_base_ms = 250;
        config.sync.backoff_max_ms = 5_000;
        let (db, api, monitor, _) = setup(ConnectivityState::Online);
        let engine = SyncEngine::new(db.clone(), api.clone(), monitor.subscribe(), &config);
        for _ in 0..5 {
            api.push(Err(Error::Api {
                status: 503,
                body: "unavailable".to_string(),
            }));
        }
        let waker = engine.waker();
        add(&db, "PKG-0");

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(engine.run(shutdown.clone()));

        // First failure backs off 500ms; nudges inside the window only queue
        for i in 1..=10 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            add(&db, &format!("PKG-{i}"));
            waker.wake();
        }
        assert_eq!(api.calls().len(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while api.calls().len() < 2 {
            assert!(Instant::now() < deadline, "no retry after backoff");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(api.calls()[1].len(), 11);

        shutdown.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(api.calls().len(), 2);
        assert_eq!(stats.transient_failures, 2);
    }

    #[tokio::test]
    async fn test_online_transition_ends_backoff_early() {
        let mut config = config();
        config.sync.backoff_base_ms = 5_000;
        config.sync.backoff_max_ms = 60_000;
        let (db, api, monitor, _) = setup(ConnectivityState::Online);
        let engine = SyncEngine::new(db.clone(), api.clone(), monitor.subscribe(), &config);
        api.push(Err(Error::Network("connection reset".to_string())));
        let record = add(&db, "PKG-1");

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(engine.run(shutdown.clone()));

        let deadline = Instant::now() + Duration::from_secs(5);
        while api.calls().is_empty() {
            assert!(Instant::now() < deadline, "first attempt never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        monitor.report(ConnectivityState::Offline);
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.report(ConnectivityState::Online);

        while db.get(&record.id).unwrap().unwrap().status != ScanStatus::Confirmed {
            assert!(Instant::now() < deadline, "backoff was not cut short");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_survives_non_transient_error() {
        let (db, api, _monitor, engine) = setup(ConnectivityState::Online);
        api.push(Err(Error::Config("disk hiccup".to_string())));
        add(&db, "PKG-1");
        add(&db, "PKG-2");

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(engine.run(shutdown.clone()));

        let deadline = Instant::now() + Duration::from_secs(5);
        while db.count_by_status().unwrap().confirmed < 2 {
            assert!(Instant::now() < deadline, "engine stopped syncing after an error");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_finished());
        assert_eq!(db.pending_sync_count().unwrap(), 0);

        shutdown.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(api.calls().len(), 2);
        assert_eq!(stats.records_confirmed, 2);
    }
}
