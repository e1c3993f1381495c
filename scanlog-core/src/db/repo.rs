//! Scan record store
//!
//! Every write below is a single committed statement or transaction by the
//! time the call returns, and the file connection runs with
//! `synchronous = FULL`, so an acknowledged write survives a crash.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const RECORD_COLUMNS: &str = "seq, id, content, symbology, device_id, session_id, captured_at, \
     fingerprint, status, attempts, last_error, created_at, updated_at";

/// Record counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub syncing: i64,
    pub confirmed: i64,
    pub conflicted: i64,
    pub failed: i64,
}

impl StatusCounts {
    /// Records not yet acknowledged by the server (the "pending sync" indicator)
    pub fn pending_sync(&self) -> i64 {
        self.pending + self.syncing
    }

    /// Records waiting for a manual decision
    pub fn needs_attention(&self) -> i64 {
        self.conflicted + self.failed
    }

    pub fn total(&self) -> i64 {
        self.pending + self.syncing + self.confirmed + self.conflicted + self.failed
    }

    fn set(&mut self, status: ScanStatus, count: i64) {
        match status {
            ScanStatus::Pending => self.pending = count,
            ScanStatus::Syncing => self.syncing = count,
            ScanStatus::Confirmed => self.confirmed = count,
            ScanStatus::Conflicted => self.conflicted = count,
            ScanStatus::Failed => self.failed = count,
        }
    }
}

/// One row of sync attempt history.
#[derive(Debug, Clone)]
pub struct SyncAttemptLog {
    /// Row id (0 before insert)
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub batch_size: usize,
    /// `completed`, `retrying` or `suspended`
    pub outcome: String,
    pub confirmed: usize,
    pub conflicted: usize,
    pub failed: usize,
    /// Records sent back to `Pending` (missing from the response or kept local)
    pub requeued: usize,
    pub error_message: Option<String>,
}

/// Database handle (single connection guarded by a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // FULL sync: a committed write is on disk before we acknowledge it
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        super::schema::run_migrations(&conn)
    }

    /// All store operations serialize through this lock.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied write
        // behind (SQLite rolls back uncommitted transactions), so a poisoned
        // lock is still safe to use.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ============================================
    // Record operations
    // ============================================

    /// Append a newly captured record. Fails if the id already exists.
    pub fn append(&self, record: &ScanRecord) -> Result<RecordId> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO scan_records (
                id, content, symbology, device_id, session_id, captured_at,
                fingerprint, status, attempts, last_error, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.id,
                record.payload.content,
                record.payload.symbology.map(|s| s.as_str()),
                record.payload.device_id,
                record.payload.session_id,
                ts(&record.payload.captured_at),
                record.fingerprint,
                record.status.as_str(),
                record.attempts,
                record.last_error,
                ts(&record.created_at),
                ts(&record.updated_at),
            ],
        )?;
        Ok(record.id.clone())
    }

    /// Get a record by id
    pub fn get(&self, id: &str) -> Result<Option<ScanRecord>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {} FROM scan_records WHERE id = ?", RECORD_COLUMNS),
            [id],
            Self::row_to_record,
        )
        .optional()
        .map_err(Error::from)
    }

    /// All `Pending` records, oldest capture first
    pub fn get_pending(&self) -> Result<Vec<ScanRecord>> {
        self.list_by_status(ScanStatus::Pending, None)
    }

    /// Up to `limit` `Pending` records, oldest capture first
    pub fn get_pending_batch(&self, limit: usize) -> Result<Vec<ScanRecord>> {
        self.list_by_status(ScanStatus::Pending, Some(limit))
    }

    /// Select up to `limit` oldest `Pending` records and mark them `Syncing`
    /// in one transaction.
    ///
    /// The returned records already carry the `Syncing` status.
    pub fn claim_pending_batch(&self, limit: usize) -> Result<Vec<ScanRecord>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut records = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM scan_records WHERE status = 'pending' ORDER BY seq ASC LIMIT ?",
                RECORD_COLUMNS
            ))?;
            let rows = stmt.query_map([limit as i64], Self::row_to_record)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let now = Utc::now();
        set_syncing(&tx, records.iter().map(|r| r.id.as_str()), &now)?;
        tx.commit()?;

        for record in &mut records {
            record.status = ScanStatus::Syncing;
            record.updated_at = now;
        }
        Ok(records)
    }

    /// Mark the given `Pending` records `Syncing` in one transaction.
    ///
    /// Ids in any other status are skipped. Returns how many moved.
    pub fn mark_syncing(&self, ids: &[RecordId]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let moved = set_syncing(&tx, ids.iter().map(String::as_str), &Utc::now())?;
        tx.commit()?;
        Ok(moved)
    }

    /// Count one more network submission for each `Syncing` record in `ids`.
    pub fn record_attempt(&self, ids: &[RecordId]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let now = ts(&Utc::now());
            let mut stmt = tx.prepare(
                "UPDATE scan_records SET attempts = attempts + 1, updated_at = ?1
                 WHERE id = ?2 AND status = 'syncing'",
            )?;
            for id in ids {
                stmt.execute(params![now, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Move `Syncing` records back to `Pending`, noting why.
    ///
    /// Records in any other status are left alone. Returns how many moved.
    pub fn revert_to_pending(&self, ids: &[RecordId], error: Option<&str>) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut moved = 0;
        {
            let now = ts(&Utc::now());
            let mut stmt = tx.prepare(
                "UPDATE scan_records
                 SET status = 'pending', last_error = COALESCE(?1, last_error), updated_at = ?2
                 WHERE id = ?3 AND status = 'syncing'",
            )?;
            for id in ids {
                moved += stmt.execute(params![error, now, id])?;
            }
        }
        tx.commit()?;
        Ok(moved)
    }

    /// Change a record's status, enforcing the lifecycle.
    ///
    /// `error` replaces `last_error` when given; confirming a record clears it.
    pub fn update_status(&self, id: &str, status: ScanStatus, error: Option<&str>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM scan_records WHERE id = ?",
                [id],
                |r| r.get(0),
            )
            .optional()?;
        let current = match current {
            Some(s) => parse_status(&s)?,
            None => return Err(Error::RecordNotFound(id.to_string())),
        };

        if !current.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: status,
            });
        }

        tx.execute(
            r#"
            UPDATE scan_records
            SET status = ?1,
                last_error = CASE WHEN ?1 = 'confirmed' THEN NULL ELSE COALESCE(?2, last_error) END,
                updated_at = ?3
            WHERE id = ?4
            "#,
            params![status.as_str(), error, ts(&Utc::now()), id],
        )?;
        tx.commit()?;

        tracing::debug!(id = %id, from = %current, to = %status, "Scan status updated");
        Ok(())
    }

    /// Startup recovery: every record left `Syncing` by a previous process
    /// goes back to `Pending`. Returns how many were reset.
    pub fn recover(&self) -> Result<usize> {
        let conn = self.conn();
        let reset = conn.execute(
            "UPDATE scan_records
             SET status = 'pending',
                 last_error = COALESCE(last_error, 'interrupted sync attempt'),
                 updated_at = ?1
             WHERE status = 'syncing'",
            [ts(&Utc::now())],
        )?;

        if reset > 0 {
            tracing::warn!(reset, "Recovered scan records left in syncing state");
        }
        Ok(reset)
    }

    /// Delete `Confirmed` records whose last update is older than `age`.
    ///
    /// This is the only delete in the store; no other status is ever removed.
    pub fn purge_confirmed_older_than(&self, age: Duration) -> Result<usize> {
        // An age reaching past the earliest representable time matches nothing
        let Some(cutoff) = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let conn = self.conn();
        let purged = conn.execute(
            "DELETE FROM scan_records WHERE status = 'confirmed' AND updated_at < ?1",
            [ts(&cutoff)],
        )?;

        if purged > 0 {
            tracing::info!(purged, "Purged confirmed scan records");
        }
        Ok(purged)
    }

    // ============================================
    // Queries
    // ============================================

    /// Records with the given status in capture order
    pub fn list_by_status(&self, status: ScanStatus, limit: Option<usize>) -> Result<Vec<ScanRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scan_records WHERE status = ?1 ORDER BY seq ASC LIMIT ?2",
            RECORD_COLUMNS
        ))?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![status.as_str(), limit], Self::row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// `Conflicted` and `Failed` records in capture order
    pub fn list_needing_attention(&self) -> Result<Vec<ScanRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scan_records WHERE status IN ('conflicted', 'failed') ORDER BY seq ASC",
            RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Most recently captured records first
    pub fn list_recent(&self, limit: usize) -> Result<Vec<ScanRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scan_records ORDER BY seq DESC LIMIT ?",
            RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map([limit as i64], Self::row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Record counts per status
    pub fn count_by_status(&self) -> Result<StatusCounts> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM scan_records GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((status, count))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            counts.set(parse_status(&status)?, count);
        }
        Ok(counts)
    }

    /// Records not yet acknowledged by the server
    pub fn pending_sync_count(&self) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM scan_records WHERE status IN ('pending', 'syncing')",
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Total records in the store
    pub fn count_records(&self) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM scan_records", [], |r| r.get(0))?;
        Ok(count)
    }

    /// Most recent record from `device_id` with this fingerprint captured at
    /// or after `since`.
    pub fn find_recent_by_fingerprint(
        &self,
        fingerprint: &str,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<RecordId>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id FROM scan_records
             WHERE fingerprint = ?1 AND device_id = ?2 AND captured_at >= ?3
             ORDER BY seq DESC LIMIT 1",
            params![fingerprint, device_id, ts(&since)],
            |r| r.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<ScanRecord> {
        let symbology: Option<String> = row.get("symbology")?;
        let symbology = symbology
            .map(|s| s.parse::<Symbology>().map_err(conversion_error))
            .transpose()?;
        let status: String = row.get("status")?;
        let captured_at: String = row.get("captured_at")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(ScanRecord {
            id: row.get("id")?,
            seq: row.get("seq")?,
            payload: ScanPayload {
                content: row.get("content")?,
                symbology,
                device_id: row.get("device_id")?,
                session_id: row.get("session_id")?,
                captured_at: parse_ts(&captured_at)?,
            },
            fingerprint: row.get("fingerprint")?,
            status: parse_status(&status)?,
            attempts: row.get("attempts")?,
            last_error: row.get("last_error")?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    // ============================================
    // Sync attempt history
    // ============================================

    /// Record one sync attempt
    pub fn insert_sync_attempt(&self, log: &SyncAttemptLog) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO sync_attempts (
                started_at, duration_ms, batch_size, outcome,
                confirmed, conflicted, failed, requeued, error_message
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                ts(&log.started_at),
                log.duration_ms,
                log.batch_size as i64,
                log.outcome,
                log.confirmed as i64,
                log.conflicted as i64,
                log.failed as i64,
                log.requeued as i64,
                log.error_message,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent sync attempt, if any
    pub fn last_sync_attempt(&self) -> Result<Option<SyncAttemptLog>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, started_at, duration_ms, batch_size, outcome,
                    confirmed, conflicted, failed, requeued, error_message
             FROM sync_attempts ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                let started_at: String = row.get(1)?;
                Ok(SyncAttemptLog {
                    id: row.get(0)?,
                    started_at: parse_ts(&started_at)?,
                    duration_ms: row.get(2)?,
                    batch_size: row.get::<_, i64>(3)? as usize,
                    outcome: row.get(4)?,
                    confirmed: row.get::<_, i64>(5)? as usize,
                    conflicted: row.get::<_, i64>(6)? as usize,
                    failed: row.get::<_, i64>(7)? as usize,
                    requeued: row.get::<_, i64>(8)? as usize,
                    error_message: row.get(9)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }
}

fn set_syncing<'a>(
    tx: &rusqlite::Transaction<'_>,
    ids: impl Iterator<Item = &'a str>,
    now: &DateTime<Utc>,
) -> Result<usize> {
    let mut stmt = tx.prepare(
        "UPDATE scan_records SET status = 'syncing', updated_at = ?1
         WHERE id = ?2 AND status = 'pending'",
    )?;
    let now = ts(now);
    let mut moved = 0;
    for id in ids {
        moved += stmt.execute(params![now, id])?;
    }
    Ok(moved)
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(e.to_string()))
}

fn parse_status(s: &str) -> rusqlite::Result<ScanStatus> {
    s.parse::<ScanStatus>().map_err(conversion_error)
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, message.into())
}
