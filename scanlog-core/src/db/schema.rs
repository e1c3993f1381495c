//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: scan records
    r#"
    CREATE TABLE IF NOT EXISTS scan_records (
        -- Insertion order; defines capture order for sync batches
        seq              INTEGER PRIMARY KEY AUTOINCREMENT,
        -- Idempotency key sent to the server
        id               TEXT NOT NULL UNIQUE,

        -- Payload
        content          TEXT NOT NULL,
        symbology        TEXT,
        device_id        TEXT NOT NULL,
        session_id       TEXT,
        captured_at      DATETIME NOT NULL,
        fingerprint      TEXT NOT NULL,

        -- Sync state
        status           TEXT NOT NULL DEFAULT 'pending'
                         CHECK (status IN ('pending', 'syncing', 'confirmed', 'conflicted', 'failed')),
        attempts         INTEGER NOT NULL DEFAULT 0,
        last_error       TEXT,

        created_at       DATETIME NOT NULL,
        updated_at       DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_scan_records_status_seq ON scan_records(status, seq);
    CREATE INDEX IF NOT EXISTS idx_scan_records_fingerprint
        ON scan_records(fingerprint, device_id, captured_at);
    "#,
    // Version 2: sync attempt history
    r#"
    CREATE TABLE IF NOT EXISTS sync_attempts (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at       DATETIME NOT NULL,
        duration_ms      INTEGER NOT NULL,
        batch_size       INTEGER NOT NULL,
        outcome          TEXT NOT NULL,
        confirmed        INTEGER NOT NULL DEFAULT 0,
        conflicted       INTEGER NOT NULL DEFAULT 0,
        failed           INTEGER NOT NULL DEFAULT 0,
        requeued         INTEGER NOT NULL DEFAULT 0,
        error_message    TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_sync_attempts_started ON sync_attempts(started_at DESC);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
