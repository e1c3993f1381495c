//! scanlog - offline-first scan capture and sync for Scanner Logistique
//!
//! Commands:
//! - `capture`: validate a decode and store it as a pending scan
//! - `status` / `list`: inspect the local queue
//! - `sync`: send everything pending now, then exit
//! - `run`: keep syncing in the background (optionally capturing from stdin)
//! - `resolve`: decide what happens to a conflicted or failed scan
//! - `purge`: drop confirmed scans past retention
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/scanlog/scans.db (~/.local/share/scanlog/scans.db)
//! - Logs: $XDG_STATE_HOME/scanlog/ (~/.local/state/scanlog/)
//! - Config: $XDG_CONFIG_HOME/scanlog/config.toml (~/.config/scanlog/config.toml)

mod daemon;
mod process_lock;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use scanlog_core::format::{format_relative_time, short_id};
use scanlog_core::sync::DrainSummary;
use scanlog_core::{
    conflict, AttemptOutcome, CapturePipeline, Config, ConnectivityMonitor, ConnectivityState,
    Database, HttpScanApi, ManualAction, RawDecode, ScanRecord, ScanStatus, SyncEngine,
};

use crate::process_lock::acquire_sync_guard;

#[derive(Parser)]
#[command(name = "scanlog")]
#[command(about = "Offline-first scan capture and sync")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a decoded barcode as a pending scan
    Capture {
        /// Decoded content
        content: String,

        /// Symbology reported by the decoder (e.g. ean13, code128, qr)
        #[arg(short = 't', long)]
        symbology: Option<String>,

        /// Capture session, e.g. a picking round
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Show configuration, queue counts and the last sync attempt
    Status,

    /// List stored scans, newest first
    List {
        /// Only scans in this status
        #[arg(long, conflicts_with = "attention")]
        status: Option<ScanStatus>,

        /// Only conflicted and failed scans
        #[arg(long)]
        attention: bool,

        /// Maximum number of scans
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Send all pending scans now, then exit
    Sync,

    /// Sync in the background until Ctrl+C
    Run {
        /// Capture one decode per stdin line (`CONTENT` or `SYMBOLOGY<TAB>CONTENT`)
        #[arg(long)]
        stdin: bool,
    },

    /// Resolve a conflicted or failed scan
    #[command(group(ArgGroup::new("action").required(true).args(["retry", "accept"])))]
    Resolve {
        /// Scan id
        id: String,

        /// Queue the scan for another sync attempt
        #[arg(long)]
        retry: bool,

        /// Accept the server's state (conflicted scans only)
        #[arg(long)]
        accept: bool,
    },

    /// Delete confirmed scans older than the retention window
    Purge {
        /// Override `sync.retention_hours`
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        scanlog_core::logging::init(&config.logging).context("failed to initialize logging")?;

    match args.command {
        Command::Capture {
            content,
            symbology,
            session,
        } => cmd_capture(&config, content, symbology, session),
        Command::Status => cmd_status(&config),
        Command::List {
            status,
            attention,
            limit,
            json,
        } => cmd_list(status, attention, limit, json),
        Command::Sync => cmd_sync(&config),
        Command::Run { stdin } => daemon::run(&config, stdin),
        Command::Resolve { id, accept, .. } => {
            // clap guarantees exactly one of --retry / --accept
            let action = if accept {
                ManualAction::AcceptServer
            } else {
                ManualAction::Retry
            };
            cmd_resolve(&id, action)
        }
        Command::Purge { older_than_hours } => cmd_purge(&config, older_than_hours),
    }
}

/// Open the store at its XDG path and bring the schema up to date
fn open_database() -> Result<Arc<Database>> {
    let db_path = Config::database_path();
    tracing::debug!(path = %db_path.display(), "Opening database");

    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    Ok(Arc::new(db))
}

fn require_api(config: &Config) -> Result<()> {
    if !config.api.is_ready() {
        anyhow::bail!(
            "api.base_url is not configured (set it in {} or SCANLOG_API_BASE_URL)",
            Config::config_path().display()
        );
    }
    Ok(())
}

fn cmd_capture(
    config: &Config,
    content: String,
    symbology: Option<String>,
    session: Option<String>,
) -> Result<()> {
    let db = open_database()?;
    let device_id = config.device_id().context("failed to resolve device id")?;
    let pipeline = CapturePipeline::new(db.clone(), device_id, config.capture.clone());

    let mut raw = RawDecode::new(content);
    raw.symbology = symbology;
    raw.session_id = session;

    let record = pipeline.capture(raw).context("scan refused")?;

    println!(
        "Captured {}  {}",
        short_id(&record.id),
        record.payload.content
    );
    println!("Pending sync: {}", db.pending_sync_count()?);
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let db = open_database()?;

    println!("Scanner Logistique");
    println!("==================");
    println!();
    println!(
        "Device:    {}",
        config.device_id().context("failed to resolve device id")?
    );
    println!(
        "Server:    {}",
        config.api.base_url.as_deref().unwrap_or("(not configured)")
    );
    println!("Database:  {}", Config::database_path().display());
    println!(
        "Logs:      {} (today: {})",
        Config::log_dir().display(),
        scanlog_core::logging::log_file_path().display()
    );

    let counts = db.count_by_status()?;
    println!();
    println!("Pending sync: {}", counts.pending_sync());
    println!("  Pending:    {}", counts.pending);
    println!("  Syncing:    {}", counts.syncing);
    println!("  Confirmed:  {}", counts.confirmed);
    println!("  Conflicted: {}", counts.conflicted);
    println!("  Failed:     {}", counts.failed);

    println!();
    match db.last_sync_attempt()? {
        Some(attempt) => {
            print!(
                "Last sync: {} ({}, {} scan(s)",
                format_relative_time(attempt.started_at),
                attempt.outcome,
                attempt.batch_size
            );
            if let Some(error) = &attempt.error_message {
                print!(", {}", error);
            }
            println!(")");
        }
        None => println!("Last sync: never"),
    }

    if counts.needs_attention() > 0 {
        println!();
        println!(
            "{} scan(s) need attention. Run 'scanlog list --attention' for details.",
            counts.needs_attention()
        );
    }

    Ok(())
}

fn cmd_list(status: Option<ScanStatus>, attention: bool, limit: usize, json: bool) -> Result<()> {
    let db = open_database()?;

    let records = if attention {
        let mut records = db.list_needing_attention()?;
        records.truncate(limit);
        records
    } else if let Some(status) = status {
        db.list_by_status(status, Some(limit))?
    } else {
        db.list_recent(limit)?
    };

    if json {
        for record in &records {
            println!("{}", serde_json::to_string(record)?);
        }
        return Ok(());
    }

    if records.is_empty() {
        println!("No scans.");
        return Ok(());
    }

    println!(
        "{:<10} {:>6} {:<11} {:>4} {:<14} {}",
        "ID", "Seq", "Status", "Try", "Captured", "Content"
    );
    println!("{:-<72}", "");
    for record in &records {
        print_record_row(record);
    }

    Ok(())
}

fn print_record_row(record: &ScanRecord) {
    println!(
        "{:<10} {:>6} {:<11} {:>4} {:<14} {}",
        short_id(&record.id),
        record.seq,
        record.status.as_str(),
        record.attempts,
        format_relative_time(record.payload.captured_at),
        record.payload.content
    );
    if record.status.needs_attention() {
        if let Some(error) = &record.last_error {
            println!("{:<10} {}", "", error);
        }
    }
}

fn cmd_sync(config: &Config) -> Result<()> {
    require_api(config)?;

    let db_path = Config::database_path();
    let _sync_guard = acquire_sync_guard(&db_path).context("failed to acquire process lock")?;

    let db = open_database()?;
    let recovered = db.recover()?;
    if recovered > 0 {
        println!("Recovered {} interrupted scan(s)", recovered);
    }

    let device_id = config.device_id().context("failed to resolve device id")?;
    let api = Arc::new(HttpScanApi::new(&config.api, &device_id)?);

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let summary = runtime.block_on(async {
        let monitor = ConnectivityMonitor::detect(api.as_ref()).await;
        if monitor.current() == ConnectivityState::Offline {
            return Ok::<_, anyhow::Error>(None);
        }

        let mut engine = SyncEngine::new(db.clone(), api.clone(), monitor.subscribe(), config);
        let summary = engine.drain().await.context("sync failed")?;
        Ok(Some(summary))
    })?;

    let counts = db.count_by_status()?;
    match summary {
        None => {
            println!(
                "Server unreachable at {}; {} scan(s) remain pending.",
                api.base_url(),
                counts.pending_sync()
            );
        }
        Some(summary) => print_drain_summary(&summary),
    }

    println!("Pending sync: {}", counts.pending_sync());
    if counts.needs_attention() > 0 {
        println!("Needs attention: {}", counts.needs_attention());
    }
    Ok(())
}

fn print_drain_summary(summary: &DrainSummary) {
    println!("Sync complete:");
    println!("  Batches sent: {}", summary.batches);
    println!("  Confirmed:    {}", summary.report.confirmed);
    println!("  Conflicted:   {}", summary.report.conflicted);
    println!("  Failed:       {}", summary.report.failed);
    if summary.report.requeued > 0 {
        println!("  Requeued:     {}", summary.report.requeued);
    }

    match &summary.stopped_by {
        Some(AttemptOutcome::Retrying { error, .. }) => {
            println!("Stopped early: {}", error);
        }
        Some(AttemptOutcome::Offline) | Some(AttemptOutcome::Suspended { .. }) => {
            println!("Stopped early: connection lost");
        }
        _ => {}
    }
}

fn cmd_resolve(id: &str, action: ManualAction) -> Result<()> {
    let db = open_database()?;
    let status = conflict::resolve_manually(&db, id, action)
        .with_context(|| format!("failed to resolve scan {}", id))?;

    match status {
        ScanStatus::Pending => println!("Scan {} queued for sync", short_id(id)),
        other => println!("Scan {} marked {}", short_id(id), other),
    }
    Ok(())
}

fn cmd_purge(config: &Config, older_than_hours: Option<u64>) -> Result<()> {
    let db = open_database()?;
    let age = older_than_hours
        .map(|hours| Duration::from_secs(hours.saturating_mul(3600)))
        .unwrap_or_else(|| config.sync.retention());

    let purged = db.purge_confirmed_older_than(age)?;
    println!("Purged {} confirmed scan(s)", purged);
    Ok(())
}
