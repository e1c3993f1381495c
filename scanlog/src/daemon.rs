//! `scanlog run`: background sync with an optional stdin capture feed.
//!
//! Runs three tasks on one runtime until Ctrl+C:
//! - the liveness probe feeding the connectivity monitor
//! - the sync engine
//! - a status line printer that follows the engine phase
//!
//! With `--stdin`, each input line is captured while sync keeps running, the
//! way a keyboard-wedge scanner feeds a terminal.

use std::sync::Arc;

use anyhow::{Context, Result};
use scanlog_core::format::short_id;
use scanlog_core::{
    CapturePipeline, Config, ConnectivityMonitor, ConnectivityProbe, Database, HttpScanApi,
    RawDecode, SyncEngine, SyncPhase,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::process_lock::acquire_sync_guard;
use crate::{open_database, require_api};

pub fn run(config: &Config, read_stdin: bool) -> Result<()> {
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

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nShutting down...");
            shutdown.cancel();
        })
        .context("failed to set Ctrl+C handler")?;
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async {
        let monitor = ConnectivityMonitor::detect(api.as_ref()).await;
        println!(
            "Device {} syncing to {} ({}). Press Ctrl+C to stop.",
            device_id,
            api.base_url(),
            monitor.current()
        );

        let engine = SyncEngine::new(db.clone(), api.clone(), monitor.subscribe(), config);
        let pipeline = CapturePipeline::new(db.clone(), device_id.clone(), config.capture.clone())
            .with_waker(engine.waker());
        let mut phases = engine.subscribe_phase();

        let probe_task = {
            let monitor = monitor.clone();
            let probe: Arc<dyn ConnectivityProbe> = api.clone();
            let interval = config.connectivity.probe_interval();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { monitor.run_probe(probe, interval, shutdown).await })
        };

        let status_task = {
            let db = db.clone();
            let mut connectivity = monitor.subscribe();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut last_line = String::new();
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        changed = phases.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        changed = connectivity.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    let phase = *phases.borrow_and_update();
                    let state = *connectivity.borrow_and_update();
                    if phase != SyncPhase::Idle && phase != SyncPhase::Retrying {
                        continue;
                    }
                    let line = status_line(&db, state.as_str(), phase);
                    if line != last_line {
                        println!("{}", line);
                        last_line = line;
                    }
                }
            })
        };

        let engine_task = tokio::spawn(engine.run(shutdown.clone()));

        if read_stdin {
            read_decodes(&pipeline, &shutdown).await?;
        }
        shutdown.cancelled().await;

        let stats = engine_task.await.context("sync engine task failed")?;
        let _ = probe_task.await;
        let _ = status_task.await;

        println!("Sync stopped.");
        println!("  Batches sent: {}", stats.batches_sent);
        println!("  Confirmed:    {}", stats.records_confirmed);
        println!("  Conflicted:   {}", stats.records_conflicted);
        println!("  Failed:       {}", stats.records_failed);
        println!("  Retries:      {}", stats.transient_failures);
        Ok(())
    })
}

fn status_line(db: &Database, connectivity: &str, phase: SyncPhase) -> String {
    match db.count_by_status() {
        Ok(counts) => {
            let mut line = format!(
                "[{}] {} pending sync, {} confirmed",
                connectivity,
                counts.pending_sync(),
                counts.confirmed
            );
            if counts.needs_attention() > 0 {
                line.push_str(&format!(", {} need attention", counts.needs_attention()));
            }
            if phase == SyncPhase::Retrying {
                line.push_str(" (retrying)");
            }
            line
        }
        Err(e) => format!("[{}] status unavailable: {}", connectivity, e),
    }
}

/// Capture stdin lines until EOF or shutdown.
async fn read_decodes(pipeline: &CapturePipeline, shutdown: &CancellationToken) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(line) = line else {
            tracing::debug!("stdin closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match pipeline.capture(parse_line(&line)) {
            Ok(record) => println!("+ {}  {}", short_id(&record.id), record.payload.content),
            Err(e) => eprintln!("! refused: {}", e),
        }
    }

    Ok(())
}

/// `CONTENT` or `SYMBOLOGY<TAB>CONTENT`
fn parse_line(line: &str) -> RawDecode {
    match line.split_once('\t') {
        Some((symbology, content)) if !symbology.trim().is_empty() => {
            RawDecode::new(content).with_symbology(symbology)
        }
        _ => RawDecode::new(line),
    }
}
