//! # scanlog-core
//!
//! Core library for scanlog, the offline-first scan capture and sync engine
//! behind Scanner Logistique.
//!
//! This library provides:
//! - Domain types for scan records and their sync lifecycle
//! - A durable SQLite store that survives restarts and crashes
//! - The capture pipeline that validates decodes and appends records
//! - Connectivity tracking and the background sync engine
//! - Conflict resolution policy
//! - Configuration management and logging infrastructure
//!
//! ## Data flow
//!
//! A decode enters through [`CapturePipeline::capture`] and is persisted as a
//! `Pending` record before the call returns. The [`SyncEngine`] claims pending
//! records in capture order, submits them in batches while the device is
//! online, and writes each server verdict back to the store.
//!
//! ## Example
//!
//! ```rust,no_run
//! use scanlog_core::{CapturePipeline, Config, Database, RawDecode};
//! use std::sync::Arc;
//!
//! let config = Config::load().expect("failed to load config");
//!
//! let db = Arc::new(Database::open(&Config::database_path()).expect("failed to open database"));
//! db.migrate().expect("failed to run migrations");
//!
//! let device_id = config.device_id().expect("failed to resolve device id");
//! let pipeline = CapturePipeline::new(db, device_id, config.capture.clone());
//! pipeline
//!     .capture(RawDecode::new("3017620422003").with_symbology("ean13"))
//!     .expect("scan refused");
//! ```

// Re-export commonly used items at the crate root
pub use capture::CapturePipeline;
pub use config::Config;
pub use conflict::{ConflictResolver, ManualAction, Resolution};
pub use connectivity::{ConnectivityMonitor, ConnectivityProbe, ConnectivityState};
pub use db::{Database, StatusCounts};
pub use error::{CaptureError, Error, Result};
pub use sync::{AttemptOutcome, HttpScanApi, ScanApi, SyncEngine, SyncPhase, SyncWaker};
pub use types::*;

// Public modules
pub mod capture;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod format;
pub mod logging;
pub mod sync;
pub mod types;
