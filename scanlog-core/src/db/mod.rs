//! Database layer for scanlog
//!
//! This module provides the scan record store using SQLite with:
//! - Schema migrations
//! - Lifecycle-checked status updates
//! - Startup recovery of interrupted sync attempts

pub mod repo;
pub mod schema;

pub use repo::{Database, StatusCounts, SyncAttemptLog};
