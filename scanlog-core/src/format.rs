//! Formatting helpers for status output.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Format a timestamp as relative time (e.g., "2m ago").
pub fn format_relative_time(ts: DateTime<Utc>) -> String {
    let now = Utc::now();
    let duration = now.signed_duration_since(ts);

    if duration.num_seconds() < 0 {
        "just now".to_string()
    } else if duration.num_seconds() < 60 {
        format!("{}s ago", duration.num_seconds())
    } else if duration.num_minutes() < 60 {
        format!("{}m ago", duration.num_minutes())
    } else if duration.num_hours() < 24 {
        format!("{}h ago", duration.num_hours())
    } else {
        ts.format("%b %d %H:%M").to_string()
    }
}

/// Format a retry delay compactly ("750ms", "4s", "2m08s").
pub fn format_delay(delay: Duration) -> String {
    let ms = delay.as_millis();
    if ms < 1_000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{}s", delay.as_secs())
    } else {
        let secs = delay.as_secs();
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

/// Shorten a record id for tables (first 8 chars of the UUID).
pub fn short_id(id: &str) -> &str {
    &id[..8.min(id.len())]
}
