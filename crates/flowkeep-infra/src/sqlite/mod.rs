//! SQLite storage layer.
//!
//! Checkpoint store and hospital repository backed by SQLite with WAL mode
//! and split read/write connection pools.

use chrono::{DateTime, Utc};
use flowkeep_types::error::RepositoryError;

pub mod checkpoint;
pub mod hospital;
pub mod pool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}
