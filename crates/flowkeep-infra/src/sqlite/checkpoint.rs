//! SQLite checkpoint store implementation.
//!
//! Implements `CheckpointStore` from `flowkeep-core`. Each row holds the full
//! checkpoint as JSON plus a SHA-256 digest of that JSON; a row whose digest
//! no longer matches is reported as corrupted instead of being restored.

use chrono::{DateTime, Utc};
use flowkeep_core::repository::checkpoint::CheckpointStore;
use flowkeep_types::checkpoint::{Checkpoint, SuspensionKind};
use flowkeep_types::error::RepositoryError;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime};
use crate::crypto::digest::sha256_hex;

/// SQLite-backed implementation of `CheckpointStore`.
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Header fields of every stored checkpoint, oldest run first.
    ///
    /// Reads only the indexed columns, so it works even when a body is
    /// corrupted.
    pub async fn list_summaries(&self) -> Result<Vec<CheckpointSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT run_id, sequence_number, flow_name, suspension_kind, updated_at \
             FROM checkpoints ORDER BY created_at ASC, run_id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                SummaryRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_summary()
            })
            .collect()
    }
}

/// Listing view of a stored checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSummary {
    pub run_id: Uuid,
    pub sequence_number: u64,
    pub flow_name: String,
    pub kind: SuspensionKind,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct CheckpointRow {
    run_id: String,
    sequence_number: i64,
    body: String,
    digest: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            sequence_number: row.try_get("sequence_number")?,
            body: row.try_get("body")?,
            digest: row.try_get("digest")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let actual = sha256_hex(self.body.as_bytes());
        if actual != self.digest {
            return Err(RepositoryError::Corrupted(format!(
                "checkpoint {} digest mismatch (stored {}, computed {})",
                self.run_id,
                short(&self.digest),
                short(&actual)
            )));
        }

        let checkpoint: Checkpoint = serde_json::from_str(&self.body).map_err(|e| {
            RepositoryError::Corrupted(format!("checkpoint {} body: {e}", self.run_id))
        })?;

        if i64::try_from(checkpoint.sequence_number).ok() != Some(self.sequence_number) {
            return Err(RepositoryError::Corrupted(format!(
                "checkpoint {} row sequence {} disagrees with body sequence {}",
                self.run_id, self.sequence_number, checkpoint.sequence_number
            )));
        }
        Ok(checkpoint)
    }
}

struct SummaryRow {
    run_id: String,
    sequence_number: i64,
    flow_name: String,
    suspension_kind: String,
    updated_at: String,
}

impl SummaryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            sequence_number: row.try_get("sequence_number")?,
            flow_name: row.try_get("flow_name")?,
            suspension_kind: row.try_get("suspension_kind")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_summary(self) -> Result<CheckpointSummary, RepositoryError> {
        Ok(CheckpointSummary {
            run_id: parse_run_id(&self.run_id)?,
            sequence_number: u64::try_from(self.sequence_number)
                .map_err(|e| RepositoryError::Query(format!("invalid sequence_number: {e}")))?,
            flow_name: self.flow_name,
            kind: self
                .suspension_kind
                .parse()
                .map_err(RepositoryError::Query)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn parse_run_id(s: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(s).map_err(|e| RepositoryError::Query(format!("invalid run_id: {e}")))
}

fn short(digest: &str) -> &str {
    &digest[..digest.len().min(12)]
}

// ---------------------------------------------------------------------------
// CheckpointStore implementation
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let body = serde_json::to_string(checkpoint)
            .map_err(|e| RepositoryError::Query(format!("failed to serialize checkpoint: {e}")))?;
        let digest = sha256_hex(body.as_bytes());
        let sequence = i64::try_from(checkpoint.sequence_number)
            .map_err(|e| RepositoryError::Query(format!("sequence number too large: {e}")))?;
        let now = format_datetime(&Utc::now());

        // The conditional update makes sequence numbers strictly increasing
        // per run: a stale or duplicate put touches no row.
        let result = sqlx::query(
            r#"INSERT INTO checkpoints
                   (run_id, sequence_number, flow_name, suspension_kind, body, digest, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (run_id) DO UPDATE SET
                   sequence_number = excluded.sequence_number,
                   flow_name = excluded.flow_name,
                   suspension_kind = excluded.suspension_kind,
                   body = excluded.body,
                   digest = excluded.digest,
                   updated_at = excluded.updated_at
               WHERE excluded.sequence_number > checkpoints.sequence_number"#,
        )
        .bind(checkpoint.run_id.to_string())
        .bind(sequence)
        .bind(&checkpoint.flow_name)
        .bind(checkpoint.kind().to_string())
        .bind(&body)
        .bind(&digest)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "run {} already at or past sequence {}",
                checkpoint.run_id, checkpoint.sequence_number
            )));
        }

        tracing::trace!(
            run_id = %checkpoint.run_id,
            sequence = checkpoint.sequence_number,
            kind = %checkpoint.kind(),
            "checkpoint stored"
        );
        Ok(())
    }

    async fn get(&self, run_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(
            "SELECT run_id, sequence_number, body, digest FROM checkpoints WHERE run_id = ?",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let row =
                    CheckpointRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(row.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_run_ids(&self) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = sqlx::query("SELECT run_id FROM checkpoints ORDER BY created_at ASC, run_id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("run_id")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                parse_run_id(&id)
            })
            .collect()
    }
}
