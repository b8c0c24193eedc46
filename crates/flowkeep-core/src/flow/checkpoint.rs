//! Checkpoint manager: the engine's view of the checkpoint store.
//!
//! Wraps a `CheckpointStore` and turns store answers that break engine
//! invariants (a stale sequence accepted or refused, a checkpoint filed
//! under the wrong run, a read that does not return what was just written)
//! into dedicated errors so the state machine can halt on them.

use flowkeep_types::checkpoint::Checkpoint;
use flowkeep_types::error::RepositoryError;
use uuid::Uuid;

use super::error::RunError;
use crate::repository::checkpoint::CheckpointStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Generic over `S: CheckpointStore` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<S: CheckpointStore> {
    store: S,
}

impl<S: CheckpointStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Make `checkpoint` the current checkpoint of its run.
    pub async fn persist(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.store.put(checkpoint).await.map_err(|e| match e {
            RepositoryError::Conflict(detail) => CheckpointError::SequenceConflict {
                run_id: checkpoint.run_id,
                sequence: checkpoint.sequence_number,
                detail,
            },
            other => CheckpointError::Store(other),
        })?;

        tracing::debug!(
            run_id = %checkpoint.run_id,
            seq = checkpoint.sequence_number,
            kind = %checkpoint.kind(),
            "persisted checkpoint"
        );
        Ok(())
    }

    /// Load the current checkpoint of a run.
    pub async fn load(&self, run_id: Uuid) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = self
            .store
            .get(&run_id)
            .await
            .map_err(CheckpointError::Store)?
            .ok_or(CheckpointError::NotFound(run_id))?;

        if checkpoint.run_id != run_id {
            return Err(CheckpointError::Misfiled {
                requested: run_id,
                found: checkpoint.run_id,
            });
        }
        Ok(checkpoint)
    }

    /// Load the checkpoint just written and check it is the one current.
    pub async fn load_written(&self, written: &Checkpoint) -> Result<Checkpoint, CheckpointError> {
        let stored = match self.load(written.run_id).await {
            Err(CheckpointError::NotFound(run_id)) => {
                return Err(CheckpointError::Diverged {
                    run_id,
                    expected: written.sequence_number,
                    found: None,
                });
            }
            other => other?,
        };

        if stored.sequence_number != written.sequence_number {
            return Err(CheckpointError::Diverged {
                run_id: written.run_id,
                expected: written.sequence_number,
                found: Some(stored.sequence_number),
            });
        }

        tracing::debug!(run_id = %stored.run_id, seq = stored.sequence_number, "reloaded checkpoint");
        Ok(stored)
    }

    /// Delete a run's checkpoint. Returns `true` if it existed.
    pub async fn discard(&self, run_id: Uuid) -> Result<bool, CheckpointError> {
        let existed = self
            .store
            .delete(&run_id)
            .await
            .map_err(CheckpointError::Store)?;
        tracing::debug!(run_id = %run_id, existed, "discarded checkpoint");
        Ok(existed)
    }

    pub async fn run_ids(&self) -> Result<Vec<Uuid>, CheckpointError> {
        self.store.list_run_ids().await.map_err(CheckpointError::Store)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint store error: {0}")]
    Store(RepositoryError),

    #[error("run {0} has no checkpoint")]
    NotFound(Uuid),

    /// The store refused a sequence number the engine computed as next.
    #[error("checkpoint {sequence} of run {run_id} conflicts with the stored one: {detail}")]
    SequenceConflict {
        run_id: Uuid,
        sequence: u64,
        detail: String,
    },

    #[error("checkpoint requested for run {requested} belongs to run {found}")]
    Misfiled { requested: Uuid, found: Uuid },

    #[error("run {run_id}: wrote checkpoint {expected} but the store returned {found:?}")]
    Diverged {
        run_id: Uuid,
        expected: u64,
        found: Option<u64>,
    },
}

impl CheckpointError {
    /// Whether this error means the store can no longer be trusted.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            CheckpointError::SequenceConflict { .. }
                | CheckpointError::Misfiled { .. }
                | CheckpointError::Diverged { .. }
        )
    }
}

impl From<CheckpointError> for RunError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Store(e) => RunError::Store(e),
            CheckpointError::NotFound(run_id) => RunError::MissingCheckpoint(run_id),
            violation => RunError::Invariant(violation.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
