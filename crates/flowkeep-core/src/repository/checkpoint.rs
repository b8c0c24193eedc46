//! Checkpoint store trait definition.
//!
//! A durable key-value store holding the current checkpoint of every live
//! run. The infrastructure layer implements it with SQLite; tests use
//! `InMemoryCheckpointStore`.

use std::sync::Arc;

use flowkeep_types::checkpoint::Checkpoint;
use flowkeep_types::error::RepositoryError;
use uuid::Uuid;

/// Storage interface for run checkpoints, keyed by run id.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    /// Replace the current checkpoint of `checkpoint.run_id`.
    ///
    /// Fails with `RepositoryError::Conflict` when the stored checkpoint has
    /// a sequence number greater than or equal to the new one.
    fn put(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get the current checkpoint of a run.
    fn get(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// Delete a run's checkpoint. Returns `true` if it existed.
    fn delete(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Ids of every run with a stored checkpoint, oldest first.
    fn list_run_ids(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;
}

impl<T: CheckpointStore> CheckpointStore for Arc<T> {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        (**self).put(checkpoint).await
    }

    async fn get(&self, run_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        (**self).get(run_id).await
    }

    async fn delete(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        (**self).delete(run_id).await
    }

    async fn list_run_ids(&self) -> Result<Vec<Uuid>, RepositoryError> {
        (**self).list_run_ids().await
    }
}
