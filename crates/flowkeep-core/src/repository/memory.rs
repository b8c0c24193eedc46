//! In-memory repository implementations.
//!
//! Used by tests, by the demo and by embedders that do not need durability
//! across process restarts. Backed by `DashMap`, so every operation is
//! synchronous under the hood.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flowkeep_types::checkpoint::Checkpoint;
use flowkeep_types::error::RepositoryError;
use flowkeep_types::hospital::HospitalCase;
use uuid::Uuid;

use super::checkpoint::CheckpointStore;
use super::hospital::HospitalRepository;

// ---------------------------------------------------------------------------
// InMemoryCheckpointStore
// ---------------------------------------------------------------------------

/// `CheckpointStore` over a `DashMap`.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<Uuid, Checkpoint>,
    failing_puts: AtomicU32,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `checkpoint` under `run_id` without any checks.
    ///
    /// Lets tools and tests plant arbitrary (stale, malformed or misfiled)
    /// checkpoints.
    pub fn overwrite(&self, run_id: Uuid, checkpoint: Checkpoint) {
        self.checkpoints.insert(run_id, checkpoint);
    }

    /// Make the next `count` calls to `put` fail with a query error.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        if self.take_injected_failure() {
            return Err(RepositoryError::Query("injected put failure".to_string()));
        }

        match self.checkpoints.entry(checkpoint.run_id) {
            Entry::Occupied(mut current) => {
                let stored = current.get().sequence_number;
                if checkpoint.sequence_number <= stored {
                    return Err(RepositoryError::Conflict(format!(
                        "run {} already at sequence {stored}, refusing {}",
                        checkpoint.run_id, checkpoint.sequence_number
                    )));
                }
                current.insert(checkpoint.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(checkpoint.clone());
            }
        }
        Ok(())
    }

    async fn get(&self, run_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self.checkpoints.get(run_id).map(|cp| cp.clone()))
    }

    async fn delete(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.checkpoints.remove(run_id).is_some())
    }

    async fn list_run_ids(&self) -> Result<Vec<Uuid>, RepositoryError> {
        // UUIDv7 ids sort by creation time.
        let mut ids: Vec<Uuid> = self.checkpoints.iter().map(|e| *e.key()).collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// InMemoryHospitalRepository
// ---------------------------------------------------------------------------

/// `HospitalRepository` over a `DashMap`.
#[derive(Debug, Default)]
pub struct InMemoryHospitalRepository {
    cases: DashMap<Uuid, HospitalCase>,
}

impl InMemoryHospitalRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HospitalRepository for InMemoryHospitalRepository {
    async fn save_case(&self, case: &HospitalCase) -> Result<(), RepositoryError> {
        self.cases.insert(case.run_id, case.clone());
        Ok(())
    }

    async fn get_case(&self, run_id: &Uuid) -> Result<Option<HospitalCase>, RepositoryError> {
        Ok(self.cases.get(run_id).map(|c| c.clone()))
    }

    async fn list_cases(&self) -> Result<Vec<HospitalCase>, RepositoryError> {
        let mut cases: Vec<HospitalCase> = self.cases.iter().map(|e| e.value().clone()).collect();
        cases.sort_by(|a, b| b.admitted_at.cmp(&a.admitted_at));
        Ok(cases)
    }

    async fn delete_case(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.cases.remove(run_id).is_some())
    }
}
