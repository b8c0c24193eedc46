//! Engine observers.
//!
//! Observers are registered on the `StateMachineBuilder` and live as long
//! as that engine instance. Every callback has a no-op default so an
//! observer only implements what it cares about. Callbacks run inline on
//! the driver task and must return quickly.

use std::sync::Arc;

use uuid::Uuid;

pub trait EngineObserver: Send + Sync {
    /// A run's in-memory state was rebuilt from its current checkpoint.
    fn on_reload_from_checkpoint(&self, _run_id: Uuid) {}

    /// The hospital is holding a run for manual action.
    fn on_kept_for_observation(&self, _run_id: Uuid, _cause: &str) {}

    /// The hospital scheduled retry number `attempt`.
    fn on_retry(&self, _run_id: Uuid, _attempt: u32) {}

    /// A run was discarded and its checkpoint deleted.
    fn on_discarded(&self, _run_id: Uuid, _cause: &str) {}
}

/// Fan-out over the registered observers.
#[derive(Clone, Default)]
pub(crate) struct ObserverSet {
    observers: Vec<Arc<dyn EngineObserver>>,
}

impl ObserverSet {
    pub(crate) fn new(observers: Vec<Arc<dyn EngineObserver>>) -> Self {
        Self { observers }
    }

    pub(crate) fn reloaded(&self, run_id: Uuid) {
        for observer in &self.observers {
            observer.on_reload_from_checkpoint(run_id);
        }
    }

    pub(crate) fn kept_for_observation(&self, run_id: Uuid, cause: &str) {
        for observer in &self.observers {
            observer.on_kept_for_observation(run_id, cause);
        }
    }

    pub(crate) fn retrying(&self, run_id: Uuid, attempt: u32) {
        for observer in &self.observers {
            observer.on_retry(run_id, attempt);
        }
    }

    pub(crate) fn discarded(&self, run_id: Uuid, cause: &str) {
        for observer in &self.observers {
            observer.on_discarded(run_id, cause);
        }
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("len", &self.observers.len())
            .finish()
    }
}
