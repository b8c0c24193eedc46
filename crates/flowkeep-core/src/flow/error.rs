//! Error types for flows, runs and the engine API.

use flowkeep_types::error::RepositoryError;
use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionError;

/// Errors raised by flow logic.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The flow refused to continue for a business reason. Never retried.
    #[error("rejected: {0}")]
    Rejected(Box<dyn std::error::Error + Send + Sync>),

    /// The flow asks for another attempt from its last checkpoint.
    #[error("retry requested: {0}")]
    RetryRequested(String),

    /// A received payload was not what the flow expected.
    #[error("unexpected payload: {0}")]
    UnexpectedPayload(String),

    /// The flow state or a payload could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    pub fn rejected(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        FlowError::Rejected(err.into())
    }

    /// The typed rejection, if this is a `Rejected` carrying an `E`.
    pub fn rejection<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            FlowError::Rejected(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Why one attempt at driving a run stopped.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("checkpoint store error: {0}")]
    Store(#[from] RepositoryError),

    /// The checkpointed state did not deserialize into the registered flow.
    #[error("cannot restore flow '{flow_name}': {source}")]
    Restore {
        flow_name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("flow '{0}' is not registered")]
    UnknownFlow(String),

    /// Re-serializing a reloaded flow did not reproduce the stored state.
    #[error("run {run_id} is not deterministic: checkpoint {sequence} changed after reload")]
    Determinism { run_id: Uuid, sequence: u64 },

    #[error("run {0} has no checkpoint")]
    MissingCheckpoint(Uuid),

    #[error("idempotent run {0} has no initial state to restart from")]
    MissingInitialState(Uuid),

    /// The store broke an engine invariant. Halts the engine.
    #[error("engine invariant violated: {0}")]
    Invariant(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("engine halted")]
    Halted,
}

/// Errors returned by the `StateMachine` API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine halted: {0}")]
    Halted(String),

    #[error("engine invariant violated: {0}")]
    InvariantViolation(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {0} is already being driven")]
    RunActive(Uuid),

    #[error("run {0} has already finished")]
    RunFinished(Uuid),

    #[error("run {0} is held for observation")]
    InObservation(Uuid),

    #[error("run {0} is not held for observation")]
    NotInObservation(Uuid),

    #[error("flow '{0}' is not registered")]
    UnregisteredFlow(String),

    #[error("repository error: {0}")]
    Store(#[from] RepositoryError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("rate too high")]
    struct TooHigh;

    #[test]
    fn rejection_downcasts_to_original_error() {
        let err = FlowError::rejected(TooHigh);
        assert!(err.rejection::<TooHigh>().is_some());
        assert_eq!(err.to_string(), "rejected: rate too high");

        let err = FlowError::RetryRequested("later".into());
        assert!(err.rejection::<TooHigh>().is_none());
    }

    #[test]
    fn run_error_display_is_transparent_for_flow_errors() {
        let err = RunError::from(FlowError::RetryRequested("busy".into()));
        assert_eq!(err.to_string(), "retry requested: busy");

        let err = RunError::Determinism {
            run_id: Uuid::nil(),
            sequence: 4,
        };
        assert!(err.to_string().contains("checkpoint 4"));
    }
}
