//! Run status and terminal outcome types.

use serde::{Deserialize, Serialize};

use std::fmt;

use crate::checkpoint::SuspensionKind;

/// Live status of a workflow run as tracked by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "kind", rename_all = "snake_case")]
pub enum RunStatus {
    /// Executing workflow logic or persisting a checkpoint.
    Running,
    /// Waiting on the I/O of a suspension point.
    Suspended(SuspensionKind),
    /// Admitted to the hospital and waiting for a retry.
    Retrying,
    Completed,
    Discarded,
    /// Held by the hospital pending manual action.
    Observation,
    /// The engine stopped after an invariant violation or shutdown.
    Halted,
}

impl RunStatus {
    /// Whether the run has reached a state that no driver will leave on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::Discarded
                | RunStatus::Observation
                | RunStatus::Halted
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Suspended(kind) => write!(f, "suspended ({kind})"),
            RunStatus::Retrying => write!(f, "retrying"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Discarded => write!(f, "discarded"),
            RunStatus::Observation => write!(f, "observation"),
            RunStatus::Halted => write!(f, "halted"),
        }
    }
}

/// Terminal result of a run, delivered to callers waiting on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { result: serde_json::Value },
    Discarded { cause: String },
    Observation { cause: String },
    Halted,
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Completed { .. } => RunStatus::Completed,
            RunOutcome::Discarded { .. } => RunStatus::Discarded,
            RunOutcome::Observation { .. } => RunStatus::Observation,
            RunOutcome::Halted => RunStatus::Halted,
        }
    }
}
