//! Checkpoint domain types.
//!
//! A `Checkpoint` is the immutable snapshot of one workflow run at a
//! suspension point. The flow's own state is an opaque JSON value; the engine
//! only interprets the header fields and the pending `Suspension`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

use crate::session::{PartyId, SessionId};

/// The kind of suspension a checkpoint was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionKind {
    /// Written by `start`, before any workflow logic ran.
    Initial,
    Send,
    Receive,
    SendAndReceive,
    Sleep,
    /// Final checkpoint retained after completion.
    Completed,
}

impl fmt::Display for SuspensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SuspensionKind::Initial => "initial",
            SuspensionKind::Send => "send",
            SuspensionKind::Receive => "receive",
            SuspensionKind::SendAndReceive => "send_and_receive",
            SuspensionKind::Sleep => "sleep",
            SuspensionKind::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl FromStr for SuspensionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initial" => Ok(SuspensionKind::Initial),
            "send" => Ok(SuspensionKind::Send),
            "receive" => Ok(SuspensionKind::Receive),
            "send_and_receive" => Ok(SuspensionKind::SendAndReceive),
            "sleep" => Ok(SuspensionKind::Sleep),
            "completed" => Ok(SuspensionKind::Completed),
            other => Err(format!("invalid suspension kind: '{other}'")),
        }
    }
}

/// The pending action a run was suspended on.
///
/// Checkpoints are captured before the action's I/O happens, so resuming a
/// run from a checkpoint performs this action again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Suspension {
    Initial,
    Send {
        to: PartyId,
        session: SessionId,
        payload: serde_json::Value,
    },
    Receive {
        from: PartyId,
        session: SessionId,
    },
    SendAndReceive {
        to: PartyId,
        session: SessionId,
        payload: serde_json::Value,
    },
    Sleep {
        until: DateTime<Utc>,
    },
    Completed {
        result: serde_json::Value,
    },
}

impl Suspension {
    pub fn kind(&self) -> SuspensionKind {
        match self {
            Suspension::Initial => SuspensionKind::Initial,
            Suspension::Send { .. } => SuspensionKind::Send,
            Suspension::Receive { .. } => SuspensionKind::Receive,
            Suspension::SendAndReceive { .. } => SuspensionKind::SendAndReceive,
            Suspension::Sleep { .. } => SuspensionKind::Sleep,
            Suspension::Completed { .. } => SuspensionKind::Completed,
        }
    }

    /// The session this suspension talks on, if any.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Suspension::Send { session, .. }
            | Suspension::Receive { session, .. }
            | Suspension::SendAndReceive { session, .. } => Some(*session),
            _ => None,
        }
    }
}

/// Snapshot of a run's complete execution state at one suspension point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    /// 0 for the initial checkpoint, +1 for every persisted checkpoint after it.
    pub sequence_number: u64,
    /// Registry name used to rebuild the flow logic on restore.
    pub flow_name: String,
    pub idempotent: bool,
    /// What the run is waiting on.
    pub suspension: Suspension,
    /// Serialized flow state (locals, step position, constructor parameters).
    pub state: serde_json::Value,
    /// Constructor snapshot, kept only for idempotent runs so they can restart from scratch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<serde_json::Value>,
    /// Sessions the run has used so far, sorted.
    #[serde(default)]
    pub sessions: Vec<SessionId>,
    /// Session this run was started to accept, if another run opened it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_session: Option<SessionId>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build the sequence-0 checkpoint written when a run starts.
    pub fn initial(
        run_id: Uuid,
        flow_name: impl Into<String>,
        idempotent: bool,
        state: serde_json::Value,
    ) -> Self {
        let initial_state = idempotent.then(|| state.clone());
        Self {
            run_id,
            sequence_number: 0,
            flow_name: flow_name.into(),
            idempotent,
            suspension: Suspension::Initial,
            state,
            initial_state,
            sessions: Vec::new(),
            accepted_session: None,
            created_at: Utc::now(),
        }
    }

    /// Mark the run as the acceptor of `session`.
    pub fn accepting(mut self, session: SessionId) -> Self {
        self.accepted_session = Some(session);
        self.sessions = vec![session];
        self
    }

    pub fn kind(&self) -> SuspensionKind {
        self.suspension.kind()
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.suspension, Suspension::Completed { .. })
    }
}
