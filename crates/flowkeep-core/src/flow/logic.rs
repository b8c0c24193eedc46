//! The flow logic trait and the values exchanged with the state machine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowkeep_types::checkpoint::Suspension;
use flowkeep_types::identity::{DigitalSignature, PublicKey};
use flowkeep_types::session::{PartyId, SessionId, SessionMessage};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::error::FlowError;
use crate::identity::SignatureVerifier;

// ---------------------------------------------------------------------------
// FlowLogic
// ---------------------------------------------------------------------------

/// User-supplied business process.
///
/// The implementing struct *is* the flow state: constructor parameters,
/// locals that must survive a suspension and the current step. It is
/// serialized into every checkpoint and rebuilt from it on restore, so
/// anything that cannot be serialized must be `#[serde(skip)]` and
/// re-injected through `FlowRegistry::register_with`.
pub trait FlowLogic: Serialize + DeserializeOwned + Send + 'static {
    /// Stable registry name, stored in checkpoints.
    const NAME: &'static str;

    /// Whether a crashed run may be restarted from scratch instead of
    /// resumed from its last checkpoint.
    fn idempotent(&self) -> bool {
        false
    }

    /// Run the logic up to its next suspension point or completion.
    ///
    /// Must not block; every wait goes through a returned `SuspendOn`.
    fn advance(&mut self, resumed: Resumed, ctx: &FlowContext) -> Result<FlowAction, FlowError>;
}

/// What the flow is being resumed with.
#[derive(Debug, Clone, PartialEq)]
pub enum Resumed {
    /// First call of a run (or of a restarted idempotent run).
    Start,
    /// A `Send` suspension finished.
    Sent,
    /// A `Receive` or `SendAndReceive` suspension got its message.
    Message(SessionMessage),
    /// A `Sleep` suspension elapsed.
    Woke,
}

impl Resumed {
    pub fn into_message(self) -> Result<SessionMessage, FlowError> {
        match self {
            Resumed::Message(message) => Ok(message),
            other => Err(FlowError::UnexpectedPayload(format!(
                "expected a message, resumed with {other:?}"
            ))),
        }
    }

    /// Decode the received message payload as `T`.
    pub fn payload<T: DeserializeOwned>(self) -> Result<T, FlowError> {
        let message = self.into_message()?;
        serde_json::from_value(message.payload)
            .map_err(|e| FlowError::UnexpectedPayload(e.to_string()))
    }
}

/// A suspension point requested by a flow.
#[derive(Debug, Clone, PartialEq)]
pub enum SuspendOn {
    /// Send and continue without waiting for an answer.
    Send {
        to: PartyId,
        session: SessionId,
        payload: serde_json::Value,
    },
    /// Wait for the next message on `session`.
    Receive { from: PartyId, session: SessionId },
    /// Send, then wait for the reply on the same session.
    SendAndReceive {
        to: PartyId,
        session: SessionId,
        payload: serde_json::Value,
    },
    Sleep { duration: Duration },
}

impl SuspendOn {
    /// The persisted form. Sleeps become absolute deadlines so a restored
    /// run does not sleep the full duration again.
    pub fn into_suspension(self, now: DateTime<Utc>) -> Suspension {
        match self {
            SuspendOn::Send { to, session, payload } => Suspension::Send { to, session, payload },
            SuspendOn::Receive { from, session } => Suspension::Receive { from, session },
            SuspendOn::SendAndReceive { to, session, payload } => {
                Suspension::SendAndReceive { to, session, payload }
            }
            SuspendOn::Sleep { duration } => {
                let duration = chrono::Duration::from_std(duration)
                    .unwrap_or_else(|_| chrono::Duration::MAX);
                let until = now.checked_add_signed(duration).unwrap_or(DateTime::<Utc>::MAX_UTC);
                Suspension::Sleep { until }
            }
        }
    }
}

/// Result of one `advance` call.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowAction {
    Suspend {
        on: SuspendOn,
        /// Keep the previous checkpoint current instead of writing one here.
        skip_persisting: bool,
    },
    Complete(serde_json::Value),
}

impl FlowAction {
    pub fn suspend(on: SuspendOn) -> Self {
        FlowAction::Suspend {
            on,
            skip_persisting: false,
        }
    }

    /// Suspend without checkpointing. A crash before the next persisted
    /// suspension replays from the previous checkpoint.
    pub fn suspend_unpersisted(on: SuspendOn) -> Self {
        FlowAction::Suspend {
            on,
            skip_persisting: true,
        }
    }

    pub fn complete<T: Serialize>(result: &T) -> Result<Self, FlowError> {
        Ok(FlowAction::Complete(serde_json::to_value(result)?))
    }
}

// ---------------------------------------------------------------------------
// FlowContext
// ---------------------------------------------------------------------------

/// Engine services available to a flow while it advances.
#[derive(Clone)]
pub struct FlowContext {
    run_id: Uuid,
    party: PartyId,
    verifier: Arc<dyn SignatureVerifier>,
}

impl FlowContext {
    pub fn new(run_id: Uuid, party: PartyId, verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            run_id,
            party,
            verifier,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The party this engine speaks as.
    pub fn party(&self) -> &PartyId {
        &self.party
    }

    /// Allocate a fresh session id. Store it in the flow state before
    /// suspending on it.
    pub fn new_session(&self) -> SessionId {
        SessionId::new()
    }

    pub fn verify(&self, signature: &DigitalSignature, bytes: &[u8], key: &PublicKey) -> bool {
        self.verifier.verify(signature, bytes, key)
    }
}

impl std::fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowContext")
            .field("run_id", &self.run_id)
            .field("party", &self.party)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Type erasure
// ---------------------------------------------------------------------------

/// Object-safe view of a `FlowLogic`, used by the registry and the engine.
pub trait ErasedFlow: Send {
    fn flow_name(&self) -> &'static str;

    fn is_idempotent(&self) -> bool;

    fn step(&mut self, resumed: Resumed, ctx: &FlowContext) -> Result<FlowAction, FlowError>;

    fn snapshot(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<F: FlowLogic> ErasedFlow for F {
    fn flow_name(&self) -> &'static str {
        F::NAME
    }

    fn is_idempotent(&self) -> bool {
        self.idempotent()
    }

    fn step(&mut self, resumed: Resumed, ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        self.advance(resumed, ctx)
    }

    fn snapshot(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
