//! Session messaging types.
//!
//! A session is a logical, ordered conversation between two ends: the
//! initiator that opened it and the acceptor it was opened towards. Every
//! payload travels inside a `SessionMessage` envelope addressed by session
//! id, counterparty name and the sender's role, so two runs of the same
//! party can hold the two ends of one session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

/// Name of a party (node or service) taking part in sessions, e.g. `"oracle"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(pub String);

impl PartyId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartyId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Identifier of one conversation, wrapping a UUID v7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a fresh session id (UUID v7, time-sortable).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Which end of a session a party holds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    /// Opened the session.
    #[default]
    Initiator,
    /// The session was opened towards it.
    Acceptor,
}

impl SessionRole {
    /// The role of the other end.
    pub fn peer(self) -> Self {
        match self {
            SessionRole::Initiator => SessionRole::Acceptor,
            SessionRole::Acceptor => SessionRole::Initiator,
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Initiator => f.write_str("initiator"),
            SessionRole::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// One end of a session: the inbox a party reads in a given role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionEnd {
    pub session: SessionId,
    pub party: PartyId,
    pub role: SessionRole,
}

impl SessionEnd {
    pub fn new(session: SessionId, party: PartyId, role: SessionRole) -> Self {
        Self {
            session,
            party,
            role,
        }
    }

    pub fn initiator(session: SessionId, party: PartyId) -> Self {
        Self::new(session, party, SessionRole::Initiator)
    }

    pub fn acceptor(session: SessionId, party: PartyId) -> Self {
        Self::new(session, party, SessionRole::Acceptor)
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.session, self.role, self.party)
    }
}

/// A payload travelling on a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    /// UUIDv7 message ID, used to drop duplicate deliveries.
    pub id: Uuid,
    /// Conversation this message belongs to.
    pub session: SessionId,
    /// Sending party.
    pub from: PartyId,
    /// Receiving party.
    pub to: PartyId,
    /// Role of the sender; the message lands in the other role's inbox.
    #[serde(default)]
    pub role: SessionRole,
    /// Registry name of the flow that opened the session, set by initiators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiating_flow: Option<String>,
    /// Opaque JSON payload.
    pub payload: serde_json::Value,
    /// When the message was created.
    pub sent_at: DateTime<Utc>,
}

impl SessionMessage {
    /// Build a new envelope, sent by the initiator, with a fresh message id.
    pub fn new(session: SessionId, from: PartyId, to: PartyId, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            session,
            from,
            to,
            role: SessionRole::Initiator,
            initiating_flow: None,
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Build a new envelope sent from `from`.
    pub fn from_end(from: &SessionEnd, to: PartyId, payload: serde_json::Value) -> Self {
        Self::new(from.session, from.party.clone(), to, payload).with_role(from.role)
    }

    pub fn with_role(mut self, role: SessionRole) -> Self {
        self.role = role;
        self
    }

    /// Tag the message with the flow that opened its session.
    pub fn initiated_by(mut self, flow_name: impl Into<String>) -> Self {
        self.initiating_flow = Some(flow_name.into());
        self
    }

    /// The end this message was sent from.
    pub fn sender_end(&self) -> SessionEnd {
        SessionEnd::new(self.session, self.from.clone(), self.role)
    }

    /// The end whose inbox receives this message.
    pub fn receiver_end(&self) -> SessionEnd {
        SessionEnd::new(self.session, self.to.clone(), self.role.peer())
    }
}

/// Notice handed to a responder when a message opens a new session addressed to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOpened {
    pub session: SessionId,
    pub initiator: PartyId,
    /// The party the session was opened towards.
    pub acceptor: PartyId,
    /// Flow that opened the session, when the initiator is a flow run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiating_flow: Option<String>,
}

impl SessionOpened {
    /// The end the responder reads from.
    pub fn acceptor_end(&self) -> SessionEnd {
        SessionEnd::acceptor(self.session, self.acceptor.clone())
    }
}
