//! Point-to-point session messaging between parties.
//!
//! The `SessionHub` holds one FIFO inbox per session end and
//! implements the send / receive / send-and-receive suspension I/O that the
//! state machine performs on behalf of flows.

pub mod hub;
pub mod transport;

use std::time::Duration;

use flowkeep_types::session::{PartyId, SessionId};
use thiserror::Error;

/// Errors raised by session I/O.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A send-and-receive is already outstanding on this session end.
    #[error("session {session} already has an outstanding send_and_receive for {party}")]
    Busy { session: SessionId, party: PartyId },

    /// No message arrived before the configured session timeout.
    #[error("no message on session {session} within {timeout:?}")]
    Timeout { session: SessionId, timeout: Duration },

    /// The inbox was closed while waiting on it.
    #[error("session {0} closed")]
    Closed(SessionId),

    /// The outbound transport refused the message.
    #[error("transport error: {0}")]
    Transport(String),

    /// A payload did not decode into the expected type.
    #[error("unexpected payload on session {session}: {detail}")]
    UnexpectedPayload { session: SessionId, detail: String },
}
