//! Outbound transport seam for parties not hosted in this process.

use flowkeep_types::session::SessionMessage;

use super::SessionError;

/// Hands session messages to some other process (network, queue, ...).
///
/// Implementations must not block; they enqueue and return. Messages coming
/// back the other way enter through `SessionHub::inbound`.
pub trait Transport: Send + Sync {
    fn dispatch(&self, message: SessionMessage) -> Result<(), SessionError>;
}
