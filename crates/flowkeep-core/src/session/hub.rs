//! Session hub: per-end FIFO inboxes, responders and send-and-receive.
//!
//! Every session has two ends, the initiator's and the acceptor's, and each
//! end owns an inbox. Sending appends to the opposite end's inbox (or hands
//! the message to the `Transport` when the receiver lives elsewhere);
//! receiving pops from the caller's own end and parks on a `Notify` until
//! something arrives. An end may have at most one outstanding
//! `send_and_receive`.
//!
//! Closing a whole session tombstones its id: late or duplicate deliveries
//! are dropped instead of opening fresh inboxes nobody will ever read.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use flowkeep_types::session::{
    PartyId, SessionEnd, SessionId, SessionMessage, SessionOpened, SessionRole,
};
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::SessionError;
use super::transport::Transport;

/// Buffer size for responder session-opened notices.
const RESPONDER_BUFFER: usize = 256;

/// Closed sessions and ends remembered for dropping late deliveries.
const TOMBSTONE_CAPACITY: usize = 4096;

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InboxState {
    queue: VecDeque<SessionMessage>,
    seen: HashSet<Uuid>,
    closed: bool,
}

#[derive(Default)]
struct Inbox {
    state: Mutex<InboxState>,
    arrived: Notify,
    exchanging: AtomicBool,
}

impl Inbox {
    /// Append a message. Returns `false` for a duplicate id.
    fn push(&self, message: SessionMessage) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.seen.insert(message.id) {
                return false;
            }
            state.queue.push_back(message);
        }
        self.arrived.notify_one();
        true
    }

    fn pop(&self, session: SessionId) -> Result<Option<SessionMessage>, SessionError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(message) = state.queue.pop_front() {
            return Ok(Some(message));
        }
        if state.closed {
            return Err(SessionError::Closed(session));
        }
        Ok(None)
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).queue.len()
    }

    fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            state.queue.clear();
        }
        self.arrived.notify_waiters();
    }
}

/// Marks a send-and-receive as outstanding until dropped.
struct ExchangeGuard<'a> {
    inbox: &'a Inbox,
}

impl<'a> ExchangeGuard<'a> {
    fn acquire(inbox: &'a Inbox) -> Option<Self> {
        inbox
            .exchanging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { inbox })
    }
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        self.inbox.exchanging.store(false, Ordering::Release);
    }
}

/// Bounded set of closed keys; the oldest is forgotten first.
struct Tombstones<K> {
    keys: HashSet<K>,
    order: VecDeque<K>,
}

impl<K: Clone + Eq + Hash> Tombstones<K> {
    fn new() -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn bury(&mut self, key: K) {
        if !self.keys.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > TOMBSTONE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }
}

// ---------------------------------------------------------------------------
// SessionHub
// ---------------------------------------------------------------------------

/// Runtime hub for session messaging between in-process parties.
pub struct SessionHub {
    inboxes: DashMap<SessionEnd, Arc<Inbox>>,
    closed_sessions: Mutex<Tombstones<SessionId>>,
    closed_ends: Mutex<Tombstones<SessionEnd>>,
    /// Parties whose inboxes live in this process.
    hosted: DashSet<PartyId>,
    /// Responders notified when a new session is opened towards them.
    responders: DashMap<PartyId, mpsc::Sender<SessionOpened>>,
    transport: Option<Arc<dyn Transport>>,
    receive_timeout: Option<Duration>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self {
            inboxes: DashMap::new(),
            closed_sessions: Mutex::new(Tombstones::new()),
            closed_ends: Mutex::new(Tombstones::new()),
            hosted: DashSet::new(),
            responders: DashMap::new(),
            transport: None,
            receive_timeout: None,
        }
    }

    /// Route messages for non-hosted parties through `transport`.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Fail receives that wait longer than `timeout`.
    pub fn with_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Declare that `party` reads its inboxes from this hub.
    pub fn host(&self, party: PartyId) {
        debug!(%party, "hosting party on session hub");
        self.hosted.insert(party);
    }

    pub fn is_hosted(&self, party: &PartyId) -> bool {
        self.hosted.contains(party)
    }

    /// Host `party` as a responder and return its stream of new sessions.
    ///
    /// A notice is sent whenever a message opens a new acceptor end for the
    /// party. If the party was already registered, the old receiver stops
    /// getting notices.
    pub fn register_responder(&self, party: PartyId) -> mpsc::Receiver<SessionOpened> {
        let (tx, rx) = mpsc::channel(RESPONDER_BUFFER);
        self.host(party.clone());
        self.responders.insert(party.clone(), tx);
        debug!(%party, "registered responder");
        rx
    }

    /// Returns `true` if the party was registered as a responder.
    pub fn unregister_responder(&self, party: &PartyId) -> bool {
        self.hosted.remove(party);
        self.responders.remove(party).is_some()
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send `payload` from the `from` end to `to` without waiting.
    pub fn send(
        &self,
        from: &SessionEnd,
        to: &PartyId,
        payload: serde_json::Value,
    ) -> Result<(), SessionError> {
        self.post(SessionMessage::from_end(from, to.clone(), payload))
    }

    /// Send an already built envelope without waiting.
    pub fn post(&self, message: SessionMessage) -> Result<(), SessionError> {
        match &self.transport {
            Some(transport) if !self.is_hosted(&message.to) => {
                debug!(session = %message.session, to = %message.to, "dispatching via transport");
                transport.dispatch(message)
            }
            _ => {
                self.deliver(message);
                Ok(())
            }
        }
    }

    /// Entry point for messages arriving from a transport.
    ///
    /// Returns `false` when the message was a duplicate or its session is
    /// already closed.
    pub fn inbound(&self, message: SessionMessage) -> bool {
        self.deliver(message)
    }

    fn deliver(&self, message: SessionMessage) -> bool {
        let end = message.receiver_end();
        if self.is_closed(&end) {
            debug!(%end, message_id = %message.id, "dropped message for closed session");
            return false;
        }

        let (inbox, opened) = match self.inboxes.entry(end.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => (entry.insert(Arc::new(Inbox::default())).clone(), true),
        };
        // A close may have raced the insert above.
        if opened && self.is_closed(&end) {
            self.inboxes.remove_if(&end, |_, current| Arc::ptr_eq(current, &inbox));
            debug!(%end, message_id = %message.id, "dropped message for closed session");
            return false;
        }

        let notice = (opened && end.role == SessionRole::Acceptor).then(|| SessionOpened {
            session: end.session,
            initiator: message.from.clone(),
            acceptor: end.party.clone(),
            initiating_flow: message.initiating_flow.clone(),
        });

        let message_id = message.id;
        if !inbox.push(message) {
            debug!(%end, %message_id, "dropped duplicate session message");
            return false;
        }
        debug!(%end, %message_id, "delivered session message");

        if let Some(notice) = notice {
            if let Some(responder) = self.responders.get(&end.party) {
                if let Err(e) = responder.try_send(notice) {
                    warn!(%end, error = %e, "responder did not take session notice");
                }
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Wait for the next message on the `end` inbox.
    pub async fn receive_raw(&self, end: &SessionEnd) -> Result<SessionMessage, SessionError> {
        let inbox = self.inbox(end)?;
        self.next_message(&inbox, end.session).await
    }

    /// Wait for the next message and decode its payload as `T`.
    pub async fn receive<T: DeserializeOwned>(&self, end: &SessionEnd) -> Result<T, SessionError> {
        let message = self.receive_raw(end).await?;
        decode(end.session, message.payload)
    }

    /// Send a request and wait for the reply on the sender's end.
    ///
    /// Fails with `SessionError::Busy`, without sending, if the end already
    /// has an exchange outstanding.
    pub async fn send_and_receive_raw(
        &self,
        from: &SessionEnd,
        to: &PartyId,
        payload: serde_json::Value,
    ) -> Result<SessionMessage, SessionError> {
        self.exchange(SessionMessage::from_end(from, to.clone(), payload))
            .await
    }

    pub async fn send_and_receive<T: DeserializeOwned>(
        &self,
        from: &SessionEnd,
        to: &PartyId,
        payload: serde_json::Value,
    ) -> Result<T, SessionError> {
        let reply = self.send_and_receive_raw(from, to, payload).await?;
        decode(from.session, reply.payload)
    }

    /// `send_and_receive` for an already built envelope.
    pub async fn exchange(&self, request: SessionMessage) -> Result<SessionMessage, SessionError> {
        let end = request.sender_end();
        let inbox = self.inbox(&end)?;
        let _exchange = ExchangeGuard::acquire(&inbox).ok_or_else(|| SessionError::Busy {
            session: end.session,
            party: end.party.clone(),
        })?;

        self.post(request)?;
        self.next_message(&inbox, end.session).await
    }

    async fn next_message(
        &self,
        inbox: &Inbox,
        session: SessionId,
    ) -> Result<SessionMessage, SessionError> {
        let deadline = self
            .receive_timeout
            .map(|timeout| (timeout, Instant::now() + timeout));

        loop {
            // Registered before checking the queue so a concurrent push is not missed.
            let arrived = inbox.arrived.notified();
            if let Some(message) = inbox.pop(session)? {
                return Ok(message);
            }

            match deadline {
                Some((timeout, at)) => {
                    if tokio::time::timeout_at(at, arrived).await.is_err() {
                        return Err(SessionError::Timeout { session, timeout });
                    }
                }
                None => arrived.await,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Close one end, waking any waiter with `Closed`.
    ///
    /// A later message may open the end again. Returns `true` if the end had
    /// an inbox.
    pub fn close(&self, end: &SessionEnd) -> bool {
        match self.inboxes.remove(end) {
            Some((_, inbox)) => {
                inbox.close();
                debug!(%end, "closed session end");
                true
            }
            None => false,
        }
    }

    /// Close one end for good: later messages to it are dropped.
    pub fn retire(&self, end: &SessionEnd) -> bool {
        self.closed_ends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bury(end.clone());
        self.close(end)
    }

    /// Close every end of `session` for good and return how many were open.
    pub fn close_session(&self, session: SessionId) -> usize {
        self.closed_sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bury(session);

        let ends: Vec<SessionEnd> = self
            .inboxes
            .iter()
            .filter(|entry| entry.key().session == session)
            .map(|entry| entry.key().clone())
            .collect();
        let closed = ends.iter().filter(|end| self.close(end)).count();
        if closed > 0 {
            debug!(%session, ends = closed, "closed session");
        }
        closed
    }

    /// Whether deliveries to `end` are being dropped.
    pub fn is_closed(&self, end: &SessionEnd) -> bool {
        self.closed_sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&end.session)
            || self
                .closed_ends
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(end)
    }

    /// Messages queued on `end`.
    pub fn pending(&self, end: &SessionEnd) -> usize {
        self.inboxes.get(end).map(|inbox| inbox.len()).unwrap_or(0)
    }

    /// Number of open session ends.
    pub fn open_ends(&self) -> usize {
        self.inboxes.len()
    }

    fn inbox(&self, end: &SessionEnd) -> Result<Arc<Inbox>, SessionError> {
        if self.is_closed(end) {
            return Err(SessionError::Closed(end.session));
        }
        let inbox = self.inboxes.entry(end.clone()).or_default().clone();
        if self.is_closed(end) {
            self.inboxes.remove_if(end, |_, current| Arc::ptr_eq(current, &inbox));
            return Err(SessionError::Closed(end.session));
        }
        Ok(inbox)
    }
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHub")
            .field("open_ends", &self.inboxes.len())
            .field("responders", &self.responders.len())
            .field("has_transport", &self.transport.is_some())
            .finish()
    }
}

fn decode<T: DeserializeOwned>(
    session: SessionId,
    payload: serde_json::Value,
) -> Result<T, SessionError> {
    serde_json::from_value(payload).map_err(|e| SessionError::UnexpectedPayload {
        session,
        detail: e.to_string(),
    })
}
