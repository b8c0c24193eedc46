//! Flows, observers and helpers shared by the engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowkeep_types::session::{PartyId, SessionId, SessionOpened};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use uuid::Uuid;

use super::error::FlowError;
use super::logic::{FlowAction, FlowContext, FlowLogic, Resumed, SuspendOn};
use super::observer::EngineObserver;
use crate::identity::testing::FakeVerifier;
use crate::session::hub::SessionHub;

pub(crate) fn context() -> FlowContext {
    FlowContext::new(Uuid::now_v7(), PartyId::new("local"), Arc::new(FakeVerifier))
}

// ---------------------------------------------------------------------------
// Countdown
// ---------------------------------------------------------------------------

/// Sends `remaining` messages to `to` ("sink" unless built with `towards`),
/// one per suspension, then completes with the number sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Countdown {
    to: PartyId,
    remaining: u32,
    sent: u32,
    session: Option<SessionId>,
    /// Every other suspension skips persisting, starting with the first.
    skip_alternate: bool,
}

impl Countdown {
    pub(crate) fn new(remaining: u32) -> Self {
        Self::towards(remaining, "sink")
    }

    pub(crate) fn towards(remaining: u32, party: &str) -> Self {
        Self {
            to: PartyId::new(party),
            remaining,
            sent: 0,
            session: None,
            skip_alternate: false,
        }
    }

    pub(crate) fn skipping(remaining: u32) -> Self {
        Self {
            skip_alternate: true,
            ..Self::new(remaining)
        }
    }
}

impl FlowLogic for Countdown {
    const NAME: &'static str = "countdown";

    fn advance(&mut self, _resumed: Resumed, ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        if self.remaining == 0 {
            return FlowAction::complete(&self.sent);
        }
        let session = *self.session.get_or_insert_with(|| ctx.new_session());
        self.remaining -= 1;
        self.sent += 1;

        let on = SuspendOn::Send {
            to: self.to.clone(),
            session,
            payload: json!(self.sent),
        };
        if self.skip_alternate && self.sent % 2 == 1 {
            Ok(FlowAction::suspend_unpersisted(on))
        } else {
            Ok(FlowAction::suspend(on))
        }
    }
}

// ---------------------------------------------------------------------------
// Gated
// ---------------------------------------------------------------------------

/// Shared count of failures a `Gated` flow still has to report.
pub(crate) type Gate = Arc<AtomicU32>;

/// Asks for a retry while its gate is closed, then completes.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Gated {
    #[serde(skip)]
    gate: Option<Gate>,
}

impl Gated {
    pub(crate) fn gate(failures: u32) -> Gate {
        Arc::new(AtomicU32::new(failures))
    }

    pub(crate) fn new(gate: Gate) -> Self {
        Self { gate: Some(gate) }
    }

    pub(crate) fn attach(&mut self, gate: Gate) {
        self.gate = Some(gate);
    }
}

impl FlowLogic for Gated {
    const NAME: &'static str = "gated";

    fn advance(&mut self, _resumed: Resumed, _ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        if let Some(gate) = &self.gate {
            let closed = gate
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if closed {
                return Err(FlowError::RetryRequested("gate closed".into()));
            }
        }
        FlowAction::complete(&"open")
    }
}

// ---------------------------------------------------------------------------
// Waiter
// ---------------------------------------------------------------------------

/// Waits for one message from `peer` and completes with its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Waiter {
    peer: PartyId,
    session: Option<SessionId>,
}

impl Waiter {
    pub(crate) fn new(peer: &str) -> Self {
        Self {
            peer: PartyId::new(peer),
            session: None,
        }
    }
}

impl FlowLogic for Waiter {
    const NAME: &'static str = "waiter";

    fn advance(&mut self, resumed: Resumed, ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        match resumed {
            Resumed::Start => {
                let session = ctx.new_session();
                self.session = Some(session);
                Ok(FlowAction::suspend(SuspendOn::Receive {
                    from: self.peer.clone(),
                    session,
                }))
            }
            other => Ok(FlowAction::Complete(other.into_message()?.payload)),
        }
    }
}

// ---------------------------------------------------------------------------
// IdempotentProbe
// ---------------------------------------------------------------------------

/// Idempotent flow counting how often its first statement ran in the
/// current state, then waiting for a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct IdempotentProbe {
    pub(crate) starts: u32,
}

impl FlowLogic for IdempotentProbe {
    const NAME: &'static str = "idempotent_probe";

    fn idempotent(&self) -> bool {
        true
    }

    fn advance(&mut self, resumed: Resumed, ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        match resumed {
            Resumed::Start => {
                self.starts += 1;
                Ok(FlowAction::suspend(SuspendOn::Receive {
                    from: PartyId::new("peer"),
                    session: ctx.new_session(),
                }))
            }
            _ => FlowAction::complete(&self.starts),
        }
    }
}

// ---------------------------------------------------------------------------
// Poison
// ---------------------------------------------------------------------------

/// Serializes fine but can never be deserialized.
#[derive(Debug, Default)]
pub(crate) struct Pill;

impl Serialize for Pill {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("pill")
    }
}

impl<'de> Deserialize<'de> for Pill {
    fn deserialize<D: Deserializer<'de>>(_deserializer: D) -> Result<Self, D::Error> {
        Err(serde::de::Error::custom("pill cannot be restored"))
    }
}

/// Waits for a message; its state cannot be restored from a checkpoint.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Poison {
    pill: Pill,
}

impl FlowLogic for Poison {
    const NAME: &'static str = "poison";

    fn advance(&mut self, resumed: Resumed, ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        match resumed {
            Resumed::Start => Ok(FlowAction::suspend(SuspendOn::Receive {
                from: PartyId::new("peer"),
                session: ctx.new_session(),
            })),
            _ => FlowAction::complete(&"unreachable"),
        }
    }
}

// ---------------------------------------------------------------------------
// Drift
// ---------------------------------------------------------------------------

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Serializes a different state every time it is serialized.
#[derive(Debug, Default)]
pub(crate) struct Drift;

#[derive(Serialize, Deserialize)]
struct DriftState {
    tick: u64,
}

impl Serialize for Drift {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        DriftState {
            tick: TICKS.fetch_add(1, Ordering::SeqCst),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Drift {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        DriftState::deserialize(deserializer).map(|_| Drift)
    }
}

impl FlowLogic for Drift {
    const NAME: &'static str = "drift";

    fn advance(&mut self, _resumed: Resumed, _ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        Ok(FlowAction::suspend(SuspendOn::Sleep {
            duration: Duration::from_millis(1),
        }))
    }
}

// ---------------------------------------------------------------------------
// Sleepy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Sleepy {
    nap_ms: u64,
    woke: bool,
}

impl Sleepy {
    pub(crate) fn new(nap_ms: u64) -> Self {
        Self { nap_ms, woke: false }
    }
}

impl FlowLogic for Sleepy {
    const NAME: &'static str = "sleepy";

    fn advance(&mut self, resumed: Resumed, _ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        match resumed {
            Resumed::Woke => {
                self.woke = true;
                FlowAction::complete(&self.woke)
            }
            _ => Ok(FlowAction::suspend(SuspendOn::Sleep {
                duration: Duration::from_millis(self.nap_ms),
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// PingPong
// ---------------------------------------------------------------------------

/// Exchanges `rounds` numbers with `peer` on one session and completes with
/// the sum of the replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PingPong {
    peer: PartyId,
    rounds: u32,
    session: Option<SessionId>,
    replies: Vec<u32>,
}

impl PingPong {
    pub(crate) fn new(peer: &str, rounds: u32) -> Self {
        Self {
            peer: PartyId::new(peer),
            rounds,
            session: None,
            replies: Vec::new(),
        }
    }
}

impl FlowLogic for PingPong {
    const NAME: &'static str = "ping_pong";

    fn advance(&mut self, resumed: Resumed, ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        if let Resumed::Message(_) = resumed {
            self.replies.push(resumed.payload()?);
        }
        if self.replies.len() as u32 == self.rounds {
            return FlowAction::complete(&self.replies.iter().sum::<u32>());
        }
        let session = *self.session.get_or_insert_with(|| ctx.new_session());
        Ok(FlowAction::suspend(SuspendOn::SendAndReceive {
            to: self.peer.clone(),
            session,
            payload: json!(self.replies.len() as u32 + 1),
        }))
    }
}

// ---------------------------------------------------------------------------
// Doubler
// ---------------------------------------------------------------------------

/// Accepts a session opened by another run and answers `rounds` numbers
/// with their double, then completes with the numbers it was sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Doubler {
    peer: PartyId,
    session: SessionId,
    rounds: u32,
    seen: Vec<u32>,
}

impl Doubler {
    pub(crate) fn new(notice: &SessionOpened, rounds: u32) -> Self {
        Self {
            peer: notice.initiator.clone(),
            session: notice.session,
            rounds,
            seen: Vec::new(),
        }
    }
}

impl FlowLogic for Doubler {
    const NAME: &'static str = "doubler";

    fn advance(&mut self, resumed: Resumed, _ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        if let Resumed::Message(_) = resumed {
            let n: u32 = resumed.payload()?;
            self.seen.push(n);
            return Ok(FlowAction::suspend(SuspendOn::Send {
                to: self.peer.clone(),
                session: self.session,
                payload: json!(n * 2),
            }));
        }
        if self.seen.len() as u32 == self.rounds {
            return FlowAction::complete(&self.seen);
        }
        Ok(FlowAction::suspend(SuspendOn::Receive {
            from: self.peer.clone(),
            session: self.session,
        }))
    }
}

/// Answer every message sent to `party` on `hub` with the same payload.
pub(crate) fn spawn_echo(hub: Arc<SessionHub>, party: &str) {
    let party = PartyId::new(party);
    let mut opened = hub.register_responder(party);
    tokio::spawn(async move {
        while let Some(notice) = opened.recv().await {
            let hub = hub.clone();
            tokio::spawn(async move {
                let end = notice.acceptor_end();
                while let Ok(message) = hub.receive_raw(&end).await {
                    if hub.send(&end, &message.from, message.payload).is_err() {
                        break;
                    }
                }
            });
        }
    });
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Call {
    Reload,
    Observation,
    Retry,
    Discard,
}

/// Observer counting callbacks per run.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    calls: Mutex<HashMap<(Uuid, Call), u32>>,
}

impl Recorder {
    fn record(&self, run_id: Uuid, call: Call) {
        *self.calls.lock().unwrap().entry((run_id, call)).or_default() += 1;
    }

    fn count(&self, run_id: Uuid, call: Call) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(&(run_id, call))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn reloads(&self, run_id: Uuid) -> u32 {
        self.count(run_id, Call::Reload)
    }

    pub(crate) fn observations(&self, run_id: Uuid) -> u32 {
        self.count(run_id, Call::Observation)
    }

    pub(crate) fn retries(&self, run_id: Uuid) -> u32 {
        self.count(run_id, Call::Retry)
    }

    pub(crate) fn discards(&self, run_id: Uuid) -> u32 {
        self.count(run_id, Call::Discard)
    }
}

impl EngineObserver for Recorder {
    fn on_reload_from_checkpoint(&self, run_id: Uuid) {
        self.record(run_id, Call::Reload);
    }

    fn on_kept_for_observation(&self, run_id: Uuid, _cause: &str) {
        self.record(run_id, Call::Observation);
    }

    fn on_retry(&self, run_id: Uuid, _attempt: u32) {
        self.record(run_id, Call::Retry);
    }

    fn on_discarded(&self, run_id: Uuid, _cause: &str) {
        self.record(run_id, Call::Discard);
    }
}
