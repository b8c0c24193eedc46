//! The flow state machine.
//!
//! Every run is a tokio task (its driver) that owns the run's async mutex
//! for as long as it executes. The driver alternates between advancing the
//! flow logic (bounded by a semaphore) and performing the I/O of the
//! suspension the logic returned. Each persisted suspension writes a
//! checkpoint *before* its I/O; failures go to the hospital, which decides
//! whether the driver restores the run from its checkpoint and tries again.
//!
//! A run holds the initiator end of the sessions it opens. When a registered
//! initiating flow opens a session towards this engine's party, the engine
//! starts the initiated flow as a new run holding the acceptor end.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use flowkeep_types::checkpoint::{Checkpoint, Suspension, SuspensionKind};
use flowkeep_types::config::EngineConfig;
use flowkeep_types::event::EngineEvent;
use flowkeep_types::hospital::HospitalCase;
use flowkeep_types::run::{RunOutcome, RunStatus};
use flowkeep_types::hospital::CaseState;
use flowkeep_types::session::{
    PartyId, SessionEnd, SessionId, SessionMessage, SessionOpened, SessionRole,
};
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::error::{EngineError, FlowError, RunError};
use super::logic::{ErasedFlow, FlowAction, FlowContext, FlowLogic, Resumed};
use super::observer::{EngineObserver, ObserverSet};
use super::registry::FlowRegistry;
use crate::event::bus::EventBus;
use crate::hospital::{Disposition, Hospital};
use crate::identity::{RejectAllVerifier, SignatureVerifier};
use crate::repository::checkpoint::CheckpointStore;
use crate::repository::hospital::HospitalRepository;
use crate::session::hub::SessionHub;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// External event handed to `StateMachine::resume`.
#[derive(Debug, Clone)]
pub enum ResumeEvent {
    /// A message for the run, delivered to its session inbox.
    Message(SessionMessage),
    /// Restore the run from its current checkpoint and drive it again.
    Checkpoint,
}

/// What `StateMachine::recover` did with each stored run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Resumed from their last checkpoint.
    pub resumed: Vec<Uuid>,
    /// Idempotent runs restarted from their initial state.
    pub restarted: Vec<Uuid>,
    /// Held for observation by the hospital. Not driven.
    pub observed: Vec<Uuid>,
    /// Retained completed checkpoints. Not driven.
    pub completed: Vec<Uuid>,
    /// Already driven by this engine, or gone before they could be loaded.
    pub skipped: Vec<Uuid>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.resumed.len()
            + self.restarted.len()
            + self.observed.len()
            + self.completed.len()
            + self.skipped.len()
    }
}

// ---------------------------------------------------------------------------
// Run slots
// ---------------------------------------------------------------------------

/// Engine-side bookkeeping for one run.
struct RunSlot {
    /// Held by the driver for its whole life.
    lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
    reloads: AtomicU32,
    sessions: StdMutex<BTreeSet<SessionId>>,
    /// Session this run was started to accept.
    accepted: OnceLock<SessionId>,
    status: watch::Sender<RunStatus>,
    outcome: watch::Sender<Option<RunOutcome>>,
    adopted_at: Instant,
}

impl RunSlot {
    fn new() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
            reloads: AtomicU32::new(0),
            sessions: StdMutex::new(BTreeSet::new()),
            accepted: OnceLock::new(),
            status: watch::Sender::new(RunStatus::Running),
            outcome: watch::Sender::new(None),
            adopted_at: Instant::now(),
        }
    }

    /// A slot for a run no driver will pick up.
    fn finished(outcome: RunOutcome) -> Self {
        let slot = Self::new();
        slot.finish(outcome);
        slot
    }

    fn set_status(&self, status: RunStatus) {
        self.status.send_replace(status);
    }

    fn finish(&self, outcome: RunOutcome) {
        self.status.send_replace(outcome.status());
        self.outcome.send_replace(Some(outcome));
    }

    fn reopen(&self) {
        self.outcome.send_replace(None);
        self.status.send_replace(RunStatus::Running);
    }

    fn outcome(&self) -> Option<RunOutcome> {
        self.outcome.borrow().clone()
    }

    fn track(&self, session: SessionId) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session);
    }

    fn sessions(&self) -> Vec<SessionId> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// This run's end of `session`.
    fn end(&self, session: SessionId, party: &PartyId) -> SessionEnd {
        let role = if self.accepted.get() == Some(&session) {
            SessionRole::Acceptor
        } else {
            SessionRole::Initiator
        };
        SessionEnd::new(session, party.clone(), role)
    }

    /// Replace the tracked sessions, returning the previous ones.
    fn replace_sessions(&self, sessions: &[SessionId]) -> Vec<SessionId> {
        let mut tracked = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = tracked.iter().copied().collect();
        *tracked = sessions.iter().copied().collect();
        previous
    }
}

/// Error for an operation on a run that already has an outcome.
fn settled(run_id: Uuid, outcome: &RunOutcome) -> EngineError {
    match outcome {
        RunOutcome::Observation { .. } => EngineError::InObservation(run_id),
        _ => EngineError::RunFinished(run_id),
    }
}

// ---------------------------------------------------------------------------
// Driver plumbing
// ---------------------------------------------------------------------------

/// How a driver obtains the run it drives.
enum Entry {
    /// Newly started; the initial checkpoint is already persisted.
    Fresh {
        flow: Box<dyn ErasedFlow>,
        initial_state: Option<serde_json::Value>,
    },
    /// Rebuild from the current checkpoint. With `restart_idempotent`,
    /// idempotent runs start over from their initial state instead.
    Restore { restart_idempotent: bool },
}

/// The in-memory side of a run between suspensions.
struct Progress {
    flow: Box<dyn ErasedFlow>,
    /// Sequence number of the current checkpoint.
    sequence: u64,
    initial_state: Option<serde_json::Value>,
}

enum Advanced {
    Suspended(Suspension),
    Completed(serde_json::Value),
}

struct Inner<S: CheckpointStore, H: HospitalRepository> {
    config: EngineConfig,
    party: PartyId,
    checkpoints: CheckpointManager<S>,
    hospital: Hospital<H>,
    registry: FlowRegistry,
    hub: Arc<SessionHub>,
    verifier: Arc<dyn SignatureVerifier>,
    observers: ObserverSet,
    events: EventBus,
    runs: DashMap<Uuid, Arc<RunSlot>>,
    /// Finished runs still holding a slot, oldest first.
    settled: StdMutex<VecDeque<Uuid>>,
    /// Accepted sessions and the run accepting each.
    accepting: DashMap<SessionId, Uuid>,
    steps: Semaphore,
    drivers: TaskTracker,
    /// Cancelled on halt and on shutdown.
    stop: CancellationToken,
    halt_reason: OnceLock<String>,
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

/// Drives workflow runs through their suspension points.
///
/// Generic over `S: CheckpointStore` and `H: HospitalRepository` so it works
/// with any storage backend (SQLite, in-memory, etc.). Cloning is cheap and
/// every clone drives the same runs.
pub struct StateMachine<S: CheckpointStore, H: HospitalRepository> {
    inner: Arc<Inner<S, H>>,
}

impl<S: CheckpointStore, H: HospitalRepository> Clone for StateMachine<S, H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, H> StateMachine<S, H>
where
    S: CheckpointStore + 'static,
    H: HospitalRepository + 'static,
{
    pub fn builder(store: S, cases: H) -> StateMachineBuilder<S, H> {
        StateMachineBuilder::new(store, cases)
    }

    // -----------------------------------------------------------------------
    // Starting and resuming
    // -----------------------------------------------------------------------

    /// Start a run of `flow`. The initial checkpoint is persisted before
    /// this returns; the run then executes in the background.
    pub async fn start<F: FlowLogic>(&self, flow: F) -> Result<Uuid, EngineError> {
        self.launch(Box::new(flow), None).await
    }

    async fn launch(
        &self,
        flow: Box<dyn ErasedFlow>,
        accepted: Option<SessionId>,
    ) -> Result<Uuid, EngineError> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let flow_name = flow.flow_name();
        if !inner.registry.contains(flow_name) {
            return Err(EngineError::UnregisteredFlow(flow_name.to_string()));
        }

        let run_id = Uuid::now_v7();
        let idempotent = flow.is_idempotent();
        let state = flow.snapshot()?;
        let mut checkpoint = Checkpoint::initial(run_id, flow_name, idempotent, state);
        if let Some(session) = accepted {
            checkpoint = checkpoint.accepting(session);
        }
        inner
            .checkpoints
            .persist(&checkpoint)
            .await
            .map_err(|e| inner.engine_error(e))?;

        let (slot, guard) = inner.claim(run_id, false).await?;
        inner.mark_accepting(run_id, &slot, accepted);
        slot.replace_sessions(&checkpoint.sessions);
        info!(run_id = %run_id, flow = flow_name, idempotent, accepted = ?accepted, "started run");
        inner.events.publish(EngineEvent::RunStarted {
            run_id,
            flow_name: flow_name.to_string(),
            idempotent,
        });

        let entry = Entry::Fresh {
            flow,
            initial_state: checkpoint.initial_state,
        };
        self.spawn_driver(run_id, slot, guard, entry);
        Ok(run_id)
    }

    /// Start the initiated flow for a session another run opened towards
    /// this engine's party.
    async fn accept(&self, notice: SessionOpened) -> Result<(), EngineError> {
        let inner = &self.inner;
        let end = notice.acceptor_end();
        if let Some(run_id) = inner.accepting.get(&notice.session) {
            debug!(%end, run_id = %*run_id, "session already has an accepting run");
            return Ok(());
        }
        let Some(flow) = inner.registry.accept(&notice) else {
            warn!(
                %end,
                initiator = %notice.initiator,
                initiating_flow = ?notice.initiating_flow,
                "no flow accepts session, closing our end"
            );
            inner.hub.retire(&end);
            return Ok(());
        };
        let run_id = self.launch(flow, Some(notice.session)).await?;
        debug!(%end, run_id = %run_id, "accepted session");
        Ok(())
    }

    /// Start accepting runs for sessions opened towards this engine until
    /// it stops.
    fn listen(&self, mut opened: mpsc::Receiver<SessionOpened>) {
        let engine: Weak<Inner<S, H>> = Arc::downgrade(&self.inner);
        let stop = self.inner.stop.clone();
        self.inner.drivers.spawn(async move {
            loop {
                let notice = tokio::select! {
                    _ = stop.cancelled() => break,
                    notice = opened.recv() => match notice {
                        Some(notice) => notice,
                        None => break,
                    },
                };
                let Some(inner) = engine.upgrade() else { break };
                let session = notice.session;
                if let Err(e) = (StateMachine { inner }).accept(notice).await {
                    warn!(%session, error = %e, "cannot start accepting run");
                }
            }
            debug!("stopped accepting sessions");
        });
    }

    /// Hand an external event to a run.
    ///
    /// A message is delivered to its session inbox; a run this engine does
    /// not drive yet is restored from its checkpoint first. `Checkpoint`
    /// restores and drives a run that is not currently driven.
    pub async fn resume(&self, run_id: Uuid, event: ResumeEvent) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.ensure_running()?;

        let slot = match inner.slot(run_id) {
            Some(slot) => {
                if let Some(outcome) = slot.outcome() {
                    return Err(settled(run_id, &outcome));
                }
                if matches!(event, ResumeEvent::Checkpoint) {
                    return Err(EngineError::RunActive(run_id));
                }
                slot
            }
            None => {
                match self.adopt(run_id).await {
                    Ok(()) => {}
                    // Another caller adopted it first; the message still goes in.
                    Err(EngineError::RunActive(_)) if matches!(event, ResumeEvent::Message(_)) => {}
                    Err(e) => return Err(e),
                }
                inner.slot(run_id).ok_or(EngineError::RunNotFound(run_id))?
            }
        };

        if let ResumeEvent::Message(message) = event {
            // The message comes from the other end of the run's session.
            let role = slot.end(message.session, &inner.party).role.peer();
            debug!(run_id = %run_id, session = %message.session, %role, "resuming run with message");
            inner.hub.inbound(message.with_role(role));
        }
        Ok(())
    }

    /// Start driving a stored run this engine does not know yet.
    async fn adopt(&self, run_id: Uuid) -> Result<(), EngineError> {
        let inner = &self.inner;
        if let Some(case) = inner.hospital.observed_case(run_id).await? {
            inner.runs.entry(run_id).or_insert_with(|| {
                Arc::new(RunSlot::finished(RunOutcome::Observation { cause: case.cause }))
            });
            inner.remember_settled(run_id);
            return Err(EngineError::InObservation(run_id));
        }

        let checkpoint = match inner.checkpoints.load(run_id).await {
            Ok(checkpoint) => checkpoint,
            Err(CheckpointError::NotFound(_)) => return Err(EngineError::RunNotFound(run_id)),
            Err(e) => return Err(inner.engine_error(e)),
        };
        if checkpoint.is_completed() {
            return Err(EngineError::RunFinished(run_id));
        }

        let (slot, guard) = inner.claim(run_id, false).await?;
        inner.mark_accepting(run_id, &slot, checkpoint.accepted_session);
        info!(run_id = %run_id, seq = checkpoint.sequence_number, "adopted run from checkpoint");
        self.spawn_driver(run_id, slot, guard, Entry::Restore { restart_idempotent: false });
        Ok(())
    }

    fn spawn_driver(
        &self,
        run_id: Uuid,
        slot: Arc<RunSlot>,
        guard: OwnedMutexGuard<()>,
        entry: Entry,
    ) {
        let inner = self.inner.clone();
        self.inner.drivers.spawn(async move {
            let outcome = inner.drive(run_id, &slot, entry).await;
            drop(guard);
            slot.finish(outcome);
            inner.remember_settled(run_id);
        });
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// The run's current checkpoint, read from the store.
    pub async fn current_checkpoint(&self, run_id: Uuid) -> Result<Checkpoint, EngineError> {
        let inner = &self.inner;
        inner.ensure_running()?;
        match inner.checkpoints.load(run_id).await {
            Ok(checkpoint) => Ok(checkpoint),
            Err(CheckpointError::NotFound(_)) => Err(EngineError::RunNotFound(run_id)),
            Err(e) => Err(inner.engine_error(e)),
        }
    }

    /// Wait until the run reaches a terminal outcome.
    ///
    /// Runs whose slot was already evicted are answered from the hospital
    /// and the retained completion checkpoint.
    pub async fn wait(&self, run_id: Uuid) -> Result<RunOutcome, EngineError> {
        let Some(slot) = self.inner.slot(run_id) else {
            return self.stored_outcome(run_id).await;
        };
        let mut outcome = slot.outcome.subscribe();
        let ready = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::RunNotFound(run_id))?;
        ready.clone().ok_or(EngineError::RunNotFound(run_id))
    }

    async fn stored_outcome(&self, run_id: Uuid) -> Result<RunOutcome, EngineError> {
        let inner = &self.inner;
        match inner.hospital.repo().get_case(&run_id).await? {
            Some(case) if case.state == CaseState::Observation => {
                return Ok(RunOutcome::Observation { cause: case.cause });
            }
            Some(case) if case.state == CaseState::Discarded => {
                return Ok(RunOutcome::Discarded { cause: case.cause });
            }
            _ => {}
        }
        match inner.checkpoints.load(run_id).await {
            Ok(Checkpoint {
                suspension: Suspension::Completed { result },
                ..
            }) => Ok(RunOutcome::Completed { result }),
            Ok(_) | Err(CheckpointError::NotFound(_)) => Err(EngineError::RunNotFound(run_id)),
            Err(e) => Err(inner.engine_error(e)),
        }
    }

    /// Live status of a run with a slot in this engine.
    pub fn status(&self, run_id: Uuid) -> Option<RunStatus> {
        self.inner.slot(run_id).map(|slot| *slot.status.borrow())
    }

    /// Follow the run's status changes.
    pub fn watch_status(&self, run_id: Uuid) -> Option<watch::Receiver<RunStatus>> {
        self.inner.slot(run_id).map(|slot| slot.status.subscribe())
    }

    /// Number of times the run was rebuilt from a stored checkpoint.
    pub fn reload_count(&self, run_id: Uuid) -> Option<u32> {
        self.inner
            .slot(run_id)
            .map(|slot| slot.reloads.load(Ordering::SeqCst))
    }

    /// Runs with a slot in this engine, sorted.
    pub fn run_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.inner.runs.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub async fn hospital_cases(&self) -> Result<Vec<HospitalCase>, EngineError> {
        Ok(self.inner.hospital.cases().await?)
    }

    pub fn party(&self) -> &PartyId {
        &self.inner.party
    }

    pub fn session_hub(&self) -> &Arc<SessionHub> {
        &self.inner.hub
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halt_reason.get().is_some()
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Cancel a run. Its driver stops without running more flow logic,
    /// releases its sessions, deletes the checkpoint and settles the run as
    /// discarded.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let slot = self
            .inner
            .slot(run_id)
            .ok_or(EngineError::RunNotFound(run_id))?;
        if let Some(outcome) = slot.outcome() {
            return Err(settled(run_id, &outcome));
        }
        info!(run_id = %run_id, "cancelling run");
        slot.cancel.cancel();
        Ok(())
    }

    /// Drive every stored run after a process restart.
    ///
    /// Idempotent runs start over from their initial state, others resume
    /// from their last checkpoint. Runs held for observation stay held. An
    /// invariant violation in the store halts the engine and is returned.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let inner = &self.inner;
        inner.ensure_running()?;

        let run_ids = inner
            .checkpoints
            .run_ids()
            .await
            .map_err(|e| inner.engine_error(e))?;

        let mut report = RecoveryReport::default();
        // Drivers start once every accepted session is known, so a resent
        // request does not start a second accepting run.
        let mut claimed = Vec::new();
        for run_id in run_ids {
            if inner.runs.contains_key(&run_id) {
                report.skipped.push(run_id);
                continue;
            }

            if let Some(case) = inner.hospital.observed_case(run_id).await? {
                let slot = RunSlot::finished(RunOutcome::Observation { cause: case.cause });
                inner.runs.insert(run_id, Arc::new(slot));
                inner.remember_settled(run_id);
                report.observed.push(run_id);
                continue;
            }

            let checkpoint = match inner.checkpoints.load(run_id).await {
                Ok(checkpoint) => Some(checkpoint),
                Err(CheckpointError::NotFound(_)) => {
                    report.skipped.push(run_id);
                    continue;
                }
                Err(e) if e.is_invariant_violation() => return Err(inner.engine_error(e)),
                Err(e) => {
                    // The driver meets the same error and hands it to the hospital.
                    warn!(run_id = %run_id, error = %e, "cannot load checkpoint during recovery");
                    None
                }
            };

            if let Some(Suspension::Completed { result }) =
                checkpoint.as_ref().map(|cp| cp.suspension.clone())
            {
                let slot = RunSlot::finished(RunOutcome::Completed { result });
                inner.runs.insert(run_id, Arc::new(slot));
                inner.remember_settled(run_id);
                report.completed.push(run_id);
                continue;
            }

            let restarting = checkpoint
                .as_ref()
                .is_some_and(|cp| cp.idempotent && cp.kind() != SuspensionKind::Initial);
            let Ok((slot, guard)) = inner.claim(run_id, false).await else {
                report.skipped.push(run_id);
                continue;
            };
            let accepted = checkpoint.as_ref().and_then(|cp| cp.accepted_session);
            inner.mark_accepting(run_id, &slot, accepted);
            claimed.push((run_id, slot, guard));
            if restarting {
                report.restarted.push(run_id);
            } else {
                report.resumed.push(run_id);
            }
        }
        for (run_id, slot, guard) in claimed {
            self.spawn_driver(run_id, slot, guard, Entry::Restore { restart_idempotent: true });
        }

        info!(
            resumed = report.resumed.len(),
            restarted = report.restarted.len(),
            observed = report.observed.len(),
            completed = report.completed.len(),
            skipped = report.skipped.len(),
            "recovered runs"
        );
        Ok(report)
    }

    /// Let a run held for observation be driven again from its checkpoint.
    /// Its hospital history is cleared.
    pub async fn release(&self, run_id: Uuid) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let case = inner
            .hospital
            .observed_case(run_id)
            .await?
            .ok_or(EngineError::NotInObservation(run_id))?;

        let (slot, guard) = inner.claim(run_id, true).await?;
        if let Err(e) = inner.hospital.release(run_id).await {
            drop(guard);
            slot.finish(RunOutcome::Observation { cause: case.cause });
            inner.remember_settled(run_id);
            return Err(e.into());
        }
        self.spawn_driver(run_id, slot, guard, Entry::Restore { restart_idempotent: false });
        Ok(())
    }

    /// Discard a run held for observation, deleting its checkpoint.
    pub async fn discard(&self, run_id: Uuid) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.ensure_running()?;
        if inner.hospital.observed_case(run_id).await?.is_none() {
            return Err(EngineError::NotInObservation(run_id));
        }

        let cause = "discarded by operator";
        inner
            .checkpoints
            .discard(run_id)
            .await
            .map_err(|e| inner.engine_error(e))?;
        inner.hospital.discard(run_id, cause).await?;

        let outcome = RunOutcome::Discarded {
            cause: cause.to_string(),
        };
        match inner.slot(run_id) {
            Some(slot) => {
                inner.release_sessions(&slot, true);
                slot.finish(outcome);
            }
            None => {
                inner.runs.insert(run_id, Arc::new(RunSlot::finished(outcome)));
            }
        }
        inner.remember_settled(run_id);
        Ok(())
    }

    /// Stop every driver without touching checkpoints and wait for them to
    /// exit. Stored runs can be recovered by another engine.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!(runs = inner.runs.len(), "shutting down state machine");
        inner.stop.cancel();
        inner.drivers.close();
        inner.drivers.wait().await;
    }
}

// ---------------------------------------------------------------------------
// Driving
// ---------------------------------------------------------------------------

impl<S, H> Inner<S, H>
where
    S: CheckpointStore + 'static,
    H: HospitalRepository + 'static,
{
    fn slot(&self, run_id: Uuid) -> Option<Arc<RunSlot>> {
        self.runs.get(&run_id).map(|entry| entry.value().clone())
    }

    fn mark_accepting(&self, run_id: Uuid, slot: &RunSlot, session: Option<SessionId>) {
        if let Some(session) = session {
            let _ = slot.accepted.set(session);
            self.accepting.insert(session, run_id);
        }
    }

    /// Queue a finished run's slot for eviction once more than
    /// `settled_run_retention` finished runs are held.
    fn remember_settled(&self, run_id: Uuid) {
        let evicted: Vec<Uuid> = {
            let mut settled = self.settled.lock().unwrap_or_else(PoisonError::into_inner);
            if !settled.contains(&run_id) {
                settled.push_back(run_id);
            }
            let excess = settled.len().saturating_sub(self.config.settled_run_retention);
            settled.drain(..excess).collect()
        };
        for run_id in evicted {
            // A slot claimed again since it settled stays.
            if self
                .runs
                .remove_if(&run_id, |_, slot| slot.outcome().is_some())
                .is_some()
            {
                debug!(run_id = %run_id, "evicted settled run");
            }
        }
    }

    /// Take the run's slot for a new driver.
    ///
    /// A known run can only be claimed back out of observation, and only
    /// when `reopen_observed` is set.
    async fn claim(
        &self,
        run_id: Uuid,
        reopen_observed: bool,
    ) -> Result<(Arc<RunSlot>, OwnedMutexGuard<()>), EngineError> {
        if let Some(slot) = self.slot(run_id) {
            match slot.outcome() {
                Some(RunOutcome::Observation { .. }) if reopen_observed => {}
                Some(outcome) => return Err(settled(run_id, &outcome)),
                None => return Err(EngineError::RunActive(run_id)),
            }
            let guard = slot
                .lock
                .clone()
                .try_lock_owned()
                .map_err(|_| EngineError::RunActive(run_id))?;
            slot.reopen();
            return Ok((slot, guard));
        }

        let slot = Arc::new(RunSlot::new());
        let guard = slot.lock.clone().lock_owned().await;
        match self.runs.entry(run_id) {
            MapEntry::Occupied(_) => Err(EngineError::RunActive(run_id)),
            MapEntry::Vacant(vacant) => {
                vacant.insert(slot.clone());
                Ok((slot, guard))
            }
        }
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if !self.stop.is_cancelled() {
            return Ok(());
        }
        let reason = self
            .halt_reason
            .get()
            .cloned()
            .unwrap_or_else(|| "engine shut down".to_string());
        Err(EngineError::Halted(reason))
    }

    fn check_running(&self) -> Result<(), RunError> {
        if self.stop.is_cancelled() {
            Err(RunError::Halted)
        } else {
            Ok(())
        }
    }

    fn trip_halt(&self, detail: &str) {
        if self.halt_reason.set(detail.to_string()).is_ok() {
            error!(detail, "engine invariant violated, halting");
            self.events.publish(EngineEvent::InvariantViolated {
                detail: detail.to_string(),
            });
        }
        self.stop.cancel();
    }

    fn engine_error(&self, err: CheckpointError) -> EngineError {
        match err {
            CheckpointError::Store(e) => EngineError::Store(e),
            CheckpointError::NotFound(run_id) => EngineError::RunNotFound(run_id),
            violation => {
                let detail = violation.to_string();
                self.trip_halt(&detail);
                EngineError::InvariantViolation(detail)
            }
        }
    }

    /// Drive a run until it reaches an outcome, going through the hospital
    /// on every failure.
    async fn drive(&self, run_id: Uuid, slot: &RunSlot, entry: Entry) -> RunOutcome {
        let mut entry = entry;
        loop {
            let err = match self.attempt(run_id, slot, entry).await {
                Ok((flow_name, result)) => {
                    return self.complete(run_id, slot, flow_name, result).await;
                }
                Err(err) => err,
            };

            match err {
                RunError::Cancelled => return self.cancelled(run_id, slot).await,
                RunError::Halted => return self.halted(run_id),
                RunError::Invariant(detail) => {
                    self.trip_halt(&detail);
                    return self.halted(run_id);
                }
                err => match self.hospital.admit(run_id, &err).await {
                    Disposition::Retry { attempt, delay } => {
                        slot.set_status(RunStatus::Retrying);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = slot.cancel.cancelled() => return self.cancelled(run_id, slot).await,
                            _ = self.stop.cancelled() => return self.halted(run_id),
                        }
                        debug!(run_id = %run_id, attempt, "retrying run from its checkpoint");
                        entry = Entry::Restore {
                            restart_idempotent: false,
                        };
                    }
                    Disposition::Discard => {
                        return self.discarded(run_id, slot, err.to_string()).await;
                    }
                    Disposition::Observe => {
                        self.release_sessions(slot, false);
                        return RunOutcome::Observation {
                            cause: err.to_string(),
                        };
                    }
                },
            }
        }
    }

    /// One attempt: from the entry point to completion or the first error.
    async fn attempt(
        &self,
        run_id: Uuid,
        slot: &RunSlot,
        entry: Entry,
    ) -> Result<(&'static str, serde_json::Value), RunError> {
        let ctx = FlowContext::new(run_id, self.party.clone(), self.verifier.clone());
        let (mut progress, mut suspension) = match entry {
            Entry::Fresh {
                flow,
                initial_state,
            } => {
                let progress = Progress {
                    flow,
                    sequence: 0,
                    initial_state,
                };
                (progress, Suspension::Initial)
            }
            Entry::Restore { restart_idempotent } => {
                self.restore(run_id, slot, restart_idempotent).await?
            }
        };

        loop {
            let resumed = self
                .perform(run_id, slot, progress.flow.flow_name(), suspension)
                .await?;
            match self.advance(run_id, slot, &mut progress, resumed, &ctx).await? {
                Advanced::Suspended(next) => suspension = next,
                Advanced::Completed(result) => return Ok((progress.flow.flow_name(), result)),
            }
        }
    }

    /// Run the flow logic once and checkpoint the suspension it returns.
    async fn advance(
        &self,
        run_id: Uuid,
        slot: &RunSlot,
        progress: &mut Progress,
        resumed: Resumed,
        ctx: &FlowContext,
    ) -> Result<Advanced, RunError> {
        let _permit = tokio::select! {
            permit = self.steps.acquire() => permit.map_err(|_| RunError::Halted)?,
            _ = slot.cancel.cancelled() => return Err(RunError::Cancelled),
            _ = self.stop.cancelled() => return Err(RunError::Halted),
        };
        slot.set_status(RunStatus::Running);

        let (on, skip_persisting) = match progress.flow.step(resumed, ctx)? {
            FlowAction::Complete(result) => {
                self.check_running()?;
                if self.config.checkpoint_retention_on_completion {
                    let suspension = Suspension::Completed {
                        result: result.clone(),
                    };
                    let checkpoint = self.capture(run_id, slot, progress, suspension)?;
                    self.checkpoints.persist(&checkpoint).await?;
                    progress.sequence = checkpoint.sequence_number;
                } else {
                    self.checkpoints.discard(run_id).await?;
                }
                return Ok(Advanced::Completed(result));
            }
            FlowAction::Suspend {
                on,
                skip_persisting,
            } => (on, skip_persisting),
        };

        let suspension = on.into_suspension(Utc::now());
        if let Some(session) = suspension.session() {
            slot.track(session);
        }
        let kind = suspension.kind();

        if skip_persisting {
            debug!(run_id = %run_id, %kind, seq = progress.sequence, "suspending without checkpoint");
            slot.set_status(RunStatus::Suspended(kind));
            return Ok(Advanced::Suspended(suspension));
        }

        self.check_running()?;
        let checkpoint = self.capture(run_id, slot, progress, suspension)?;
        self.checkpoints.persist(&checkpoint).await?;
        progress.sequence = checkpoint.sequence_number;
        self.events.publish(EngineEvent::CheckpointPersisted {
            run_id,
            sequence_number: checkpoint.sequence_number,
            kind,
        });

        if self.config.reload_checkpoint_after_suspend {
            let stored = self.checkpoints.load_written(&checkpoint).await?;
            let flow = self.registry.restore(&stored.flow_name, stored.state.clone())?;
            let replayed = flow.snapshot().map_err(FlowError::from)?;
            if replayed != stored.state {
                return Err(RunError::Determinism {
                    run_id,
                    sequence: stored.sequence_number,
                });
            }
            progress.flow = flow;
            slot.replace_sessions(&stored.sessions);
            self.count_reload(run_id, slot);
            slot.set_status(RunStatus::Suspended(stored.kind()));
            return Ok(Advanced::Suspended(stored.suspension));
        }

        slot.set_status(RunStatus::Suspended(kind));
        Ok(Advanced::Suspended(checkpoint.suspension))
    }

    /// The next checkpoint of a run: current sequence + 1.
    fn capture(
        &self,
        run_id: Uuid,
        slot: &RunSlot,
        progress: &Progress,
        suspension: Suspension,
    ) -> Result<Checkpoint, RunError> {
        Ok(Checkpoint {
            run_id,
            sequence_number: progress.sequence + 1,
            flow_name: progress.flow.flow_name().to_string(),
            idempotent: progress.flow.is_idempotent(),
            suspension,
            state: progress.flow.snapshot().map_err(FlowError::from)?,
            initial_state: progress.initial_state.clone(),
            sessions: slot.sessions(),
            accepted_session: slot.accepted.get().copied(),
            created_at: Utc::now(),
        })
    }

    /// Rebuild a run from its current checkpoint.
    async fn restore(
        &self,
        run_id: Uuid,
        slot: &RunSlot,
        restart_idempotent: bool,
    ) -> Result<(Progress, Suspension), RunError> {
        let checkpoint = self.checkpoints.load(run_id).await?;
        self.mark_accepting(run_id, slot, checkpoint.accepted_session);
        let restart = restart_idempotent
            && checkpoint.idempotent
            && checkpoint.kind() != SuspensionKind::Initial;

        let restored = if restart {
            let initial_state = checkpoint
                .initial_state
                .clone()
                .ok_or(RunError::MissingInitialState(run_id))?;
            let flow = self
                .registry
                .restore(&checkpoint.flow_name, initial_state.clone())?;

            self.check_running()?;
            // An accepted session is kept; sessions the run opened are abandoned.
            let kept: Vec<SessionId> = checkpoint.accepted_session.into_iter().collect();
            let fresh = Checkpoint {
                sequence_number: checkpoint.sequence_number + 1,
                suspension: Suspension::Initial,
                state: initial_state.clone(),
                initial_state: Some(initial_state.clone()),
                sessions: kept.clone(),
                created_at: Utc::now(),
                ..checkpoint
            };
            self.checkpoints.persist(&fresh).await?;
            let abandoned = slot.replace_sessions(&kept);
            for session in abandoned.into_iter().filter(|session| !kept.contains(session)) {
                self.hub.close_session(session);
            }
            info!(run_id = %run_id, seq = fresh.sequence_number, "restarting idempotent run from its initial state");

            let progress = Progress {
                flow,
                sequence: fresh.sequence_number,
                initial_state: Some(initial_state),
            };
            (progress, Suspension::Initial)
        } else {
            let flow = self
                .registry
                .restore(&checkpoint.flow_name, checkpoint.state.clone())?;
            slot.replace_sessions(&checkpoint.sessions);
            if checkpoint.kind() != SuspensionKind::Initial {
                slot.set_status(RunStatus::Suspended(checkpoint.kind()));
            }
            debug!(run_id = %run_id, seq = checkpoint.sequence_number, kind = %checkpoint.kind(), "restored run from checkpoint");

            let progress = Progress {
                flow,
                sequence: checkpoint.sequence_number,
                initial_state: checkpoint.initial_state,
            };
            (progress, checkpoint.suspension)
        };

        if self.config.reload_checkpoint_after_suspend {
            self.count_reload(run_id, slot);
        }
        Ok(restored)
    }

    fn count_reload(&self, run_id: Uuid, slot: &RunSlot) {
        let reload_count = slot.reloads.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(run_id = %run_id, reload_count, "reloaded run from checkpoint");
        self.observers.reloaded(run_id);
        self.events.publish(EngineEvent::RunReloaded {
            run_id,
            reload_count,
        });
    }

    /// Perform a suspension's I/O and produce what the flow resumes with.
    async fn perform(
        &self,
        run_id: Uuid,
        slot: &RunSlot,
        flow_name: &str,
        suspension: Suspension,
    ) -> Result<Resumed, RunError> {
        tokio::select! {
            resumed = self.perform_io(run_id, slot, flow_name, suspension) => resumed,
            _ = slot.cancel.cancelled() => Err(RunError::Cancelled),
            _ = self.stop.cancelled() => Err(RunError::Halted),
        }
    }

    async fn perform_io(
        &self,
        run_id: Uuid,
        slot: &RunSlot,
        flow_name: &str,
        suspension: Suspension,
    ) -> Result<Resumed, RunError> {
        match suspension {
            Suspension::Initial => Ok(Resumed::Start),
            Suspension::Send { to, session, payload } => {
                let end = slot.end(session, &self.party);
                self.hub.post(envelope(&end, to, payload, flow_name))?;
                Ok(Resumed::Sent)
            }
            Suspension::Receive { from, session } => {
                let end = slot.end(session, &self.party);
                debug!(run_id = %run_id, %end, %from, "waiting for message");
                let message = self.hub.receive_raw(&end).await?;
                Ok(Resumed::Message(message))
            }
            Suspension::SendAndReceive { to, session, payload } => {
                let end = slot.end(session, &self.party);
                let message = self
                    .hub
                    .exchange(envelope(&end, to, payload, flow_name))
                    .await?;
                Ok(Resumed::Message(message))
            }
            Suspension::Sleep { until } => {
                let remaining = (until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(remaining).await;
                Ok(Resumed::Woke)
            }
            Suspension::Completed { .. } => Err(RunError::Invariant(format!(
                "run {run_id} was resumed past its completion"
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Outcomes
    // -----------------------------------------------------------------------

    /// Close the run's session ends. A finished run also closes the
    /// sessions it opened for good and retires its end of an accepted one.
    fn release_sessions(&self, slot: &RunSlot, finished: bool) {
        for session in slot.replace_sessions(&[]) {
            let end = slot.end(session, &self.party);
            match (finished, end.role) {
                (false, _) => {
                    self.hub.close(&end);
                }
                (true, SessionRole::Initiator) => {
                    self.hub.close_session(session);
                }
                (true, SessionRole::Acceptor) => {
                    self.hub.retire(&end);
                }
            }
        }
        if finished {
            if let Some(session) = slot.accepted.get() {
                self.accepting.remove(session);
            }
        }
    }

    async fn complete(
        &self,
        run_id: Uuid,
        slot: &RunSlot,
        flow_name: &'static str,
        result: serde_json::Value,
    ) -> RunOutcome {
        self.release_sessions(slot, true);
        self.hospital.resolve(run_id).await;

        let duration_ms = slot.adopted_at.elapsed().as_millis() as u64;
        info!(run_id = %run_id, flow = flow_name, duration_ms, "run completed");
        self.events.publish(EngineEvent::RunCompleted {
            run_id,
            flow_name: flow_name.to_string(),
            duration_ms,
        });
        RunOutcome::Completed { result }
    }

    async fn discarded(&self, run_id: Uuid, slot: &RunSlot, cause: String) -> RunOutcome {
        if let Err(e) = self.checkpoints.discard(run_id).await {
            warn!(run_id = %run_id, error = %e, "cannot delete checkpoint of discarded run");
        }
        self.release_sessions(slot, true);
        RunOutcome::Discarded { cause }
    }

    /// A cancelled run settles as discarded.
    async fn cancelled(&self, run_id: Uuid, slot: &RunSlot) -> RunOutcome {
        let cause = "run cancelled";
        if let Err(e) = self.checkpoints.discard(run_id).await {
            warn!(run_id = %run_id, error = %e, "cannot delete checkpoint of cancelled run");
        }
        self.release_sessions(slot, true);
        self.hospital.withdraw(run_id).await;
        info!(run_id = %run_id, "run cancelled");
        self.observers.discarded(run_id, cause);
        self.events.publish(EngineEvent::RunCancelled { run_id });
        RunOutcome::Discarded {
            cause: cause.to_string(),
        }
    }

    fn halted(&self, run_id: Uuid) -> RunOutcome {
        debug!(run_id = %run_id, "driver stopped by engine halt");
        RunOutcome::Halted
    }
}

/// A message from `end`. Initiators name their flow so the acceptor's
/// engine can pick the initiated flow.
fn envelope(
    end: &SessionEnd,
    to: PartyId,
    payload: serde_json::Value,
    flow_name: &str,
) -> SessionMessage {
    let message = SessionMessage::from_end(end, to, payload);
    match end.role {
        SessionRole::Initiator => message.initiated_by(flow_name),
        SessionRole::Acceptor => message,
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures a `StateMachine`. Observers registered here are scoped to the
/// engine being built.
pub struct StateMachineBuilder<S: CheckpointStore, H: HospitalRepository> {
    store: S,
    cases: H,
    config: EngineConfig,
    party: PartyId,
    registry: FlowRegistry,
    hub: Option<Arc<SessionHub>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    observers: Vec<Arc<dyn EngineObserver>>,
    events: Option<EventBus>,
}

impl<S, H> StateMachineBuilder<S, H>
where
    S: CheckpointStore + 'static,
    H: HospitalRepository + 'static,
{
    pub fn new(store: S, cases: H) -> Self {
        Self {
            store,
            cases,
            config: EngineConfig::default(),
            party: PartyId::new("local"),
            registry: FlowRegistry::new(),
            hub: None,
            verifier: None,
            observers: Vec::new(),
            events: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The party this engine's flows speak as.
    pub fn party(mut self, party: PartyId) -> Self {
        self.party = party;
        self
    }

    pub fn registry(mut self, registry: FlowRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Share a session hub with responders or other engines. A hub built
    /// by the engine uses `session_timeout_secs` for receives.
    pub fn session_hub(mut self, hub: Arc<SessionHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the engine. With initiated flows registered it also starts
    /// listening for sessions, which needs a running tokio runtime.
    pub fn build(self) -> StateMachine<S, H> {
        let config = self.config.normalized();
        let hub = self.hub.unwrap_or_else(|| {
            let timeout = config.session_timeout_secs.map(Duration::from_secs);
            Arc::new(SessionHub::new().with_receive_timeout(timeout))
        });
        hub.host(self.party.clone());
        let opened = self
            .registry
            .accepts_sessions()
            .then(|| hub.register_responder(self.party.clone()));

        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(config.event_capacity));
        let observers = ObserverSet::new(self.observers);
        let verifier = self
            .verifier
            .unwrap_or_else(|| Arc::new(RejectAllVerifier) as Arc<dyn SignatureVerifier>);

        info!(
            party = %self.party,
            flows = ?self.registry.names(),
            reload_after_suspend = config.reload_checkpoint_after_suspend,
            max_concurrent_steps = config.max_concurrent_steps,
            "built state machine"
        );

        let inner = Inner {
            party: self.party,
            checkpoints: CheckpointManager::new(self.store),
            hospital: Hospital::new(self.cases, config.clone(), observers.clone(), events.clone()),
            registry: self.registry,
            hub,
            verifier,
            observers,
            events,
            runs: DashMap::new(),
            settled: StdMutex::new(VecDeque::new()),
            accepting: DashMap::new(),
            steps: Semaphore::new(config.max_concurrent_steps),
            drivers: TaskTracker::new(),
            stop: CancellationToken::new(),
            halt_reason: OnceLock::new(),
            config,
        };
        let machine = StateMachine {
            inner: Arc::new(inner),
        };
        if let Some(opened) = opened {
            machine.listen(opened);
        }
        machine
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::testing::{
        Countdown, Doubler, Drift, Gated, IdempotentProbe, PingPong, Poison, Recorder, Sleepy,
        Waiter, spawn_echo,
    };
    use crate::repository::memory::{InMemoryCheckpointStore, InMemoryHospitalRepository};
    use flowkeep_types::error::RepositoryError;
    use serde_json::json;
    use tokio::time::timeout;

    type Stores = (Arc<InMemoryCheckpointStore>, Arc<InMemoryHospitalRepository>);
    type Engine = StateMachine<Arc<InMemoryCheckpointStore>, Arc<InMemoryHospitalRepository>>;

    const PATIENCE: Duration = Duration::from_secs(5);

    fn stores() -> Stores {
        (
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(InMemoryHospitalRepository::new()),
        )
    }

    fn config(reload: bool) -> EngineConfig {
        EngineConfig {
            reload_checkpoint_after_suspend: reload,
            retry_backoff_ms: 1,
            retry_backoff_max_ms: 5,
            ..EngineConfig::default()
        }
    }

    fn registry() -> FlowRegistry {
        let mut registry = FlowRegistry::new();
        registry
            .register::<Countdown>()
            .register::<Waiter>()
            .register::<IdempotentProbe>()
            .register::<Poison>()
            .register::<Drift>()
            .register::<Sleepy>()
            .register::<PingPong>();
        registry
    }

    fn launch(stores: &Stores, config: EngineConfig) -> (Engine, Arc<Recorder>) {
        launch_with(stores, config, registry())
    }

    fn launch_with(
        stores: &Stores,
        config: EngineConfig,
        registry: FlowRegistry,
    ) -> (Engine, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let engine = StateMachine::builder(stores.0.clone(), stores.1.clone())
            .config(config)
            .registry(registry)
            .observer(recorder.clone())
            .build();
        (engine, recorder)
    }

    async fn settle(engine: &Engine, run_id: Uuid) -> RunOutcome {
        timeout(PATIENCE, engine.wait(run_id))
            .await
            .expect("run did not settle")
            .unwrap()
    }

    async fn until_status(engine: &Engine, run_id: Uuid, want: RunStatus) {
        let mut status = engine.watch_status(run_id).unwrap();
        timeout(PATIENCE, status.wait_for(|s| *s == want))
            .await
            .expect("status not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn completed_run_deletes_its_checkpoint() {
        let stores = stores();
        let (engine, recorder) = launch(&stores, config(false));

        let run_id = engine.start(Countdown::new(3)).await.unwrap();
        assert_eq!(
            settle(&engine, run_id).await,
            RunOutcome::Completed { result: json!(3) }
        );

        assert!(matches!(
            engine.current_checkpoint(run_id).await,
            Err(EngineError::RunNotFound(_))
        ));
        assert!(stores.0.is_empty());
        assert_eq!(engine.reload_count(run_id), Some(0));
        assert_eq!(recorder.reloads(run_id), 0);
        assert_eq!(engine.status(run_id), Some(RunStatus::Completed));
    }

    #[tokio::test]
    async fn reload_after_suspend_counts_persisted_suspensions() {
        let stores = stores();
        let (engine, recorder) = launch(&stores, config(true));

        let run_id = engine.start(Countdown::new(3)).await.unwrap();
        settle(&engine, run_id).await;
        assert_eq!(engine.reload_count(run_id), Some(3));
        assert_eq!(recorder.reloads(run_id), 3);

        // Two of the four suspensions skip persisting and are not reloaded.
        let run_id = engine.start(Countdown::skipping(4)).await.unwrap();
        assert_eq!(
            settle(&engine, run_id).await,
            RunOutcome::Completed { result: json!(4) }
        );
        assert_eq!(engine.reload_count(run_id), Some(2));
        assert_eq!(recorder.reloads(run_id), 2);
    }

    #[tokio::test]
    async fn retained_completion_checkpoint_consumes_next_sequence() {
        let stores = stores();
        let cfg = EngineConfig {
            checkpoint_retention_on_completion: true,
            ..config(false)
        };
        let (engine, _) = launch(&stores, cfg.clone());

        let run_id = engine.start(Countdown::skipping(4)).await.unwrap();
        settle(&engine, run_id).await;

        // initial 0, two persisted sends, completion.
        let checkpoint = engine.current_checkpoint(run_id).await.unwrap();
        assert_eq!(checkpoint.sequence_number, 3);
        assert!(checkpoint.is_completed());

        let (restarted, _) = launch_with(&stores, cfg, registry());
        let report = restarted.recover().await.unwrap();
        assert_eq!(report.completed, vec![run_id]);
        assert_eq!(
            settle(&restarted, run_id).await,
            RunOutcome::Completed { result: json!(4) }
        );
    }

    #[tokio::test]
    async fn retries_count_as_reloads_and_resolve_the_case() {
        let stores = stores();
        let gate = Gated::gate(2);
        let mut registry = registry();
        let injected = gate.clone();
        registry.register_with::<Gated, _>(move |flow| flow.attach(injected.clone()));
        let (engine, recorder) = launch_with(&stores, config(true), registry);

        let run_id = engine.start(Gated::new(gate)).await.unwrap();
        assert_eq!(
            settle(&engine, run_id).await,
            RunOutcome::Completed { result: json!("open") }
        );

        assert_eq!(recorder.retries(run_id), 2);
        assert_eq!(engine.reload_count(run_id), Some(2));
        let cases = engine.hospital_cases().await.unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].state, CaseState::Resolved);
        assert_eq!(cases[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_discard_the_run() {
        let stores = stores();
        let gate = Gated::gate(10);
        let mut registry = registry();
        let injected = gate.clone();
        registry.register_with::<Gated, _>(move |flow| flow.attach(injected.clone()));
        let cfg = EngineConfig {
            max_retry_attempts: 2,
            ..config(false)
        };
        let (engine, recorder) = launch_with(&stores, cfg, registry);

        let run_id = engine.start(Gated::new(gate)).await.unwrap();
        assert!(matches!(
            settle(&engine, run_id).await,
            RunOutcome::Discarded { .. }
        ));
        assert_eq!(recorder.retries(run_id), 2);
        assert_eq!(recorder.discards(run_id), 1);
        assert!(stores.0.is_empty());
    }

    #[tokio::test]
    async fn unrestorable_run_is_observed_once_and_stays_observed() {
        let stores = stores();
        let (engine, recorder) = launch(&stores, config(true));

        let run_id = engine.start(Poison::default()).await.unwrap();
        assert!(matches!(
            settle(&engine, run_id).await,
            RunOutcome::Observation { .. }
        ));
        assert_eq!(recorder.observations(run_id), 1);
        assert_eq!(recorder.discards(run_id), 0);
        assert_eq!(
            engine.current_checkpoint(run_id).await.unwrap().sequence_number,
            1
        );
        engine.shutdown().await;

        let (restarted, recorder) = launch(&stores, config(true));
        let report = restarted.recover().await.unwrap();
        assert_eq!(report.observed, vec![run_id]);
        assert!(matches!(
            settle(&restarted, run_id).await,
            RunOutcome::Observation { .. }
        ));
        assert!(matches!(
            restarted.resume(run_id, ResumeEvent::Checkpoint).await,
            Err(EngineError::InObservation(_))
        ));
        assert_eq!(recorder.observations(run_id), 0);
        assert!(restarted.current_checkpoint(run_id).await.is_ok());
    }

    #[tokio::test]
    async fn state_changing_on_reload_is_a_determinism_failure() {
        let stores = stores();
        let (engine, recorder) = launch(&stores, config(true));

        let run_id = engine.start(Drift).await.unwrap();
        match settle(&engine, run_id).await {
            RunOutcome::Observation { cause } => assert!(cause.contains("not deterministic")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(recorder.observations(run_id), 1);
    }

    /// Deliver `payload` to a run blocked on a receive from "peer".
    async fn answer(engine: &Engine, run_id: Uuid, payload: serde_json::Value) {
        until_status(engine, run_id, RunStatus::Suspended(SuspensionKind::Receive)).await;
        let session = engine
            .current_checkpoint(run_id)
            .await
            .unwrap()
            .suspension
            .session()
            .unwrap();
        let message =
            SessionMessage::new(session, PartyId::new("peer"), engine.party().clone(), payload);
        engine
            .resume(run_id, ResumeEvent::Message(message))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn recovery_restarts_idempotent_runs_and_resumes_the_rest() {
        // The same idempotent flow, never interrupted.
        let (reference, _) = launch(&stores(), config(false));
        let uninterrupted = reference.start(IdempotentProbe::default()).await.unwrap();
        answer(&reference, uninterrupted, json!("go")).await;
        let expected = settle(&reference, uninterrupted).await;
        assert_eq!(expected, RunOutcome::Completed { result: json!(1) });

        let stores = stores();
        let (engine, _) = launch(&stores, config(false));
        let idempotent = engine.start(IdempotentProbe::default()).await.unwrap();
        let waiter = engine.start(Waiter::new("peer")).await.unwrap();
        let receiving = RunStatus::Suspended(SuspensionKind::Receive);
        until_status(&engine, idempotent, receiving).await;
        until_status(&engine, waiter, receiving).await;
        engine.shutdown().await;
        assert!(matches!(engine.start(Countdown::new(1)).await, Err(EngineError::Halted(_))));

        let (restarted, _) = launch(&stores, config(false));
        let report = restarted.recover().await.unwrap();
        assert_eq!(report.restarted, vec![idempotent]);
        assert_eq!(report.resumed, vec![waiter]);
        until_status(&restarted, idempotent, receiving).await;
        until_status(&restarted, waiter, receiving).await;

        // Fresh initial checkpoint at 2, its first suspension at 3.
        let checkpoint = restarted.current_checkpoint(idempotent).await.unwrap();
        assert_eq!(checkpoint.sequence_number, 3);
        assert_eq!(checkpoint.state["starts"], json!(1));

        let checkpoint = restarted.current_checkpoint(waiter).await.unwrap();
        assert_eq!(checkpoint.sequence_number, 1);
        let session = checkpoint.suspension.session().unwrap();
        let message = SessionMessage::new(
            session,
            PartyId::new("peer"),
            restarted.party().clone(),
            json!("hello"),
        );
        restarted
            .resume(waiter, ResumeEvent::Message(message))
            .await
            .unwrap();
        assert_eq!(
            settle(&restarted, waiter).await,
            RunOutcome::Completed { result: json!("hello") }
        );

        // The restarted run finishes with the result of a run never interrupted.
        answer(&restarted, idempotent, json!("go")).await;
        assert_eq!(settle(&restarted, idempotent).await, expected);
        assert!(stores.0.is_empty());
    }

    #[tokio::test]
    async fn message_for_unknown_run_adopts_it_from_the_store() {
        let stores = stores();
        let (engine, _) = launch(&stores, config(false));
        let run_id = engine.start(Waiter::new("peer")).await.unwrap();
        until_status(&engine, run_id, RunStatus::Suspended(SuspensionKind::Receive)).await;
        let session = engine
            .current_checkpoint(run_id)
            .await
            .unwrap()
            .suspension
            .session()
            .unwrap();
        engine.shutdown().await;

        let (other, _) = launch(&stores, config(false));
        let message =
            SessionMessage::new(session, PartyId::new("peer"), other.party().clone(), json!(7));
        other
            .resume(run_id, ResumeEvent::Message(message))
            .await
            .unwrap();
        assert_eq!(
            settle(&other, run_id).await,
            RunOutcome::Completed { result: json!(7) }
        );
        assert!(matches!(
            other.resume(run_id, ResumeEvent::Checkpoint).await,
            Err(EngineError::RunFinished(_))
        ));
    }

    #[tokio::test]
    async fn resume_rejects_active_and_unknown_runs() {
        let stores = stores();
        let (engine, _) = launch(&stores, config(false));
        let run_id = engine.start(Waiter::new("peer")).await.unwrap();

        assert!(matches!(
            engine.resume(run_id, ResumeEvent::Checkpoint).await,
            Err(EngineError::RunActive(_))
        ));
        assert!(matches!(
            engine.resume(Uuid::now_v7(), ResumeEvent::Checkpoint).await,
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_discards_a_blocked_run() {
        let stores = stores();
        let (engine, recorder) = launch(&stores, config(false));
        let mut events = engine.subscribe();

        let run_id = engine.start(Waiter::new("peer")).await.unwrap();
        until_status(&engine, run_id, RunStatus::Suspended(SuspensionKind::Receive)).await;

        engine.cancel(run_id).unwrap();
        assert_eq!(
            settle(&engine, run_id).await,
            RunOutcome::Discarded {
                cause: "run cancelled".to_string()
            }
        );
        assert_eq!(engine.status(run_id), Some(RunStatus::Discarded));
        assert_eq!(recorder.discards(run_id), 1);
        assert!(stores.0.is_empty());
        assert_eq!(engine.session_hub().open_ends(), 0);
        assert!(matches!(engine.cancel(run_id), Err(EngineError::RunFinished(_))));

        let mut cancelled = false;
        while let Ok(event) = events.try_recv() {
            cancelled |= matches!(event, EngineEvent::RunCancelled { run_id: id } if id == run_id);
        }
        assert!(cancelled);
    }

    #[tokio::test]
    async fn send_and_receive_exchanges_with_a_responder() {
        let stores = stores();
        let (engine, recorder) = launch(&stores, config(true));
        spawn_echo(engine.session_hub().clone(), "echo");

        let run_id = engine.start(PingPong::new("echo", 3)).await.unwrap();
        assert_eq!(
            settle(&engine, run_id).await,
            RunOutcome::Completed { result: json!(6) }
        );
        assert_eq!(recorder.reloads(run_id), 3);
    }

    #[tokio::test]
    async fn sleeping_run_wakes_after_its_deadline() {
        let stores = stores();
        let (engine, _) = launch(&stores, config(false));

        let run_id = engine.start(Sleepy::new(20)).await.unwrap();
        assert_eq!(
            settle(&engine, run_id).await,
            RunOutcome::Completed { result: json!(true) }
        );
    }

    #[tokio::test]
    async fn unregistered_flow_cannot_start() {
        let stores = stores();
        let (engine, _) = launch_with(&stores, config(false), FlowRegistry::new());
        assert!(matches!(
            engine.start(Countdown::new(1)).await,
            Err(EngineError::UnregisteredFlow(_))
        ));
        assert!(stores.0.is_empty());
    }

    #[tokio::test]
    async fn observed_run_can_be_released_or_discarded() {
        let stores = stores();
        let (engine, _) = launch(&stores, config(false));
        let first = engine.start(Waiter::new("peer")).await.unwrap();
        let second = engine.start(Waiter::new("peer")).await.unwrap();
        let receiving = RunStatus::Suspended(SuspensionKind::Receive);
        until_status(&engine, first, receiving).await;
        until_status(&engine, second, receiving).await;
        engine.shutdown().await;

        // An engine without the flow registered cannot restore either run.
        let (blind, recorder) = launch_with(&stores, config(false), FlowRegistry::new());
        blind.recover().await.unwrap();
        assert!(matches!(settle(&blind, first).await, RunOutcome::Observation { .. }));
        assert!(matches!(settle(&blind, second).await, RunOutcome::Observation { .. }));
        assert_eq!(recorder.observations(first), 1);

        blind.discard(second).await.unwrap();
        assert!(matches!(settle(&blind, second).await, RunOutcome::Discarded { .. }));
        assert_eq!(recorder.discards(second), 1);
        assert!(matches!(
            blind.current_checkpoint(second).await,
            Err(EngineError::RunNotFound(_))
        ));
        blind.shutdown().await;

        let (fixed, _) = launch(&stores, config(false));
        let report = fixed.recover().await.unwrap();
        assert_eq!(report.observed, vec![first]);
        fixed.release(first).await.unwrap();
        until_status(&fixed, first, receiving).await;
        assert!(matches!(
            fixed.release(first).await,
            Err(EngineError::NotInObservation(_))
        ));
    }

    #[tokio::test]
    async fn misfiled_checkpoint_halts_the_engine() {
        let stores = stores();
        let planted = Uuid::now_v7();
        stores.0.overwrite(
            planted,
            Checkpoint::initial(Uuid::now_v7(), Countdown::NAME, false, json!({})),
        );
        let (engine, _) = launch(&stores, config(false));
        let mut events = engine.subscribe();

        assert!(matches!(
            engine.recover().await,
            Err(EngineError::InvariantViolation(_))
        ));
        assert!(engine.is_halted());
        assert!(matches!(
            engine.start(Countdown::new(1)).await,
            Err(EngineError::Halted(_))
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::InvariantViolated { .. })
        ));
    }

    #[tokio::test]
    async fn failing_store_write_is_retried() {
        let stores = stores();
        let (engine, recorder) = launch(&stores, config(false));
        let run_id = engine.start(Countdown::new(2)).await.unwrap();
        // Not deterministic which write fails, but every retry resumes cleanly.
        stores.0.fail_next_puts(1);
        assert_eq!(
            settle(&engine, run_id).await,
            RunOutcome::Completed { result: json!(2) }
        );
        assert!(recorder.retries(run_id) <= 1);
    }

    #[tokio::test]
    async fn two_runs_on_one_engine_hold_both_ends_of_a_session() {
        let stores = stores();
        let mut registry = registry();
        registry
            .register_initiated::<Doubler, _>(PingPong::NAME, |notice| Doubler::new(notice, 2));
        let (engine, _) = launch_with(&stores, config(true), registry);
        let mut events = engine.subscribe();

        // Addressed to the engine's own party: the request must reach a new
        // accepting run instead of the sender's inbox.
        let initiator = engine.start(PingPong::new("local", 2)).await.unwrap();
        assert_eq!(
            settle(&engine, initiator).await,
            RunOutcome::Completed { result: json!(6) }
        );

        let mut accepting = None;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::RunStarted { run_id, flow_name, .. } = event {
                if flow_name == Doubler::NAME {
                    accepting = Some(run_id);
                }
            }
        }
        let acceptor = accepting.expect("no accepting run was started");
        assert_eq!(
            settle(&engine, acceptor).await,
            RunOutcome::Completed { result: json!([1, 2]) }
        );
        assert_eq!(engine.run_ids().len(), 2);
        assert_eq!(engine.session_hub().open_ends(), 0);
        assert!(stores.0.is_empty());
    }

    #[tokio::test]
    async fn session_without_an_initiated_flow_is_closed() {
        let stores = stores();
        let mut registry = registry();
        registry
            .register_initiated::<Doubler, _>(PingPong::NAME, |notice| Doubler::new(notice, 1));
        let (engine, _) = launch_with(&stores, config(false), registry);

        // Countdown opens a session towards the engine's party but nothing accepts it.
        let run_id = engine.start(Countdown::towards(2, "local")).await.unwrap();
        assert_eq!(
            settle(&engine, run_id).await,
            RunOutcome::Completed { result: json!(2) }
        );
        assert_eq!(engine.run_ids(), vec![run_id]);
        assert_eq!(engine.session_hub().open_ends(), 0);
    }

    #[tokio::test]
    async fn finished_runs_leave_no_session_ends_behind() {
        let stores = stores();
        let (engine, _) = launch(&stores, config(false));

        let mut runs = Vec::new();
        for _ in 0..5 {
            runs.push(engine.start(Countdown::new(2)).await.unwrap());
        }
        for run_id in runs {
            settle(&engine, run_id).await;
        }
        assert_eq!(engine.session_hub().open_ends(), 0);

        let waiter = engine.start(Waiter::new("peer")).await.unwrap();
        until_status(&engine, waiter, RunStatus::Suspended(SuspensionKind::Receive)).await;
        let session = engine
            .current_checkpoint(waiter)
            .await
            .unwrap()
            .suspension
            .session()
            .unwrap();
        let message =
            SessionMessage::new(session, PartyId::new("peer"), PartyId::new("local"), json!(1))
                .with_role(SessionRole::Acceptor);
        engine
            .resume(waiter, ResumeEvent::Message(message.clone()))
            .await
            .unwrap();
        settle(&engine, waiter).await;
        assert_eq!(engine.session_hub().open_ends(), 0);

        // A late duplicate does not bring the inbox back.
        assert!(!engine.session_hub().inbound(message.clone()));
        assert!(matches!(
            engine.resume(waiter, ResumeEvent::Message(message)).await,
            Err(EngineError::RunFinished(_))
        ));
        assert_eq!(engine.session_hub().open_ends(), 0);
    }

    #[tokio::test]
    async fn settled_runs_beyond_retention_are_answered_from_the_store() {
        let stores = stores();
        let cfg = EngineConfig {
            settled_run_retention: 2,
            checkpoint_retention_on_completion: true,
            ..config(false)
        };
        let (engine, _) = launch(&stores, cfg);

        let mut runs = Vec::new();
        for n in 0..5 {
            let run_id = engine.start(Countdown::new(n)).await.unwrap();
            settle(&engine, run_id).await;
            runs.push(run_id);
        }

        let kept = engine.run_ids();
        assert_eq!(kept.len(), 2);
        assert!(kept.contains(&runs[3]) && kept.contains(&runs[4]));
        assert_eq!(engine.status(runs[0]), None);
        assert_eq!(
            engine.wait(runs[0]).await.unwrap(),
            RunOutcome::Completed { result: json!(0) }
        );
        assert!(matches!(
            engine.wait(Uuid::now_v7()).await,
            Err(EngineError::RunNotFound(_))
        ));
    }

    /// Hands out every stored sleep as already due.
    struct Hurried(Arc<InMemoryCheckpointStore>);

    impl CheckpointStore for Hurried {
        async fn put(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
            self.0.put(checkpoint).await
        }

        async fn get(&self, run_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
            let mut checkpoint = self.0.get(run_id).await?;
            if let Some(Suspension::Sleep { until }) =
                checkpoint.as_mut().map(|cp| &mut cp.suspension)
            {
                *until = Utc::now();
            }
            Ok(checkpoint)
        }

        async fn delete(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
            self.0.delete(run_id).await
        }

        async fn list_run_ids(&self) -> Result<Vec<Uuid>, RepositoryError> {
            self.0.list_run_ids().await
        }
    }

    #[tokio::test]
    async fn reload_continues_from_the_stored_suspension() {
        let stores = stores();
        let engine = StateMachine::builder(Hurried(stores.0.clone()), stores.1.clone())
            .config(config(true))
            .registry(registry())
            .build();

        // An hour-long nap, but the stored checkpoint says it is due now.
        let run_id = engine.start(Sleepy::new(3_600_000)).await.unwrap();
        let outcome = timeout(PATIENCE, engine.wait(run_id))
            .await
            .expect("run followed its in-memory suspension")
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { result: json!(true) });
        assert_eq!(engine.reload_count(run_id), Some(1));
    }
}
