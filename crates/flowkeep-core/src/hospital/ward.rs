//! The hospital: per-run failure cases and their dispositions.

use chrono::Utc;
use flowkeep_types::config::EngineConfig;
use flowkeep_types::error::RepositoryError;
use flowkeep_types::event::EngineEvent;
use flowkeep_types::hospital::{CaseState, HospitalCase};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::policy::{Disposition, HospitalPolicy};
use crate::event::bus::EventBus;
use crate::flow::error::RunError;
use crate::flow::observer::ObserverSet;
use crate::repository::hospital::HospitalRepository;

/// Receives run failures and decides retry, discard or observation.
///
/// Generic over `H: HospitalRepository`; cases are persisted so a run held
/// for observation stays held across restarts.
pub struct Hospital<H: HospitalRepository> {
    repo: H,
    config: EngineConfig,
    observers: ObserverSet,
    events: EventBus,
}

impl<H: HospitalRepository> Hospital<H> {
    pub(crate) fn new(
        repo: H,
        config: EngineConfig,
        observers: ObserverSet,
        events: EventBus,
    ) -> Self {
        Self {
            repo,
            config,
            observers,
            events,
        }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &H {
        &self.repo
    }

    /// Admit a failed run and return what the state machine must do with it.
    ///
    /// If the case cannot be recorded the run is held for observation.
    pub async fn admit(&self, run_id: Uuid, err: &RunError) -> Disposition {
        let class = HospitalPolicy::classify(err);
        let cause = err.to_string();

        let existing = match self.repo.get_case(&run_id).await {
            Ok(case) => case,
            Err(e) => return self.observe_unrecorded(run_id, &cause, e),
        };
        let mut case = match existing {
            Some(case) if case.state == CaseState::Observation => {
                // Observers were told when the case entered observation.
                return Disposition::Observe;
            }
            Some(case) if !case.state.is_closed() => case,
            _ => HospitalCase::new(run_id, cause.clone(), class),
        };

        let disposition = HospitalPolicy::decide(&self.config, class, case.attempt_count);
        case.cause = cause.clone();
        case.class = class;
        case.updated_at = Utc::now();
        case.state = match disposition {
            Disposition::Retry { attempt, .. } => {
                case.attempt_count = attempt;
                CaseState::Retrying
            }
            Disposition::Discard => CaseState::Discarded,
            Disposition::Observe => CaseState::Observation,
        };

        if let Err(e) = self.repo.save_case(&case).await {
            return self.observe_unrecorded(run_id, &cause, e);
        }

        match disposition {
            Disposition::Retry { attempt, delay } => {
                warn!(run_id = %run_id, %class, attempt, delay_ms = delay.as_millis() as u64, cause, "run admitted, retrying");
                self.observers.retrying(run_id, attempt);
                self.events.publish(EngineEvent::RetryScheduled {
                    run_id,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    cause,
                });
            }
            Disposition::Discard => {
                warn!(run_id = %run_id, %class, attempts = case.attempt_count, cause, "run admitted, discarding");
                self.observers.discarded(run_id, &cause);
                self.events.publish(EngineEvent::RunDiscarded { run_id, cause });
            }
            Disposition::Observe => {
                warn!(run_id = %run_id, %class, cause, "run admitted, keeping for observation");
                self.observers.kept_for_observation(run_id, &cause);
                self.events.publish(EngineEvent::RunObserved { run_id, cause });
            }
        }
        disposition
    }

    fn observe_unrecorded(&self, run_id: Uuid, cause: &str, err: RepositoryError) -> Disposition {
        error!(run_id = %run_id, error = %err, cause, "cannot record hospital case, keeping run for observation");
        self.observers.kept_for_observation(run_id, cause);
        self.events.publish(EngineEvent::RunObserved {
            run_id,
            cause: cause.to_string(),
        });
        Disposition::Observe
    }

    /// Mark an open case resolved after its run completed.
    pub async fn resolve(&self, run_id: Uuid) {
        self.close_case(run_id, CaseState::Resolved).await;
    }

    /// Close an open case as discarded without notifying anyone. Used when
    /// a run is cancelled.
    pub async fn withdraw(&self, run_id: Uuid) {
        self.close_case(run_id, CaseState::Discarded).await;
    }

    async fn close_case(&self, run_id: Uuid, state: CaseState) {
        let case = match self.repo.get_case(&run_id).await {
            Ok(Some(case)) if !case.state.is_closed() => case,
            Ok(_) => return,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "cannot load hospital case");
                return;
            }
        };
        let case = HospitalCase {
            state,
            updated_at: Utc::now(),
            ..case
        };
        if let Err(e) = self.repo.save_case(&case).await {
            warn!(run_id = %run_id, error = %e, %state, "cannot close hospital case");
        } else {
            info!(run_id = %run_id, %state, "closed hospital case");
        }
    }

    /// The case holding `run_id` in observation, if any.
    pub async fn observed_case(&self, run_id: Uuid) -> Result<Option<HospitalCase>, RepositoryError> {
        Ok(self
            .repo
            .get_case(&run_id)
            .await?
            .filter(|case| case.state == CaseState::Observation))
    }

    /// Let an observed run be driven again. Its failure history is dropped.
    pub async fn release(&self, run_id: Uuid) -> Result<(), RepositoryError> {
        self.repo.delete_case(&run_id).await?;
        info!(run_id = %run_id, "released run from observation");
        Ok(())
    }

    /// Discard an observed run on operator request.
    pub async fn discard(&self, run_id: Uuid, cause: &str) -> Result<(), RepositoryError> {
        if let Some(case) = self.repo.get_case(&run_id).await? {
            let case = HospitalCase {
                state: CaseState::Discarded,
                cause: cause.to_string(),
                updated_at: Utc::now(),
                ..case
            };
            self.repo.save_case(&case).await?;
        }
        warn!(run_id = %run_id, cause, "discarded observed run");
        self.observers.discarded(run_id, cause);
        self.events.publish(EngineEvent::RunDiscarded {
            run_id,
            cause: cause.to_string(),
        });
        Ok(())
    }

    pub async fn cases(&self) -> Result<Vec<HospitalCase>, RepositoryError> {
        self.repo.list_cases().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::error::FlowError;
    use crate::flow::observer::EngineObserver;
    use crate::flow::testing::Recorder;
    use crate::repository::memory::InMemoryHospitalRepository;
    use std::sync::Arc;
    use std::time::Duration;

    fn hospital(max_retry_attempts: u32) -> (Hospital<InMemoryHospitalRepository>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let config = EngineConfig {
            max_retry_attempts,
            retry_backoff_ms: 10,
            ..EngineConfig::default()
        };
        let hospital = Hospital::new(
            InMemoryHospitalRepository::new(),
            config,
            ObserverSet::new(vec![recorder.clone() as Arc<dyn EngineObserver>]),
            EventBus::new(16),
        );
        (hospital, recorder)
    }

    fn retryable() -> RunError {
        RunError::from(FlowError::RetryRequested("again".into()))
    }

    #[tokio::test]
    async fn retries_until_bound_then_discards() {
        let (hospital, recorder) = hospital(2);
        let run_id = Uuid::now_v7();

        assert_eq!(
            hospital.admit(run_id, &retryable()).await,
            Disposition::Retry {
                attempt: 1,
                delay: Duration::from_millis(10)
            }
        );
        assert!(matches!(
            hospital.admit(run_id, &retryable()).await,
            Disposition::Retry { attempt: 2, .. }
        ));
        assert_eq!(hospital.admit(run_id, &retryable()).await, Disposition::Discard);

        let case = hospital.repo().get_case(&run_id).await.unwrap().unwrap();
        assert_eq!(case.state, CaseState::Discarded);
        assert_eq!(case.attempt_count, 2);
        assert_eq!(recorder.retries(run_id), 2);
        assert_eq!(recorder.discards(run_id), 1);
    }

    #[tokio::test]
    async fn observation_is_reported_once() {
        let (hospital, recorder) = hospital(3);
        let run_id = Uuid::now_v7();
        let err = RunError::UnknownFlow("gone".into());

        assert_eq!(hospital.admit(run_id, &err).await, Disposition::Observe);
        assert_eq!(hospital.admit(run_id, &err).await, Disposition::Observe);

        assert_eq!(recorder.observations(run_id), 1);
        assert!(hospital.observed_case(run_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn resolve_closes_open_case() {
        let (hospital, _) = hospital(3);
        let run_id = Uuid::now_v7();
        hospital.admit(run_id, &retryable()).await;

        hospital.resolve(run_id).await;
        let case = hospital.repo().get_case(&run_id).await.unwrap().unwrap();
        assert_eq!(case.state, CaseState::Resolved);

        // A later failure opens a fresh case.
        hospital.admit(run_id, &retryable()).await;
        let case = hospital.repo().get_case(&run_id).await.unwrap().unwrap();
        assert_eq!(case.attempt_count, 1);
        assert_eq!(case.state, CaseState::Retrying);
    }

    #[tokio::test]
    async fn business_failures_are_discarded_immediately() {
        let (hospital, recorder) = hospital(3);
        let run_id = Uuid::now_v7();
        let err = RunError::from(FlowError::rejected("out of range"));

        assert_eq!(hospital.admit(run_id, &err).await, Disposition::Discard);
        assert_eq!(recorder.retries(run_id), 0);
        assert_eq!(recorder.discards(run_id), 1);
    }

    #[tokio::test]
    async fn release_forgets_the_case() {
        let (hospital, _) = hospital(3);
        let run_id = Uuid::now_v7();
        hospital.admit(run_id, &RunError::UnknownFlow("x".into())).await;

        hospital.release(run_id).await.unwrap();
        assert!(hospital.observed_case(run_id).await.unwrap().is_none());
        assert!(hospital.cases().await.unwrap().is_empty());
    }
}
