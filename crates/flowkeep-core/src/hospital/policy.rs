//! Stateless hospital policy: classification, retry bound and backoff.

use std::time::Duration;

use flowkeep_types::config::EngineConfig;
use flowkeep_types::error::RepositoryError;
use flowkeep_types::hospital::FailureClass;

use crate::flow::error::{FlowError, RunError};
use crate::session::SessionError;

// ---------------------------------------------------------------------------
// Disposition
// ---------------------------------------------------------------------------

/// What the state machine must do with a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Resume from the current checkpoint after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Delete the checkpoint and finish the run as discarded.
    Discard,
    /// Keep the checkpoint and hold the run for manual action.
    Observe,
}

// ---------------------------------------------------------------------------
// HospitalPolicy
// ---------------------------------------------------------------------------

/// No internal state, all logic is in associated functions that take
/// configuration as parameters.
pub struct HospitalPolicy;

impl HospitalPolicy {
    /// Classify a run failure.
    pub fn classify(err: &RunError) -> FailureClass {
        match err {
            RunError::Flow(FlowError::Rejected(_) | FlowError::UnexpectedPayload(_)) => {
                FailureClass::Business
            }
            RunError::Flow(FlowError::RetryRequested(_)) => FailureClass::Retryable,
            RunError::Flow(FlowError::Serialization(_)) => FailureClass::Unrecoverable,

            RunError::Session(SessionError::UnexpectedPayload { .. }) => FailureClass::Business,
            RunError::Session(_) => FailureClass::Retryable,

            RunError::Store(RepositoryError::Connection | RepositoryError::Query(_)) => {
                FailureClass::Retryable
            }
            RunError::Store(_) => FailureClass::Unrecoverable,

            RunError::Restore { .. }
            | RunError::UnknownFlow(_)
            | RunError::Determinism { .. }
            | RunError::MissingCheckpoint(_)
            | RunError::MissingInitialState(_)
            | RunError::Invariant(_)
            | RunError::Cancelled
            | RunError::Halted => FailureClass::Unrecoverable,
        }
    }

    /// Whether another retry is allowed after `attempts` retries.
    pub fn should_retry(config: &EngineConfig, attempts: u32) -> bool {
        attempts < config.max_retry_attempts
    }

    /// Delay before retry number `attempt` (1-based):
    /// `retry_backoff_ms * 2^(attempt-1)`, capped at `retry_backoff_max_ms`.
    pub fn backoff(config: &EngineConfig, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let ms = config
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(config.retry_backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Decide the disposition for a failure of `class` after `attempts` retries.
    pub fn decide(config: &EngineConfig, class: FailureClass, attempts: u32) -> Disposition {
        match class {
            FailureClass::Business => Disposition::Discard,
            FailureClass::Unrecoverable => Disposition::Observe,
            FailureClass::Retryable if Self::should_retry(config, attempts) => {
                let attempt = attempts + 1;
                Disposition::Retry {
                    attempt,
                    delay: Self::backoff(config, attempt),
                }
            }
            FailureClass::Retryable => Disposition::Discard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkeep_types::session::{PartyId, SessionId};
    use uuid::Uuid;

    fn config() -> EngineConfig {
        EngineConfig {
            max_retry_attempts: 3,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 350,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn classifies_failures() {
        let business = RunError::from(FlowError::rejected("no"));
        assert_eq!(HospitalPolicy::classify(&business), FailureClass::Business);

        let busy = RunError::from(SessionError::Busy {
            session: SessionId::new(),
            party: PartyId::new("me"),
        });
        assert_eq!(HospitalPolicy::classify(&busy), FailureClass::Retryable);

        let transient = RunError::Store(RepositoryError::Connection);
        assert_eq!(HospitalPolicy::classify(&transient), FailureClass::Retryable);

        let corrupted = RunError::Store(RepositoryError::Corrupted("digest".into()));
        assert_eq!(HospitalPolicy::classify(&corrupted), FailureClass::Unrecoverable);

        let nondeterministic = RunError::Determinism {
            run_id: Uuid::nil(),
            sequence: 1,
        };
        assert_eq!(
            HospitalPolicy::classify(&nondeterministic),
            FailureClass::Unrecoverable
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = config();
        assert_eq!(HospitalPolicy::backoff(&config, 1), Duration::from_millis(100));
        assert_eq!(HospitalPolicy::backoff(&config, 2), Duration::from_millis(200));
        assert_eq!(HospitalPolicy::backoff(&config, 3), Duration::from_millis(350));
        assert_eq!(HospitalPolicy::backoff(&config, 80), Duration::from_millis(350));
    }

    #[test]
    fn retryable_failures_are_bounded() {
        let config = config();
        assert_eq!(
            HospitalPolicy::decide(&config, FailureClass::Retryable, 0),
            Disposition::Retry {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert!(matches!(
            HospitalPolicy::decide(&config, FailureClass::Retryable, 2),
            Disposition::Retry { attempt: 3, .. }
        ));
        assert_eq!(
            HospitalPolicy::decide(&config, FailureClass::Retryable, 3),
            Disposition::Discard
        );
    }

    #[test]
    fn business_discards_and_unrecoverable_observes() {
        let config = config();
        assert_eq!(
            HospitalPolicy::decide(&config, FailureClass::Business, 0),
            Disposition::Discard
        );
        assert_eq!(
            HospitalPolicy::decide(&config, FailureClass::Unrecoverable, 0),
            Disposition::Observe
        );
    }
}
