//! Hospital case types: the record of a run's failure and its disposition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

/// How a failure is treated by the hospital.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Raised by workflow logic itself. Never retried.
    Business,
    /// Transport, session or explicit retry signal. Retried up to the bound.
    Retryable,
    /// Serialization, restore or determinism failure. Held for observation.
    Unrecoverable,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Business => write!(f, "business"),
            FailureClass::Retryable => write!(f, "retryable"),
            FailureClass::Unrecoverable => write!(f, "unrecoverable"),
        }
    }
}

impl FromStr for FailureClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "business" => Ok(FailureClass::Business),
            "retryable" => Ok(FailureClass::Retryable),
            "unrecoverable" => Ok(FailureClass::Unrecoverable),
            other => Err(format!("invalid failure class: '{other}'")),
        }
    }
}

/// Lifecycle state of a hospital case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    Admitted,
    Retrying,
    /// The run completed after being retried.
    Resolved,
    Discarded,
    /// Held indefinitely pending manual action.
    Observation,
}

impl CaseState {
    pub fn is_closed(&self) -> bool {
        matches!(self, CaseState::Resolved | CaseState::Discarded)
    }
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseState::Admitted => write!(f, "admitted"),
            CaseState::Retrying => write!(f, "retrying"),
            CaseState::Resolved => write!(f, "resolved"),
            CaseState::Discarded => write!(f, "discarded"),
            CaseState::Observation => write!(f, "observation"),
        }
    }
}

impl FromStr for CaseState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admitted" => Ok(CaseState::Admitted),
            "retrying" => Ok(CaseState::Retrying),
            "resolved" => Ok(CaseState::Resolved),
            "discarded" => Ok(CaseState::Discarded),
            "observation" => Ok(CaseState::Observation),
            other => Err(format!("invalid case state: '{other}'")),
        }
    }
}

/// A record of one run's failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HospitalCase {
    pub run_id: Uuid,
    /// Message of the most recent failure.
    pub cause: String,
    pub class: FailureClass,
    /// Number of retries granted so far.
    pub attempt_count: u32,
    pub state: CaseState,
    pub admitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HospitalCase {
    pub fn new(run_id: Uuid, cause: impl Into<String>, class: FailureClass) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            cause: cause.into(),
            class,
            attempt_count: 0,
            state: CaseState::Admitted,
            admitted_at: now,
            updated_at: now,
        }
    }
}
