//! Event types for the flowkeep engine event bus.
//!
//! `EngineEvent` is broadcast by the state machine and the hospital. All
//! variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::SuspensionKind;

/// Events emitted while runs execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: Uuid,
        flow_name: String,
        idempotent: bool,
    },

    /// A checkpoint was written to the store.
    CheckpointPersisted {
        run_id: Uuid,
        sequence_number: u64,
        kind: SuspensionKind,
    },

    /// The run's in-memory state was rebuilt from its current checkpoint.
    RunReloaded { run_id: Uuid, reload_count: u32 },

    RunCompleted {
        run_id: Uuid,
        flow_name: String,
        duration_ms: u64,
    },

    /// The hospital scheduled another attempt.
    RetryScheduled {
        run_id: Uuid,
        attempt: u32,
        delay_ms: u64,
        cause: String,
    },

    RunDiscarded { run_id: Uuid, cause: String },

    RunObserved { run_id: Uuid, cause: String },

    RunCancelled { run_id: Uuid },

    /// The engine halted; no further runs will be driven.
    InvariantViolated { detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_snake_case() {
        let event = EngineEvent::CheckpointPersisted {
            run_id: Uuid::nil(),
            sequence_number: 3,
            kind: SuspensionKind::SendAndReceive,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"checkpoint_persisted\""));
        assert!(json.contains("\"kind\":\"send_and_receive\""));

        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, EngineEvent::CheckpointPersisted { sequence_number: 3, .. }));
    }
}
