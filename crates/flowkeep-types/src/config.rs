//! Engine configuration types.
//!
//! `EngineConfig` is the `[engine]` body of `flowkeep.toml` and controls
//! checkpoint reloading, hospital retry behaviour, session timeouts and
//! step concurrency.

use serde::{Deserialize, Serialize};

/// Configuration for one state machine instance.
///
/// Loaded from `~/.flowkeep/flowkeep.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Re-read and rebuild every run from the store after each persisted
    /// checkpoint. Exercises checkpoint determinism; off in production.
    #[serde(default)]
    pub reload_checkpoint_after_suspend: bool,

    /// Retries granted to a run before a retryable failure discards it.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Keep a `completed` checkpoint instead of deleting it when a run finishes.
    #[serde(default)]
    pub checkpoint_retention_on_completion: bool,

    /// Base delay before the first retry, doubled on every further attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound for the retry delay.
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// How long a receive may wait for a message. `None` waits forever.
    #[serde(default)]
    pub session_timeout_secs: Option<u64>,

    /// Runs allowed to execute logic or persist checkpoints at the same time.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,

    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Finished runs whose outcome stays in memory for `wait` and `status`.
    /// Older ones are evicted and answered from the stores instead.
    #[serde(default = "default_settled_run_retention")]
    pub settled_run_retention: usize,
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_retry_backoff_max_ms() -> u64 {
    10_000
}

fn default_max_concurrent_steps() -> usize {
    64
}

fn default_event_capacity() -> usize {
    1024
}

fn default_settled_run_retention() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reload_checkpoint_after_suspend: false,
            max_retry_attempts: default_max_retry_attempts(),
            checkpoint_retention_on_completion: false,
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            session_timeout_secs: None,
            max_concurrent_steps: default_max_concurrent_steps(),
            event_capacity: default_event_capacity(),
            settled_run_retention: default_settled_run_retention(),
        }
    }
}

impl EngineConfig {
    /// Clamp values that would otherwise stall the engine.
    pub fn normalized(mut self) -> Self {
        self.max_concurrent_steps = self.max_concurrent_steps.max(1);
        self.event_capacity = self.event_capacity.max(1);
        self.retry_backoff_max_ms = self.retry_backoff_max_ms.max(self.retry_backoff_ms);
        self
    }
}

/// Top-level layout of `flowkeep.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowkeepConfig {
    #[serde(default)]
    pub engine: EngineConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert!(!config.reload_checkpoint_after_suspend);
        assert_eq!(config.max_retry_attempts, 3);
        assert!(!config.checkpoint_retention_on_completion);
        assert_eq!(config.retry_backoff_ms, 100);
        assert_eq!(config.retry_backoff_max_ms, 10_000);
        assert!(config.session_timeout_secs.is_none());
        assert_eq!(config.max_concurrent_steps, 64);
        assert_eq!(config.settled_run_retention, 1024);
    }

    #[test]
    fn test_config_deserialize_with_defaults() {
        let config: FlowkeepConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_config_deserialize_with_values() {
        let toml_str = r#"
[engine]
reload_checkpoint_after_suspend = true
max_retry_attempts = 5
session_timeout_secs = 30
settled_run_retention = 16
"#;
        let config: FlowkeepConfig = toml::from_str(toml_str).unwrap();
        assert!(config.engine.reload_checkpoint_after_suspend);
        assert_eq!(config.engine.max_retry_attempts, 5);
        assert_eq!(config.engine.session_timeout_secs, Some(30));
        assert_eq!(config.engine.settled_run_retention, 16);
        assert_eq!(config.engine.retry_backoff_ms, 100);
    }

    #[test]
    fn test_normalized_clamps_degenerate_values() {
        let config = EngineConfig {
            max_concurrent_steps: 0,
            retry_backoff_ms: 500,
            retry_backoff_max_ms: 10,
            ..EngineConfig::default()
        }
        .normalized();
        assert_eq!(config.max_concurrent_steps, 1);
        assert_eq!(config.retry_backoff_max_ms, 500);
    }
}
