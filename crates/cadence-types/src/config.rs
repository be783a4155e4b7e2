//! Engine configuration types for Cadence.
//!
//! `EngineConfig` represents `cadence.toml` in the data directory. All
//! fields have defaults, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

/// Runtime tuning for the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Retry policy applied to transient action failures.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Upper bound on a single handler invocation.
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,

    /// How long a dispatch claim is held before the task is redelivered.
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,

    /// Maximum tasks claimed per dispatch pass.
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: usize,

    /// Maximum handler invocations running at once.
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,

    /// Timer loop poll interval.
    #[serde(default = "default_timer_tick_ms")]
    pub timer_tick_ms: u64,

    /// Dispatch loop poll interval.
    #[serde(default = "default_dispatch_poll_ms")]
    pub dispatch_poll_ms: u64,

    /// Largest `max_iterations` a loop node may declare.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// Re-read-and-retry attempts on an epoch conflict before giving up.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Pure nodes executed in one advance before the instance is re-queued.
    #[serde(default = "default_max_steps_per_advance")]
    pub max_steps_per_advance: u32,

    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_action_timeout_secs() -> u64 {
    30
}

fn default_claim_timeout_secs() -> u64 {
    120
}

fn default_dispatch_batch_size() -> usize {
    32
}

fn default_dispatch_concurrency() -> usize {
    8
}

fn default_timer_tick_ms() -> u64 {
    250
}

fn default_dispatch_poll_ms() -> u64 {
    500
}

fn default_max_loop_iterations() -> u32 {
    1000
}

fn default_max_conflict_retries() -> u32 {
    8
}

fn default_max_steps_per_advance() -> u32 {
    1024
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            action_timeout_secs: default_action_timeout_secs(),
            claim_timeout_secs: default_claim_timeout_secs(),
            dispatch_batch_size: default_dispatch_batch_size(),
            dispatch_concurrency: default_dispatch_concurrency(),
            timer_tick_ms: default_timer_tick_ms(),
            dispatch_poll_ms: default_dispatch_poll_ms(),
            max_loop_iterations: default_max_loop_iterations(),
            max_conflict_retries: default_max_conflict_retries(),
            max_steps_per_advance: default_max_steps_per_advance(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

/// Exponential backoff policy: `base * 2^attempt`, plus jitter, capped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of the unjittered delay added as random jitter.
    /// Values above 0.5 are clamped to 0.5.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

impl RetryPolicy {
    /// Jitter ratio clamped to `[0, 0.5]`.
    pub fn effective_jitter_ratio(&self) -> f64 {
        if self.jitter_ratio.is_nan() {
            return 0.0;
        }
        self.jitter_ratio.clamp(0.0, 0.5)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.action_timeout_secs, 30);
        assert_eq!(config.max_loop_iterations, 1000);
        assert_eq!(config.event_bus_capacity, 1024);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
dispatch_concurrency = 2

[retry]
max_attempts = 3
jitter_ratio = 0.9
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dispatch_concurrency, 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.retry.effective_jitter_ratio(), 0.5);
    }
}
