//! Engine configuration types.
//!
//! `EngineConfig` is passed explicitly to the runtime builder. It is usually
//! loaded from a TOML file; every field has a default.

use serde::{Deserialize, Serialize};

use crate::flow::RetryPolicy;

/// Runtime-wide settings for the flow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// `maxIterations` applied to `forEach` edges that do not declare one.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,

    /// Upper bound on concurrently running nodes within one run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Hub broadcast channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Default wait for a `reply` to an outstanding prompt.
    #[serde(default = "default_prompt_timeout_ms")]
    pub prompt_timeout_ms: u64,

    /// Retry policy for nodes that declare none.
    #[serde(default)]
    pub default_retry: RetryPolicy,
}

fn default_max_iterations() -> u32 {
    1000
}

fn default_max_concurrency() -> usize {
    16
}

fn default_event_capacity() -> usize {
    1024
}

fn default_prompt_timeout_ms() -> u64 {
    300_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            max_concurrency: default_max_concurrency(),
            event_capacity: default_event_capacity(),
            prompt_timeout_ms: default_prompt_timeout_ms(),
            default_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Clamp zero values to the smallest usable setting.
    pub fn validated(mut self) -> Self {
        self.default_max_iterations = self.default_max_iterations.max(1);
        self.max_concurrency = self.max_concurrency.max(1);
        self.event_capacity = self.event_capacity.max(1);
        self.default_retry.max_attempts = self.default_retry.max_attempts.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.default_max_iterations, 1000);
        assert_eq!(config.max_concurrency, 16);
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.prompt_timeout_ms, 300_000);
        assert_eq!(config.default_retry, RetryPolicy::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
default_max_iterations = 50
max_concurrency = 4

[default_retry]
maxAttempts = 3
backoffMs = 25
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_max_iterations, 50);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.default_retry, RetryPolicy::new(3, 25));
    }

    #[test]
    fn test_validated_clamps_zeroes() {
        let config = EngineConfig {
            default_max_iterations: 0,
            max_concurrency: 0,
            event_capacity: 0,
            prompt_timeout_ms: 0,
            default_retry: RetryPolicy::new(0, 0),
        }
        .validated();
        assert_eq!(config.default_max_iterations, 1);
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.event_capacity, 1);
        assert_eq!(config.default_retry.max_attempts, 1);
    }
}
