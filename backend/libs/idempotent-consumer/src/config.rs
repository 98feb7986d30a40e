//! Consumer configuration
//!
//! Loaded from `IDEMPOTENT_CONSUMER_*` environment variables; every field has
//! a default.

use serde::Deserialize;
use std::time::Duration;

use crate::consumer::LoopSettings;
use crate::error::{IdempotencyError, IdempotencyResult};
use crate::retry::RetryPolicy;

/// Environment variable prefix for [`ConsumerConfig::from_env`]
pub const ENV_PREFIX: &str = "IDEMPOTENT_CONSUMER_";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Retries after the first failed attempt; exceeding it quarantines the message
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Upper bound for one processing attempt
    pub processing_timeout_ms: u64,
    /// How long dedup records are kept (default 30 days)
    pub dedup_retention_secs: u64,
    /// Longest time the broker can redeliver a message (default 7 days)
    pub broker_retention_secs: u64,
    pub sweep_interval_secs: u64,
    pub partition_buffer: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
            processing_timeout_ms: 30_000,
            dedup_retention_secs: 30 * 86_400,
            broker_retention_secs: 7 * 86_400,
            sweep_interval_secs: 3600,
            partition_buffer: 256,
        }
    }
}

impl ConsumerConfig {
    /// Load from `IDEMPOTENT_CONSUMER_*` variables and validate
    pub fn from_env() -> IdempotencyResult<Self> {
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| IdempotencyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> IdempotencyResult<()> {
        if self.processing_timeout_ms == 0 {
            return Err(IdempotencyError::Config(
                "processing_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.partition_buffer == 0 {
            return Err(IdempotencyError::Config(
                "partition_buffer must be greater than zero".to_string(),
            ));
        }

        if self.backoff_multiplier < 1.0 {
            return Err(IdempotencyError::Config(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }

        // A record expiring before the broker stops redelivering would let a
        // late redelivery through as new
        if self.dedup_retention_secs <= self.broker_retention_secs {
            return Err(IdempotencyError::Config(format!(
                "dedup_retention_secs ({}) must exceed broker_retention_secs ({})",
                self.dedup_retention_secs, self.broker_retention_secs
            )));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            retry: self.retry_policy(),
            partition_buffer: self.partition_buffer,
            ..LoopSettings::default()
        }
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConsumerConfig::default();
        config.validate().unwrap();

        assert_eq!(config.retry_policy().max_retries, 5);
        assert_eq!(config.processing_timeout(), Duration::from_secs(30));
        assert_eq!(config.dedup_retention(), Duration::from_secs(2_592_000));
    }

    #[test]
    fn test_retention_must_outlive_redelivery_window() {
        let config = ConsumerConfig {
            dedup_retention_secs: 86_400,
            broker_retention_secs: 7 * 86_400,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(IdempotencyError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_timeout_and_shrinking_backoff() {
        let zero_timeout = ConsumerConfig {
            processing_timeout_ms: 0,
            ..Default::default()
        };
        assert!(zero_timeout.validate().is_err());

        let shrinking = ConsumerConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn test_prefixed_variables_override_defaults() {
        let vars = vec![
            ("IDEMPOTENT_CONSUMER_MAX_RETRIES".to_string(), "3".to_string()),
            ("IDEMPOTENT_CONSUMER_JITTER".to_string(), "false".to_string()),
        ];
        let config: ConsumerConfig = envy::prefixed(ENV_PREFIX).from_iter(vars).unwrap();

        assert_eq!(config.max_retries, 3);
        assert!(!config.jitter);
        assert_eq!(config.partition_buffer, 256);
    }
}
