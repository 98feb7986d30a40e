//! Bounded retry state with exponential backoff and jitter

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first failed attempt before a message is quarantined
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let base_ms = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = Duration::from_millis(base_ms.min(self.max_backoff.as_millis() as f64) as u64);
        apply_jitter(capped, self.jitter)
    }
}

fn apply_jitter(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let mut rng = rand::thread_rng();
        let jitter_factor = 1.0 + rng.gen_range(-0.3..0.3); // ±30%
        Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
    } else {
        base
    }
}

/// What the consumption loop does after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait and retry the same message
    Retry(Duration),
    /// Retry budget exhausted: dead-letter and acknowledge
    Quarantine,
}

/// Per-message attempt counters
///
/// Processing failures spend the retry budget. Storage failures do not: the
/// message is retried until the store comes back, since quarantining it would
/// acknowledge a message that was never examined.
#[derive(Debug, Default, Clone)]
pub struct AttemptState {
    attempts: u32,
    processing_failures: u32,
    storage_failures: u32,
}

impl AttemptState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of an attempt
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn processing_failures(&self) -> u32 {
        self.processing_failures
    }

    pub fn storage_failures(&self) -> u32 {
        self.storage_failures
    }

    pub fn record_processing_failure(&mut self, policy: &RetryPolicy) -> RetryDecision {
        self.processing_failures += 1;
        if self.processing_failures > policy.max_retries {
            RetryDecision::Quarantine
        } else {
            RetryDecision::Retry(policy.backoff_for(self.processing_failures))
        }
    }

    pub fn record_storage_failure(&mut self, policy: &RetryPolicy) -> Duration {
        self.storage_failures += 1;
        policy.backoff_for(self.storage_failures)
    }
}
