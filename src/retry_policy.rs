//! # Retry Policy
//!
//! Exponential backoff shared by the reprocessing loop (claim retries) and the
//! fan-out children (attempt retries).
//!
//! The wait before retry `n` (1-indexed) is
//! `min(initial_interval * backoff_coefficient^(n-1), maximum_interval)`.
//! With `initial_interval = 2s`, coefficient `2` and `maximum_interval = 30s`
//! retries 1..6 wait `2s, 4s, 8s, 16s, 30s, 30s`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants;

/// Errors raised when a policy violates its invariants
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryPolicyError {
    #[error("initial interval ({initial_ms}ms) exceeds maximum interval ({maximum_ms}ms)")]
    InvalidIntervals { initial_ms: u64, maximum_ms: u64 },

    #[error("backoff coefficient must be a finite number >= 1.0, got {0}")]
    InvalidCoefficient(f64),

    #[error("maximum attempts must be at least 1 (omit it for unlimited attempts)")]
    ZeroAttempts,
}

/// Retry and backoff settings for one kind of operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Wait before the first retry, in milliseconds
    pub initial_interval_ms: u64,
    /// Cap on any single wait, in milliseconds
    pub maximum_interval_ms: u64,
    /// Multiplicative growth between consecutive waits
    pub backoff_coefficient: f64,
    /// Total attempts (first execution included); `None` means unlimited
    #[serde(default)]
    pub maximum_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: constants::fan_out::INITIAL_INTERVAL_MS,
            maximum_interval_ms: constants::fan_out::MAXIMUM_INTERVAL_MS,
            backoff_coefficient: constants::fan_out::BACKOFF_COEFFICIENT,
            maximum_attempts: Some(constants::fan_out::MAXIMUM_ATTEMPTS),
        }
    }
}

impl RetryPolicy {
    /// Build a validated policy
    pub fn new(
        initial_interval: Duration,
        maximum_interval: Duration,
        backoff_coefficient: f64,
        maximum_attempts: Option<u32>,
    ) -> Result<Self, RetryPolicyError> {
        let policy = Self {
            initial_interval_ms: duration_to_ms(initial_interval),
            maximum_interval_ms: duration_to_ms(maximum_interval),
            backoff_coefficient,
            maximum_attempts,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Unlimited retries used around `claim_batch` failures
    pub fn claim_retry_default() -> Self {
        Self {
            initial_interval_ms: constants::reprocessing::CLAIM_RETRY_INITIAL_INTERVAL_MS,
            maximum_interval_ms: constants::reprocessing::CLAIM_RETRY_MAXIMUM_INTERVAL_MS,
            backoff_coefficient: 2.0,
            maximum_attempts: None,
        }
    }

    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.initial_interval_ms > self.maximum_interval_ms {
            return Err(RetryPolicyError::InvalidIntervals {
                initial_ms: self.initial_interval_ms,
                maximum_ms: self.maximum_interval_ms,
            });
        }
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(RetryPolicyError::InvalidCoefficient(self.backoff_coefficient));
        }
        if self.maximum_attempts == Some(0) {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        Ok(())
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn maximum_interval(&self) -> Duration {
        Duration::from_millis(self.maximum_interval_ms)
    }

    /// Wait before retry `retry` (1-indexed). Retry 0 is the first execution and
    /// never waits.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let raw_ms = self.initial_interval_ms as f64 * self.backoff_coefficient.powi(exponent);
        let capped_ms = raw_ms.min(self.maximum_interval_ms as f64);
        // `as` saturates for out-of-range floats
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt is allowed after `failed_attempts` failures
    pub fn allows_attempt_after(&self, failed_attempts: u32) -> bool {
        match self.maximum_attempts {
            Some(max) => failed_attempts < max,
            None => true,
        }
    }

    /// Waits between attempts for a bounded policy, in order.
    ///
    /// Unlimited policies yield `limit` entries.
    pub fn schedule(&self, limit: u32) -> Vec<Duration> {
        let retries = match self.maximum_attempts {
            Some(max) => max.saturating_sub(1).min(limit),
            None => limit,
        };
        (1..=retries).map(|retry| self.delay_for_retry(retry)).collect()
    }
}

/// Consecutive-failure tracker driving waits between failed operations
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
        }
    }

    /// Record a failure and return the wait before trying again
    pub fn next_delay(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.policy.delay_for_retry(self.consecutive_failures)
    }

    /// Whether the policy still permits another try
    pub fn can_retry(&self) -> bool {
        self.policy.allows_attempt_after(self.consecutive_failures)
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
