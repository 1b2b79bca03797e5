//! Retry/backoff bookkeeping for retryable failures.
//!
//! Exponential backoff with multiplicative jitter. Routine operations use
//! 2s, 4s, 8s, 16s (capped at 5 minutes); urgent ones start at 500ms and cap
//! at one minute. The fifth retryable failure kills the operation.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;
use crate::models::{DeadReason, OperationStatus, QueuedOperation, HIGH_PRIORITY};

const DEFAULT_BASE_DELAY_MS: u64 = 2_000;
const DEFAULT_MAX_DELAY_MS: u64 = 5 * 60 * 1_000;
const DEFAULT_HIGH_PRIORITY_BASE_DELAY_MS: u64 = 500;
const DEFAULT_HIGH_PRIORITY_MAX_DELAY_MS: u64 = 60 * 1_000;
const DEFAULT_JITTER: f64 = 0.25;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub high_priority_base_delay_ms: u64,
    pub high_priority_max_delay_ms: u64,
    /// Upper bound of the random multiplier added to each delay (0.25 = up to +25%)
    pub jitter: f64,
    /// Retryable failures allowed before an operation is marked dead
    pub max_attempts: u32,
    pub high_priority_threshold: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            high_priority_base_delay_ms: DEFAULT_HIGH_PRIORITY_BASE_DELAY_MS,
            high_priority_max_delay_ms: DEFAULT_HIGH_PRIORITY_MAX_DELAY_MS,
            jitter: DEFAULT_JITTER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            high_priority_threshold: HIGH_PRIORITY,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before attempt `attempt + 1`, ignoring jitter
    pub fn base_delay(&self, attempt: u32, priority: i32) -> Duration {
        let (base, cap) = if priority >= self.high_priority_threshold {
            (
                self.high_priority_base_delay_ms,
                self.high_priority_max_delay_ms,
            )
        } else {
            (self.base_delay_ms, self.max_delay_ms)
        };

        let exponent = attempt.saturating_sub(1).min(32);
        let delay = base.saturating_mul(1_u64 << exponent);
        Duration::from_millis(delay.min(cap))
    }

    fn jittered(&self, delay: Duration, sample: f64) -> Duration {
        let factor = self.jitter.max(0.0).mul_add(sample.clamp(0.0, 1.0), 1.0);
        delay.mul_f64(factor)
    }
}

/// How a failed remote call should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Fatal,
}

/// Classify an adapter error. Only validation failures are terminal.
pub const fn classify_error(error: &Error) -> FailureClass {
    match error {
        Error::Validation(_) | Error::InvalidInput(_) => FailureClass::Fatal,
        _ => FailureClass::Retryable,
    }
}

/// What happened to an operation after a retryable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Scheduled again once `next_attempt_at` passes
    Retry {
        attempt: u32,
        delay: Duration,
        next_attempt_at: i64,
    },
    /// Retry budget spent; the operation is dead
    Exhausted { attempts: u32 },
}

/// Applies a [`RetryPolicy`] to failed operations
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Jittered delay before the next attempt
    pub fn next_delay(&self, attempt: u32, priority: i32) -> Duration {
        let delay = self.policy.base_delay(attempt, priority);
        if self.policy.jitter <= 0.0 {
            return delay;
        }
        let sample = rand::thread_rng().gen_range(0.0..1.0);
        self.policy.jittered(delay, sample)
    }

    /// Count a retryable failure against `operation` and move it to
    /// `failed` (with a backoff gate) or `dead`.
    pub fn record_failure(
        &self,
        operation: &mut QueuedOperation,
        error: &str,
        now: i64,
    ) -> RetryDecision {
        operation.retry_count = operation.retry_count.saturating_add(1);
        operation.last_error = Some(error.to_string());
        operation.updated_at = now;
        let attempt = operation.retry_count;

        if attempt >= self.policy.max_attempts {
            operation.status = OperationStatus::Dead;
            operation.dead_reason = Some(DeadReason::ExhaustedRetries);
            operation.next_attempt_at = None;
            warn!(
                operation_id = %operation.id,
                entity_id = %operation.entity_id,
                attempt,
                error,
                "Retry budget exhausted; operation is dead"
            );
            return RetryDecision::Exhausted { attempts: attempt };
        }

        let delay = self.next_delay(attempt, operation.priority);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let next_attempt_at = now.saturating_add(delay_ms);
        operation.status = OperationStatus::Failed;
        operation.next_attempt_at = Some(next_attempt_at);

        warn!(
            operation_id = %operation.id,
            entity_id = %operation.entity_id,
            attempt,
            delay_ms,
            error,
            "Retryable failure, backing off"
        );

        RetryDecision::Retry {
            attempt,
            delay,
            next_attempt_at,
        }
    }
}
