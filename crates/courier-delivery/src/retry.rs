//! Exponential backoff with jitter.
//!
//! The same formula drives two budgets: the executor's immediate in-process
//! attempts (base 1s, cap 5s) and the dead-letter worker's retry cycles,
//! which compound across cycles with a much larger base and cap.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry policy for a delivery budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the initial one.
    pub max_attempts: u32,

    /// Base delay for exponential backoff calculation.
    pub base_delay: Duration,

    /// Cap applied to the exponential delay before jitter.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied symmetrically.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate(3)
    }
}

impl RetryPolicy {
    /// In-process policy used by the executor: 1s base, 5s cap, ±20%.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.2,
        }
    }

    /// Dead-letter policy: 1 minute base, 1 hour cap, ±20%.
    pub fn dead_letter(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.2,
        }
    }

    /// Returns the same policy with a different attempt budget.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self { max_attempts, ..self.clone() }
    }

    /// Delay after the `attempt_number`-th failure (1-based), before jitter:
    /// `min(base * 2^(attempt_number - 1), max)`.
    pub fn nominal_delay(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let delay = self.base_delay.saturating_mul(multiplier);

        std::cmp::min(delay, self.max_delay)
    }

    /// Nominal delay with jitter applied. Jitter may push the result past
    /// `max_delay` by up to `jitter_factor`.
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        apply_jitter(self.nominal_delay(attempt_number), self.jitter_factor)
    }
}

/// Retry decision context for a failed delivery attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Current attempt number (1-based).
    pub attempt_number: u32,
    /// Error that caused the delivery failure.
    pub error: DeliveryError,
    /// Timestamp of the failed attempt.
    pub failed_at: DateTime<Utc>,
    /// Retry policy to apply.
    pub policy: RetryPolicy,
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`.
    Retry {
        /// How long to wait before the next attempt
        delay: Duration,
        /// When the next attempt should be made
        next_attempt_at: DateTime<Utc>,
    },
    /// Do not retry.
    GiveUp {
        /// Reason why the delivery should not be retried
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed delivery.
    pub fn new(
        attempt_number: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_number, error, failed_at, policy }
    }

    /// Determines if and when to retry.
    ///
    /// Gives up once the attempt budget is spent or the error is terminal.
    /// A 429 Retry-After hint replaces the computed backoff, bounded by the
    /// policy cap.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.attempt_number >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.policy.max_attempts),
            };
        }

        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        let delay = self.calculate_delay();
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { delay, next_attempt_at: self.failed_at + chrono_delay }
    }

    fn calculate_delay(&self) -> Duration {
        if let Some(retry_after_seconds) = self.error.retry_after_seconds() {
            return std::cmp::min(Duration::from_secs(retry_after_seconds), self.policy.max_delay);
        }

        self.policy.delay_for(self.attempt_number)
    }
}

/// Applies jitter to a duration to prevent thundering herd effects.
///
/// Randomizes the delay by ±jitter_factor. With jitter_factor=0.2 a 5s delay
/// becomes 4s to 6s.
pub fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(policy: RetryPolicy) -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..policy }
    }

    #[test]
    fn immediate_backoff_doubles_then_caps() {
        let policy = no_jitter(RetryPolicy::immediate(10));

        let delays: Vec<_> = (1..=5).map(|attempt| policy.delay_for(attempt)).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[test]
    fn dead_letter_backoff_compounds_to_an_hour() {
        let policy = no_jitter(RetryPolicy::dead_letter(20));

        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for(12), Duration::from_secs(3600));
    }

    #[test]
    fn retry_respects_maximum_attempts() {
        let context = RetryContext::new(
            3,
            DeliveryError::timeout(30),
            Utc::now(),
            RetryPolicy::immediate(3),
        );

        match context.decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("should not retry at max attempts"),
        }
    }

    #[test]
    fn non_retryable_errors_rejected() {
        let context = RetryContext::new(
            1,
            DeliveryError::client_error(404, "not found"),
            Utc::now(),
            RetryPolicy::default(),
        );

        match context.decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("non-retryable")),
            RetryDecision::Retry { .. } => unreachable!("should not retry client errors"),
        }
    }

    #[test]
    fn retry_after_header_is_capped_by_policy() {
        let failed_at = Utc::now();
        let context = RetryContext::new(
            1,
            DeliveryError::rate_limited(Some(120)),
            failed_at,
            RetryPolicy::immediate(3),
        );

        let RetryDecision::Retry { delay, next_attempt_at } = context.decide_retry() else {
            unreachable!("429 is retryable");
        };
        assert_eq!(delay, Duration::from_secs(5));
        assert_eq!(next_attempt_at, failed_at + chrono::Duration::seconds(5));
    }

    #[test]
    fn jitter_varies_delay_within_bounds() {
        let base_delay = Duration::from_secs(10);
        let mut seen_delays = std::collections::HashSet::new();

        for _ in 0..20 {
            let jittered = apply_jitter(base_delay, 0.2);
            seen_delays.insert(jittered.as_millis());
        }

        assert!(seen_delays.len() > 1, "jitter should create variation");
        for &delay_ms in &seen_delays {
            assert!((8_000..=12_000).contains(&delay_ms), "delay out of range: {delay_ms}ms");
        }
    }
}
