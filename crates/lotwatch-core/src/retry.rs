use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ErrorClass;

/// Retry budget already spent on one unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryBudget {
    /// Attempts made so far (the failing one included).
    pub attempts: u32,
    pub block_retries: u32,
    pub unknown_retries: u32,
}

/// Decides whether and when a failed attempt is retried.
///
/// Delay schedule: `base * multiplier^(attempt-1)`, capped at `max_delay`,
/// then scaled by a uniform factor in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the attempt following `attempt` (1-indexed), without jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let raw = self.config.base_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = raw.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        let jitter = self.config.jitter;
        if jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::random_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }

    /// Whether a failure of `class` earns another attempt, updating the budget.
    pub fn should_retry(&self, class: ErrorClass, budget: &mut RetryBudget) -> bool {
        match class {
            ErrorClass::Transient | ErrorClass::RateLimited => {
                budget.attempts < self.config.max_attempts
            }
            ErrorClass::AuthFailure | ErrorClass::DataInvalid => false,
            ErrorClass::BlockedOrDetected => {
                if budget.block_retries < self.config.max_block_retries {
                    budget.block_retries += 1;
                    true
                } else {
                    false
                }
            }
            ErrorClass::Unknown => {
                if budget.unknown_retries < self.config.max_unknown_retries
                    && budget.attempts < self.config.max_attempts
                {
                    budget.unknown_retries += 1;
                    true
                } else {
                    false
                }
            }
        }
    }
}
