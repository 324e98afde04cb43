//! Classify, retry and circuit-break collection attempts.
//!
//! [`Resilience::execute`] wraps one work unit. Each failed attempt is mapped
//! to an [`ErrorClass`]; the class decides whether the unit is retried, how
//! long it waits, and whether the outcome counts toward the collector's
//! circuit breaker. Only the final outcome of a unit reaches the breaker.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::config::{EngineConfig, RetryConfig};
use crate::error::{AppError, ClassifiedError, ErrorClass};
use crate::governor::RateGovernor;
use crate::models::CollectorIdentity;
use crate::retry::{RetryBudget, RetryPolicy};

/// Why a unit produced no result.
#[derive(Debug, Clone, Error)]
pub enum ExecuteError {
    /// The collector's breaker is open; nothing was attempted.
    #[error("Circuit open for collector '{collector}'")]
    CircuitOpen { collector: String },

    /// Retries were exhausted or the class is not retryable.
    #[error("{error}")]
    Failed {
        error: ClassifiedError,
        /// True when this failure opened the breaker.
        breaker_opened: bool,
    },

    /// The pool had nothing usable for longer than the exhaustion timeout.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Per-collector retry bookkeeping, exposed through engine status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryState {
    /// Attempts made across every unit of this collector.
    pub attempts: u64,
    pub retries: u64,
    /// Backoff applied before the most recent retry. Zero after a success.
    pub current_backoff_ms: u64,
    pub breaker: Option<CircuitState>,
    /// Consecutive breaker-tripping outcomes since the last success.
    pub consecutive_failures: u32,
    pub last_error: Option<ErrorClass>,
}

pub struct Resilience {
    policy: RetryPolicy,
    governor: RateGovernor,
    breaker_config: CircuitBreakerConfig,
    default_penalty: Duration,
    exhaustion_timeout: Duration,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    states: Mutex<HashMap<String, RetryState>>,
    /// Start of each collector's current run of exhausted leases.
    exhausted_since: Mutex<HashMap<String, Instant>>,
}

impl Resilience {
    pub fn new(config: &EngineConfig, governor: RateGovernor) -> Self {
        Self {
            policy: RetryPolicy::new(config.retry.clone()),
            governor,
            breaker_config: CircuitBreakerConfig::from(&config.breaker),
            default_penalty: config.rate.default_penalty(),
            exhaustion_timeout: config.timeouts.exhaustion_timeout(),
            breakers: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            exhausted_since: Mutex::new(HashMap::new()),
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        self.policy.config()
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Resilience state recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Breaker for `collector`, created on first use.
    pub fn breaker(&self, collector: &str) -> CircuitBreaker {
        Self::lock(&self.breakers)
            .entry(collector.to_string())
            .or_insert_with(|| CircuitBreaker::new(collector, self.breaker_config.clone()))
            .clone()
    }

    pub fn is_open(&self, collector: &str) -> bool {
        self.breaker(collector).is_open()
    }

    pub fn retry_state(&self, collector: &str) -> RetryState {
        let mut state = Self::lock(&self.states)
            .get(collector)
            .cloned()
            .unwrap_or_default();
        let stats = self.breaker(collector).stats();
        state.breaker = Some(stats.state);
        state.consecutive_failures = stats.failure_count;
        if state.last_error.is_none() {
            state.last_error = stats.last_error.map(|e| e.class);
        }
        state
    }

    /// Close every breaker and clear retry bookkeeping.
    pub fn reset(&self) {
        for breaker in Self::lock(&self.breakers).values() {
            breaker.reset();
        }
        Self::lock(&self.states).clear();
        Self::lock(&self.exhausted_since).clear();
    }

    fn update_state(&self, collector: &str, f: impl FnOnce(&mut RetryState)) {
        let mut states = Self::lock(&self.states);
        f(states.entry(collector.to_string()).or_default());
    }

    /// Run `op` under the retry policy and the collector's breaker.
    ///
    /// `op` receives the 1-based attempt number. `ResourceExhausted` from `op`
    /// is retried with backoff without consuming an attempt until the
    /// exhaustion timeout elapses. The exhaustion clock belongs to the
    /// collector, so once it has run out later units give up on their first
    /// exhausted lease until some attempt gets past the pool again.
    pub async fn execute<T, F, Fut>(
        &self,
        collector: &CollectorIdentity,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ExecuteError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let name = collector.name.as_str();
        let breaker = self.breaker(name);
        if breaker.is_open() {
            return Err(ExecuteError::CircuitOpen {
                collector: name.to_string(),
            });
        }

        let mut budget = RetryBudget::default();
        let mut attempt = 1u32;
        let mut exhausted_rounds = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(ExecuteError::Cancelled);
            }
            self.update_state(name, |s| s.attempts += 1);

            let error = match op(attempt).await {
                Ok(value) => {
                    self.clear_exhaustion(name);
                    breaker.record_success();
                    self.update_state(name, |s| s.current_backoff_ms = 0);
                    return Ok(value);
                }
                Err(e) => e,
            };

            match error {
                AppError::Cancelled => return Err(ExecuteError::Cancelled),
                AppError::ResourceExhausted(msg) => {
                    let since = *Self::lock(&self.exhausted_since)
                        .entry(name.to_string())
                        .or_insert_with(Instant::now);
                    let elapsed = since.elapsed();
                    if elapsed >= self.exhaustion_timeout {
                        tracing::warn!(
                            collector = %name,
                            waited_ms = %elapsed.as_millis(),
                            "Giving up on unit: {msg}"
                        );
                        return Err(ExecuteError::ResourceExhausted(msg));
                    }
                    exhausted_rounds += 1;
                    let delay = self
                        .policy
                        .delay_for_attempt(exhausted_rounds)
                        .min(self.exhaustion_timeout - elapsed);
                    tracing::debug!(
                        collector = %name,
                        delay_ms = %delay.as_millis(),
                        "Resource exhausted, backing off"
                    );
                    self.sleep(delay, cancel).await?;
                    continue;
                }
                _ => {}
            }
            self.clear_exhaustion(name);
            exhausted_rounds = 0;

            let class = error.class();
            budget.attempts = attempt;

            if class == ErrorClass::RateLimited {
                let penalty = error.retry_after().unwrap_or(self.default_penalty);
                self.governor.penalize(name, penalty).await;
            }

            if !self.policy.should_retry(class, &mut budget) {
                let classified = ClassifiedError::new(&error, attempt);
                let breaker_opened = breaker.record_failure(&classified);
                self.update_state(name, |s| s.last_error = Some(class));
                tracing::warn!(
                    collector = %name,
                    class = %class,
                    attempts = attempt,
                    error = %error,
                    "Unit failed"
                );
                return Err(ExecuteError::Failed {
                    error: classified,
                    breaker_opened,
                });
            }

            // Throttled units wait on the governor's penalty window instead.
            let delay = if class == ErrorClass::RateLimited {
                Duration::ZERO
            } else {
                self.policy.delay_for_attempt(attempt)
            };
            tracing::info!(
                collector = %name,
                class = %class,
                attempt,
                delay_ms = %delay.as_millis(),
                error = %error,
                "Retrying unit"
            );
            self.update_state(name, |s| {
                s.retries += 1;
                s.current_backoff_ms = delay.as_millis() as u64;
                s.last_error = Some(class);
            });
            self.sleep(delay, cancel).await?;
            attempt += 1;
        }
    }

    fn clear_exhaustion(&self, collector: &str) {
        Self::lock(&self.exhausted_since).remove(collector);
    }

    async fn sleep(&self, delay: Duration, cancel: &CancellationToken) -> Result<(), ExecuteError> {
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = cancel.cancelled() => Err(ExecuteError::Cancelled),
        }
    }
}
