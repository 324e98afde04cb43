//! Per-source request pacing.
//!
//! Each source gets an independent token bucket (capacity C, refill R/s).
//! [`RateGovernor::acquire`] suspends only the calling task until a token is
//! available. [`RateGovernor::penalize`] models explicit server throttling:
//! it drains the bucket and freezes refill for the penalty window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimit;
use crate::error::AppError;

#[derive(Debug)]
struct Bucket {
    limit: RateLimit,
    tokens: f64,
    last_refill: Instant,
    penalized_until: Option<Instant>,
}

impl Bucket {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            tokens: limit.capacity as f64,
            last_refill: Instant::now(),
            penalized_until: None,
        }
    }

    /// Take a token, or report how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(until) = self.penalized_until {
            if now < until {
                return Err(until - now);
            }
            self.penalized_until = None;
            self.last_refill = until;
        }

        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.limit.refill_per_sec)
            .min(self.limit.capacity as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.limit.refill_per_sec))
        }
    }

    fn penalize(&mut self, now: Instant, duration: Duration) {
        let until = now + duration;
        self.tokens = 0.0;
        self.penalized_until = Some(match self.penalized_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }
}

/// Token-bucket limiter keyed by source name.
#[derive(Clone)]
pub struct RateGovernor {
    default_limit: RateLimit,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl RateGovernor {
    /// Sources without an explicit registration use `default_limit`.
    pub fn new(default_limit: RateLimit) -> Self {
        Self {
            default_limit,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register (or replace) the bucket for one source.
    pub async fn register(&self, source: &str, limit: RateLimit) {
        let mut map = self.buckets.lock().await;
        map.insert(source.to_string(), Bucket::new(limit));
    }

    /// Wait for a permit for `source`.
    ///
    /// Returns `Cancelled` promptly if the token fires while waiting.
    pub async fn acquire(&self, source: &str, cancel: &CancellationToken) -> Result<(), AppError> {
        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let wait = {
                let mut map = self.buckets.lock().await;
                let bucket = map
                    .entry(source.to_string())
                    .or_insert_with(|| Bucket::new(self.default_limit));
                match bucket.try_take(Instant::now()) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            // Lock is dropped here so other sources aren't blocked.
            tracing::debug!(
                source = %source,
                wait_ms = %wait.as_millis(),
                "Waiting for rate permit"
            );
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => return Err(AppError::Cancelled),
            }
        }
    }

    /// Drain the bucket for `source` and suspend refill for `duration`.
    pub async fn penalize(&self, source: &str, duration: Duration) {
        let mut map = self.buckets.lock().await;
        let bucket = map
            .entry(source.to_string())
            .or_insert_with(|| Bucket::new(self.default_limit));
        bucket.penalize(Instant::now(), duration);
        tracing::info!(
            source = %source,
            penalty_ms = %duration.as_millis(),
            "Source penalized"
        );
    }

    /// Time until the penalty on `source` lifts, if one is active.
    #[cfg(test)]
    pub(crate) async fn penalty_remaining(&self, source: &str) -> Option<Duration> {
        let map = self.buckets.lock().await;
        let until = map.get(source)?.penalized_until?;
        until.checked_duration_since(Instant::now())
    }
}
