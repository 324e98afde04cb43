//! Egress proxy pool with health tracking and rotation.
//!
//! # Lease health
//!
//! ```text
//! HEALTHY --[failure]--> DEGRADED --[threshold consecutive failures]--> QUARANTINED
//!    ^                      |                                               |
//!    +-----[success]--------+                                          [cooldown]
//!    |                                                                      v
//!    +---------------------------[success]------------------------- PROBATIONARY
//!                                                                          |
//!                            QUARANTINED <-----------[failure]-------------+
//! ```
//!
//! Selection is round-robin over idle, non-quarantined entries. Probationary
//! entries only win one in every N selections (N = pool size) while trusted
//! entries are idle.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::{PoolConfig, ProxyEndpoint};
use crate::error::AppError;
use crate::models::SourceKind;

/// Health of a pool entry as seen by `acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseHealth {
    Healthy,
    Degraded,
    Quarantined,
    Probationary,
}

/// What happened while an attempt held a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Success,
    Failure,
    /// The failure was not the proxy's fault (bad data, cancellation).
    Neutral,
}

/// Why a lease could not be handed out right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// No entry for this kind is outside quarantine.
    Unavailable,
    /// Usable entries exist but all are checked out.
    Busy,
}

/// A checked-out proxy. Owned by exactly one attempt until released.
#[derive(Debug)]
pub struct ProxyLease {
    id: usize,
    pub endpoint: ProxyEndpoint,
    pub health_score: f64,
    pub last_used: Option<Instant>,
    pub probationary: bool,
}

impl ProxyLease {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn proxy_url(&self) -> &str {
        &self.endpoint.url
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.endpoint.username, &self.endpoint.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

/// Snapshot of pool health for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub quarantined: usize,
    pub probationary: usize,
    pub in_use: usize,
}

#[derive(Debug)]
struct PoolEntry {
    endpoint: ProxyEndpoint,
    in_use: bool,
    consecutive_failures: u32,
    successes: u64,
    failures: u64,
    last_used: Option<Instant>,
    quarantined_until: Option<Instant>,
    probationary: bool,
}

impl PoolEntry {
    fn new(endpoint: ProxyEndpoint) -> Self {
        Self {
            endpoint,
            in_use: false,
            consecutive_failures: 0,
            successes: 0,
            failures: 0,
            last_used: None,
            quarantined_until: None,
            probationary: false,
        }
    }

    /// Current health, lifting expired quarantines into probation.
    fn health(&mut self, now: Instant) -> LeaseHealth {
        if let Some(until) = self.quarantined_until {
            if now < until {
                return LeaseHealth::Quarantined;
            }
            self.quarantined_until = None;
            self.probationary = true;
            self.consecutive_failures = 0;
        }
        if self.probationary {
            LeaseHealth::Probationary
        } else if self.consecutive_failures > 0 {
            LeaseHealth::Degraded
        } else {
            LeaseHealth::Healthy
        }
    }

    fn score(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    entries: Vec<PoolEntry>,
    cursor: usize,
    selections: u64,
}

/// Thread-safe proxy pool shared by every concurrent work unit.
#[derive(Clone)]
pub struct ResourcePool {
    config: PoolConfig,
    inner: Arc<Mutex<PoolInner>>,
    released: Arc<Notify>,
}

impl ResourcePool {
    pub fn new(endpoints: Vec<ProxyEndpoint>, config: PoolConfig) -> Self {
        let entries = endpoints.into_iter().map(PoolEntry::new).collect();
        Self {
            config,
            inner: Arc::new(Mutex::new(PoolInner {
                entries,
                cursor: 0,
                selections: 0,
            })),
            released: Arc::new(Notify::new()),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Resource pool recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Check out a lease without waiting.
    pub fn try_acquire(&self, kind: SourceKind) -> Result<ProxyLease, AcquireError> {
        let mut inner = self.lock_inner();
        let now = Instant::now();
        let size = inner.entries.len();

        let mut trusted = Vec::new();
        let mut probation = Vec::new();
        let mut busy = false;
        for (idx, entry) in inner.entries.iter_mut().enumerate() {
            if !entry.endpoint.serves(kind) {
                continue;
            }
            let health = entry.health(now);
            if health == LeaseHealth::Quarantined {
                continue;
            }
            if entry.in_use {
                busy = true;
                continue;
            }
            if health == LeaseHealth::Probationary {
                probation.push(idx);
            } else {
                trusted.push(idx);
            }
        }

        if trusted.is_empty() && probation.is_empty() {
            return Err(if busy {
                AcquireError::Busy
            } else {
                AcquireError::Unavailable
            });
        }

        let probation_turn = size > 0 && inner.selections % size as u64 == size as u64 - 1;
        let pool = if trusted.is_empty() || (probation_turn && !probation.is_empty()) {
            &probation
        } else {
            &trusted
        };
        let cursor = inner.cursor;
        let idx = pool
            .iter()
            .copied()
            .find(|&i| i > cursor)
            .unwrap_or(pool[0]);

        inner.cursor = idx;
        inner.selections += 1;
        let entry = &mut inner.entries[idx];
        entry.in_use = true;
        let lease = ProxyLease {
            id: idx,
            endpoint: entry.endpoint.clone(),
            health_score: entry.score(),
            last_used: entry.last_used,
            probationary: entry.probationary,
        };
        tracing::debug!(
            proxy = %lease.endpoint.url,
            probationary = lease.probationary,
            "Lease acquired"
        );
        Ok(lease)
    }

    /// Check out a lease, waiting while every usable entry is busy.
    ///
    /// Fails fast with `ResourceExhausted` when nothing is usable and with
    /// `Cancelled` when the token fires.
    pub async fn acquire(
        &self,
        kind: SourceKind,
        cancel: &CancellationToken,
    ) -> Result<ProxyLease, AppError> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_acquire(kind) {
                Ok(lease) => return Ok(lease),
                Err(AcquireError::Unavailable) => {
                    return Err(AppError::ResourceExhausted(format!(
                        "no healthy {kind} proxies"
                    )));
                }
                Err(AcquireError::Busy) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = cancel.cancelled() => return Err(AppError::Cancelled),
                        // Quarantines expire on their own; re-check periodically.
                        () = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }

    /// Return a lease with the outcome of the attempt that held it.
    pub fn release(&self, lease: ProxyLease, outcome: LeaseOutcome) {
        {
            let mut inner = self.lock_inner();
            let threshold = self.config.failure_threshold;
            let cooldown = self.config.cooldown();
            let Some(entry) = inner.entries.get_mut(lease.id) else {
                return;
            };
            let now = Instant::now();
            entry.in_use = false;
            entry.last_used = Some(now);

            match outcome {
                LeaseOutcome::Success => {
                    entry.successes += 1;
                    entry.consecutive_failures = 0;
                    entry.probationary = false;
                }
                LeaseOutcome::Failure => {
                    entry.failures += 1;
                    entry.consecutive_failures += 1;
                    if entry.probationary || entry.consecutive_failures >= threshold {
                        tracing::warn!(
                            proxy = %entry.endpoint.url,
                            failures = entry.consecutive_failures,
                            cooldown_secs = cooldown.as_secs(),
                            "Quarantining proxy"
                        );
                        entry.quarantined_until = Some(now + cooldown);
                        entry.probationary = false;
                    }
                }
                LeaseOutcome::Neutral => {}
            }
        }
        self.released.notify_waiters();
    }

    /// Mark every entry idle. Used on shutdown.
    pub fn release_all(&self) -> usize {
        let released = {
            let mut inner = self.lock_inner();
            let mut count = 0;
            for entry in inner.entries.iter_mut().filter(|e| e.in_use) {
                entry.in_use = false;
                count += 1;
            }
            count
        };
        self.released.notify_waiters();
        released
    }

    pub fn health_report(&self) -> PoolHealth {
        let mut inner = self.lock_inner();
        let now = Instant::now();
        let mut report = PoolHealth {
            total: inner.entries.len(),
            ..Default::default()
        };
        for entry in inner.entries.iter_mut() {
            match entry.health(now) {
                LeaseHealth::Healthy => report.healthy += 1,
                LeaseHealth::Degraded => report.degraded += 1,
                LeaseHealth::Quarantined => report.quarantined += 1,
                LeaseHealth::Probationary => report.probationary += 1,
            }
            if entry.in_use {
                report.in_use += 1;
            }
        }
        report
    }
}
