//! The per-unit collection primitive shared by every strategy.
//!
//! One attempt runs: proxy lease (browser collectors) -> rate permit ->
//! stream the collector's items -> normalize -> store. The resilience layer
//! drives attempts; the finished unit is reported over the aggregation
//! channel.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::campaign::{UnitOutcome, UnitReport};
use crate::config::EngineConfig;
use crate::error::AppError;
use crate::governor::RateGovernor;
use crate::metrics::{ITEMS_COLLECTED, MetricLabels, MetricsSink, UNITS_FAILED};
use crate::models::{CollectorIdentity, TargetKey, WorkUnit};
use crate::pool::{LeaseOutcome, ProxyLease, ResourcePool};
use crate::reporter::{CampaignEvent, CampaignReporter};
use crate::resilience::{ExecuteError, Resilience};
use crate::traits::{Collector, RecordStore};

/// Counters that survive across attempts of one unit.
#[derive(Debug, Default)]
struct UnitTally {
    attempts: AtomicU32,
    items: AtomicU64,
    duplicates: AtomicU64,
    invalid_records: AtomicU64,
    persist_errors: AtomicU64,
}

impl UnitTally {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(
        &self,
        identity: &CollectorIdentity,
        key: &TargetKey,
        outcome: UnitOutcome,
    ) -> UnitReport {
        UnitReport {
            collector: identity.name.clone(),
            key: key.clone(),
            attempts: self.attempts.load(Ordering::Relaxed),
            items: self.items.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            invalid_records: self.invalid_records.load(Ordering::Relaxed),
            persist_errors: self.persist_errors.load(Ordering::Relaxed),
            outcome,
        }
    }
}

/// Everything a strategy needs to dispatch units for one campaign.
pub struct UnitContext<'a, S> {
    pub campaign_id: Uuid,
    pub config: &'a EngineConfig,
    pub pool: &'a ResourcePool,
    pub governor: &'a RateGovernor,
    pub resilience: &'a Resilience,
    pub store: &'a S,
    pub metrics: &'a dyn MetricsSink,
    pub reporter: &'a dyn CampaignReporter,
    /// Campaign-scoped token: fires on shutdown or budget expiry.
    pub cancel: &'a CancellationToken,
    pub results: mpsc::UnboundedSender<UnitReport>,
}

impl<S: RecordStore> UnitContext<'_, S> {
    /// Whether another unit may be dispatched to `collector`.
    pub fn should_dispatch(&self, collector: &str) -> bool {
        !self.cancel.is_cancelled() && !self.resilience.is_open(collector)
    }

    /// Pacing pause plus up to `pacing.jitter_ms` of jitter.
    ///
    /// Returns false if the campaign was cancelled while waiting.
    pub async fn pause(&self, base: Duration) -> bool {
        let jitter = self.config.pacing.jitter_ms;
        let extra = if jitter > 0 {
            rand::random_range(0..=jitter)
        } else {
            0
        };
        let delay = base + Duration::from_millis(extra);
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = self.cancel.cancelled() => false,
        }
    }

    /// Run one (collector, key) unit to completion and report it.
    pub async fn run_unit<C: Collector>(
        &self,
        collector: &C,
        identity: &CollectorIdentity,
        key: &TargetKey,
    ) {
        self.reporter.report(CampaignEvent::UnitDispatched {
            collector: &identity.name,
            key,
        });

        let tally = UnitTally::default();
        let result = self
            .resilience
            .execute(identity, self.cancel, |attempt| {
                let unit = WorkUnit {
                    collector: identity.clone(),
                    key: key.clone(),
                    attempt,
                };
                self.attempt(collector, unit, &tally)
            })
            .await;

        let labels = MetricLabels::collector(self.campaign_id, &identity.name);
        let items = tally.items.load(Ordering::Relaxed);
        if items > 0 {
            self.metrics.counter(ITEMS_COLLECTED, items, labels);
        }

        let outcome = match result {
            Ok(()) => {
                self.reporter.report(CampaignEvent::UnitSucceeded {
                    collector: &identity.name,
                    key,
                    items,
                    duplicates: tally.duplicates.load(Ordering::Relaxed),
                });
                UnitOutcome::Succeeded
            }
            Err(ExecuteError::Failed {
                error,
                breaker_opened,
            }) => {
                self.metrics
                    .counter(UNITS_FAILED, 1, labels.with_class(error.class));
                self.reporter.report(CampaignEvent::UnitFailed {
                    collector: &identity.name,
                    key,
                    error: &error,
                });
                UnitOutcome::Failed {
                    error,
                    breaker_opened,
                }
            }
            Err(ExecuteError::ResourceExhausted(msg)) => {
                tracing::warn!(collector = %identity.name, %key, "Unit starved: {msg}");
                UnitOutcome::Exhausted(msg)
            }
            Err(ExecuteError::Cancelled) => {
                tracing::info!(collector = %identity.name, %key, "Unit cancelled");
                UnitOutcome::Cancelled
            }
            Err(ExecuteError::CircuitOpen { .. }) => UnitOutcome::Skipped,
        };

        // The receiver only goes away once the campaign is over.
        let _ = self.results.send(tally.report(identity, key, outcome));
    }

    async fn attempt<C: Collector>(
        &self,
        collector: &C,
        unit: WorkUnit,
        tally: &UnitTally,
    ) -> Result<(), AppError> {
        tally.attempts.fetch_max(unit.attempt, Ordering::Relaxed);
        let kind = unit.collector.kind;

        // Lease first: a starved pool must not burn rate permits.
        let lease = if collector.uses_proxy() {
            Some(self.pool.acquire(kind, self.cancel).await?)
        } else {
            None
        };
        if let Err(e) = self.governor.acquire(&unit.collector.name, self.cancel).await {
            if let Some(lease) = lease {
                self.pool.release(lease, LeaseOutcome::Neutral);
            }
            return Err(e);
        }

        let limit = self.config.timeouts.attempt_timeout(kind);
        let grace = self.config.timeouts.shutdown_grace();
        let result = {
            let consume = self.consume(collector, &unit.key, lease.as_ref(), tally);
            tokio::pin!(consume);
            tokio::select! {
                r = tokio::time::timeout(limit, &mut consume) => {
                    r.unwrap_or_else(|_| Err(AppError::Timeout(limit)))
                }
                // In-flight attempts get a grace period to finish after cancellation.
                () = async {
                    self.cancel.cancelled().await;
                    tokio::time::sleep(grace).await;
                } => Err(AppError::Cancelled),
            }
        };

        if let Some(lease) = lease {
            let outcome = match &result {
                Ok(()) => LeaseOutcome::Success,
                Err(AppError::Cancelled) => LeaseOutcome::Neutral,
                Err(e) if e.class().blames_lease() => LeaseOutcome::Failure,
                Err(_) => LeaseOutcome::Neutral,
            };
            self.pool.release(lease, outcome);
        }

        if let Err(e) = &result {
            tracing::debug!(
                collector = %unit.collector.name,
                key = %unit.key,
                attempt = unit.attempt,
                error = %e,
                "Attempt failed"
            );
        }
        result
    }

    async fn consume<C: Collector>(
        &self,
        collector: &C,
        key: &TargetKey,
        lease: Option<&ProxyLease>,
        tally: &UnitTally,
    ) -> Result<(), AppError> {
        let mut items = std::pin::pin!(collector.collect(key, lease));
        while let Some(item) = items.next().await {
            let record = match collector.normalize(item?) {
                Ok(record) => record,
                Err(e) => {
                    UnitTally::bump(&tally.invalid_records);
                    tracing::debug!(%key, error = %e, "Skipping invalid record");
                    continue;
                }
            };
            match self.store.store(&record).await {
                Ok(_) => UnitTally::bump(&tally.items),
                Err(AppError::Duplicate(_)) => UnitTally::bump(&tally.duplicates),
                Err(e) => {
                    UnitTally::bump(&tally.persist_errors);
                    tracing::warn!(
                        %key,
                        external_id = %record.external_id,
                        error = %e,
                        "Failed to persist record"
                    );
                }
            }
        }
        Ok(())
    }
}
