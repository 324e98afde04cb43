//! Top-level campaign driver.
//!
//! # Engine states
//!
//! ```text
//! UNINITIALIZED -> INITIALIZING -> READY -> RUNNING -> COMPLETED | PARTIALLY_FAILED | FAILED
//!                                    ^                              |
//!                                    +-----------[reset]------------+
//!
//! any state --[shutdown]--> SHUTTING_DOWN -> TERMINATED
//! ```
//!
//! The engine owns collector state and the campaign result. Strategies never
//! touch either; they send unit reports over a channel that a single
//! aggregation loop inside [`Engine::run_campaign`] consumes.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::campaign::{CampaignMeta, CampaignOutcome, CampaignResult, CampaignTally, UnitReport};
use crate::config::{ConfigSource, EngineConfig};
use crate::error::AppError;
use crate::governor::RateGovernor;
use crate::metrics::{CAMPAIGN_DURATION_MS, MetricLabels, MetricsSink, POOL_HEALTHY, TracingMetrics};
use crate::models::{CollectorIdentity, CollectorState};
use crate::pool::{PoolHealth, ResourcePool};
use crate::reporter::{CampaignEvent, CampaignReporter, TracingCampaignReporter};
use crate::resilience::{Resilience, RetryState};
use crate::runner::UnitContext;
use crate::strategy::{Assignment, StrategyKind};
use crate::traits::{Collector, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    Completed,
    PartiallyFailed,
    Failed,
    ShuttingDown,
    Terminated,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Initializing => "initializing",
            EngineState::Ready => "ready",
            EngineState::Running => "running",
            EngineState::Completed => "completed",
            EngineState::PartiallyFailed => "partially_failed",
            EngineState::Failed => "failed",
            EngineState::ShuttingDown => "shutting_down",
            EngineState::Terminated => "terminated",
        }
    }

    fn finished(&self) -> bool {
        matches!(
            self,
            EngineState::Completed | EngineState::PartiallyFailed | EngineState::Failed
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl From<CampaignOutcome> for EngineState {
    fn from(outcome: CampaignOutcome) -> Self {
        match outcome {
            CampaignOutcome::Completed => EngineState::Completed,
            CampaignOutcome::PartiallyFailed => EngineState::PartiallyFailed,
            CampaignOutcome::Failed => EngineState::Failed,
        }
    }
}

/// Per-collector view in [`EngineStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct CollectorStatus {
    pub name: String,
    pub kind: crate::models::SourceKind,
    pub state: CollectorState,
    /// Most specific known failure reason.
    pub reason: Option<String>,
    pub retry: Option<RetryState>,
}

/// Read-only engine snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub collectors: Vec<CollectorStatus>,
    pub pool: PoolHealth,
    pub campaign_id: Option<Uuid>,
    pub elapsed_ms: Option<u64>,
    pub last_outcome: Option<CampaignOutcome>,
}

#[derive(Debug)]
struct CollectorSlot {
    identity: CollectorIdentity,
    state: CollectorState,
    reason: Option<String>,
    /// Disabled by configuration or a failed health check; never reset.
    excluded: bool,
}

#[derive(Debug)]
struct Shared {
    state: EngineState,
    collectors: Vec<CollectorSlot>,
    campaign: Option<(Uuid, Instant)>,
    last_outcome: Option<CampaignOutcome>,
    shutdown_requested: bool,
}

/// Components built from the configuration snapshot at `initialize`.
struct Runtime {
    config: EngineConfig,
    pool: ResourcePool,
    governor: RateGovernor,
    resilience: Resilience,
}

pub struct Engine<C, S, M = TracingMetrics, R = TracingCampaignReporter> {
    collectors: Vec<C>,
    store: S,
    metrics: M,
    reporter: R,
    runtime: Option<Runtime>,
    shared: Arc<Mutex<Shared>>,
    shutdown: CancellationToken,
    idle: Notify,
}

impl<C, S> Engine<C, S>
where
    C: Collector,
    S: RecordStore,
{
    pub fn new(collectors: Vec<C>, store: S) -> Self {
        Self {
            collectors,
            store,
            metrics: TracingMetrics,
            reporter: TracingCampaignReporter,
            runtime: None,
            shared: Arc::new(Mutex::new(Shared {
                state: EngineState::Uninitialized,
                collectors: Vec::new(),
                campaign: None,
                last_outcome: None,
                shutdown_requested: false,
            })),
            shutdown: CancellationToken::new(),
            idle: Notify::new(),
        }
    }
}

impl<C, S, M, R> Engine<C, S, M, R>
where
    C: Collector,
    S: RecordStore,
    M: MetricsSink,
    R: CampaignReporter,
{
    pub fn with_metrics<M2: MetricsSink>(self, metrics: M2) -> Engine<C, S, M2, R> {
        Engine {
            collectors: self.collectors,
            store: self.store,
            metrics,
            reporter: self.reporter,
            runtime: self.runtime,
            shared: self.shared,
            shutdown: self.shutdown,
            idle: self.idle,
        }
    }

    pub fn with_reporter<R2: CampaignReporter>(self, reporter: R2) -> Engine<C, S, M, R2> {
        Engine {
            collectors: self.collectors,
            store: self.store,
            metrics: self.metrics,
            reporter,
            runtime: self.runtime,
            shared: self.shared,
            shutdown: self.shutdown,
            idle: self.idle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Engine state recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> EngineState {
        self.lock().state
    }

    /// Configuration snapshot in effect, once initialized.
    pub fn config(&self) -> Option<&EngineConfig> {
        self.runtime.as_ref().map(|r| &r.config)
    }

    /// Load configuration, validate collectors and build the shared components.
    ///
    /// Fails with `ConfigError` if the configuration is invalid or no
    /// collector is usable. The engine is left `Uninitialized` on failure.
    pub async fn initialize<CS: ConfigSource>(&mut self, source: &CS) -> Result<(), AppError> {
        {
            let mut shared = self.lock();
            if shared.state != EngineState::Uninitialized {
                return Err(AppError::ConfigError(format!(
                    "Engine cannot initialize from state {}",
                    shared.state
                )));
            }
            shared.state = EngineState::Initializing;
        }

        match self.build_runtime(source).await {
            Ok((runtime, slots)) => {
                let ready = slots
                    .iter()
                    .filter(|s| s.state == CollectorState::Ready)
                    .count();
                tracing::info!(
                    collectors = slots.len(),
                    ready,
                    keys = runtime.config.target_keys.len(),
                    proxies = runtime.config.proxies.len(),
                    "Engine initialized"
                );
                self.runtime = Some(runtime);
                let mut shared = self.lock();
                shared.collectors = slots;
                shared.state = EngineState::Ready;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Engine initialization failed");
                self.lock().state = EngineState::Uninitialized;
                Err(e)
            }
        }
    }

    async fn build_runtime<CS: ConfigSource>(
        &self,
        source: &CS,
    ) -> Result<(Runtime, Vec<CollectorSlot>), AppError> {
        let config = source.load().await?.validate()?;

        let mut names = HashSet::new();
        for collector in &self.collectors {
            let identity = collector.identity();
            if !names.insert(identity.name.clone()) {
                return Err(AppError::ConfigError(format!(
                    "Two collectors share the name '{}'",
                    identity.name
                )));
            }
        }
        for reg in &config.collectors {
            if !names.contains(&reg.name) {
                tracing::warn!(
                    collector = %reg.name,
                    "Registration has no collector implementation"
                );
            }
        }

        let governor = RateGovernor::new(config.rate.api);
        let mut slots = Vec::with_capacity(self.collectors.len());
        for collector in &self.collectors {
            let identity = collector.identity();
            let registration = config.registration(&identity.name);

            let (state, reason) = match registration {
                Some(reg) if !reg.enabled => {
                    (CollectorState::Disabled, Some("disabled by configuration".to_string()))
                }
                Some(reg) if reg.kind != identity.kind => {
                    return Err(AppError::ConfigError(format!(
                        "Collector '{}' is registered as {} but implemented as {}",
                        identity.name, reg.kind, identity.kind
                    )));
                }
                _ => match collector.health_check().await {
                    Ok(()) => (CollectorState::Ready, None),
                    Err(e) => {
                        tracing::warn!(
                            collector = %identity.name,
                            error = %e,
                            "Health check failed"
                        );
                        (CollectorState::Disabled, Some(format!("health check failed: {e}")))
                    }
                },
            };

            governor
                .register(&identity.name, config.rate_for(&identity.name, identity.kind))
                .await;
            slots.push(CollectorSlot {
                excluded: state == CollectorState::Disabled,
                identity,
                state,
                reason,
            });
        }

        if !slots.iter().any(|s| s.state == CollectorState::Ready) {
            return Err(AppError::ConfigError("No usable collectors".into()));
        }

        let pool = ResourcePool::new(config.proxies.clone(), config.pool.clone());
        let resilience = Resilience::new(&config, governor.clone());
        Ok((
            Runtime {
                config,
                pool,
                governor,
                resilience,
            },
            slots,
        ))
    }

    /// Run one campaign over every `Ready` collector.
    ///
    /// Per-unit failures never surface here; they are counted in the result.
    /// Errors only if the engine is not `Ready`.
    pub async fn run_campaign(&self) -> Result<CampaignResult, AppError> {
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(AppError::ConfigError("Engine is not initialized".into()));
        };
        let campaign_id = Uuid::new_v4();
        let started = Instant::now();
        let started_at = Utc::now();

        let mut tally = CampaignTally::new();
        let assignments: Vec<Assignment<'_, C>> = {
            let mut shared = self.lock();
            if shared.state != EngineState::Ready || shared.shutdown_requested {
                return Err(AppError::ConfigError(format!(
                    "Campaign can only start from ready, engine is {}",
                    shared.state
                )));
            }
            shared.state = EngineState::Running;
            shared.campaign = Some((campaign_id, started));

            let mut assignments = Vec::new();
            for (slot, collector) in shared.collectors.iter_mut().zip(&self.collectors) {
                if slot.state != CollectorState::Ready {
                    continue;
                }
                let keys = runtime.config.keys_for(&slot.identity.name);
                tally.register(&slot.identity, keys.len());
                slot.state = CollectorState::Running;
                slot.reason = None;
                assignments.push(Assignment {
                    collector,
                    identity: slot.identity.clone(),
                    keys,
                });
            }
            assignments
        };

        let distinct_keys = assignments
            .iter()
            .flat_map(|a| a.keys.iter())
            .collect::<HashSet<_>>()
            .len();
        let strategy =
            StrategyKind::select(&runtime.config.strategy, assignments.len(), distinct_keys);
        self.reporter.report(CampaignEvent::Started {
            campaign_id,
            strategy,
            collectors: assignments.len(),
            keys: distinct_keys,
        });

        let cancel = self.shutdown.child_token();
        let finished = CancellationToken::new();
        let budget_expired = AtomicBool::new(false);
        let budget = runtime.config.timeouts.campaign_budget();
        let (tx, mut rx) = mpsc::unbounded_channel::<UnitReport>();

        let ctx = UnitContext {
            campaign_id,
            config: &runtime.config,
            pool: &runtime.pool,
            governor: &runtime.governor,
            resilience: &runtime.resilience,
            store: &self.store,
            metrics: &self.metrics,
            reporter: &self.reporter,
            cancel: &cancel,
            results: tx,
        };

        let dispatch = async {
            let ctx = ctx;
            strategy.run(&ctx, &assignments).await;
            drop(ctx);
            finished.cancel();
        };
        let watchdog = async {
            tokio::select! {
                () = tokio::time::sleep(budget) => {
                    tracing::warn!(
                        %campaign_id,
                        budget_ms = %budget.as_millis(),
                        "Campaign budget expired"
                    );
                    budget_expired.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
                () = finished.cancelled() => {}
            }
        };
        let aggregate = async {
            while let Some(report) = rx.recv().await {
                if let Some(state) = tally.record(&report) {
                    let reason = tally
                        .summary(&report.collector)
                        .and_then(|s| s.disabled_reason.clone());
                    self.set_collector_state(&report.collector, state, reason);
                }
            }
        };
        tokio::join!(dispatch, watchdog, aggregate);

        let result = tally.finish(CampaignMeta {
            campaign_id,
            strategy,
            started_at,
            budget_expired: budget_expired.load(Ordering::SeqCst),
            cancelled: self.shutdown.is_cancelled(),
        });
        self.complete(runtime, &result);
        Ok(result)
    }

    fn set_collector_state(&self, name: &str, state: CollectorState, reason: Option<String>) {
        {
            let mut shared = self.lock();
            let Some(slot) = shared.collectors.iter_mut().find(|s| s.identity.name == name) else {
                return;
            };
            if slot.state == state {
                return;
            }
            slot.state = state;
            slot.reason = reason.clone();
        }
        self.reporter.report(CampaignEvent::CollectorStateChanged {
            collector: name,
            state,
            reason: reason.as_deref(),
        });
    }

    /// Publish final collector states, metrics and the terminal engine state.
    fn complete(&self, runtime: &Runtime, result: &CampaignResult) {
        for (name, summary) in &result.collectors {
            let reason = summary.disabled_reason.clone().or_else(|| {
                runtime
                    .resilience
                    .retry_state(name)
                    .last_error
                    .filter(|_| summary.items == 0 && summary.error_count() > 0)
                    .map(|class| format!("no items, last error {class}"))
            });
            self.set_collector_state(name, summary.state, reason);
        }

        let labels = MetricLabels::campaign(result.campaign_id);
        self.metrics
            .gauge(CAMPAIGN_DURATION_MS, result.duration_ms as f64, labels);
        self.metrics.gauge(
            POOL_HEALTHY,
            runtime.pool.health_report().healthy as f64,
            labels,
        );

        if result.outcome == CampaignOutcome::Completed {
            runtime.resilience.reset();
        }

        {
            let mut shared = self.lock();
            if shared.state == EngineState::Running {
                shared.state = result.outcome.into();
            }
            shared.campaign = None;
            shared.last_outcome = Some(result.outcome);
        }
        self.idle.notify_waiters();
        self.reporter.report(CampaignEvent::Finished { result });
    }

    /// Snapshot of engine, collector and pool state. Safe during a campaign.
    pub fn status(&self) -> EngineStatus {
        let shared = self.lock();
        let collectors = shared
            .collectors
            .iter()
            .map(|slot| CollectorStatus {
                name: slot.identity.name.clone(),
                kind: slot.identity.kind,
                state: slot.state,
                reason: slot.reason.clone(),
                retry: self
                    .runtime
                    .as_ref()
                    .map(|r| r.resilience.retry_state(&slot.identity.name)),
            })
            .collect();
        EngineStatus {
            state: shared.state,
            collectors,
            pool: self
                .runtime
                .as_ref()
                .map(|r| r.pool.health_report())
                .unwrap_or_default(),
            campaign_id: shared.campaign.map(|(id, _)| id),
            elapsed_ms: shared
                .campaign
                .map(|(_, started)| started.elapsed().as_millis() as u64),
            last_outcome: shared.last_outcome,
        }
    }

    /// Return a finished engine to `Ready` with closed breakers.
    ///
    /// Collectors excluded at initialization stay disabled.
    pub fn reset(&self) -> Result<(), AppError> {
        let mut shared = self.lock();
        if !(shared.state.finished() || shared.state == EngineState::Ready) {
            return Err(AppError::ConfigError(format!(
                "Engine cannot reset from state {}",
                shared.state
            )));
        }
        if let Some(runtime) = &self.runtime {
            runtime.resilience.reset();
        }
        for slot in shared.collectors.iter_mut().filter(|s| !s.excluded) {
            slot.state = CollectorState::Ready;
            slot.reason = None;
        }
        shared.state = EngineState::Ready;
        tracing::info!("Engine reset");
        Ok(())
    }

    /// Cancel any running campaign, disable collectors and release leases.
    ///
    /// Idempotent. In-flight attempts get `timeouts.shutdown_grace` to finish
    /// before they are abandoned.
    pub async fn shutdown(&self) {
        let running = {
            let mut shared = self.lock();
            if shared.shutdown_requested || shared.state == EngineState::Terminated {
                return;
            }
            shared.shutdown_requested = true;
            shared.state == EngineState::Running
        };
        tracing::info!(running, "Engine shutting down");
        self.shutdown.cancel();

        if running {
            let grace = self
                .config()
                .map(|c| c.timeouts.shutdown_grace())
                .unwrap_or_default();
            let wait = async {
                loop {
                    let notified = self.idle.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if self.lock().state != EngineState::Running {
                        return;
                    }
                    notified.await;
                }
            };
            if tokio::time::timeout(grace + Duration::from_secs(1), wait)
                .await
                .is_err()
            {
                tracing::warn!("Campaign did not stop within the shutdown grace period");
            }
        }

        let names: Vec<String> = {
            let mut shared = self.lock();
            shared.state = EngineState::ShuttingDown;
            shared
                .collectors
                .iter()
                .filter(|s| s.state != CollectorState::Disabled)
                .map(|s| s.identity.name.clone())
                .collect()
        };
        for name in names {
            self.set_collector_state(
                &name,
                CollectorState::Disabled,
                Some("engine shut down".into()),
            );
        }
        if let Some(runtime) = &self.runtime {
            let released = runtime.pool.release_all();
            tracing::debug!(released, "Released proxy leases");
        }
        self.lock().state = EngineState::Terminated;
        tracing::info!("Engine terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CollectorRegistration, PacingConfig, ProxyEndpoint, RateConfig, RateLimit, RetryConfig,
        StaticConfigSource, StrategyConfig, StrategyMode, TimeoutConfig,
    };
    use crate::error::ErrorClass;
    use crate::metrics::ITEMS_COLLECTED;
    use crate::models::{SourceKind, TargetKey};
    use crate::testutil::{Behavior, MockCollector, MockReporter, MockStore, RecordingMetrics};

    fn keys(n: usize) -> Vec<TargetKey> {
        (0..n).map(|i| TargetKey::new(format!("9720{i}"))).collect()
    }

    fn config(n_keys: usize) -> EngineConfig {
        EngineConfig {
            target_keys: keys(n_keys),
            pacing: PacingConfig {
                sequential_key_delay_ms: 0,
                collector_delay_ms: 0,
                parallel_key_delay_ms: 0,
                max_concurrency: 4,
                jitter_ms: 0,
            },
            rate: RateConfig {
                api: RateLimit::new(100, 1000.0),
                browser: RateLimit::new(100, 1000.0),
                default_penalty_ms: 10,
            },
            retry: RetryConfig {
                base_delay_ms: 1,
                max_delay_ms: 2,
                jitter: 0.0,
                ..Default::default()
            },
            timeouts: TimeoutConfig {
                exhaustion_timeout_ms: 20,
                shutdown_grace_ms: 50,
                ..Default::default()
            },
            proxies: vec![
                ProxyEndpoint::new("http://proxy-a:8080"),
                ProxyEndpoint::new("http://proxy-b:8080"),
            ],
            ..Default::default()
        }
    }

    async fn engine(
        collectors: Vec<MockCollector>,
        config: EngineConfig,
    ) -> Engine<MockCollector, MockStore, RecordingMetrics, MockReporter> {
        let mut engine = Engine::new(collectors, MockStore::new())
            .with_metrics(RecordingMetrics::new())
            .with_reporter(MockReporter::new());
        engine
            .initialize(&StaticConfigSource(config))
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn all_success_completes_with_full_ratio() {
        let a = MockCollector::new("county", SourceKind::Api, 2);
        let b = MockCollector::new("listings", SourceKind::Browser, 1);
        let engine = engine(vec![a.clone(), b.clone()], config(3)).await;

        let result = engine.run_campaign().await.unwrap();

        assert_eq!(result.outcome, CampaignOutcome::Completed);
        assert_eq!(result.success_ratio, 1.0);
        assert_eq!(result.total_items, 9);
        assert_eq!(result.collectors["county"].attempted, 3);
        assert_eq!(result.collectors["listings"].attempted, 3);
        assert_eq!(engine.state(), EngineState::Completed);
        assert_eq!(engine.store.count(), 9);
        assert_eq!(engine.metrics.total(ITEMS_COLLECTED, Some("county")), 6.0);
    }

    #[tokio::test]
    async fn browser_units_hold_a_lease_api_units_do_not() {
        let a = MockCollector::new("county", SourceKind::Api, 1);
        let b = MockCollector::new("listings", SourceKind::Browser, 1);
        let engine = engine(vec![a.clone(), b.clone()], config(2)).await;
        engine.run_campaign().await.unwrap();

        assert!(a.calls().iter().all(|(_, proxy)| proxy.is_none()));
        assert!(b.calls().iter().all(|(_, proxy)| proxy.is_some()));
        assert_eq!(engine.status().pool.in_use, 0);
    }

    #[tokio::test]
    async fn one_blocked_collector_is_partial_failure() {
        let a = MockCollector::failing("listings", SourceKind::Browser, || {
            AppError::Blocked("captcha".into())
        });
        let b = MockCollector::new("county", SourceKind::Api, 1);
        let mut config = config(3);
        config.pool.failure_threshold = 10;
        let engine = engine(vec![a.clone(), b], config).await;

        let result = engine.run_campaign().await.unwrap();

        let blocked = &result.collectors["listings"];
        assert_eq!(result.outcome, CampaignOutcome::PartiallyFailed);
        assert_eq!(blocked.items, 0);
        assert_eq!(blocked.attempted, 3);
        assert_eq!(blocked.errors[&ErrorClass::BlockedOrDetected], 3);
        assert_eq!(blocked.state, CollectorState::Completed);
        // Each unit rotates through its blocked-retry allowance.
        assert_eq!(a.calls().len(), 9);
        assert_eq!(engine.state(), EngineState::PartiallyFailed);
    }

    #[tokio::test]
    async fn five_auth_failures_disable_collector() {
        let a = MockCollector::failing("county", SourceKind::Api, || {
            AppError::AuthError("401".into())
        });
        let b = MockCollector::new("listings", SourceKind::Browser, 1);
        let reporter_engine = engine(vec![a.clone(), b], config(8)).await;

        let result = reporter_engine.run_campaign().await.unwrap();

        let county = &result.collectors["county"];
        assert_eq!(county.attempted, 5);
        assert_eq!(county.errors[&ErrorClass::AuthFailure], 5);
        assert_eq!(county.state, CollectorState::Disabled);
        assert_eq!(a.calls().len(), 5);
        assert_eq!(result.collectors["listings"].attempted, 8);
        assert_eq!(
            reporter_engine.reporter.count("state:county:disabled"),
            1
        );
        let status = reporter_engine.status();
        let county_status = status
            .collectors
            .iter()
            .find(|c| c.name == "county")
            .unwrap();
        assert_eq!(county_status.state, CollectorState::Disabled);
        assert!(county_status.reason.as_deref().unwrap().contains("breaker"));
    }

    #[tokio::test]
    async fn transient_retry_does_not_double_count() {
        let a = MockCollector::new("county", SourceKind::Api, 3).script(
            "97200",
            vec![Behavior::ItemsThenError(
                2,
                AppError::NetworkError("reset".into()),
            )],
        );
        let engine = engine(vec![a.clone()], config(1)).await;

        let result = engine.run_campaign().await.unwrap();

        let county = &result.collectors["county"];
        assert_eq!(county.items, 3);
        assert_eq!(county.duplicates, 2);
        assert_eq!(county.succeeded, 1);
        assert_eq!(engine.store.count(), 3);
        assert_eq!(a.calls().len(), 2);
    }

    #[tokio::test]
    async fn total_resource_exhaustion_fails_campaign() {
        let mut config = config(2);
        config.proxies.clear();
        let a = MockCollector::new("listings", SourceKind::Browser, 1);
        let b = MockCollector::new("agents", SourceKind::Browser, 1);
        let engine = engine(vec![a.clone(), b], config).await;

        let result = engine.run_campaign().await.unwrap();

        assert_eq!(result.outcome, CampaignOutcome::Failed);
        assert_eq!(result.total_items, 0);
        assert!(result.resource_exhausted);
        assert_eq!(result.collectors["listings"].state, CollectorState::Failed);
        assert!(a.calls().is_empty());
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn exhaustion_wait_is_paid_once_per_collector() {
        let mut config = config(5);
        config.proxies.clear();
        config.timeouts.exhaustion_timeout_ms = 100;
        config.strategy = StrategyConfig {
            mode: StrategyMode::Sequential,
            ..Default::default()
        };
        let a = MockCollector::new("listings", SourceKind::Browser, 1);
        let b = MockCollector::new("agents", SourceKind::Browser, 1);
        let engine = engine(vec![a, b], config).await;

        let start = Instant::now();
        let result = engine.run_campaign().await.unwrap();

        // Waiting per unit would take ten exhaustion timeouts.
        assert!(start.elapsed() < Duration::from_millis(600));
        assert_eq!(result.outcome, CampaignOutcome::Failed);
        assert!(result.resource_exhausted);
        for name in ["listings", "agents"] {
            let summary = &result.collectors[name];
            assert_eq!(summary.attempted, 5);
            assert_eq!(summary.exhausted, 5);
        }
    }

    #[tokio::test]
    async fn slow_attempts_time_out_as_transient() {
        let mut config = config(1);
        config.timeouts.api_attempt_ms = 20;
        let a = MockCollector::new("county", SourceKind::Api, 1)
            .with_delay(Duration::from_millis(200));
        let engine = engine(vec![a.clone()], config).await;

        let result = engine.run_campaign().await.unwrap();

        let summary = &result.collectors["county"];
        assert_eq!(summary.errors.get(&ErrorClass::Transient), Some(&1));
        assert_eq!(summary.items, 0);
        assert_eq!(a.calls().len(), 3);
        assert_eq!(result.outcome, CampaignOutcome::Failed);
    }

    #[tokio::test]
    async fn sequential_preserves_key_order() {
        let mut config = config(5);
        config.strategy = StrategyConfig {
            mode: StrategyMode::Sequential,
            ..Default::default()
        };
        let a = MockCollector::new("county", SourceKind::Api, 1);
        let b = MockCollector::new("listings", SourceKind::Browser, 1);
        let engine = engine(vec![a.clone(), b.clone()], config).await;
        engine.run_campaign().await.unwrap();

        let expected: Vec<String> = keys(5).iter().map(|k| k.to_string()).collect();
        assert_eq!(a.keys_called(), expected);
        assert_eq!(b.keys_called(), expected);
    }

    #[tokio::test]
    async fn parallel_preserves_per_collector_order() {
        let mut config = config(4);
        config.strategy.mode = StrategyMode::Parallel;
        let a = MockCollector::new("county", SourceKind::Api, 1)
            .with_delay(Duration::from_millis(3));
        let b = MockCollector::new("listings", SourceKind::Browser, 1);
        let engine = engine(vec![a.clone(), b.clone()], config).await;
        let result = engine.run_campaign().await.unwrap();

        assert_eq!(result.strategy, StrategyKind::Parallel);
        let expected: Vec<String> = keys(4).iter().map(|k| k.to_string()).collect();
        assert_eq!(a.keys_called(), expected);
        assert_eq!(b.keys_called(), expected);
    }

    #[tokio::test]
    async fn adaptive_mixes_small_campaigns() {
        let a = MockCollector::new("county", SourceKind::Api, 1);
        let b = MockCollector::new("listings", SourceKind::Browser, 1);
        let engine = engine(vec![a, b], config(3)).await;
        let result = engine.run_campaign().await.unwrap();
        assert_eq!(result.strategy, StrategyKind::Mixed);
        assert_eq!(engine.reporter.count("started:mixed"), 1);
    }

    #[tokio::test]
    async fn key_failing_everywhere_still_counts_as_attempted() {
        let a = MockCollector::new("county", SourceKind::Api, 1)
            .script("97201", vec![Behavior::Error(AppError::DataInvalid("gone".into()))]);
        let b = MockCollector::new("listings", SourceKind::Browser, 1)
            .script("97201", vec![Behavior::Error(AppError::DataInvalid("gone".into()))]);
        let engine = engine(vec![a, b], config(3)).await;

        let result = engine.run_campaign().await.unwrap();

        assert_eq!(result.keys_attempted, 3);
        assert_eq!(result.collectors["county"].attempted, 3);
        assert_eq!(result.errors_by_class()[&ErrorClass::DataInvalid], 2);
        assert_eq!(result.outcome, CampaignOutcome::Completed);
    }

    #[tokio::test]
    async fn invalid_records_are_counted_and_skipped() {
        let a = MockCollector::new("county", SourceKind::Api, 1)
            .script("97200", vec![Behavior::Invalid(4)]);
        let engine = engine(vec![a], config(2)).await;
        let result = engine.run_campaign().await.unwrap();

        let county = &result.collectors["county"];
        assert_eq!(county.invalid_records, 4);
        assert_eq!(county.succeeded, 2);
        assert_eq!(county.items, 1);
    }

    #[tokio::test]
    async fn collector_with_no_keys_is_skipped() {
        let mut config = config(2);
        let mut reg = CollectorRegistration::new("idle", SourceKind::Api);
        reg.keys = Some(vec![]);
        config.collectors.push(reg);
        let a = MockCollector::new("county", SourceKind::Api, 1);
        let idle = MockCollector::new("idle", SourceKind::Api, 1);
        let engine = engine(vec![a, idle.clone()], config).await;

        let result = engine.run_campaign().await.unwrap();

        assert_eq!(result.outcome, CampaignOutcome::Completed);
        assert_eq!(result.collectors["idle"].attempted, 0);
        assert!(idle.calls().is_empty());
    }

    #[tokio::test]
    async fn initialize_rejects_when_no_collector_is_usable() {
        let mut config = config(1);
        let mut reg = CollectorRegistration::new("county", SourceKind::Api);
        reg.enabled = false;
        config.collectors.push(reg);
        let listings = MockCollector::new("listings", SourceKind::Browser, 1).unhealthy("no key");

        let mut engine = Engine::new(
            vec![MockCollector::new("county", SourceKind::Api, 1), listings],
            MockStore::new(),
        );
        let err = engine
            .initialize(&StaticConfigSource(config))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[tokio::test]
    async fn unhealthy_collector_is_disabled_but_campaign_runs() {
        let a = MockCollector::new("county", SourceKind::Api, 1);
        let b = MockCollector::new("listings", SourceKind::Browser, 1).unhealthy("expired");
        let engine = engine(vec![a, b.clone()], config(2)).await;

        let status = engine.status();
        assert_eq!(status.state, EngineState::Ready);
        assert_eq!(status.collectors[1].state, CollectorState::Disabled);

        let result = engine.run_campaign().await.unwrap();
        assert!(!result.collectors.contains_key("listings"));
        assert_eq!(result.outcome, CampaignOutcome::Completed);
        assert!(b.calls().is_empty());
    }

    #[tokio::test]
    async fn run_campaign_requires_ready() {
        let a = MockCollector::new("county", SourceKind::Api, 1);
        let engine = engine(vec![a], config(1)).await;
        engine.run_campaign().await.unwrap();
        assert!(engine.run_campaign().await.is_err());

        engine.reset().unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        assert!(engine.run_campaign().await.is_ok());
    }

    #[tokio::test]
    async fn reset_closes_breakers() {
        let a = MockCollector::failing("county", SourceKind::Api, || {
            AppError::AuthError("401".into())
        });
        let b = MockCollector::new("listings", SourceKind::Browser, 1);
        let engine = engine(vec![a.clone(), b], config(6)).await;
        engine.run_campaign().await.unwrap();
        assert_eq!(a.calls().len(), 5);

        engine.reset().unwrap();
        let county = engine
            .status()
            .collectors
            .into_iter()
            .find(|c| c.name == "county")
            .unwrap();
        assert_eq!(county.state, CollectorState::Ready);
        assert_eq!(
            county.retry.unwrap().breaker,
            Some(crate::circuit_breaker::CircuitState::Closed)
        );
    }

    #[tokio::test]
    async fn rerun_over_unchanged_data_completes() {
        let a = MockCollector::new("county", SourceKind::Api, 2);
        let engine = engine(vec![a], config(2)).await;

        let first = engine.run_campaign().await.unwrap();
        assert_eq!(first.outcome, CampaignOutcome::Completed);
        assert_eq!(first.total_items, 4);

        engine.reset().unwrap();
        let second = engine.run_campaign().await.unwrap();

        assert_eq!(second.outcome, CampaignOutcome::Completed);
        assert_eq!(second.total_items, 0);
        assert_eq!(second.collectors["county"].duplicates, 4);
        assert_eq!(engine.state(), EngineState::Completed);
    }

    #[tokio::test]
    async fn shutdown_during_campaign_returns_promptly() {
        let a = MockCollector::new("county", SourceKind::Api, 1)
            .with_delay(Duration::from_secs(30));
        let b = MockCollector::new("listings", SourceKind::Browser, 1)
            .with_delay(Duration::from_secs(30));
        let engine = engine(vec![a, b], config(3)).await;

        let start = Instant::now();
        let (result, ()) = tokio::join!(engine.run_campaign(), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            engine.shutdown().await;
        });
        let result = result.unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(result.cancelled);
        assert_eq!(result.outcome, CampaignOutcome::PartiallyFailed);
        assert_eq!(engine.state(), EngineState::Terminated);
        assert!(
            engine
                .status()
                .collectors
                .iter()
                .all(|c| c.state == CollectorState::Disabled)
        );
        assert_eq!(engine.status().pool.in_use, 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let a = MockCollector::new("county", SourceKind::Api, 1);
        let engine = engine(vec![a], config(1)).await;
        engine.shutdown().await;
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Terminated);
        assert!(engine.run_campaign().await.is_err());
    }

    #[tokio::test]
    async fn campaign_budget_forces_partial_result() {
        let mut config = config(3);
        config.timeouts.campaign_budget_ms = 40;
        config.strategy.mode = StrategyMode::Sequential;
        let a = MockCollector::new("county", SourceKind::Api, 1)
            .with_delay(Duration::from_millis(25));
        let engine = engine(vec![a], config).await;

        let result = engine.run_campaign().await.unwrap();

        let county = &result.collectors["county"];
        assert!(result.budget_expired);
        assert!(county.attempted < 3 || county.cancelled > 0);
        assert_eq!(result.outcome, CampaignOutcome::PartiallyFailed);
    }

    #[tokio::test]
    async fn status_is_available_while_running() {
        let a = MockCollector::new("county", SourceKind::Api, 1)
            .with_delay(Duration::from_millis(20));
        let engine = engine(vec![a], config(2)).await;

        let (result, status) = tokio::join!(engine.run_campaign(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            engine.status()
        });
        result.unwrap();
        assert_eq!(status.state, EngineState::Running);
        assert!(status.campaign_id.is_some());
        assert!(status.elapsed_ms.is_some());
        assert_eq!(status.collectors[0].state, CollectorState::Running);
    }
}
