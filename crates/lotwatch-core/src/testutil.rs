//! Test utilities: mock implementations of the engine's collaborators.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{Stream, StreamExt};
use uuid::Uuid;

use crate::error::{AppError, ErrorClass};
use crate::metrics::{MetricLabels, MetricsSink};
use crate::models::{
    CollectorIdentity, NormalizedRecord, RawItem, RecordKind, SourceKind, TargetKey,
};
use crate::pool::ProxyLease;
use crate::reporter::{CampaignEvent, CampaignReporter};
use crate::traits::{Collector, RecordStore};

// ---------------------------------------------------------------------------
// MockCollector
// ---------------------------------------------------------------------------

/// What one `collect` call does.
#[derive(Debug)]
pub enum Behavior {
    /// Yield this many valid items.
    Items(usize),
    /// Yield this many valid items, then fail.
    ItemsThenError(usize, AppError),
    /// Fail before yielding anything.
    Error(AppError),
    /// Yield items whose payload cannot be normalized.
    Invalid(usize),
}

type Fallback = Arc<dyn Fn(&TargetKey) -> Behavior + Send + Sync>;

/// Mock collector with per-key scripted behaviour.
#[derive(Clone)]
pub struct MockCollector {
    identity: CollectorIdentity,
    uses_proxy: bool,
    delay: Option<Duration>,
    health: Arc<Mutex<Option<String>>>,
    script: Arc<Mutex<HashMap<TargetKey, VecDeque<Behavior>>>>,
    fallback: Fallback,
    /// (key, proxy url) for every `collect` call.
    calls: Arc<Mutex<Vec<(TargetKey, Option<String>)>>>,
}

impl MockCollector {
    /// Collector yielding `items` valid items for every key.
    pub fn new(name: &str, kind: SourceKind, items: usize) -> Self {
        Self::with_fallback(name, kind, move |_| Behavior::Items(items))
    }

    /// Collector whose unscripted calls are answered by `fallback`.
    pub fn with_fallback(
        name: &str,
        kind: SourceKind,
        fallback: impl Fn(&TargetKey) -> Behavior + Send + Sync + 'static,
    ) -> Self {
        Self {
            identity: CollectorIdentity::new(name, kind),
            uses_proxy: kind == SourceKind::Browser,
            delay: None,
            health: Arc::new(Mutex::new(None)),
            script: Arc::new(Mutex::new(HashMap::new())),
            fallback: Arc::new(fallback),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Collector that fails every call with a fresh error from `make`.
    pub fn failing(
        name: &str,
        kind: SourceKind,
        make: impl Fn() -> AppError + Send + Sync + 'static,
    ) -> Self {
        Self::with_fallback(name, kind, move |_| Behavior::Error(make()))
    }

    /// Queue behaviours for successive calls on `key`.
    pub fn script(self, key: &str, behaviors: Vec<Behavior>) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(TargetKey::new(key))
            .or_default()
            .extend(behaviors);
        self
    }

    /// Sleep this long before yielding anything.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_proxy(mut self, uses_proxy: bool) -> Self {
        self.uses_proxy = uses_proxy;
        self
    }

    pub fn unhealthy(self, reason: &str) -> Self {
        *self.health.lock().unwrap() = Some(reason.to_string());
        self
    }

    pub fn calls(&self) -> Vec<(TargetKey, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Keys in the order they were collected.
    pub fn keys_called(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|(k, _)| k.as_str().to_string())
            .collect()
    }

    fn next_behavior(&self, key: &TargetKey) -> Behavior {
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| (self.fallback)(key))
    }

    fn item(&self, key: &TargetKey, i: usize) -> Result<RawItem, AppError> {
        Ok(RawItem::new(
            self.identity.name.clone(),
            key.clone(),
            serde_json::json!({"id": format!("{key}-{i}"), "price": 100_000 + i}),
        ))
    }
}

impl Collector for MockCollector {
    fn identity(&self) -> CollectorIdentity {
        self.identity.clone()
    }

    fn uses_proxy(&self) -> bool {
        self.uses_proxy
    }

    async fn health_check(&self) -> Result<(), AppError> {
        match self.health.lock().unwrap().clone() {
            Some(reason) => Err(AppError::AuthError(reason)),
            None => Ok(()),
        }
    }

    fn collect<'a>(
        &'a self,
        key: &'a TargetKey,
        lease: Option<&'a ProxyLease>,
    ) -> impl Stream<Item = Result<RawItem, AppError>> + Send + 'a {
        self.calls
            .lock()
            .unwrap()
            .push((key.clone(), lease.map(|l| l.proxy_url().to_string())));

        let items: Vec<Result<RawItem, AppError>> = match self.next_behavior(key) {
            Behavior::Items(n) => (0..n).map(|i| self.item(key, i)).collect(),
            Behavior::ItemsThenError(n, err) => (0..n)
                .map(|i| self.item(key, i))
                .chain(std::iter::once(Err(err)))
                .collect(),
            Behavior::Error(err) => vec![Err(err)],
            Behavior::Invalid(n) => (0..n)
                .map(|_| {
                    Ok(RawItem::new(
                        self.identity.name.clone(),
                        key.clone(),
                        serde_json::json!({"garbage": true}),
                    ))
                })
                .collect(),
        };

        let delay = self.delay;
        futures::stream::once(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            items
        })
        .flat_map(futures::stream::iter)
    }

    fn normalize(&self, item: RawItem) -> Result<NormalizedRecord, AppError> {
        let id = item
            .payload
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::DataInvalid("missing id".into()))?
            .to_string();
        let price = item.payload.get("price").and_then(|v| v.as_i64());
        Ok(NormalizedRecord::new(
            item.source,
            RecordKind::Listing,
            item.key,
            id,
            None,
            price,
            None,
            serde_json::Value::Null,
        ))
    }
}

// ---------------------------------------------------------------------------
// MockStore
// ---------------------------------------------------------------------------

/// In-memory store that reports `Duplicate` for repeated content hashes.
#[derive(Clone, Default)]
pub struct MockStore {
    seen: Arc<Mutex<HashSet<String>>>,
    stored: Arc<Mutex<Vec<NormalizedRecord>>>,
    fail_with: Arc<Mutex<Option<String>>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `store` call fails with a database error.
    pub fn failing(message: &str) -> Self {
        let store = Self::default();
        *store.fail_with.lock().unwrap() = Some(message.to_string());
        store
    }

    pub fn stored(&self) -> Vec<NormalizedRecord> {
        self.stored.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.stored.lock().unwrap().len()
    }
}

impl RecordStore for MockStore {
    async fn store(&self, record: &NormalizedRecord) -> Result<Uuid, AppError> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(AppError::DatabaseError(message));
        }
        let key = format!("{}|{}", record.source, record.content_hash);
        if !self.seen.lock().unwrap().insert(key) {
            return Err(AppError::Duplicate(record.external_id.clone()));
        }
        self.stored.lock().unwrap().push(record.clone());
        Ok(Uuid::new_v4())
    }
}

// ---------------------------------------------------------------------------
// RecordingMetrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMetric {
    pub name: &'static str,
    pub value: f64,
    pub campaign_id: Uuid,
    pub collector: Option<String>,
    pub class: Option<ErrorClass>,
}

/// Metrics sink that records every emission.
#[derive(Clone, Default)]
pub struct RecordingMetrics {
    recorded: Arc<Mutex<Vec<RecordedMetric>>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<RecordedMetric> {
        self.recorded.lock().unwrap().clone()
    }

    /// Sum of every emission named `name`, optionally for one collector.
    pub fn total(&self, name: &str, collector: Option<&str>) -> f64 {
        self.recorded()
            .iter()
            .filter(|m| m.name == name)
            .filter(|m| collector.is_none() || m.collector.as_deref() == collector)
            .map(|m| m.value)
            .sum()
    }

    fn push(&self, name: &'static str, value: f64, labels: MetricLabels<'_>) {
        self.recorded.lock().unwrap().push(RecordedMetric {
            name,
            value,
            campaign_id: labels.campaign_id,
            collector: labels.collector.map(str::to_string),
            class: labels.class,
        });
    }
}

impl MetricsSink for RecordingMetrics {
    fn counter(&self, name: &'static str, value: u64, labels: MetricLabels<'_>) {
        self.push(name, value as f64, labels);
    }

    fn gauge(&self, name: &'static str, value: f64, labels: MetricLabels<'_>) {
        self.push(name, value, labels);
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records a short label for every event.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl CampaignReporter for MockReporter {
    fn report(&self, event: CampaignEvent<'_>) {
        let label = match event {
            CampaignEvent::Started { strategy, .. } => format!("started:{strategy}"),
            CampaignEvent::UnitDispatched { collector, key } => {
                format!("dispatched:{collector}:{key}")
            }
            CampaignEvent::UnitSucceeded { collector, key, .. } => {
                format!("succeeded:{collector}:{key}")
            }
            CampaignEvent::UnitFailed {
                collector, error, ..
            } => format!("failed:{collector}:{}", error.class),
            CampaignEvent::CollectorStateChanged {
                collector, state, ..
            } => format!("state:{collector}:{state}"),
            CampaignEvent::Finished { result } => format!("finished:{}", result.outcome),
        };
        self.events.lock().unwrap().push(label);
    }
}
