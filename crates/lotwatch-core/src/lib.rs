pub mod campaign;
pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod governor;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod reporter;
pub mod resilience;
pub mod retry;
pub mod runner;
pub mod strategy;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use campaign::{CampaignOutcome, CampaignResult, CollectorSummary};
pub use config::{ConfigSource, EngineConfig, FileConfigSource, StaticConfigSource};
pub use engine::{Engine, EngineState, EngineStatus};
pub use error::{AppError, ClassifiedError, ErrorClass};
pub use metrics::{MetricsSink, NullMetrics, TracingMetrics};
pub use models::{
    CollectorIdentity, CollectorState, NormalizedRecord, RawItem, RecordKind, SourceKind,
    TargetKey, compute_hash,
};
pub use pool::{ProxyLease, ResourcePool};
pub use reporter::{CampaignEvent, CampaignReporter, TracingCampaignReporter};
pub use traits::{Collector, NullStore, RecordStore};
