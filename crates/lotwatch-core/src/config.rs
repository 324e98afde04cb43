//! Typed configuration snapshot for a campaign.
//!
//! Every knob carries a default so a minimal file only needs target keys and
//! collector registrations. Durations are plain millisecond integers on the
//! wire and exposed as [`Duration`] through accessor methods.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::models::{SourceKind, TargetKey};

/// Root configuration consumed once by `Engine::initialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Keys every collector walks unless its registration narrows them.
    pub target_keys: Vec<TargetKey>,
    pub collectors: Vec<CollectorRegistration>,
    /// Egress proxies handed out by the resource pool.
    pub proxies: Vec<ProxyEndpoint>,
    pub pool: PoolConfig,
    pub rate: RateConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub pacing: PacingConfig,
    pub strategy: StrategyConfig,
    pub timeouts: TimeoutConfig,
}

/// Per-collector switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorRegistration {
    pub name: String,
    pub kind: SourceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Subset of campaign keys; `None` means all of them.
    #[serde(default)]
    pub keys: Option<Vec<TargetKey>>,
    /// Overrides the per-kind default bucket.
    #[serde(default)]
    pub rate: Option<RateLimit>,
    /// Source-specific settings, interpreted by the collector implementation.
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl CollectorRegistration {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            keys: None,
            rate: None,
            settings: serde_json::Value::Null,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A proxy the pool can lease out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    /// `http://host:port` or `socks5://host:port`.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Source kinds allowed to use this proxy. Empty means any.
    #[serde(default)]
    pub kinds: Vec<SourceKind>,
}

impl ProxyEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            kinds: Vec::new(),
        }
    }

    pub fn serves(&self, kind: SourceKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Consecutive failures before a lease is quarantined.
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 5 * 60 * 1000,
        }
    }
}

impl PoolConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl RateLimit {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub api: RateLimit,
    pub browser: RateLimit,
    /// Penalty applied on throttling responses without a Retry-After hint.
    pub default_penalty_ms: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            api: RateLimit::new(2, 1.0),
            browser: RateLimit::new(1, 0.2),
            default_penalty_ms: 60_000,
        }
    }
}

impl RateConfig {
    pub fn for_kind(&self, kind: SourceKind) -> RateLimit {
        match kind {
            SourceKind::Api => self.api,
            SourceKind::Browser => self.browser,
        }
    }

    pub fn default_penalty(&self) -> Duration {
        Duration::from_millis(self.default_penalty_ms)
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Total attempts per unit, first dispatch included.
    pub max_attempts: u32,
    /// Fractional jitter applied symmetrically (0.2 = ±20%).
    pub jitter: f64,
    /// Proxy/session rotations allowed after an anti-bot signal.
    pub max_block_retries: u32,
    /// Retries granted to unclassified failures before escalating.
    pub max_unknown_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 3,
            jitter: 0.2,
            max_block_retries: 2,
            max_unknown_retries: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive auth/blocked outcomes that disable a collector.
    pub failure_threshold: u32,
    /// Lets an open breaker admit a trial unit after this long. Off by default:
    /// a disabled collector stays disabled for the rest of the campaign.
    pub recovery_timeout_ms: Option<u64>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub sequential_key_delay_ms: u64,
    pub collector_delay_ms: u64,
    pub parallel_key_delay_ms: u64,
    /// Ceiling on concurrently running collector tasks.
    pub max_concurrency: usize,
    /// Random extra delay added to each pacing pause, `[0, jitter]`.
    pub jitter_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            sequential_key_delay_ms: 2_000,
            collector_delay_ms: 5_000,
            parallel_key_delay_ms: 500,
            max_concurrency: 4,
            jitter_ms: 250,
        }
    }
}

impl PacingConfig {
    pub fn sequential_key_delay(&self) -> Duration {
        Duration::from_millis(self.sequential_key_delay_ms)
    }

    pub fn collector_delay(&self) -> Duration {
        Duration::from_millis(self.collector_delay_ms)
    }

    pub fn parallel_key_delay(&self) -> Duration {
        Duration::from_millis(self.parallel_key_delay_ms)
    }
}

/// Which orchestration strategy a campaign uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    #[default]
    Adaptive,
    Sequential,
    Parallel,
    Mixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub mode: StrategyMode,
    /// Key-space size above which adaptive selection goes parallel.
    pub large_key_space: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            mode: StrategyMode::Adaptive,
            large_key_space: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub api_attempt_ms: u64,
    pub browser_attempt_ms: u64,
    /// Wall-clock budget for the whole campaign.
    pub campaign_budget_ms: u64,
    /// How long an in-flight attempt may run after cancellation.
    pub shutdown_grace_ms: u64,
    /// How long `Unavailable` from the pool is tolerated per unit.
    pub exhaustion_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            api_attempt_ms: 30_000,
            browser_attempt_ms: 60_000,
            campaign_budget_ms: 90 * 60 * 1000,
            shutdown_grace_ms: 5_000,
            exhaustion_timeout_ms: 60_000,
        }
    }
}

impl TimeoutConfig {
    pub fn attempt_timeout(&self, kind: SourceKind) -> Duration {
        match kind {
            SourceKind::Api => Duration::from_millis(self.api_attempt_ms),
            SourceKind::Browser => Duration::from_millis(self.browser_attempt_ms),
        }
    }

    pub fn campaign_budget(&self) -> Duration {
        Duration::from_millis(self.campaign_budget_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn exhaustion_timeout(&self) -> Duration {
        Duration::from_millis(self.exhaustion_timeout_ms)
    }
}

impl EngineConfig {
    /// Parse a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw).map_err(|e| AppError::ConfigError(format!("Invalid config: {e}")))
    }

    /// Check cross-field constraints and drop duplicate target keys.
    pub fn validate(mut self) -> Result<Self, AppError> {
        if self.target_keys.is_empty() {
            return Err(AppError::ConfigError("No target keys configured".into()));
        }
        self.target_keys = dedup_keys(self.target_keys);

        let mut names = HashSet::new();
        for reg in &mut self.collectors {
            if reg.name.trim().is_empty() {
                return Err(AppError::ConfigError("Collector name must not be empty".into()));
            }
            if !names.insert(reg.name.clone()) {
                return Err(AppError::ConfigError(format!(
                    "Collector '{}' registered twice",
                    reg.name
                )));
            }
            if let Some(rate) = &reg.rate {
                validate_rate(&reg.name, rate)?;
            }
            if let Some(keys) = reg.keys.take() {
                reg.keys = Some(dedup_keys(keys));
            }
        }

        validate_rate("api default", &self.rate.api)?;
        validate_rate("browser default", &self.rate.browser)?;

        for proxy in &self.proxies {
            let url = Url::parse(&proxy.url).map_err(|e| {
                AppError::ConfigError(format!("Invalid proxy URL '{}': {e}", proxy.url))
            })?;
            match url.scheme() {
                "http" | "https" | "socks5" | "socks5h" => {}
                scheme => {
                    return Err(AppError::ConfigError(format!(
                        "Proxy scheme '{scheme}' is not supported"
                    )));
                }
            }
        }

        if self.pool.failure_threshold == 0 {
            return Err(AppError::ConfigError(
                "pool.failure_threshold must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::ConfigError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(AppError::ConfigError(
                "retry.jitter must be within [0, 1)".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(AppError::ConfigError(
                "retry.multiplier must be at least 1".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(AppError::ConfigError(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.pacing.max_concurrency == 0 {
            return Err(AppError::ConfigError(
                "pacing.max_concurrency must be at least 1".into(),
            ));
        }

        Ok(self)
    }

    pub fn registration(&self, name: &str) -> Option<&CollectorRegistration> {
        self.collectors.iter().find(|r| r.name == name)
    }

    /// Keys a collector should walk, in campaign order.
    pub fn keys_for(&self, name: &str) -> Vec<TargetKey> {
        match self.registration(name).and_then(|r| r.keys.as_ref()) {
            Some(keys) => keys.clone(),
            None => self.target_keys.clone(),
        }
    }

    pub fn rate_for(&self, name: &str, kind: SourceKind) -> RateLimit {
        self.registration(name)
            .and_then(|r| r.rate)
            .unwrap_or_else(|| self.rate.for_kind(kind))
    }
}

fn validate_rate(owner: &str, rate: &RateLimit) -> Result<(), AppError> {
    if rate.capacity == 0 || rate.refill_per_sec.is_nan() || rate.refill_per_sec <= 0.0 {
        return Err(AppError::ConfigError(format!(
            "Rate limit for {owner} needs capacity >= 1 and a positive refill rate"
        )));
    }
    Ok(())
}

fn dedup_keys(keys: Vec<TargetKey>) -> Vec<TargetKey> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}

/// Supplies the configuration snapshot.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> impl Future<Output = Result<EngineConfig, AppError>> + Send;
}

/// Reads configuration from a JSON file.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileConfigSource {
    async fn load(&self) -> Result<EngineConfig, AppError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            AppError::ConfigError(format!(
                "Failed to read config file {}: {e}",
                self.path.display()
            ))
        })?;
        EngineConfig::from_json(&raw)
    }
}

/// Hands out an in-memory snapshot.
#[derive(Debug, Clone)]
pub struct StaticConfigSource(pub EngineConfig);

impl ConfigSource for StaticConfigSource {
    async fn load(&self) -> Result<EngineConfig, AppError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn minimal() -> EngineConfig {
        EngineConfig {
            target_keys: vec!["97201".into(), "97202".into()],
            collectors: vec![CollectorRegistration::new("county", SourceKind::Api)],
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.pool.failure_threshold, 3);
        assert_eq!(config.pool.cooldown(), Duration::from_secs(300));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(
            config.timeouts.attempt_timeout(SourceKind::Api),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.timeouts.attempt_timeout(SourceKind::Browser),
            Duration::from_secs(60)
        );
        assert_eq!(config.timeouts.campaign_budget(), Duration::from_secs(5400));
        assert_eq!(config.strategy.mode, StrategyMode::Adaptive);
    }

    #[test]
    fn parses_minimal_json() {
        let config = EngineConfig::from_json(
            r#"{
                "target_keys": ["97201"],
                "collectors": [{"name": "county", "kind": "api"}]
            }"#,
        )
        .unwrap();
        assert!(config.collectors[0].enabled);
        assert!(config.collectors[0].keys.is_none());
        assert_eq!(config.retry.base_delay_ms, 1_000);
    }

    #[test]
    fn validate_rejects_empty_keys() {
        let config = EngineConfig {
            target_keys: vec![],
            ..minimal()
        };
        assert!(matches!(
            config.validate(),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn validate_rejects_duplicate_collectors() {
        let mut config = minimal();
        config
            .collectors
            .push(CollectorRegistration::new("county", SourceKind::Browser));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("registered twice"));
    }

    #[test]
    fn validate_rejects_bad_proxy_scheme() {
        let mut config = minimal();
        config.proxies.push(ProxyEndpoint::new("ftp://proxy:21"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_dedups_keys_preserving_order() {
        let config = EngineConfig {
            target_keys: vec!["b".into(), "a".into(), "b".into()],
            ..minimal()
        }
        .validate()
        .unwrap();
        assert_eq!(config.target_keys, vec![TargetKey::new("b"), TargetKey::new("a")]);
    }

    #[test]
    fn keys_for_honours_registration_subset() {
        let mut config = minimal();
        config.collectors[0].keys = Some(vec!["97202".into()]);
        assert_eq!(config.keys_for("county"), vec![TargetKey::new("97202")]);
        assert_eq!(config.keys_for("unregistered").len(), 2);
    }

    #[test]
    fn rate_for_prefers_override() {
        let mut config = minimal();
        config.collectors[0].rate = Some(RateLimit::new(5, 2.0));
        assert_eq!(config.rate_for("county", SourceKind::Api).capacity, 5);
        assert_eq!(
            config.rate_for("other", SourceKind::Browser),
            config.rate.browser
        );
    }

    #[tokio::test]
    async fn file_source_loads_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"target_keys": ["97201"], "pacing": {{"max_concurrency": 2}}}}"#
        )
        .unwrap();

        let config = FileConfigSource::new(file.path()).load().await.unwrap();
        assert_eq!(config.pacing.max_concurrency, 2);
        assert_eq!(config.pacing.parallel_key_delay_ms, 500);
    }

    #[tokio::test]
    async fn file_source_missing_file_is_config_error() {
        let err = FileConfigSource::new("/nonexistent/lotwatch.json")
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
