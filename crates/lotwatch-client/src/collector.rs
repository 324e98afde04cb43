use futures::Stream;
use futures::future::Either;
use lotwatch_core::config::{CollectorRegistration, EngineConfig};
use lotwatch_core::error::AppError;
use lotwatch_core::models::{CollectorIdentity, NormalizedRecord, RawItem, SourceKind, TargetKey};
use lotwatch_core::pool::ProxyLease;
use lotwatch_core::traits::Collector;
use serde::Deserialize;

use crate::api::ApiCollector;
use crate::browser::BrowserCollector;
use crate::captcha::HttpCaptchaSolver;

#[cfg(feature = "browser")]
pub type DefaultSessions = crate::session::ChromiumSessions;
#[cfg(not(feature = "browser"))]
pub type DefaultSessions = crate::session::UnavailableSessions;

/// `captcha` block of a browser registration's settings.
#[derive(Debug, Deserialize)]
struct CaptchaSettings {
    base_url: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_key_env: Option<String>,
}

impl CaptchaSettings {
    fn from_registration(registration: &CollectorRegistration) -> Result<Option<Self>, AppError> {
        let Some(raw) = registration.settings.get("captcha") else {
            return Ok(None);
        };
        serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| {
                AppError::ConfigError(format!(
                    "{}: invalid captcha settings: {e}",
                    registration.name
                ))
            })
    }

    fn solver(&self) -> Result<HttpCaptchaSolver, AppError> {
        let key = self
            .api_key
            .clone()
            .or_else(|| self.api_key_env.as_ref().and_then(|var| std::env::var(var).ok()))
            .unwrap_or_default();
        HttpCaptchaSolver::new(&self.base_url, &key)
    }
}

/// The closed set of collectors the CLI can build from configuration.
pub enum SourceCollector {
    Api(ApiCollector),
    Browser(BrowserCollector<DefaultSessions>),
}

impl SourceCollector {
    /// Build the collector a registration describes.
    pub fn from_registration(
        registration: &CollectorRegistration,
        config: &EngineConfig,
    ) -> Result<Self, AppError> {
        match registration.kind {
            SourceKind::Api => ApiCollector::from_registration(registration).map(Self::Api),
            SourceKind::Browser => {
                let solver = CaptchaSettings::from_registration(registration)?
                    .map(|c| c.solver())
                    .transpose()?;
                let sessions = default_sessions(config, solver);
                BrowserCollector::from_registration(registration, sessions).map(Self::Browser)
            }
        }
    }

    /// Build every enabled registration.
    pub fn build_all(config: &EngineConfig) -> Result<Vec<Self>, AppError> {
        config
            .collectors
            .iter()
            .filter(|r| r.enabled)
            .map(|r| Self::from_registration(r, config))
            .collect()
    }
}

#[cfg(feature = "browser")]
fn default_sessions(config: &EngineConfig, solver: Option<HttpCaptchaSolver>) -> DefaultSessions {
    let sessions = crate::session::ChromiumSessions::new(
        config.timeouts.attempt_timeout(SourceKind::Browser),
    );
    match solver {
        Some(solver) => sessions.with_solver(solver),
        None => sessions,
    }
}

#[cfg(not(feature = "browser"))]
fn default_sessions(_config: &EngineConfig, solver: Option<HttpCaptchaSolver>) -> DefaultSessions {
    if solver.is_some() {
        tracing::debug!("CAPTCHA solver configured but browser support is not compiled in");
    }
    crate::session::UnavailableSessions
}

impl Collector for SourceCollector {
    fn identity(&self) -> CollectorIdentity {
        match self {
            Self::Api(c) => c.identity(),
            Self::Browser(c) => c.identity(),
        }
    }

    fn uses_proxy(&self) -> bool {
        match self {
            Self::Api(c) => c.uses_proxy(),
            Self::Browser(c) => c.uses_proxy(),
        }
    }

    async fn health_check(&self) -> Result<(), AppError> {
        match self {
            Self::Api(c) => c.health_check().await,
            Self::Browser(c) => c.health_check().await,
        }
    }

    fn collect<'a>(
        &'a self,
        key: &'a TargetKey,
        lease: Option<&'a ProxyLease>,
    ) -> impl Stream<Item = Result<RawItem, AppError>> + Send + 'a {
        match self {
            Self::Api(c) => Either::Left(c.collect(key, lease)),
            Self::Browser(c) => Either::Right(c.collect(key, lease)),
        }
    }

    fn normalize(&self, item: RawItem) -> Result<NormalizedRecord, AppError> {
        match self {
            Self::Api(c) => c.normalize(item),
            Self::Browser(c) => c.normalize(item),
        }
    }
}
