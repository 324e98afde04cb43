use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::{Stream, StreamExt, stream};
use lotwatch_core::config::CollectorRegistration;
use lotwatch_core::error::AppError;
use lotwatch_core::models::{
    CollectorIdentity, NormalizedRecord, RawItem, RecordKind, SourceKind, TargetKey,
};
use lotwatch_core::pool::ProxyLease;
use lotwatch_core::traits::Collector;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::http::{send_error, status_error};
use crate::parse;

/// Where each record field lives in an item, as a JSON pointer or a
/// top-level field name.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    pub id: String,
    pub address: Option<String>,
    pub price: Option<String>,
    pub area: Option<String>,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            id: "id".into(),
            address: Some("address".into()),
            price: Some("price".into()),
            area: Some("area".into()),
        }
    }
}

/// Registration settings of an [`ApiCollector`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    /// Appended to `base_url`; `{key}` is replaced with the target key.
    pub path: String,
    /// Query parameter carrying the target key, if the path does not.
    pub key_param: Option<String>,
    pub page_param: String,
    pub size_param: String,
    pub page_size: u32,
    pub max_pages: u32,
    /// JSON pointer to the array of items in each page.
    pub items_pointer: String,
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub api_key_header: String,
    /// Route requests through the leased proxy.
    pub use_proxy: bool,
    pub request_timeout_ms: u64,
    pub record_kind: RecordKind,
    pub fields: FieldMap,
    /// Checked by the health check when set.
    pub health_path: Option<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            path: String::new(),
            key_param: None,
            page_param: "page".into(),
            size_param: "page_size".into(),
            page_size: 100,
            max_pages: 20,
            items_pointer: "/results".into(),
            api_key: None,
            api_key_env: None,
            api_key_header: "X-Api-Key".into(),
            use_proxy: false,
            request_timeout_ms: 30_000,
            record_kind: RecordKind::Parcel,
            fields: FieldMap::default(),
            health_path: None,
        }
    }
}

/// Collector for a paginated JSON REST API.
///
/// Pages are requested one after another; items of every page are yielded
/// before the next request, so a failure on page `n` keeps pages `1..n`.
pub struct ApiCollector {
    identity: CollectorIdentity,
    settings: ApiSettings,
    api_key: Option<String>,
    client: Client,
    timeout: Duration,
    proxied: Mutex<HashMap<String, Client>>,
}

impl ApiCollector {
    pub fn new(name: impl Into<String>, settings: ApiSettings) -> Result<Self, AppError> {
        let name = name.into();
        Url::parse(&settings.base_url).map_err(|e| {
            AppError::ConfigError(format!("{name}: invalid base_url {:?}: {e}", settings.base_url))
        })?;
        if settings.page_size == 0 || settings.max_pages == 0 {
            return Err(AppError::ConfigError(format!(
                "{name}: page_size and max_pages must be positive"
            )));
        }

        let timeout = Duration::from_millis(settings.request_timeout_ms);
        let client = Self::client_builder(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("{name}: HTTP client: {e}")))?;
        let api_key = settings.api_key.clone().or_else(|| {
            settings
                .api_key_env
                .as_ref()
                .and_then(|var| std::env::var(var).ok())
        });

        Ok(Self {
            identity: CollectorIdentity::new(name, SourceKind::Api),
            settings,
            api_key,
            client,
            timeout,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_registration(registration: &CollectorRegistration) -> Result<Self, AppError> {
        if registration.kind != SourceKind::Api {
            return Err(AppError::ConfigError(format!(
                "{} is registered as {}, not api",
                registration.name, registration.kind
            )));
        }
        let settings = if registration.settings.is_null() {
            ApiSettings::default()
        } else {
            serde_json::from_value(registration.settings.clone()).map_err(|e| {
                AppError::ConfigError(format!("{}: invalid settings: {e}", registration.name))
            })?
        };
        Self::new(registration.name.clone(), settings)
    }

    pub fn settings(&self) -> &ApiSettings {
        &self.settings
    }

    fn client_builder(timeout: Duration) -> reqwest::ClientBuilder {
        Client::builder()
            .user_agent(concat!("lotwatch/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
    }

    /// Client routed through `lease` when proxying is enabled.
    fn client_for(&self, lease: Option<&ProxyLease>) -> Result<Client, AppError> {
        let Some(lease) = lease.filter(|_| self.settings.use_proxy) else {
            return Ok(self.client.clone());
        };

        let mut cache = self.proxied.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = cache.get(lease.proxy_url()) {
            return Ok(client.clone());
        }

        let mut proxy = reqwest::Proxy::all(lease.proxy_url()).map_err(|e| {
            AppError::ConfigError(format!("invalid proxy {}: {e}", lease.proxy_url()))
        })?;
        if let Some((user, pass)) = lease.credentials() {
            proxy = proxy.basic_auth(user, pass);
        }
        let client = Self::client_builder(Duration::from_millis(self.settings.request_timeout_ms))
            .proxy(proxy)
            .build()
            .map_err(|e| AppError::ConfigError(format!("proxied HTTP client: {e}")))?;
        cache.insert(lease.proxy_url().to_string(), client.clone());
        Ok(client)
    }

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        let raw = format!(
            "{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&raw).map_err(|e| AppError::ConfigError(format!("invalid URL {raw}: {e}")))
    }

    fn page_url(&self, key: &TargetKey, page: u32) -> Result<Url, AppError> {
        let mut url = self.endpoint(&self.settings.path.replace("{key}", key.as_str()))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(param) = &self.settings.key_param {
                query.append_pair(param, key.as_str());
            }
            query.append_pair(&self.settings.page_param, &page.to_string());
            query.append_pair(&self.settings.size_param, &self.settings.page_size.to_string());
        }
        Ok(url)
    }

    async fn get(&self, client: &Client, url: Url) -> Result<Value, AppError> {
        let mut request = client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header(self.settings.api_key_header.as_str(), key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| send_error(e, self.timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read response body: {e}")))?;
        if !status.is_success() {
            return Err(status_error(status, &headers, &body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn fetch_page(
        &self,
        key: &TargetKey,
        lease: Option<&ProxyLease>,
        page: u32,
    ) -> Result<Vec<Value>, AppError> {
        let client = self.client_for(lease)?;
        let body = self.get(&client, self.page_url(key, page)?).await?;

        let items = match body.pointer(&self.settings.items_pointer) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None if page > 1 => Vec::new(),
            _ => {
                return Err(AppError::DataInvalid(format!(
                    "response has no array at {}",
                    self.settings.items_pointer
                )));
            }
        };
        tracing::debug!(
            collector = %self.identity.name,
            %key,
            page,
            items = items.len(),
            "Fetched page"
        );
        Ok(items)
    }
}

impl Collector for ApiCollector {
    fn identity(&self) -> CollectorIdentity {
        self.identity.clone()
    }

    fn uses_proxy(&self) -> bool {
        self.settings.use_proxy
    }

    async fn health_check(&self) -> Result<(), AppError> {
        if let (None, Some(var)) = (&self.api_key, &self.settings.api_key_env) {
            return Err(AppError::AuthError(format!("API key not set ({var})")));
        }
        if let Some(path) = &self.settings.health_path {
            self.get(&self.client, self.endpoint(path)?).await?;
        }
        Ok(())
    }

    fn collect<'a>(
        &'a self,
        key: &'a TargetKey,
        lease: Option<&'a ProxyLease>,
    ) -> impl Stream<Item = Result<RawItem, AppError>> + Send + 'a {
        let page_size = self.settings.page_size as usize;
        let max_pages = self.settings.max_pages;

        stream::unfold(Some(1u32), move |page| async move {
            let page = page?;
            match self.fetch_page(key, lease, page).await {
                Ok(items) => {
                    let next = (items.len() >= page_size && page < max_pages).then_some(page + 1);
                    let batch: Vec<_> = items
                        .into_iter()
                        .map(|payload| {
                            Ok(RawItem::new(self.identity.name.clone(), key.clone(), payload))
                        })
                        .collect();
                    Some((batch, next))
                }
                Err(e) => Some((vec![Err(e)], None)),
            }
        })
        .flat_map(stream::iter)
    }

    fn normalize(&self, item: RawItem) -> Result<NormalizedRecord, AppError> {
        let fields = &self.settings.fields;
        let payload = &item.payload;
        let field = |name: &Option<String>| name.as_deref().and_then(|f| parse::lookup(payload, f));

        let external_id = parse::lookup(payload, &fields.id)
            .and_then(parse::text)
            .ok_or_else(|| AppError::DataInvalid(format!("item has no {}", fields.id)))?;
        let address = field(&fields.address).and_then(parse::text);
        let price = field(&fields.price).and_then(parse::money);
        let area = field(&fields.area).and_then(parse::amount);

        Ok(NormalizedRecord::new(
            item.source,
            self.settings.record_kind,
            item.key,
            external_id,
            address,
            price,
            area,
            item.payload,
        ))
    }
}
