use futures::{Stream, StreamExt, stream};
use lotwatch_core::config::CollectorRegistration;
use lotwatch_core::error::AppError;
use lotwatch_core::models::{
    CollectorIdentity, NormalizedRecord, RawItem, RecordKind, SourceKind, TargetKey,
};
use lotwatch_core::pool::ProxyLease;
use lotwatch_core::traits::Collector;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::parse;
use crate::session::{BrowserSession, CaptchaOutcome, Challenge, SessionProvider};

/// Registration settings of a [`BrowserCollector`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Search page URL; `{key}` and `{page}` are substituted.
    pub search_url: String,
    pub max_pages: u32,
    /// One match per listing card.
    pub listing_selector: String,
    /// Attribute of the card holding the listing id.
    pub id_attribute: String,
    pub address_selector: Option<String>,
    pub price_selector: Option<String>,
    pub area_selector: Option<String>,
    /// Present on pages that have a successor.
    pub next_selector: Option<String>,
    /// Element carrying a `data-sitekey` CAPTCHA challenge.
    pub captcha_selector: String,
    /// Case-insensitive text that marks a block page.
    pub block_markers: Vec<String>,
    pub record_kind: RecordKind,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            search_url: String::new(),
            max_pages: 10,
            listing_selector: "[data-listing-id]".into(),
            id_attribute: "data-listing-id".into(),
            address_selector: Some(".address".into()),
            price_selector: Some(".price".into()),
            area_selector: Some(".sqft".into()),
            next_selector: Some("a[rel=next]".into()),
            captcha_selector: "[data-sitekey]".into(),
            block_markers: vec![
                "access denied".into(),
                "unusual traffic".into(),
                "are you a robot".into(),
                "px-captcha".into(),
            ],
            record_kind: RecordKind::Listing,
        }
    }
}

/// What a rendered page turned out to be.
#[derive(Debug, PartialEq)]
enum PageView {
    Listings { items: Vec<Value>, has_next: bool },
    Captcha(Challenge),
    Blocked(String),
}

/// Compiled selectors. Rebuilt per page so no `scraper` value lives across an await.
struct Selectors {
    listing: Selector,
    address: Option<Selector>,
    price: Option<Selector>,
    area: Option<Selector>,
    next: Option<Selector>,
    captcha: Selector,
}

impl Selectors {
    fn compile(settings: &BrowserSettings) -> Result<Self, AppError> {
        let one = |raw: &str| {
            Selector::parse(raw)
                .map_err(|e| AppError::ConfigError(format!("invalid selector {raw:?}: {e}")))
        };
        let opt = |raw: &Option<String>| raw.as_deref().map(one).transpose();
        Ok(Self {
            listing: one(&settings.listing_selector)?,
            address: opt(&settings.address_selector)?,
            price: opt(&settings.price_selector)?,
            area: opt(&settings.area_selector)?,
            next: opt(&settings.next_selector)?,
            captcha: one(&settings.captcha_selector)?,
        })
    }
}

fn inner_text(card: &ElementRef<'_>, selector: &Option<Selector>) -> Option<String> {
    let el = card.select(selector.as_ref()?).next()?;
    let text = el.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

/// Collector for a listing site driven through browser sessions.
///
/// Each `collect` call opens one session on the unit's proxy lease, walks
/// the search result pages for the key and closes the session. A CAPTCHA is
/// handed to the provider's solver once per page; an unsolved challenge or a
/// block page fails the attempt as `Blocked`.
pub struct BrowserCollector<P> {
    identity: CollectorIdentity,
    settings: BrowserSettings,
    sessions: P,
}

impl<P: SessionProvider> BrowserCollector<P> {
    pub fn new(
        name: impl Into<String>,
        settings: BrowserSettings,
        sessions: P,
    ) -> Result<Self, AppError> {
        let name = name.into();
        if !settings.search_url.contains("{key}") {
            return Err(AppError::ConfigError(format!(
                "{name}: search_url must contain {{key}}"
            )));
        }
        if settings.max_pages == 0 {
            return Err(AppError::ConfigError(format!("{name}: max_pages must be positive")));
        }
        Selectors::compile(&settings)?;

        Ok(Self {
            identity: CollectorIdentity::new(name, SourceKind::Browser),
            settings,
            sessions,
        })
    }

    pub fn from_registration(
        registration: &CollectorRegistration,
        sessions: P,
    ) -> Result<Self, AppError> {
        if registration.kind != SourceKind::Browser {
            return Err(AppError::ConfigError(format!(
                "{} is registered as {}, not browser",
                registration.name, registration.kind
            )));
        }
        let settings = if registration.settings.is_null() {
            BrowserSettings::default()
        } else {
            serde_json::from_value(registration.settings.clone()).map_err(|e| {
                AppError::ConfigError(format!("{}: invalid settings: {e}", registration.name))
            })?
        };
        Self::new(registration.name.clone(), settings, sessions)
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.settings
    }

    fn page_url(&self, key: &TargetKey, page: u32) -> String {
        self.settings
            .search_url
            .replace("{key}", key.as_str())
            .replace("{page}", &page.to_string())
    }

    fn inspect(&self, html: &str, url: &str) -> Result<PageView, AppError> {
        let selectors = Selectors::compile(&self.settings)?;
        let doc = Html::parse_document(html);

        if let Some(el) = doc.select(&selectors.captcha).next() {
            let site_key = el.value().attr("data-sitekey").unwrap_or_default();
            return Ok(PageView::Captcha(Challenge {
                site_key: site_key.to_string(),
                page_url: url.to_string(),
            }));
        }

        let items: Vec<Value> = doc
            .select(&selectors.listing)
            .map(|card| {
                json!({
                    "id": card.value().attr(&self.settings.id_attribute),
                    "address": inner_text(&card, &selectors.address),
                    "price": inner_text(&card, &selectors.price),
                    "area": inner_text(&card, &selectors.area),
                    "url": url,
                })
            })
            .collect();

        if items.is_empty() {
            let lower = html.to_lowercase();
            if let Some(marker) = self
                .settings
                .block_markers
                .iter()
                .find(|m| lower.contains(&m.to_lowercase()))
            {
                return Ok(PageView::Blocked(marker.clone()));
            }
        }

        let has_next = selectors
            .next
            .as_ref()
            .is_some_and(|next| doc.select(next).next().is_some());
        Ok(PageView::Listings { items, has_next })
    }

    /// Load one result page, clearing at most one CAPTCHA on the way.
    async fn load_page(
        &self,
        session: &mut P::Session,
        url: &str,
    ) -> Result<(Vec<Value>, bool), AppError> {
        let html = session.navigate(url).await?;
        let view = match self.inspect(&html, url)? {
            PageView::Captcha(challenge) => {
                tracing::info!(collector = %self.identity.name, url, "CAPTCHA challenge");
                match self.sessions.solve_captcha(&challenge).await? {
                    CaptchaOutcome::Solved(token) => {
                        let html = session.submit_captcha(&token).await?;
                        self.inspect(&html, url)?
                    }
                    CaptchaOutcome::Unsolved => {
                        return Err(AppError::Blocked(format!("unsolved CAPTCHA at {url}")));
                    }
                }
            }
            view => view,
        };

        match view {
            PageView::Listings { items, has_next } => Ok((items, has_next)),
            PageView::Captcha(_) => Err(AppError::Blocked(format!("CAPTCHA persisted at {url}"))),
            PageView::Blocked(marker) => {
                Err(AppError::Blocked(format!("block page ({marker}) at {url}")))
            }
        }
    }
}

enum Cursor<S> {
    Start,
    Open { session: S, page: u32 },
    Done,
}

impl<P: SessionProvider> Collector for BrowserCollector<P> {
    fn identity(&self) -> CollectorIdentity {
        self.identity.clone()
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.sessions.health_check().await
    }

    fn collect<'a>(
        &'a self,
        key: &'a TargetKey,
        lease: Option<&'a ProxyLease>,
    ) -> impl Stream<Item = Result<RawItem, AppError>> + Send + 'a {
        stream::unfold(Cursor::Start, move |cursor| async move {
            let (mut session, page) = match cursor {
                Cursor::Done => return None,
                Cursor::Open { session, page } => (session, page),
                Cursor::Start => match self.sessions.new_session(lease).await {
                    Ok(session) => (session, 1),
                    Err(e) => return Some((vec![Err(e)], Cursor::Done)),
                },
            };

            let url = self.page_url(key, page);
            match self.load_page(&mut session, &url).await {
                Ok((items, has_next)) => {
                    tracing::debug!(
                        collector = %self.identity.name,
                        %key,
                        page,
                        items = items.len(),
                        "Scraped page"
                    );
                    let batch: Vec<_> = items
                        .into_iter()
                        .map(|payload| {
                            Ok(RawItem::new(self.identity.name.clone(), key.clone(), payload))
                        })
                        .collect();
                    let next = if has_next && page < self.settings.max_pages && !batch.is_empty() {
                        Cursor::Open {
                            session,
                            page: page + 1,
                        }
                    } else {
                        session.close().await;
                        Cursor::Done
                    };
                    Some((batch, next))
                }
                Err(e) => {
                    session.close().await;
                    Some((vec![Err(e)], Cursor::Done))
                }
            }
        })
        .flat_map(stream::iter)
    }

    fn normalize(&self, item: RawItem) -> Result<NormalizedRecord, AppError> {
        let payload = &item.payload;
        let external_id = payload
            .get("id")
            .and_then(parse::text)
            .ok_or_else(|| AppError::DataInvalid("listing card without id".into()))?;
        let address = payload.get("address").and_then(parse::text);
        let price = payload.get("price").and_then(parse::money);
        let area = payload.get("area").and_then(parse::amount);
        if address.is_none() && price.is_none() {
            return Err(AppError::DataInvalid(format!(
                "listing {external_id} has neither address nor price"
            )));
        }

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
