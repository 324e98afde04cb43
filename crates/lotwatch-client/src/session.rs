//! Browser session collaborator.
//!
//! A [`SessionProvider`] hands out isolated browser sessions bound to a proxy
//! lease and brokers CAPTCHA solving. [`BrowserCollector`](crate::BrowserCollector)
//! owns the session lifecycle; the engine never sees sessions.

use std::future::Future;

use lotwatch_core::error::AppError;
use lotwatch_core::pool::ProxyLease;

/// A CAPTCHA found on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub site_key: String,
    pub page_url: String,
}

/// Result of handing a challenge to the solver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptchaOutcome {
    Solved(String),
    Unsolved,
}

/// One isolated browsing context. Lives for a single collection attempt.
pub trait BrowserSession: Send {
    /// Navigate to `url` and return the rendered HTML.
    fn navigate(&mut self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;

    /// Inject a solved CAPTCHA token, submit the challenge form and return
    /// the HTML of the page it leads to.
    fn submit_captcha(
        &mut self,
        token: &str,
    ) -> impl Future<Output = Result<String, AppError>> + Send;

    /// Tear down the session. Errors are logged, never returned.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Source of browser sessions and CAPTCHA solutions.
pub trait SessionProvider: Send + Sync {
    type Session: BrowserSession;

    /// Open a session whose traffic egresses through `lease`, if given.
    fn new_session(
        &self,
        lease: Option<&ProxyLease>,
    ) -> impl Future<Output = Result<Self::Session, AppError>> + Send;

    fn solve_captcha(
        &self,
        _challenge: &Challenge,
    ) -> impl Future<Output = Result<CaptchaOutcome, AppError>> + Send {
        async { Ok(CaptchaOutcome::Unsolved) }
    }

    /// Whether sessions can be opened at all.
    fn health_check(&self) -> impl Future<Output = Result<(), AppError>> + Send {
        async { Ok(()) }
    }
}

/// Provider used when the crate is built without the `browser` feature.
///
/// Fails its health check, so browser collectors are disabled at
/// initialization instead of failing every unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableSessions;

/// Session type of [`UnavailableSessions`]; never constructed.
#[derive(Debug)]
pub enum NoSession {}

impl BrowserSession for NoSession {
    async fn navigate(&mut self, _url: &str) -> Result<String, AppError> {
        match *self {}
    }

    async fn submit_captcha(&mut self, _token: &str) -> Result<String, AppError> {
        match *self {}
    }

    async fn close(self) {
        match self {}
    }
}

impl SessionProvider for UnavailableSessions {
    type Session = NoSession;

    async fn new_session(&self, _lease: Option<&ProxyLease>) -> Result<NoSession, AppError> {
        Err(unavailable())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Err(unavailable())
    }
}

fn unavailable() -> AppError {
    AppError::ConfigError("browser support not compiled in (enable the `browser` feature)".into())
}

#[cfg(feature = "browser")]
pub use chromium::{ChromiumSession, ChromiumSessions};

#[cfg(feature = "browser")]
mod chromium {
    use std::path::PathBuf;
    use std::time::Duration;

    use chromiumoxide::page::Page;
    use chromiumoxide::{Browser, BrowserConfig};
    use futures::StreamExt;
    use tokio::task::JoinHandle;

    use super::{BrowserSession, CaptchaOutcome, Challenge, SessionProvider};
    use crate::captcha::HttpCaptchaSolver;
    use lotwatch_core::error::AppError;
    use lotwatch_core::pool::ProxyLease;

    /// Headless Chromium sessions via the Chrome DevTools Protocol.
    ///
    /// Every session launches its own Chromium process so the proxy lease
    /// (`--proxy-server`) and cookie jar are isolated per session.
    /// Authenticated proxies need a local forwarder: Chromium takes no
    /// credentials on the command line.
    #[derive(Clone)]
    pub struct ChromiumSessions {
        timeout: Duration,
        solver: Option<HttpCaptchaSolver>,
    }

    impl ChromiumSessions {
        pub fn new(timeout: Duration) -> Self {
            Self {
                timeout,
                solver: None,
            }
        }

        pub fn with_solver(mut self, solver: HttpCaptchaSolver) -> Self {
            self.solver = Some(solver);
            self
        }

        fn config(&self, lease: Option<&ProxyLease>) -> Result<BrowserConfig, AppError> {
            let mut builder = BrowserConfig::builder()
                .no_sandbox()
                .disable_default_args();

            if let Some(bin) = find_chrome_binary() {
                tracing::debug!("Using Chrome binary: {}", bin.display());
                builder = builder.chrome_executable(bin);
            }
            if let Some(lease) = lease {
                if lease.credentials().is_some() {
                    tracing::warn!(
                        proxy = lease.proxy_url(),
                        "Proxy credentials are ignored by Chromium sessions"
                    );
                }
                builder = builder.arg(format!("--proxy-server={}", lease.proxy_url()));
            }

            builder
                .arg("--headless=new")
                .arg("--disable-gpu")
                .arg("--disable-dev-shm-usage")
                .arg("--disable-extensions")
                .arg("--disable-blink-features=AutomationControlled")
                .arg("--no-first-run")
                .build()
                .map_err(|e| AppError::BrowserError(format!("Browser config error: {e}")))
        }
    }

    /// Locate a Chrome/Chromium binary, honouring `CHROME_BIN`.
    ///
    /// Returns `None` to let `chromiumoxide` do its own lookup.
    fn find_chrome_binary() -> Option<PathBuf> {
        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        [
            // Snap wrappers strip headless flags; use the real binary.
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
    }

    /// Aborts the CDP handler task when the session goes away, closed or not.
    struct HandlerGuard(JoinHandle<()>);

    impl Drop for HandlerGuard {
        fn drop(&mut self) {
            self.0.abort();
        }
    }

    pub struct ChromiumSession {
        browser: Browser,
        _handler: HandlerGuard,
        page: Page,
        timeout: Duration,
    }

    impl ChromiumSession {
        async fn rendered(&self) -> Result<String, AppError> {
            self.page
                .find_element("body")
                .await
                .map_err(|e| AppError::BrowserError(format!("Page did not render body: {e}")))?;
            self.page
                .content()
                .await
                .map_err(|e| AppError::BrowserError(format!("Failed to read page content: {e}")))
        }
    }

    impl BrowserSession for ChromiumSession {
        async fn navigate(&mut self, url: &str) -> Result<String, AppError> {
            let timeout = self.timeout;
            let result = tokio::time::timeout(timeout, async {
                self.page.goto(url).await.map_err(|e| {
                    AppError::NetworkError(format!("Failed to navigate to {url}: {e}"))
                })?;
                self.rendered().await
            })
            .await;

            result.unwrap_or_else(|_| Err(AppError::Timeout(timeout)))
        }

        async fn submit_captcha(&mut self, token: &str) -> Result<String, AppError> {
            let token = serde_json::to_string(token)?;
            let script = format!(
                "(() => {{ \
                   const field = document.querySelector('[name=\"g-recaptcha-response\"]') \
                     || document.querySelector('[name=\"h-captcha-response\"]'); \
                   if (field) {{ field.value = {token}; }} \
                   const form = field ? field.closest('form') : document.forms[0]; \
                   if (form) {{ form.submit(); }} \
                 }})()"
            );

            let timeout = self.timeout;
            let result = tokio::time::timeout(timeout, async {
                self.page.evaluate(script).await.map_err(|e| {
                    AppError::BrowserError(format!("Failed to submit CAPTCHA token: {e}"))
                })?;
                self.page.wait_for_navigation().await.map_err(|e| {
                    AppError::NetworkError(format!("CAPTCHA submission did not navigate: {e}"))
                })?;
                self.rendered().await
            })
            .await;

            result.unwrap_or_else(|_| Err(AppError::Timeout(timeout)))
        }

        async fn close(mut self) {
            if let Err(e) = self.page.close().await {
                tracing::debug!("Failed to close page: {e}");
            }
            if let Err(e) = self.browser.close().await {
                tracing::debug!("Failed to close browser: {e}");
            }
        }
    }

    impl SessionProvider for ChromiumSessions {
        type Session = ChromiumSession;

        async fn new_session(
            &self,
            lease: Option<&ProxyLease>,
        ) -> Result<ChromiumSession, AppError> {
            let config = self.config(lease)?;
            let (browser, mut handler) = Browser::launch(config)
                .await
                .map_err(|e| AppError::BrowserError(format!("Failed to launch browser: {e}")))?;

            // The CDP handler must be polled continuously for the connection to work.
            let handler = HandlerGuard(tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        tracing::debug!("Browser CDP handler error: {event:?}");
                        break;
                    }
                }
            }));

            let page = browser
                .new_page("about:blank")
                .await
                .map_err(|e| AppError::BrowserError(format!("Failed to open page: {e}")))?;

            Ok(ChromiumSession {
                browser,
                _handler: handler,
                page,
                timeout: self.timeout,
            })
        }

        async fn solve_captcha(&self, challenge: &Challenge) -> Result<CaptchaOutcome, AppError> {
            match &self.solver {
                Some(solver) => solver.solve(challenge).await,
                None => Ok(CaptchaOutcome::Unsolved),
            }
        }

        async fn health_check(&self) -> Result<(), AppError> {
            let session = self.new_session(None).await?;
            session.close().await;
            Ok(())
        }
    }

}
