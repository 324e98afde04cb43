pub mod api;
pub mod browser;
pub mod captcha;
pub mod collector;
mod http;
mod parse;
pub mod session;

pub use api::{ApiCollector, ApiSettings, FieldMap};
pub use browser::{BrowserCollector, BrowserSettings};
pub use captcha::HttpCaptchaSolver;
pub use collector::{DefaultSessions, SourceCollector};
#[cfg(feature = "browser")]
pub use session::ChromiumSessions;
pub use session::{BrowserSession, CaptchaOutcome, Challenge, SessionProvider, UnavailableSessions};
