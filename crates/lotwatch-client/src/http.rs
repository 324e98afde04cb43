//! Mapping reqwest failures onto the collection error taxonomy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use lotwatch_core::error::AppError;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

/// Classify a request that never produced a response.
pub(crate) fn send_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout)
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else if let Some(status) = e.status() {
        AppError::HttpError {
            status: status.as_u16(),
            message: e.to_string(),
        }
    } else {
        AppError::NetworkError(e.to_string())
    }
}

/// Classify a non-success response.
pub(crate) fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> AppError {
    let code = status.as_u16();
    match code {
        401 | 403 => AppError::AuthError(format!("HTTP {code}: {}", snippet(body))),
        429 | 503 => AppError::RateLimitExceeded {
            retry_after: retry_after(headers, Utc::now()),
        },
        _ => AppError::HttpError {
            status: code,
            message: snippet(body).to_string(),
        },
    }
}

/// `Retry-After` as either delta-seconds or an HTTP date.
pub(crate) fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok()
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
