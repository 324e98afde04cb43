use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error types for Lotwatch.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration is missing or invalid. Fatal before a campaign starts.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The resource pool or rate governor could not supply a slot.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// HTTP request completed with a non-success status.
    #[error("HTTP {status}: {message}")]
    HttpError { status: u16, message: String },

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Source signalled throttling (429 / 503).
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: Option<Duration> },

    /// Credentials rejected by the source.
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Anti-bot challenge, block page, or unsolved CAPTCHA.
    #[error("Blocked by source: {0}")]
    Blocked(String),

    /// Payload could not be turned into a record.
    #[error("Invalid data: {0}")]
    DataInvalid(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Browser automation failed outside navigation.
    #[error("Browser error: {0}")]
    BrowserError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Record already persisted.
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Cooperative shutdown reached this operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// Classification applied to every failed collection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network hiccup or timeout. Retried.
    Transient,
    /// Server-side throttling. Retried after a governor penalty.
    RateLimited,
    /// Credentials rejected. Never retried.
    AuthFailure,
    /// Anti-bot signal. Retried on a fresh proxy/session up to a cap.
    BlockedOrDetected,
    /// Nothing usable for this unit. Skipped.
    DataInvalid,
    /// Anything else. Retried once.
    Unknown,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 6] = [
        ErrorClass::Transient,
        ErrorClass::RateLimited,
        ErrorClass::AuthFailure,
        ErrorClass::BlockedOrDetected,
        ErrorClass::DataInvalid,
        ErrorClass::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::AuthFailure => "auth_failure",
            ErrorClass::BlockedOrDetected => "blocked_or_detected",
            ErrorClass::DataInvalid => "data_invalid",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Classes counted by the per-collector circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(self, ErrorClass::AuthFailure | ErrorClass::BlockedOrDetected)
    }

    /// Classes where the proxy lease itself is suspect.
    pub fn blames_lease(&self) -> bool {
        matches!(
            self,
            ErrorClass::Transient | ErrorClass::BlockedOrDetected | ErrorClass::Unknown
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl AppError {
    /// Map a failure to its resilience class.
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => ErrorClass::Transient,
            AppError::RateLimitExceeded { .. } => ErrorClass::RateLimited,
            AppError::AuthError(_) => ErrorClass::AuthFailure,
            AppError::Blocked(_) => ErrorClass::BlockedOrDetected,
            AppError::DataInvalid(_) | AppError::SerializationError(_) => ErrorClass::DataInvalid,
            AppError::HttpError { status, .. } => match *status {
                401 | 403 => ErrorClass::AuthFailure,
                429 | 503 => ErrorClass::RateLimited,
                404 | 410 | 422 => ErrorClass::DataInvalid,
                s if s >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Unknown,
            },
            _ => ErrorClass::Unknown,
        }
    }

    /// Server-suggested wait before the next request, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::RateLimitExceeded { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::RateLimited | ErrorClass::Unknown
        )
    }
}

/// A collection failure after the resilience layer is done with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub message: String,
    /// Attempts spent on the unit, including the failing one.
    pub attempts: u32,
}

impl ClassifiedError {
    pub fn new(error: &AppError, attempts: u32) -> Self {
        Self {
            class: error.class(),
            message: error.to_string(),
            attempts,
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.class, self.attempts, self.message
        )
    }
}

impl std::error::Error for ClassifiedError {}
