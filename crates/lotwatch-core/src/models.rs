use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque unit-of-work identifier, e.g. a ZIP code or county area code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetKey(String);

impl TargetKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for TargetKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How a collector reaches its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Stateless REST calls, paced by the rate governor.
    Api,
    /// Session-based browser automation behind a proxy lease.
    Browser,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Api => "api",
            SourceKind::Browser => "browser",
        }
    }

    /// Browser sources tolerate concurrency; API sources are rate-sensitive.
    pub fn is_rate_sensitive(&self) -> bool {
        matches!(self, SourceKind::Api)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "api" => Ok(SourceKind::Api),
            "browser" => Ok(SourceKind::Browser),
            _ => Err(format!("Unknown source kind: {s}")),
        }
    }
}

/// Name and kind of a registered collector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectorIdentity {
    pub name: String,
    pub kind: SourceKind,
}

impl CollectorIdentity {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for CollectorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

/// Lifecycle of a collector within the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorState {
    Ready,
    Running,
    Completed,
    Failed,
    Disabled,
}

impl CollectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorState::Ready => "ready",
            CollectorState::Running => "running",
            CollectorState::Completed => "completed",
            CollectorState::Failed => "failed",
            CollectorState::Disabled => "disabled",
        }
    }
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One (collector, key) collection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub collector: CollectorIdentity,
    pub key: TargetKey,
    /// 1 on first dispatch, incremented only when the resilience layer retries.
    pub attempt: u32,
}

/// Unprocessed payload yielded by a collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    pub source: String,
    pub key: TargetKey,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

impl RawItem {
    pub fn new(source: impl Into<String>, key: TargetKey, payload: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            key,
            payload,
            fetched_at: Utc::now(),
        }
    }
}

/// Whether a record describes an active listing or an assessor parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Listing,
    Parcel,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Listing => "listing",
            RecordKind::Parcel => "parcel",
        }
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "listing" => Ok(RecordKind::Listing),
            "parcel" => Ok(RecordKind::Parcel),
            _ => Err(format!("Unknown record kind: {s}")),
        }
    }
}

/// A listing or parcel in the shape the persistence layer stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source: String,
    pub kind: RecordKind,
    pub target_key: TargetKey,
    /// Identifier assigned by the source (MLS number, parcel APN, ...).
    pub external_id: String,
    pub address: Option<String>,
    /// Asking price or assessed value, whole currency units.
    pub price: Option<i64>,
    pub area_sq_ft: Option<f64>,
    pub attributes: serde_json::Value,
    /// SHA-256 over the identifying and descriptive fields.
    pub content_hash: String,
    pub collected_at: DateTime<Utc>,
}

impl NormalizedRecord {
    /// Build a record and compute its content hash.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: impl Into<String>,
        kind: RecordKind,
        target_key: TargetKey,
        external_id: impl Into<String>,
        address: Option<String>,
        price: Option<i64>,
        area_sq_ft: Option<f64>,
        attributes: serde_json::Value,
    ) -> Self {
        let source = source.into();
        let external_id = external_id.into();
        let content_hash = compute_hash(&format!(
            "{source}|{external_id}|{}|{}|{}|{attributes}",
            address.as_deref().unwrap_or(""),
            price.map(|p| p.to_string()).unwrap_or_default(),
            area_sq_ft.map(|a| a.to_string()).unwrap_or_default(),
        ));
        Self {
            source,
            kind,
            target_key,
            external_id,
            address,
            price,
            area_sq_ft,
            attributes,
            content_hash,
            collected_at: Utc::now(),
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
