//! Campaign aggregation.
//!
//! Work units report through a channel as [`UnitReport`]s; a single owner
//! folds them into a [`CampaignTally`]. Folding only adds counts, so the
//! arrival order of reports from concurrent collectors does not matter.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClassifiedError, ErrorClass};
use crate::models::{CollectorIdentity, CollectorState, SourceKind, TargetKey};
use crate::strategy::StrategyKind;

/// How a single work unit ended.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Succeeded,
    Failed {
        error: ClassifiedError,
        breaker_opened: bool,
    },
    /// No proxy lease could be obtained within the exhaustion timeout.
    Exhausted(String),
    /// Shutdown or budget expiry interrupted the unit.
    Cancelled,
    /// The breaker opened before the unit could run.
    Skipped,
}

/// Result of one (collector, key) unit, sent over the aggregation channel.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub collector: String,
    pub key: TargetKey,
    pub attempts: u32,
    /// Records newly persisted.
    pub items: u64,
    /// Records the store already had.
    pub duplicates: u64,
    /// Raw items that failed normalization.
    pub invalid_records: u64,
    pub persist_errors: u64,
    pub outcome: UnitOutcome,
}

/// Per-collector slice of a campaign result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorSummary {
    pub kind: SourceKind,
    /// Keys assigned to this collector for the campaign.
    pub planned: u64,
    pub attempted: u64,
    pub succeeded: u64,
    pub items: u64,
    pub duplicates: u64,
    pub invalid_records: u64,
    pub persist_errors: u64,
    pub exhausted: u64,
    pub cancelled: u64,
    pub errors: BTreeMap<ErrorClass, u64>,
    pub state: CollectorState,
    pub disabled_reason: Option<String>,
}

impl CollectorSummary {
    fn new(kind: SourceKind, planned: u64) -> Self {
        Self {
            kind,
            planned,
            attempted: 0,
            succeeded: 0,
            items: 0,
            duplicates: 0,
            invalid_records: 0,
            persist_errors: 0,
            exhausted: 0,
            cancelled: 0,
            errors: BTreeMap::new(),
            state: CollectorState::Running,
            disabled_reason: None,
        }
    }

    pub fn error_count(&self) -> u64 {
        self.errors.values().sum()
    }

    /// Records this collector produced, new or already stored.
    pub fn collected(&self) -> u64 {
        self.items + self.duplicates
    }

    /// Collectors without keys sit the campaign out.
    pub fn participated(&self) -> bool {
        self.planned > 0
    }

    /// State once every unit has reported.
    fn settle(&mut self) {
        if self.state != CollectorState::Running {
            return;
        }
        self.state = if self.attempted > 0 && self.exhausted == self.attempted {
            CollectorState::Failed
        } else {
            CollectorState::Completed
        };
    }
}

/// Terminal engine state for a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignOutcome {
    Completed,
    PartiallyFailed,
    Failed,
}

impl CampaignOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignOutcome::Completed => "completed",
            CampaignOutcome::PartiallyFailed => "partially_failed",
            CampaignOutcome::Failed => "failed",
        }
    }

    /// Whether a CLI invocation should exit successfully.
    pub fn is_success(&self) -> bool {
        !matches!(self, CampaignOutcome::Failed)
    }
}

impl fmt::Display for CampaignOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for CampaignOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(CampaignOutcome::Completed),
            "partially_failed" => Ok(CampaignOutcome::PartiallyFailed),
            "failed" => Ok(CampaignOutcome::Failed),
            _ => Err(format!("Unknown campaign outcome: {s}")),
        }
    }
}

/// Immutable summary of a finished campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignResult {
    pub campaign_id: Uuid,
    pub strategy: StrategyKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub collectors: BTreeMap<String, CollectorSummary>,
    /// Distinct keys dispatched to at least one collector.
    pub keys_attempted: u64,
    pub total_items: u64,
    /// Succeeded units over attempted units, 0.0 when nothing ran.
    pub success_ratio: f64,
    pub budget_expired: bool,
    pub cancelled: bool,
    /// Every participating collector starved for proxies.
    pub resource_exhausted: bool,
    pub outcome: CampaignOutcome,
}

impl CampaignResult {
    /// Error counts summed over collectors.
    pub fn errors_by_class(&self) -> BTreeMap<ErrorClass, u64> {
        let mut totals = BTreeMap::new();
        for summary in self.collectors.values() {
            for (class, count) in &summary.errors {
                *totals.entry(*class).or_insert(0) += count;
            }
        }
        totals
    }

    pub fn attempted_units(&self) -> u64 {
        self.collectors.values().map(|c| c.attempted).sum()
    }
}

/// Campaign-level facts the tally cannot derive from unit reports.
#[derive(Debug, Clone)]
pub struct CampaignMeta {
    pub campaign_id: Uuid,
    pub strategy: StrategyKind,
    pub started_at: DateTime<Utc>,
    pub budget_expired: bool,
    pub cancelled: bool,
}

/// Running aggregate. Owned by the engine's aggregation loop.
#[derive(Debug, Default, Clone)]
pub struct CampaignTally {
    collectors: BTreeMap<String, CollectorSummary>,
    keys: BTreeSet<TargetKey>,
}

impl CampaignTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a participating collector and how many keys it was assigned.
    pub fn register(&mut self, identity: &CollectorIdentity, planned: usize) {
        let mut summary = CollectorSummary::new(identity.kind, planned as u64);
        if planned == 0 {
            summary.state = CollectorState::Completed;
        }
        self.collectors.insert(identity.name.clone(), summary);
    }

    pub fn summary(&self, collector: &str) -> Option<&CollectorSummary> {
        self.collectors.get(collector)
    }

    /// Fold one unit report in. Returns the collector's new state if it changed.
    pub fn record(&mut self, report: &UnitReport) -> Option<CollectorState> {
        let summary = self.collectors.get_mut(&report.collector)?;
        if report.outcome == UnitOutcome::Skipped {
            return None;
        }
        self.keys.insert(report.key.clone());

        summary.attempted += 1;
        summary.items += report.items;
        summary.duplicates += report.duplicates;
        summary.invalid_records += report.invalid_records;
        summary.persist_errors += report.persist_errors;

        match &report.outcome {
            UnitOutcome::Succeeded => summary.succeeded += 1,
            UnitOutcome::Failed {
                error,
                breaker_opened,
            } => {
                *summary.errors.entry(error.class).or_insert(0) += 1;
                if *breaker_opened && summary.state != CollectorState::Disabled {
                    summary.state = CollectorState::Disabled;
                    summary.disabled_reason = Some(format!("circuit breaker opened: {error}"));
                    return Some(CollectorState::Disabled);
                }
            }
            UnitOutcome::Exhausted(_) => summary.exhausted += 1,
            UnitOutcome::Cancelled => summary.cancelled += 1,
            UnitOutcome::Skipped => {}
        }
        None
    }

    pub fn finish(mut self, meta: CampaignMeta) -> CampaignResult {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - meta.started_at).num_milliseconds().max(0) as u64;

        for summary in self.collectors.values_mut() {
            summary.settle();
        }

        let total_items: u64 = self.collectors.values().map(|c| c.items).sum();
        let attempted: u64 = self.collectors.values().map(|c| c.attempted).sum();
        let succeeded: u64 = self.collectors.values().map(|c| c.succeeded).sum();
        let success_ratio = if attempted == 0 {
            0.0
        } else {
            succeeded as f64 / attempted as f64
        };

        let participants: Vec<&CollectorSummary> =
            self.collectors.values().filter(|c| c.participated()).collect();
        let resource_exhausted = !participants.is_empty()
            && participants
                .iter()
                .all(|c| c.attempted > 0 && c.exhausted == c.attempted);
        let some_empty = participants.iter().any(|c| c.collected() == 0);
        let collected: u64 = self.collectors.values().map(|c| c.collected()).sum();

        // Interruption is not a failure: keep whatever was aggregated.
        let outcome = if meta.budget_expired || meta.cancelled {
            CampaignOutcome::PartiallyFailed
        } else if collected == 0 {
            CampaignOutcome::Failed
        } else if some_empty {
            CampaignOutcome::PartiallyFailed
        } else {
            CampaignOutcome::Completed
        };

        CampaignResult {
            campaign_id: meta.campaign_id,
            strategy: meta.strategy,
            started_at: meta.started_at,
            finished_at,
            duration_ms,
            collectors: self.collectors,
            keys_attempted: self.keys.len() as u64,
            total_items,
            success_ratio,
            budget_expired: meta.budget_expired,
            cancelled: meta.cancelled,
            resource_exhausted,
            outcome,
        }
    }
}
