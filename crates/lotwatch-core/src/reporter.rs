use uuid::Uuid;

use crate::campaign::{CampaignOutcome, CampaignResult};
use crate::error::ClassifiedError;
use crate::models::{CollectorState, TargetKey};
use crate::strategy::StrategyKind;

/// Events emitted by the engine for monitoring/logging.
#[derive(Debug, Clone)]
pub enum CampaignEvent<'a> {
    Started {
        campaign_id: Uuid,
        strategy: StrategyKind,
        collectors: usize,
        keys: usize,
    },
    UnitDispatched {
        collector: &'a str,
        key: &'a TargetKey,
    },
    UnitSucceeded {
        collector: &'a str,
        key: &'a TargetKey,
        items: u64,
        duplicates: u64,
    },
    UnitFailed {
        collector: &'a str,
        key: &'a TargetKey,
        error: &'a ClassifiedError,
    },
    CollectorStateChanged {
        collector: &'a str,
        state: CollectorState,
        reason: Option<&'a str>,
    },
    Finished {
        result: &'a CampaignResult,
    },
}

/// Trait for receiving campaign events (decoupled logging).
pub trait CampaignReporter: Send + Sync {
    fn report(&self, event: CampaignEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCampaignReporter;

impl CampaignReporter for TracingCampaignReporter {
    fn report(&self, event: CampaignEvent<'_>) {
        match event {
            CampaignEvent::Started {
                campaign_id,
                strategy,
                collectors,
                keys,
            } => {
                tracing::info!(%campaign_id, %strategy, collectors, keys, "Campaign started");
            }
            CampaignEvent::UnitDispatched { collector, key } => {
                tracing::debug!(%collector, %key, "Unit dispatched");
            }
            CampaignEvent::UnitSucceeded {
                collector,
                key,
                items,
                duplicates,
            } => {
                tracing::info!(%collector, %key, items, duplicates, "Unit completed");
            }
            CampaignEvent::UnitFailed {
                collector,
                key,
                error,
            } => {
                tracing::warn!(%collector, %key, class = %error.class, %error, "Unit failed");
            }
            CampaignEvent::CollectorStateChanged {
                collector,
                state,
                reason,
            } => {
                tracing::info!(
                    %collector,
                    %state,
                    reason = reason.unwrap_or("-"),
                    "Collector state changed"
                );
            }
            CampaignEvent::Finished { result } => match result.outcome {
                CampaignOutcome::Failed => tracing::error!(
                    campaign_id = %result.campaign_id,
                    outcome = %result.outcome,
                    total_items = result.total_items,
                    duration_ms = result.duration_ms,
                    "Campaign failed"
                ),
                _ => tracing::info!(
                    campaign_id = %result.campaign_id,
                    outcome = %result.outcome,
                    total_items = result.total_items,
                    success_ratio = result.success_ratio,
                    duration_ms = result.duration_ms,
                    "Campaign finished"
                ),
            },
        }
    }
}
