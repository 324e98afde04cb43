//! Push-style metrics collaborator.
//!
//! Emission is fire-and-forget: sinks return nothing and must swallow their
//! own failures.

use uuid::Uuid;

use crate::error::ErrorClass;

pub const ITEMS_COLLECTED: &str = "items_collected";
pub const UNITS_FAILED: &str = "units_failed";
pub const CAMPAIGN_DURATION_MS: &str = "campaign_duration_ms";
pub const POOL_HEALTHY: &str = "pool_healthy";

/// Dimensions attached to every emission.
#[derive(Debug, Clone, Copy)]
pub struct MetricLabels<'a> {
    pub campaign_id: Uuid,
    pub collector: Option<&'a str>,
    pub class: Option<ErrorClass>,
}

impl<'a> MetricLabels<'a> {
    pub fn campaign(campaign_id: Uuid) -> Self {
        Self {
            campaign_id,
            collector: None,
            class: None,
        }
    }

    pub fn collector(campaign_id: Uuid, collector: &'a str) -> Self {
        Self {
            campaign_id,
            collector: Some(collector),
            class: None,
        }
    }

    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = Some(class);
        self
    }
}

pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &'static str, value: u64, labels: MetricLabels<'_>);
    fn gauge(&self, name: &'static str, value: f64, labels: MetricLabels<'_>);
}

/// Emits metrics as debug-level tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn counter(&self, name: &'static str, value: u64, labels: MetricLabels<'_>) {
        tracing::debug!(
            metric = name,
            value,
            campaign_id = %labels.campaign_id,
            collector = labels.collector.unwrap_or("-"),
            class = labels.class.map(|c| c.as_str()).unwrap_or("-"),
            "counter"
        );
    }

    fn gauge(&self, name: &'static str, value: f64, labels: MetricLabels<'_>) {
        tracing::debug!(
            metric = name,
            value,
            campaign_id = %labels.campaign_id,
            collector = labels.collector.unwrap_or("-"),
            "gauge"
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn counter(&self, _name: &'static str, _value: u64, _labels: MetricLabels<'_>) {}
    fn gauge(&self, _name: &'static str, _value: f64, _labels: MetricLabels<'_>) {}
}
