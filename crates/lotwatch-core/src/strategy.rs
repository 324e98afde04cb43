//! Orchestration strategies.
//!
//! A strategy only decides order and concurrency. Every unit goes through
//! [`UnitContext::run_unit`], and results flow back over the context's
//! aggregation channel.

use std::fmt;

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::config::{StrategyConfig, StrategyMode};
use crate::models::{CollectorIdentity, TargetKey};
use crate::runner::UnitContext;
use crate::traits::{Collector, RecordStore};

/// A collector and the keys it walks this campaign, in order.
pub struct Assignment<'a, C> {
    pub collector: &'a C,
    pub identity: CollectorIdentity,
    pub keys: Vec<TargetKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// One collector at a time, one key at a time.
    Sequential,
    /// One task per collector, bounded by `pacing.max_concurrency`.
    Parallel,
    /// Rate-sensitive collectors sequentially, the rest in parallel.
    Mixed,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Sequential => "sequential",
            StrategyKind::Parallel => "parallel",
            StrategyKind::Mixed => "mixed",
        }
    }

    /// Pick the strategy for a campaign. Decided once, at campaign start.
    pub fn select(config: &StrategyConfig, collectors: usize, keys: usize) -> Self {
        match config.mode {
            StrategyMode::Sequential => StrategyKind::Sequential,
            StrategyMode::Parallel => StrategyKind::Parallel,
            StrategyMode::Mixed => StrategyKind::Mixed,
            StrategyMode::Adaptive => {
                if collectors <= 1 {
                    StrategyKind::Sequential
                } else if keys > config.large_key_space {
                    StrategyKind::Parallel
                } else {
                    StrategyKind::Mixed
                }
            }
        }
    }

    /// Dispatch every assigned unit.
    pub async fn run<C, S>(&self, ctx: &UnitContext<'_, S>, assignments: &[Assignment<'_, C>])
    where
        C: Collector,
        S: RecordStore,
    {
        let active: Vec<&Assignment<'_, C>> = assignments
            .iter()
            .filter(|a| {
                if a.keys.is_empty() {
                    tracing::debug!(collector = %a.identity.name, "No keys assigned, skipping");
                }
                !a.keys.is_empty()
            })
            .collect();

        match self {
            StrategyKind::Sequential => run_sequential(ctx, &active).await,
            StrategyKind::Parallel => run_parallel(ctx, &active).await,
            StrategyKind::Mixed => {
                let (sensitive, tolerant): (Vec<_>, Vec<_>) = active
                    .into_iter()
                    .partition(|a| a.identity.kind.is_rate_sensitive());
                futures::future::join(
                    run_sequential(ctx, &sensitive),
                    run_parallel(ctx, &tolerant),
                )
                .await;
            }
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

async fn run_sequential<C, S>(ctx: &UnitContext<'_, S>, assignments: &[&Assignment<'_, C>])
where
    C: Collector,
    S: RecordStore,
{
    for (i, assignment) in assignments.iter().enumerate() {
        if i > 0 && !ctx.pause(ctx.config.pacing.collector_delay()).await {
            return;
        }
        walk_keys(ctx, assignment, ctx.config.pacing.sequential_key_delay()).await;
        if ctx.cancel.is_cancelled() {
            return;
        }
    }
}

async fn run_parallel<C, S>(ctx: &UnitContext<'_, S>, assignments: &[&Assignment<'_, C>])
where
    C: Collector,
    S: RecordStore,
{
    let delay = ctx.config.pacing.parallel_key_delay();
    futures::stream::iter(assignments)
        .map(|assignment| walk_keys(ctx, assignment, delay))
        .buffer_unordered(ctx.config.pacing.max_concurrency)
        .for_each(|()| futures::future::ready(()))
        .await;
}

/// Walk one collector's keys in order, stopping if its breaker opens.
async fn walk_keys<C, S>(
    ctx: &UnitContext<'_, S>,
    assignment: &Assignment<'_, C>,
    delay: std::time::Duration,
) where
    C: Collector,
    S: RecordStore,
{
    let name = assignment.identity.name.as_str();
    for (i, key) in assignment.keys.iter().enumerate() {
        if i > 0 && !ctx.pause(delay).await {
            return;
        }
        if !ctx.should_dispatch(name) {
            if !ctx.cancel.is_cancelled() {
                tracing::info!(
                    collector = %name,
                    remaining = assignment.keys.len() - i,
                    "Breaker open, no further units for this collector"
                );
            }
            return;
        }
        ctx.run_unit(assignment.collector, &assignment.identity, key)
            .await;
    }
}
