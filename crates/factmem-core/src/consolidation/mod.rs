//! The five consolidation passes that turn raw facts into durable
//! structure: per-fact distillation into observations, observation and
//! fact deduplication, temporal pattern mining, and cross-cluster
//! dreaming. Each pass is independently fallible and degrades to doing
//! nothing on a model or embedding failure rather than halting the
//! others; the background loop in [`crate::facade`] is what turns
//! repeated failure into backoff.

mod dream;
mod fact_merge;
mod observation_merge;
mod per_fact;
mod temporal;

use crate::error::Result;
use crate::providers::{EmbeddingProvider, LanguageModelProvider};
use crate::storage::Storage;

/// Counts of work done by one call to [`run_tick`], surfaced for
/// logging and tests.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationReport {
    pub facts_consolidated: usize,
    pub observations_merged: usize,
    pub facts_merged: usize,
    pub temporal_observations_created: usize,
    pub temporal_observations_reinforced: usize,
    pub dreams_created: usize,
}

/// Runs one full pass over all five consolidation stages. Each stage's
/// own errors are already swallowed internally (the stages degrade to
/// "did nothing" on model/embedding failure); this only propagates
/// storage errors, which the background loop treats as a reason to back
/// off.
pub async fn run_tick(
    storage: &Storage,
    embedder: &dyn EmbeddingProvider,
    model: &dyn LanguageModelProvider,
) -> Result<ConsolidationReport> {
    let mut report = ConsolidationReport::default();

    report.facts_consolidated = per_fact::run(storage, embedder, model).await?;
    report.observations_merged = observation_merge::run(storage, embedder, model).await?;
    let (created, reinforced) = temporal::run(storage, embedder, model).await?;
    report.temporal_observations_created = created;
    report.temporal_observations_reinforced = reinforced;
    report.facts_merged = fact_merge::run(storage, embedder, model).await?;
    report.dreams_created = dream::run(storage, model).await?;

    Ok(report)
}
