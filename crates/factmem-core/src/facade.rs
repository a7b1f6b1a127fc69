//! The engine's public surface: `remember`/`recall`/`forget`/`get_context`/
//! `clear`, entity merging, and the background consolidation loop.
//!
//! Storage is fully synchronous; this is the one layer that talks async,
//! bridging to it with a process-wide write lock that serializes every
//! mutation (remember, forget, clear, merge_entities, and each
//! consolidation step) while reads run uncontended against the storage
//! type's own reader connection.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::consolidation;
use crate::error::{MemoryError, Result};
use crate::memory::extraction::{self, ExtractedEntity};
use crate::memory::links::create_links_for_fact;
use crate::memory::model::{Entity, Fact, FactContext, FactType};
use crate::memory::resolution;
use crate::providers::{EmbeddingProvider, LanguageModelProvider, Reranker};
use crate::retrieval;
use crate::storage::Storage;

/// Outcome of [`FactMemory::remember`].
#[derive(Debug, Clone)]
pub struct RememberResult {
    pub fact: Fact,
    pub links_created: usize,
    pub entities_extracted: usize,
}

/// Pre-deletion row counts returned by [`FactMemory::clear`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearCounts {
    pub facts: i64,
    pub links: i64,
    pub observations: i64,
}

struct Inner {
    storage: Storage,
    embedder: Box<dyn EmbeddingProvider>,
    model: Box<dyn LanguageModelProvider>,
    reranker: Box<dyn Reranker>,
    write_lock: AsyncMutex<()>,
}

/// The engine's public entry point. Cheap to clone: everything it wraps
/// is shared through an `Arc`.
#[derive(Clone)]
pub struct FactMemory {
    inner: Arc<Inner>,
    consolidation_task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl FactMemory {
    pub fn new(
        storage: Storage,
        embedder: Box<dyn EmbeddingProvider>,
        model: Box<dyn LanguageModelProvider>,
        reranker: Box<dyn Reranker>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                embedder,
                model,
                reranker,
                write_lock: AsyncMutex::new(()),
            }),
            consolidation_task: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// Embeds the text and extracts entities outside the write lock (both
    /// are network calls), resolves each extracted entity against the
    /// entity store, then opens a single transaction to insert the fact,
    /// its entity references, and its links. Nothing above the
    /// transaction touches the writer connection, so the lock is only
    /// ever held for the database phase.
    pub async fn remember(
        &self,
        text: &str,
        source_type: &str,
        source_ref: Option<&str>,
        fact_type: FactType,
        happened_at: Option<DateTime<Utc>>,
    ) -> Result<RememberResult> {
        let inner = &self.inner;

        let embedding = inner.embedder.embed_one(text).await.map_err(MemoryError::Embedding)?;
        let extracted = extraction::extract(inner.model.as_ref(), inner.storage.config.extraction_temperature, text).await;

        let mut resolved: Vec<(String, String, i64)> = Vec::new();
        let mut seen_names: HashSet<String> = HashSet::new();
        for entity in &extracted.entities {
            if !seen_names.insert(entity.name.to_lowercase()) {
                continue;
            }
            let entity_id = self.resolve_entity(entity, source_ref).await?;
            resolved.push((entity.name.clone(), entity.entity_type.clone(), entity_id));
        }

        let _permit = inner.write_lock.lock().await;

        let mut conn = inner.storage.writer.lock().unwrap();
        let tx = conn.transaction()?;

        let fact = inner.storage.create_fact_in(&tx, text, fact_type, source_type, source_ref, Some(&embedding), happened_at)?;
        for (name, entity_type, entity_id) in &resolved {
            inner.storage.add_entity_ref_in(&tx, fact.id, name, entity_type, Some(*entity_id))?;
        }
        let links_created = create_links_for_fact(&inner.storage, &tx, &fact)?;

        tx.commit()?;
        drop(conn);

        Ok(RememberResult { fact, links_created, entities_extracted: resolved.len() })
    }

    /// Resolves an extracted `(name, type)` mention to an entity id,
    /// minting a new entity when nothing existing clears the auto-merge
    /// threshold. An exact `(name, type)` match short-circuits everything
    /// else.
    async fn resolve_entity(&self, extracted: &ExtractedEntity, source_ref: Option<&str>) -> Result<i64> {
        let storage = &self.inner.storage;
        let cfg = &storage.config;

        if let Some(existing) = storage.get_entity_by_name(&extracted.name, Some(&extracted.entity_type))? {
            return Ok(existing.id);
        }

        let canonical = Entity::canonical_text(&extracted.name, &extracted.entity_type);
        let query_embedding = self.inner.embedder.embed_one(&canonical).await.map_err(MemoryError::Embedding)?;

        let mut candidates: Vec<Entity> = Vec::new();
        let mut seen_ids: HashSet<i64> = HashSet::new();
        for e in storage.list_entities_by_type(&extracted.entity_type, cfg.entity_candidates_limit)? {
            if seen_ids.insert(e.id) {
                candidates.push(e);
            }
        }
        for (e, _sim) in storage.search_entities_vector(&query_embedding, cfg.entity_candidates_limit)? {
            if seen_ids.insert(e.id) {
                candidates.push(e);
            }
        }

        let now = Utc::now();
        let mut scored: Vec<(i64, f64, f64, f64)> = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let name_sim = resolution::name_similarity(&extracted.name, &candidate.name);
            let co_occurrence = match source_ref {
                Some(sref) if storage.get_entity_source_overlap(&candidate.name, sref)? => 1.0,
                _ => 0.0,
            };
            let last_mention = storage.get_entity_last_mention(&candidate.name)?;
            let temporal = resolution::temporal_proximity_score(last_mention, now, cfg.entity_temporal_sigma_hours, cfg.entity_temporal_neutral);
            scored.push((candidate.id, name_sim, co_occurrence, temporal));
        }

        if let Some(best) = resolution::resolve(&scored, cfg) {
            return Ok(best.entity_id);
        }

        let is_core = extracted.name == "User";
        let entity = storage.create_entity(&extracted.name, &extracted.entity_type, Some(&query_embedding), is_core)?;
        Ok(entity.id)
    }

    /// Embeds `query`, runs the hybrid retrieval pipeline, then under the
    /// write lock reinforces every returned fact and observation plus
    /// each observation's supporting facts.
    pub async fn recall(&self, query: &str, limit: usize, query_time: Option<DateTime<Utc>>) -> Result<FactContext> {
        let inner = &self.inner;
        let embedding = inner.embedder.embed_one(query).await.map_err(MemoryError::Embedding)?;

        let context = retrieval::retrieve_with_observations(&inner.storage, inner.reranker.as_ref(), query, &embedding, limit, query_time).await?;

        let _permit = inner.write_lock.lock().await;

        let fact_ids: Vec<i64> = context.facts.iter().map(|f| f.id).collect();
        inner.storage.reinforce_facts(&fact_ids)?;

        let obs_ids: Vec<i64> = context.observations.iter().map(|o| o.id).collect();
        inner.storage.reinforce_observations(&obs_ids)?;

        let mut source_fact_ids: Vec<i64> = context.observations.iter().flat_map(|o| o.source_fact_ids.iter().copied()).collect();
        source_fact_ids.sort_unstable();
        source_fact_ids.dedup();
        inner.storage.reinforce_facts(&source_fact_ids)?;

        Ok(context)
    }

    /// Embeds `query`, deletes every fact among the top
    /// `forget_search_limit` vector hits whose similarity clears
    /// `forget_similarity_threshold`, and returns how many were deleted.
    pub async fn forget(&self, query: &str) -> Result<usize> {
        let inner = &self.inner;
        let cfg = &inner.storage.config;
        let embedding = inner.embedder.embed_one(query).await.map_err(MemoryError::Embedding)?;
        let hits = inner.storage.search_facts_vector(&embedding, cfg.forget_search_limit)?;
        let to_delete: Vec<i64> = hits.into_iter().filter(|(_, sim)| *sim >= cfg.forget_similarity_threshold).map(|(f, _)| f.id).collect();

        let _permit = inner.write_lock.lock().await;
        for id in &to_delete {
            inner.storage.delete_fact(*id)?;
        }
        Ok(to_delete.len())
    }

    /// Latest facts referencing the canonical `User` entity, and the most
    /// recent facts globally — the static prompt section callers
    /// pre-populate before a conversation turn.
    pub fn get_context(&self, user_limit: usize, recent_limit: usize) -> Result<(Vec<Fact>, Vec<Fact>)> {
        let storage = &self.inner.storage;
        let user_facts = storage.get_facts_for_entity("User", user_limit)?;
        let recent_facts = storage.list_recent_facts(recent_limit)?;
        Ok((user_facts, recent_facts))
    }

    /// Maps `names` to existing entities, picks a canonical one (the
    /// explicit `canonical_name` if it resolves, else the first found),
    /// and merges the rest into it.
    pub async fn merge_entities(&self, names: &[String], canonical_name: Option<&str>) -> Result<i64> {
        let storage = &self.inner.storage;
        let _permit = self.inner.write_lock.lock().await;

        let mut entities: Vec<Entity> = Vec::new();
        for name in names {
            if let Some(e) = storage.get_entity_by_name(name, None)? {
                entities.push(e);
            }
        }
        if entities.is_empty() {
            return Ok(0);
        }

        let keep_id = canonical_name.and_then(|n| entities.iter().find(|e| e.name == n).map(|e| e.id)).unwrap_or(entities[0].id);
        let merge_ids: Vec<i64> = entities.iter().map(|e| e.id).filter(|id| *id != keep_id).collect();

        storage.merge_entities(keep_id, &merge_ids)
    }

    /// Returns the pre-deletion row counts then drops every fact, link,
    /// entity, observation, dream, and temporal checkpoint.
    pub async fn clear(&self) -> Result<ClearCounts> {
        let inner = &self.inner;
        let _permit = inner.write_lock.lock().await;

        let counts = ClearCounts {
            facts: inner.storage.count_facts()?,
            links: inner.storage.count_links()?,
            observations: inner.storage.count_observations()?,
        };

        inner.storage.clear_facts()?;
        inner.storage.clear_entities()?;
        inner.storage.clear_observations()?;
        inner.storage.clear_dreams()?;
        inner.storage.clear_temporal_checkpoints()?;

        Ok(counts)
    }

    pub fn count(&self) -> Result<i64> {
        self.inner.storage.count_facts()
    }

    pub fn link_count(&self) -> Result<i64> {
        self.inner.storage.count_links()
    }

    /// Starts the background consolidation loop: runs a tick, sleeps
    /// `interval` on success (resetting the backoff), and on a storage
    /// error doubles the sleep up to `consolidation_backoff_cap * interval`.
    /// A second call replaces the previous task without waiting for it to
    /// notice.
    pub fn start_consolidation(&self, interval: Duration) {
        let inner = Arc::clone(&self.inner);
        let cap = interval * inner.storage.config.consolidation_backoff_cap;

        let handle = tokio::spawn(async move {
            let mut sleep_for = interval;
            loop {
                tokio::time::sleep(sleep_for).await;

                let report = {
                    let _permit = inner.write_lock.lock().await;
                    consolidation::run_tick(&inner.storage, inner.embedder.as_ref(), inner.model.as_ref()).await
                };

                sleep_for = match report {
                    Ok(report) => {
                        tracing::debug!(
                            facts_consolidated = report.facts_consolidated,
                            observations_merged = report.observations_merged,
                            facts_merged = report.facts_merged,
                            temporal_observations_created = report.temporal_observations_created,
                            dreams_created = report.dreams_created,
                            "consolidation tick complete"
                        );
                        interval
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "consolidation tick failed, backing off");
                        (sleep_for * 2).min(cap)
                    }
                };
            }
        });

        *self.consolidation_task.lock().unwrap() = Some(handle);
    }

    /// Stops the background consolidation loop, if running, and waits
    /// for the abort to take effect.
    pub async fn close(&self) {
        let handle = self.consolidation_task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::providers::{ChatMessage, Completion, NoopReranker};
    use async_trait::async_trait;
    use serde_json::Value;

    struct StubEmbedder;
    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed_one(&self, text: &str) -> std::result::Result<Vec<f32>, String> {
            let seed = text.bytes().map(|b| b as f32).sum::<f32>() / 255.0;
            Ok(vec![seed; 768])
        }
        fn dimensions(&self) -> usize {
            768
        }
    }

    struct StubModel(&'static str);
    #[async_trait]
    impl LanguageModelProvider for StubModel {
        async fn complete(&self, _messages: &[ChatMessage], _schema: Option<&Value>, _temp: f32) -> std::result::Result<Completion, String> {
            Ok(Completion { content: self.0.to_string() })
        }
    }

    /// Extracts "User" whenever the source text looks first-person,
    /// otherwise nothing, so `get_context` tests see a realistic split.
    struct FirstPersonModel;
    #[async_trait]
    impl LanguageModelProvider for FirstPersonModel {
        async fn complete(&self, messages: &[ChatMessage], _schema: Option<&Value>, _temp: f32) -> std::result::Result<Completion, String> {
            let content = if messages[0].content.contains("\nI ") {
                r#"{"entities": [{"name": "User", "entity_type": "person"}]}"#
            } else {
                r#"{"entities": []}"#
            };
            Ok(Completion { content: content.to_string() })
        }
    }

    fn engine(model_response: &'static str) -> FactMemory {
        let storage = Storage::open_in_memory(MemoryConfig::default()).unwrap();
        FactMemory::new(storage, Box::new(StubEmbedder), Box::new(StubModel(model_response)), Box::new(NoopReranker))
    }

    #[tokio::test]
    async fn remember_creates_fact_and_entity_refs() {
        let mem = engine(r#"{"entities": [{"name": "Alice", "entity_type": "person"}]}"#);
        let result = mem.remember("Alice likes tea", "user", None, FactType::World, None).await.unwrap();
        assert_eq!(result.entities_extracted, 1);
        assert_eq!(mem.count().unwrap(), 1);

        let refs = mem.storage().get_entity_refs(result.fact.id).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "Alice");
    }

    #[tokio::test]
    async fn remember_reuses_entity_across_facts() {
        let mem = engine(r#"{"entities": [{"name": "Alice", "entity_type": "person"}]}"#);
        let a = mem.remember("Alice likes tea", "user", None, FactType::World, None).await.unwrap();
        let b = mem.remember("Alice visited Paris", "user", None, FactType::World, None).await.unwrap();

        let a_refs = mem.storage().get_entity_refs(a.fact.id).unwrap();
        let b_refs = mem.storage().get_entity_refs(b.fact.id).unwrap();
        assert_eq!(a_refs[0].canonical_id, b_refs[0].canonical_id);
    }

    #[tokio::test]
    async fn recall_reinforces_returned_facts() {
        let mem = engine(r#"{"entities": []}"#);
        mem.remember("The mitochondria is the powerhouse of the cell", "user", None, FactType::World, None).await.unwrap();
        let before = mem.storage().list_recent_facts(1).unwrap()[0].access_count;

        mem.recall("mitochondria powerhouse cell", 5, None).await.unwrap();

        let after = mem.storage().list_recent_facts(1).unwrap()[0].access_count;
        assert!(after > before);
    }

    #[tokio::test]
    async fn forget_deletes_near_duplicate() {
        let mem = engine(r#"{"entities": []}"#);
        mem.remember("identical text for forgetting", "user", None, FactType::World, None).await.unwrap();
        assert_eq!(mem.count().unwrap(), 1);

        let deleted = mem.forget("identical text for forgetting").await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(mem.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_reports_pre_deletion_counts_and_empties_tables() {
        let mem = engine(r#"{"entities": [{"name": "Alice", "entity_type": "person"}]}"#);
        mem.remember("Alice likes tea", "user", None, FactType::World, None).await.unwrap();

        let counts = mem.clear().await.unwrap();
        assert_eq!(counts.facts, 1);
        assert_eq!(mem.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn get_context_splits_user_and_recent_facts() {
        let storage = Storage::open_in_memory(MemoryConfig::default()).unwrap();
        let mem = FactMemory::new(storage, Box::new(StubEmbedder), Box::new(FirstPersonModel), Box::new(NoopReranker));
        mem.remember("I enjoy long walks", "user", None, FactType::World, None).await.unwrap();
        mem.remember("Mount Everest is the tallest mountain", "user", None, FactType::World, None).await.unwrap();

        let (user_facts, recent_facts) = mem.get_context(10, 10).unwrap();
        assert_eq!(user_facts.len(), 1);
        assert_eq!(recent_facts.len(), 2);
    }
}
