//! The hybrid retrieval pipeline: seed via RRF over vector + FTS search,
//! expand one hop through shared entities and temporal proximity,
//! rerank (or fall back to multi-signal scoring), then apply
//! decay/recency on top.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::MemoryConfig;
use crate::memory::decay::{decay_score, recency_boost};
use crate::memory::model::{Fact, FactContext, Observation};
use crate::providers::Reranker;
use crate::search::hybrid::reciprocal_rank_fusion;
use crate::storage::Storage;

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom > 0.0 {
        (dot / denom) as f64
    } else {
        0.0
    }
}

/// Vector + FTS hybrid search over facts, fused by RRF. FTS hits are
/// given a synthetic descending-rank score since FTS5's bm25() isn't
/// comparable to cosine similarity; RRF only needs rank order.
fn hybrid_search_facts(storage: &Storage, query_text: &str, query_embedding: &[f32], limit: usize) -> crate::error::Result<HashMap<i64, f64>> {
    let overfetch = limit * storage.config.rrf_overfetch_factor;

    let vector_hits = storage.search_facts_vector(query_embedding, overfetch)?;
    let vector_ranking: Vec<i64> = vector_hits.into_iter().map(|(f, _)| f.id).collect();

    let fts_query = crate::search::fts::build_fts_query(query_text);
    let fts_ranking: Vec<i64> = match fts_query {
        Some(q) => storage.search_facts_fts(&q, overfetch)?.into_iter().map(|f| f.id).collect(),
        None => Vec::new(),
    };

    Ok(reciprocal_rank_fusion(&[vector_ranking, fts_ranking], storage.config.rrf_k).into_iter().collect())
}

fn hybrid_search_observations(
    storage: &Storage,
    query_text: &str,
    query_embedding: &[f32],
    limit: usize,
) -> crate::error::Result<HashMap<i64, f64>> {
    let overfetch = limit * storage.config.rrf_overfetch_factor;

    let vector_hits = storage.search_observations_vector(query_embedding, overfetch)?;
    let vector_ranking: Vec<i64> = vector_hits.into_iter().map(|(o, _)| o.id).collect();

    let fts_query = crate::search::fts::build_fts_query(query_text);
    let fts_ranking: Vec<i64> = match fts_query {
        Some(q) => storage.search_observations_fts(&q, overfetch)?.into_iter().map(|o| o.id).collect(),
        None => Vec::new(),
    };

    Ok(reciprocal_rank_fusion(&[vector_ranking, fts_ranking], storage.config.rrf_k).into_iter().collect())
}

/// One-hop entity expansion: facts sharing a canonical entity with any
/// seed fact, weighted by inverse document frequency of that entity so
/// rare shared entities pull in stronger connections than common ones.
fn entity_expand(storage: &Storage, seed_fact_ids: &[i64], cfg: &MemoryConfig) -> crate::error::Result<HashMap<i64, f64>> {
    let entity_ids = storage.get_entity_ids_for_facts(seed_fact_ids)?;
    if entity_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let seed_set: HashSet<i64> = seed_fact_ids.iter().copied().collect();
    let mut expansion: HashMap<i64, f64> = HashMap::new();

    for entity_id in entity_ids {
        let freq = storage.count_entity_facts_by_id(entity_id)?;
        let idf_weight = if freq > 0 { 1.0 / (freq as f64 + 1.0).log2() } else { 1.0 };

        if idf_weight < cfg.entity_expansion_idf_floor {
            continue;
        }

        let facts = storage.get_facts_for_entity_id(entity_id, cfg.entity_expansion_per_entity_limit)?;
        for fact in facts {
            if !seed_set.contains(&fact.id) {
                let entry = expansion.entry(fact.id).or_insert(0.0);
                *entry = entry.max(idf_weight);
            }
        }
    }

    if expansion.len() > cfg.entity_expansion_max_facts {
        let mut ranked: Vec<(i64, f64)> = expansion.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(cfg.entity_expansion_max_facts);
        expansion = ranked.into_iter().collect();
    }

    Ok(expansion)
}

/// Facts temporally close to `query_time`, ranked by embedding
/// similarity to the query and capped at `limit`.
fn temporal_vector_expand(
    storage: &Storage,
    query_embedding: &[f32],
    query_time: DateTime<Utc>,
    limit: usize,
    cfg: &MemoryConfig,
) -> crate::error::Result<HashMap<i64, f64>> {
    let overfetch = cfg.recall_search_limit * 20;
    let candidates = storage.search_facts_temporal(query_time, overfetch)?;
    if candidates.is_empty() {
        return Ok(HashMap::new());
    }

    let mut scored: Vec<(i64, f64)> = candidates
        .iter()
        .filter_map(|f| f.embedding.as_ref().map(|e| (f.id, cosine_similarity(query_embedding, e) * cfg.temporal_expansion_base_score)))
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    Ok(scored.into_iter().collect())
}

fn score_fact(fact: &Fact, base_score: f64, query_time: Option<DateTime<Utc>>, cfg: &MemoryConfig) -> f64 {
    let decay = decay_score(fact.last_accessed_at, fact.access_count, Utc::now(), cfg.memory_decay_rate);
    let recency = recency_boost(fact.happened_at.unwrap_or(fact.created_at), query_time, cfg.recency_sigma_hours);
    base_score * decay * recency
}

fn score_observation(obs: &Observation, base_score: f64, query_time: Option<DateTime<Utc>>, cfg: &MemoryConfig) -> f64 {
    let decay = decay_score(obs.last_accessed_at, obs.access_count, Utc::now(), cfg.memory_decay_rate);
    let recency = recency_boost(obs.updated_at, query_time, cfg.recency_sigma_hours);
    base_score * decay * recency
}

/// Seeds via hybrid search, expands one hop via shared entities and
/// temporal+vector proximity, reranks (falling back to multi-signal
/// scoring), and applies decay/recency. Returns an empty context if
/// hybrid search finds nothing.
pub async fn retrieve_facts(
    storage: &Storage,
    reranker: &dyn Reranker,
    query_text: &str,
    query_embedding: &[f32],
    seed_limit: usize,
    query_time: Option<DateTime<Utc>>,
) -> crate::error::Result<FactContext> {
    let cfg = &storage.config;
    let rrf_scores = hybrid_search_facts(storage, query_text, query_embedding, seed_limit)?;
    if rrf_scores.is_empty() {
        return Ok(FactContext::default());
    }

    let mut ranked: Vec<(i64, f64)> = rrf_scores.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(seed_limit);
    let seeds: HashMap<i64, f64> = ranked.into_iter().collect();
    let seed_ids: Vec<i64> = seeds.keys().copied().collect();

    let expansion = entity_expand(storage, &seed_ids, cfg)?;

    let temporal_ids = match query_time {
        Some(qt) => temporal_vector_expand(storage, query_embedding, qt, cfg.temporal_expansion_limit, cfg)?,
        None => HashMap::new(),
    };

    let mut candidate_ids: HashSet<i64> = seeds.keys().copied().collect();
    candidate_ids.extend(expansion.keys().copied());
    candidate_ids.extend(temporal_ids.keys().copied());

    let facts_by_id = storage.get_facts_batch(&candidate_ids.into_iter().collect::<Vec<_>>())?;
    if facts_by_id.is_empty() {
        return Ok(FactContext::default());
    }

    let ordered_ids: Vec<i64> = facts_by_id.keys().copied().collect();
    let documents: Vec<String> = ordered_ids.iter().map(|id| facts_by_id[id].text.clone()).collect();
    let rerank_results = reranker.rerank(query_text, &documents).await;

    let base_scores: HashMap<i64, f64> = if !rerank_results.is_empty() {
        rerank_results
            .into_iter()
            .filter_map(|r| ordered_ids.get(r.index).map(|id| (*id, r.relevance_score as f64)))
            .collect()
    } else {
        let mut scores = seeds.clone();
        for (fid, idf_w) in &expansion {
            if !scores.contains_key(fid) {
                if let Some(fact) = facts_by_id.get(fid) {
                    let sim = fact.embedding.as_ref().map(|e| cosine_similarity(query_embedding, e)).unwrap_or(0.0);
                    scores.insert(*fid, idf_w * 0.5 * sim.max(0.0));
                }
            }
        }
        for (fid, base) in &temporal_ids {
            scores.entry(*fid).or_insert(*base);
        }
        scores
    };

    let mut scored: Vec<(Fact, f64)> = base_scores
        .into_iter()
        .filter_map(|(fid, base)| facts_by_id.get(&fid).map(|f| (f.clone(), score_fact(f, base, query_time, cfg))))
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(cfg.entity_expansion_max_facts);

    Ok(FactContext {
        facts: scored.into_iter().map(|(f, _)| f).collect(),
        observations: Vec::new(),
        bundled_sources: HashMap::new(),
    })
}

/// Retrieves top observations via hybrid search, bundles their most
/// recent source facts for display, then fills in with standalone
/// facts from [`retrieve_facts`] that aren't already part of a bundle.
pub async fn retrieve_with_observations(
    storage: &Storage,
    reranker: &dyn Reranker,
    query_text: &str,
    query_embedding: &[f32],
    seed_limit: usize,
    query_time: Option<DateTime<Utc>>,
) -> crate::error::Result<FactContext> {
    let cfg = &storage.config;

    let obs_rrf = hybrid_search_observations(storage, query_text, query_embedding, cfg.recall_observation_limit)?;
    let obs_ids: Vec<i64> = obs_rrf.keys().copied().collect();
    let obs_by_id = storage.get_observations_batch(&obs_ids)?;

    let mut obs_scored: Vec<(i64, f64)> = obs_rrf
        .into_iter()
        .filter_map(|(oid, base)| obs_by_id.get(&oid).map(|o| (oid, score_observation(o, base, query_time, cfg))))
        .collect();
    obs_scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    obs_scored.truncate(cfg.recall_observation_limit);

    let observations: Vec<Observation> = obs_scored.into_iter().filter_map(|(oid, _)| obs_by_id.get(&oid).cloned()).collect();

    let mut bundled_fact_ids: HashSet<i64> = HashSet::new();
    for obs in &observations {
        bundled_fact_ids.extend(obs.source_fact_ids.iter().copied());
    }

    let mut display_ids_per_obs: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut all_display_ids: HashSet<i64> = HashSet::new();
    for obs in &observations {
        if obs.source_fact_ids.is_empty() {
            continue;
        }
        let start = obs.source_fact_ids.len().saturating_sub(cfg.bundled_display_limit);
        let recent: Vec<i64> = obs.source_fact_ids[start..].to_vec();
        all_display_ids.extend(recent.iter().copied());
        display_ids_per_obs.insert(obs.id, recent);
    }

    let display_facts = if all_display_ids.is_empty() {
        HashMap::new()
    } else {
        storage.get_facts_batch(&all_display_ids.into_iter().collect::<Vec<_>>())?
    };

    let mut bundled_sources: HashMap<i64, Vec<Fact>> = HashMap::new();
    for obs in &observations {
        if let Some(ids) = display_ids_per_obs.get(&obs.id) {
            let facts: Vec<Fact> = ids.iter().filter_map(|fid| display_facts.get(fid).cloned()).collect();
            if !facts.is_empty() {
                bundled_sources.insert(obs.id, facts);
            }
        }
    }

    let fact_context = retrieve_facts(storage, reranker, query_text, query_embedding, seed_limit, query_time).await?;
    let standalone_facts: Vec<Fact> = fact_context
        .facts
        .into_iter()
        .filter(|f| !bundled_fact_ids.contains(&f.id))
        .take(cfg.recall_standalone_fact_limit)
        .collect();

    Ok(FactContext {
        facts: standalone_facts,
        observations,
        bundled_sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::memory::model::FactType;
    use crate::providers::NoopReranker;

    fn storage() -> Storage {
        Storage::open_in_memory(MemoryConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn retrieve_facts_empty_db_returns_empty_context() {
        let s = storage();
        let reranker = NoopReranker;
        let ctx = retrieve_facts(&s, &reranker, "anything", &vec![0.0; 768], 5, None).await.unwrap();
        assert!(ctx.facts.is_empty());
    }

    #[tokio::test]
    async fn retrieve_facts_finds_fts_matches() {
        let s = storage();
        let reranker = NoopReranker;
        s.create_fact("Alice enjoys hiking in the mountains", FactType::World, "user", None, None, None).unwrap();
        let ctx = retrieve_facts(&s, &reranker, "hiking mountains", &vec![0.0; 768], 5, None).await.unwrap();
        assert!(!ctx.facts.is_empty());
    }

    #[tokio::test]
    async fn retrieve_with_observations_bundles_source_facts() {
        let s = storage();
        let reranker = NoopReranker;
        let fact = s.create_fact("Alice switched careers to data science", FactType::World, "user", None, None, None).unwrap();
        s.create_observation("Alice works in data science", None, Some(fact.id)).unwrap();

        let ctx = retrieve_with_observations(&s, &reranker, "data science career", &vec![0.0; 768], 5, None).await.unwrap();
        assert_eq!(ctx.observations.len(), 1);
    }
}
