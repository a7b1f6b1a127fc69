//! Fact merge pass: collapse near-duplicate facts. Symmetric in spirit
//! to the observation merge pass, but also has to carry over entity
//! references, access counts, and any observation that cites the
//! removed fact.

use std::collections::HashSet;

use crate::error::Result;
use crate::memory::model::Fact;
use crate::providers::{ChatMessage, EmbeddingProvider, LanguageModelProvider};
use crate::storage::Storage;

const FACT_MERGE_PROMPT: &str = "Two facts may describe the same underlying event or state. Decide \
whether they are the same thing said two ways, or genuinely different.

FACT A (id {id_a}): {text_a}

FACT B (id {id_b}): {text_b}

If the same, return a merged text covering both. If different, say so.

Return a single JSON object:
{{\"action\": \"same\", \"text\": \"...\"}}
{{\"action\": \"different\", \"reason\": \"...\"}}

Return ONLY the JSON object.";

fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["same", "different"] },
            "text": { "type": ["string", "null"] },
            "reason": { "type": ["string", "null"] }
        },
        "required": ["action"]
    })
}

#[derive(Debug, Clone, serde::Deserialize)]
struct MergeDecision {
    action: String,
    text: Option<String>,
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na > 0.0 && nb > 0.0 {
        (dot / (na * nb)) as f64
    } else {
        0.0
    }
}

fn find_top_pair(facts: &[Fact], skipped: &HashSet<(i64, i64)>, threshold: f64) -> Option<(usize, usize, f64)> {
    let mut best: Option<(usize, usize, f64)> = None;
    for i in 0..facts.len() {
        let Some(emb_a) = &facts[i].embedding else { continue };
        for j in (i + 1)..facts.len() {
            let Some(emb_b) = &facts[j].embedding else { continue };
            let key = (facts[i].id.min(facts[j].id), facts[i].id.max(facts[j].id));
            if skipped.contains(&key) {
                continue;
            }
            let sim = cosine(emb_a, emb_b);
            if sim >= threshold && best.map(|(_, _, best_sim)| sim > best_sim).unwrap_or(true) {
                best = Some((i, j, sim));
            }
        }
    }
    best
}

/// More entity refs wins, then higher access count, then the newer fact.
fn pick_keeper<'a>(a: &'a Fact, b: &'a Fact) -> (&'a Fact, &'a Fact) {
    if a.entity_refs.len() != b.entity_refs.len() {
        return if a.entity_refs.len() >= b.entity_refs.len() { (a, b) } else { (b, a) };
    }
    if a.access_count != b.access_count {
        return if a.access_count >= b.access_count { (a, b) } else { (b, a) };
    }
    if a.created_at >= b.created_at { (a, b) } else { (b, a) }
}

async fn decide(model: &dyn LanguageModelProvider, a: &Fact, b: &Fact, temperature: f32) -> MergeDecision {
    let prompt = FACT_MERGE_PROMPT
        .replace("{id_a}", &a.id.to_string())
        .replace("{text_a}", &a.text)
        .replace("{id_b}", &b.id.to_string())
        .replace("{text_b}", &b.text);

    let completion = match model.complete(&[ChatMessage::user(prompt)], Some(&schema()), temperature).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "fact merge decision failed");
            return MergeDecision { action: "different".to_string(), text: None };
        }
    };

    serde_json::from_str(&completion.content).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "fact merge produced malformed JSON");
        MergeDecision { action: "different".to_string(), text: None }
    })
}

/// Rewrites the keeper's text, transfers the removed fact's entity refs
/// (skipping ones the keeper already has) and access count, repoints
/// any observation citing the removed id at the keeper, then deletes
/// the removed fact. All storage writes here are synchronous and run
/// under the caller's lock; the embedding call that produced
/// `embedding` already happened outside it.
fn apply_merge(storage: &Storage, keeper: &Fact, removed: &Fact, merged_text: &str, embedding: &[f32]) -> Result<()> {
    storage.update_fact_text(keeper.id, merged_text, Some(embedding))?;

    let mut keeper_entities: HashSet<i64> = storage.get_entity_ids_for_facts(&[keeper.id])?.into_iter().collect();
    for r in storage.get_entity_refs(removed.id)? {
        if let Some(cid) = r.canonical_id {
            if !keeper_entities.contains(&cid) {
                storage.add_entity_ref(keeper.id, &r.name, &r.entity_type, Some(cid))?;
                keeper_entities.insert(cid);
            }
        }
    }

    storage.add_access_count(keeper.id, removed.access_count)?;
    storage.replace_fact_id_in_observations(removed.id, keeper.id)?;
    storage.delete_fact(removed.id)?;

    Ok(())
}

pub async fn run(storage: &Storage, embedder: &dyn EmbeddingProvider, model: &dyn LanguageModelProvider) -> Result<usize> {
    let mut facts = storage.list_all_facts_with_embeddings()?;
    if facts.len() < 2 {
        return Ok(0);
    }

    let threshold = storage.config.fact_merge_similarity_threshold;
    let mut skipped: HashSet<(i64, i64)> = HashSet::new();
    let mut merges = 0;

    while let Some((i, j, sim)) = find_top_pair(&facts, &skipped, threshold) {
        let (a, b) = (facts[i].clone(), facts[j].clone());
        let key = (a.id.min(b.id), a.id.max(b.id));

        let decision = decide(model, &a, &b, storage.config.fact_merge_temperature).await;
        if decision.action != "same" {
            skipped.insert(key);
            continue;
        }

        let (keeper, removed) = {
            let (k, r) = pick_keeper(&a, &b);
            (k.clone(), r.clone())
        };
        let merged_text = decision.text.unwrap_or_else(|| keeper.text.clone());

        let embedding = match embedder.embed_one(&merged_text).await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, sim, "embedding failed during fact merge");
                skipped.insert(key);
                continue;
            }
        };

        apply_merge(storage, &keeper, &removed, &merged_text, &embedding)?;
        merges += 1;

        let keeper_id = keeper.id;
        let removed_id = removed.id;
        facts.retain(|f| f.id != removed_id);
        if let Some(refreshed) = storage.get_fact(keeper_id)? {
            if let Some(slot) = facts.iter_mut().find(|f| f.id == keeper_id) {
                *slot = refreshed;
            }
        }
    }

    if merges > 0 {
        storage.cleanup_orphaned_entities()?;
    }

    Ok(merges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::memory::model::FactType;
    use async_trait::async_trait;
    use serde_json::Value;

    fn storage() -> Storage {
        Storage::open_in_memory(MemoryConfig::default()).unwrap()
    }

    struct StubEmbedder;
    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed_one(&self, _text: &str) -> std::result::Result<Vec<f32>, String> {
            Ok(vec![0.9; 768])
        }
        fn dimensions(&self) -> usize {
            768
        }
    }

    struct StubModel(&'static str);
    #[async_trait]
    impl LanguageModelProvider for StubModel {
        async fn complete(&self, _messages: &[ChatMessage], _schema: Option<&Value>, _temp: f32) -> std::result::Result<crate::providers::Completion, String> {
            Ok(crate::providers::Completion { content: self.0.to_string() })
        }
    }

    #[tokio::test]
    async fn merges_duplicate_facts_and_cleans_up_orphans() {
        let s = storage();
        let a = s.create_fact("Alice works at Meta", FactType::World, "user", None, Some(&[1.0; 768]), None).unwrap();
        let b = s.create_fact("Alice is employed at Meta", FactType::World, "user", None, Some(&[1.0; 768]), None).unwrap();
        s.add_entity_ref(a.id, "Alice", "person", None).unwrap();
        s.add_entity_ref(b.id, "Alice", "person", None).unwrap();

        let model = StubModel(r#"{"action": "same", "text": "Alice works at Meta"}"#);
        let embedder = StubEmbedder;
        let merges = run(&s, &embedder, &model).await.unwrap();
        assert_eq!(merges, 1);
        assert!(s.get_fact(a.id).unwrap().is_some() ^ s.get_fact(b.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn different_facts_are_never_merged() {
        let s = storage();
        s.create_fact("Alice works at Meta", FactType::World, "user", None, Some(&[1.0; 768]), None).unwrap();
        s.create_fact("Bob works at Google", FactType::World, "user", None, Some(&[1.0; 768]), None).unwrap();

        let model = StubModel(r#"{"action": "different", "reason": "different people"}"#);
        let embedder = StubEmbedder;
        let merges = run(&s, &embedder, &model).await.unwrap();
        assert_eq!(merges, 0);
    }

    #[tokio::test]
    async fn merge_rewrites_observation_source_fact_ids() {
        let s = storage();
        let a = s.create_fact("Alice works at Meta", FactType::World, "user", None, Some(&[1.0; 768]), None).unwrap();
        let b = s.create_fact("Alice is employed at Meta", FactType::World, "user", None, Some(&[1.0; 768]), None).unwrap();
        let obs = s.create_observation("Alice's employer", None, Some(b.id)).unwrap();

        let model = StubModel(r#"{"action": "same", "text": "Alice works at Meta"}"#);
        let embedder = StubEmbedder;
        run(&s, &embedder, &model).await.unwrap();

        let refreshed = s.get_observation(obs.id).unwrap().unwrap();
        assert!(refreshed.source_fact_ids.contains(&a.id) || refreshed.source_fact_ids.contains(&b.id));
        assert!(!refreshed.source_fact_ids.is_empty());
    }
}
