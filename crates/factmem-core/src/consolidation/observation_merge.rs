//! Observation merge pass: recursive pairwise deduplication. Repeatedly
//! finds the most similar pair above threshold, asks the model to merge
//! or skip, and loops until no pair exceeds it.

use crate::error::Result;
use crate::memory::model::Observation;
use crate::providers::{ChatMessage, EmbeddingProvider, LanguageModelProvider};
use crate::storage::Storage;

const OBSERVATION_MERGE_PROMPT: &str = "Two observations may describe the same underlying pattern. \
Decide whether to merge them into one, or keep them separate.

OBSERVATION A (id {id_a}, {evidence_a} supporting facts): {text_a}

OBSERVATION B (id {id_b}, {evidence_b} supporting facts): {text_b}

If they describe the same pattern, return a merged text that preserves both facts' nuance. \
If they are distinct enough to stand alone, skip.

Return a single JSON object:
{{\"action\": \"merge\", \"text\": \"...\"}}
{{\"action\": \"skip\", \"reason\": \"...\"}}

Return ONLY the JSON object.";

fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["merge", "skip"] },
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

/// The highest-similarity pair not already in `skipped`, above
/// `threshold`. Observations without an embedding never participate.
fn find_top_pair(observations: &[Observation], skipped: &std::collections::HashSet<(i64, i64)>, threshold: f64) -> Option<(usize, usize, f64)> {
    let mut best: Option<(usize, usize, f64)> = None;
    for i in 0..observations.len() {
        let Some(emb_a) = &observations[i].embedding else { continue };
        for j in (i + 1)..observations.len() {
            let Some(emb_b) = &observations[j].embedding else { continue };
            let key = (observations[i].id.min(observations[j].id), observations[i].id.max(observations[j].id));
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

async fn decide(model: &dyn LanguageModelProvider, a: &Observation, b: &Observation, temperature: f32) -> MergeDecision {
    let prompt = OBSERVATION_MERGE_PROMPT
        .replace("{id_a}", &a.id.to_string())
        .replace("{evidence_a}", &a.evidence_count.to_string())
        .replace("{text_a}", &a.summary)
        .replace("{id_b}", &b.id.to_string())
        .replace("{evidence_b}", &b.evidence_count.to_string())
        .replace("{text_b}", &b.summary);

    let completion = match model.complete(&[ChatMessage::user(prompt)], Some(&schema()), temperature).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "observation merge decision failed");
            return MergeDecision { action: "skip".to_string(), text: None };
        }
    };

    serde_json::from_str(&completion.content).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "observation merge produced malformed JSON");
        MergeDecision { action: "skip".to_string(), text: None }
    })
}

pub async fn run(storage: &Storage, embedder: &dyn EmbeddingProvider, model: &dyn LanguageModelProvider) -> Result<usize> {
    let mut observations = storage.list_all_observations_with_embeddings()?;
    if observations.len() < 2 {
        return Ok(0);
    }

    let threshold = storage.config.observation_merge_similarity_threshold;
    let mut skipped: std::collections::HashSet<(i64, i64)> = std::collections::HashSet::new();
    let mut merges = 0;

    while let Some((i, j, sim)) = find_top_pair(&observations, &skipped, threshold) {
        let (a, b) = (observations[i].clone(), observations[j].clone());
        let key = (a.id.min(b.id), a.id.max(b.id));

        let decision = decide(model, &a, &b, storage.config.observation_merge_temperature).await;
        if decision.action != "merge" {
            skipped.insert(key);
            continue;
        }
        let Some(text) = decision.text else {
            skipped.insert(key);
            continue;
        };

        let (keeper, removed) = if a.evidence_count >= b.evidence_count { (&a, &b) } else { (&b, &a) };

        let embedding = match embedder.embed_one(&text).await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed during observation merge");
                skipped.insert(key);
                continue;
            }
        };

        storage.merge_observations(keeper.id, removed.id, &text, &embedding, &format!("merged with observation {} (sim={sim:.3})", removed.id))?;
        merges += 1;

        let keeper_id = keeper.id;
        let removed_id = removed.id;
        observations.retain(|o| o.id != removed_id);
        if let Some(slot) = observations.iter_mut().find(|o| o.id == keeper_id) {
            slot.summary = text;
            slot.embedding = Some(embedding);
        }
    }

    Ok(merges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
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
    async fn merges_near_duplicate_observations() {
        let s = storage();
        s.create_observation("Alice likes tea", Some(&[1.0; 768]), None).unwrap();
        s.create_observation("Alice enjoys tea", Some(&[1.0; 768]), None).unwrap();

        let model = StubModel(r#"{"action": "merge", "text": "Alice likes tea"}"#);
        let embedder = StubEmbedder;
        let merges = run(&s, &embedder, &model).await.unwrap();
        assert_eq!(merges, 1);
        assert_eq!(s.count_observations().unwrap(), 1);
    }

    #[tokio::test]
    async fn below_threshold_pairs_are_never_considered() {
        let s = storage();
        let mut a = vec![0.0; 768];
        a[0] = 1.0;
        let mut b = vec![0.0; 768];
        b[1] = 1.0;
        s.create_observation("Alice likes tea", Some(&a), None).unwrap();
        s.create_observation("Bob likes skiing", Some(&b), None).unwrap();

        let model = StubModel(r#"{"action": "merge", "text": "unused"}"#);
        let embedder = StubEmbedder;
        let merges = run(&s, &embedder, &model).await.unwrap();
        assert_eq!(merges, 0);
        assert_eq!(s.count_observations().unwrap(), 2);
    }

    #[tokio::test]
    async fn skip_decision_keeps_both_observations() {
        let s = storage();
        s.create_observation("Alice likes tea", Some(&[1.0; 768]), None).unwrap();
        s.create_observation("Alice enjoys tea", Some(&[1.0; 768]), None).unwrap();

        let model = StubModel(r#"{"action": "skip", "reason": "distinct enough"}"#);
        let embedder = StubEmbedder;
        let merges = run(&s, &embedder, &model).await.unwrap();
        assert_eq!(merges, 0);
        assert_eq!(s.count_observations().unwrap(), 2);
    }
}
