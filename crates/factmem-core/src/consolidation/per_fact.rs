//! Per-fact consolidation: distill one unconsolidated fact into a
//! higher-level observation, or decide it carries no durable knowledge.

use crate::error::Result;
use crate::memory::model::{Fact, Observation};
use crate::providers::{ChatMessage, EmbeddingProvider, LanguageModelProvider};
use crate::storage::Storage;

const CONSOLIDATION_PROMPT: &str = "You are a memory consolidation system. Synthesize facts into \
higher-level observations that capture patterns and preferences rather than restating events.

Examples:
- Fact: \"Alice prefers Python\" -> Observation: \"Alice is a Python-focused developer\"
- Fact: \"User had a good experience at Cafe Roma\" -> Observation: \"Cafe Roma provides good experiences\"

Rules:
- observations synthesize patterns, they do not decompose a fact into parts
- never merge facts about different people
- when an observation already has 10 or more source facts, prefer creating a new sub-topic \
observation over growing it further
- when facts contradict, merge them with the contradiction preserved in the text, e.g. \
\"User was previously a React enthusiast but has now switched to Vue\"
- skip facts describing ephemeral or transient state (\"User is at the coffee shop\")

NEW FACT: {fact_text}

EXISTING OBSERVATIONS (closest by similarity, each with up to 3 supporting facts):
{observations_json}

Choose exactly one action and return it as a single JSON object:
{{\"action\": \"update\", \"observation_id\": <id>, \"text\": \"...\", \"reason\": \"...\"}}
{{\"action\": \"create\", \"text\": \"...\", \"reason\": \"...\"}}
{{\"action\": \"skip\", \"reason\": \"...\"}}

Return ONLY the JSON object.";

fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["update", "create", "skip"] },
            "observation_id": { "type": ["integer", "null"] },
            "text": { "type": ["string", "null"] },
            "reason": { "type": ["string", "null"] }
        },
        "required": ["action"]
    })
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Decision {
    action: String,
    observation_id: Option<i64>,
    text: Option<String>,
    #[allow(dead_code)]
    reason: Option<String>,
}

fn format_candidates(storage: &Storage, candidates: &[(Observation, f64)]) -> String {
    if candidates.is_empty() {
        return "[]".to_string();
    }

    let entries: Vec<serde_json::Value> = candidates
        .iter()
        .map(|(obs, similarity)| {
            let source_facts: Vec<serde_json::Value> = obs
                .source_fact_ids
                .iter()
                .take(3)
                .filter_map(|fid| storage.get_fact(*fid).ok().flatten())
                .map(|f| serde_json::json!({ "text": f.text, "created_at": f.created_at.to_rfc3339() }))
                .collect();

            serde_json::json!({
                "id": obs.id,
                "text": obs.summary,
                "evidence_count": obs.evidence_count,
                "similarity": (similarity * 1000.0).round() / 1000.0,
                "source_facts": source_facts,
            })
        })
        .collect();

    serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
}

async fn decide(
    storage: &Storage,
    model: &dyn LanguageModelProvider,
    fact: &Fact,
    candidates: &[(Observation, f64)],
) -> Option<Decision> {
    let prompt = CONSOLIDATION_PROMPT
        .replace("{fact_text}", &fact.text)
        .replace("{observations_json}", &format_candidates(storage, candidates));

    let completion = match model.complete(&[ChatMessage::user(prompt)], Some(&schema()), storage.config.consolidation_temperature).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, fact_id = fact.id, "consolidation decision failed");
            return None;
        }
    };

    match serde_json::from_str::<Decision>(&completion.content) {
        Ok(d) => Some(d),
        Err(e) => {
            tracing::warn!(error = %e, fact_id = fact.id, "consolidation produced malformed JSON");
            None
        }
    }
}

/// Applies a decision: `create`/`update` re-embed the synthesized text
/// and write through to the observation store; `skip` and any
/// incomplete action are no-ops. The fact is always marked consolidated
/// afterward regardless of outcome, so a bad decision never blocks
/// future passes from reconsidering it.
async fn apply(storage: &Storage, embedder: &dyn EmbeddingProvider, fact: &Fact, decision: Option<Decision>) -> bool {
    let applied = match decision {
        None => false,
        Some(d) if d.action == "skip" => false,
        Some(d) if d.action == "update" => match (d.observation_id, d.text) {
            (Some(obs_id), Some(text)) => match embedder.embed_one(&text).await {
                Ok(embedding) => {
                    matches!(
                        storage.update_observation(obs_id, &text, Some(&embedding), Some(fact.id), "per-fact consolidation"),
                        Ok(())
                    )
                }
                Err(e) => {
                    tracing::warn!(error = %e, "embedding failed during consolidation update");
                    false
                }
            },
            _ => false,
        },
        Some(d) if d.action == "create" => match d.text {
            Some(text) => match embedder.embed_one(&text).await {
                Ok(embedding) => storage.create_observation(&text, Some(&embedding), Some(fact.id)).is_ok(),
                Err(e) => {
                    tracing::warn!(error = %e, "embedding failed during consolidation create");
                    false
                }
            },
            None => false,
        },
        Some(_) => false,
    };

    let _ = storage.mark_fact_consolidated(fact.id);
    applied
}

/// Consolidates up to `batch_size` unconsolidated facts. Returns the
/// number that resulted in a create or update (skips and failures still
/// get marked consolidated, but don't count).
pub async fn run(storage: &Storage, embedder: &dyn EmbeddingProvider, model: &dyn LanguageModelProvider) -> Result<usize> {
    let facts = storage.list_unconsolidated_facts(storage.config.consolidation_batch_size)?;
    let mut applied = 0;

    for fact in facts {
        if fact.embedding.is_none() {
            storage.mark_fact_consolidated(fact.id)?;
            continue;
        }

        let candidates = storage.search_observations_vector(fact.embedding.as_ref().unwrap(), storage.config.consolidation_search_limit)?;
        let decision = decide(storage, model, &fact, &candidates).await;
        if apply(storage, embedder, &fact, decision).await {
            applied += 1;
        }
    }

    Ok(applied)
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
            Ok(vec![0.1; 768])
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

    struct FailingModel;
    #[async_trait]
    impl LanguageModelProvider for FailingModel {
        async fn complete(&self, _messages: &[ChatMessage], _schema: Option<&Value>, _temp: f32) -> std::result::Result<crate::providers::Completion, String> {
            Err("unreachable".to_string())
        }
    }

    #[tokio::test]
    async fn skip_decision_still_marks_fact_consolidated() {
        let s = storage();
        let fact = s.create_fact("User is at the coffee shop", FactType::World, "user", None, Some(&[0.1; 768]), None).unwrap();
        let model = StubModel(r#"{"action": "skip", "reason": "ephemeral"}"#);
        let embedder = StubEmbedder;
        let applied = run(&s, &embedder, &model).await.unwrap();
        assert_eq!(applied, 0);
        let refreshed = s.get_fact(fact.id).unwrap().unwrap();
        assert!(refreshed.consolidated_at.is_some());
    }

    #[tokio::test]
    async fn create_decision_inserts_observation_and_marks_consolidated() {
        let s = storage();
        let fact = s.create_fact("Alice prefers Python", FactType::World, "user", None, Some(&[0.1; 768]), None).unwrap();
        let model = StubModel(r#"{"action": "create", "text": "Alice is a Python-focused developer"}"#);
        let embedder = StubEmbedder;
        let applied = run(&s, &embedder, &model).await.unwrap();
        assert_eq!(applied, 1);
        assert_eq!(s.count_observations().unwrap(), 1);
        let refreshed = s.get_fact(fact.id).unwrap().unwrap();
        assert!(refreshed.consolidated_at.is_some());
    }

    #[tokio::test]
    async fn model_failure_degrades_to_skip_but_still_consolidates() {
        let s = storage();
        let fact = s.create_fact("Alice prefers Python", FactType::World, "user", None, Some(&[0.1; 768]), None).unwrap();
        let model = FailingModel;
        let embedder = StubEmbedder;
        let applied = run(&s, &embedder, &model).await.unwrap();
        assert_eq!(applied, 0);
        assert!(s.get_fact(fact.id).unwrap().unwrap().consolidated_at.is_some());
    }

    #[tokio::test]
    async fn fact_without_embedding_is_marked_consolidated_without_a_decision() {
        let s = storage();
        let fact = s.create_fact("no embedding here", FactType::World, "user", None, None, None).unwrap();
        let model = FailingModel;
        let embedder = StubEmbedder;
        run(&s, &embedder, &model).await.unwrap();
        assert!(s.get_fact(fact.id).unwrap().unwrap().consolidated_at.is_some());
    }
}
