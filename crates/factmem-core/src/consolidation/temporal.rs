//! Temporal pattern mining: per eligible entity, ask the model to
//! surface trends across its recent timeline, folding duplicates into
//! an existing observation instead of creating a new one.

use chrono::Utc;

use crate::error::Result;
use crate::providers::{ChatMessage, EmbeddingProvider, LanguageModelProvider};
use crate::storage::Storage;

const TEMPORAL_PATTERN_PROMPT: &str = "These facts all concern the entity \"{entity_name}\", ordered by \
when they happened. Look for a trend, recurring behavior, or change over time that individual \
facts don't capture on their own.

FACTS:
{facts_json}

Return zero or more actions, each either proposing a new observation or explicitly skipping:
{{\"actions\": [
  {{\"action\": \"create\", \"text\": \"...\", \"source_fact_ids\": [...]}},
  {{\"action\": \"skip\", \"reason\": \"...\"}}
]}}

If nothing in these facts forms a pattern beyond the individual events, return an empty actions list.

Return ONLY the JSON object.";

fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "actions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "action": { "type": "string", "enum": ["create", "skip"] },
                        "text": { "type": ["string", "null"] },
                        "reason": { "type": ["string", "null"] },
                        "source_fact_ids": { "type": "array", "items": { "type": "integer" } }
                    },
                    "required": ["action"]
                }
            }
        },
        "required": ["actions"]
    })
}

#[derive(Debug, Clone, serde::Deserialize)]
struct TemporalAction {
    action: String,
    text: Option<String>,
    #[serde(default)]
    source_fact_ids: Vec<i64>,
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
struct TemporalResponse {
    #[serde(default)]
    actions: Vec<TemporalAction>,
}

async fn llm_patterns(model: &dyn LanguageModelProvider, entity_name: &str, facts_json: &str, temperature: f32) -> Option<Vec<TemporalAction>> {
    let prompt = TEMPORAL_PATTERN_PROMPT.replace("{entity_name}", entity_name).replace("{facts_json}", facts_json);

    let completion = match model.complete(&[ChatMessage::user(prompt)], Some(&schema()), temperature).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, entity = entity_name, "temporal pattern mining failed");
            return None;
        }
    };

    match serde_json::from_str::<TemporalResponse>(&completion.content) {
        Ok(r) => Some(r.actions),
        Err(e) => {
            tracing::warn!(error = %e, entity = entity_name, "temporal pattern mining produced malformed JSON");
            None
        }
    }
}

/// Mines recent-activity patterns for every entity with enough recent
/// facts and no existing checkpoint for today's window. Returns
/// `(observations_created, existing_observations_reinforced)`.
pub async fn run(storage: &Storage, embedder: &dyn EmbeddingProvider, model: &dyn LanguageModelProvider) -> Result<(usize, usize)> {
    let cfg = &storage.config;
    let entities = storage.get_entities_with_fact_count(cfg.temporal_window_days, cfg.temporal_min_facts as i64)?;
    if entities.is_empty() {
        return Ok((0, 0));
    }

    let window_end = Utc::now().format("%Y-%m-%d").to_string();
    let mut created = 0;
    let mut reinforced = 0;

    for (entity_id, entity_name, _count) in entities {
        if storage.has_temporal_checkpoint(entity_id, &window_end)? {
            continue;
        }

        let facts = storage.get_facts_for_entity_temporal(entity_id, cfg.temporal_window_days, 50)?;
        if facts.len() < cfg.temporal_min_facts {
            continue;
        }

        let facts_json = serde_json::to_string_pretty(
            &facts
                .iter()
                .map(|f| {
                    serde_json::json!({
                        "id": f.id,
                        "text": f.text,
                        "happened_at": f.happened_at.map(|t| t.to_rfc3339()),
                        "created_at": f.created_at.to_rfc3339(),
                    })
                })
                .collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".to_string());

        let Some(actions) = llm_patterns(model, &entity_name, &facts_json, cfg.consolidation_temperature).await else {
            continue;
        };

        let mut to_create: Vec<(String, Vec<i64>, Vec<f32>)> = Vec::new();
        let mut to_reinforce: Vec<(i64, Vec<i64>)> = Vec::new();

        for action in &actions {
            if action.action != "create" {
                continue;
            }
            let Some(text) = &action.text else { continue };
            let embedding = match embedder.embed_one(text).await {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "embedding failed during temporal pattern mining");
                    continue;
                }
            };

            let nearest = storage.search_observations_vector(&embedding, 1)?;
            if let Some((existing, sim)) = nearest.first() {
                if *sim >= cfg.observation_merge_similarity_threshold {
                    if !action.source_fact_ids.is_empty() {
                        to_reinforce.push((existing.id, action.source_fact_ids.clone()));
                    }
                    continue;
                }
            }
            to_create.push((text.clone(), action.source_fact_ids.clone(), embedding));
        }

        for (obs_id, fact_ids) in to_reinforce {
            storage.add_source_facts(obs_id, &fact_ids)?;
            reinforced += 1;
        }

        for (text, fact_ids, embedding) in to_create {
            let first = fact_ids.first().copied();
            let obs = storage.create_observation(&text, Some(&embedding), first)?;
            if fact_ids.len() > 1 {
                storage.add_source_facts(obs.id, &fact_ids[1..])?;
            }
            created += 1;
        }

        storage.set_temporal_checkpoint(entity_id, &window_end)?;
    }

    Ok((created, reinforced))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::memory::model::FactType;
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::Value;

    fn storage() -> Storage {
        let mut cfg = MemoryConfig::default();
        cfg.temporal_min_facts = 2;
        Storage::open_in_memory(cfg).unwrap()
    }

    struct StubEmbedder;
    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed_one(&self, _text: &str) -> std::result::Result<Vec<f32>, String> {
            Ok(vec![0.2; 768])
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
    async fn creates_observation_for_eligible_entity() {
        let s = storage();
        let now = Utc::now() - Duration::days(1);
        let a = s.create_fact("Alice went running", FactType::World, "user", None, Some(&[0.2; 768]), Some(now)).unwrap();
        let b = s.create_fact("Alice went running again", FactType::World, "user", None, Some(&[0.2; 768]), Some(now)).unwrap();
        let entity = s.create_entity("Alice", "person", None, false).unwrap();
        s.add_entity_ref(a.id, "Alice", "person", Some(entity.id)).unwrap();
        s.add_entity_ref(b.id, "Alice", "person", Some(entity.id)).unwrap();

        let model = StubModel(r#"{"actions": [{"action": "create", "text": "Alice runs regularly", "source_fact_ids": []}]}"#);
        let embedder = StubEmbedder;
        let (created, reinforced) = run(&s, &embedder, &model).await.unwrap();
        assert_eq!(created, 1);
        assert_eq!(reinforced, 0);
    }

    #[tokio::test]
    async fn no_eligible_entities_is_a_noop() {
        let s = storage();
        let model = StubModel(r#"{"actions": []}"#);
        let embedder = StubEmbedder;
        let (created, reinforced) = run(&s, &embedder, &model).await.unwrap();
        assert_eq!((created, reinforced), (0, 0));
    }
}
