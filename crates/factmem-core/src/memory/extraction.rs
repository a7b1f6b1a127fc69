//! LLM-based entity extraction.

use crate::providers::{ChatMessage, LanguageModelProvider};

const EXTRACTION_PROMPT: &str = "Extract proper-noun entities from the following text, each tagged with \
a short type such as person, place, organization, or product. \
Normalize first-person references (\"I\", \"me\", \"my\") to the literal entity name \"User\" with type \"person\". \
Return strictly the entities explicitly present; do not infer unstated ones.\n\nTEXT:\n{text}";

#[derive(Debug, Clone, Default)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub entities: Vec<ExtractedEntity>,
}

fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "entity_type": { "type": "string" }
                    },
                    "required": ["name", "entity_type"]
                }
            }
        },
        "required": ["entities"]
    })
}

fn strip_code_fence(content: &str) -> &str {
    let content = content.trim();
    if let Some(rest) = content.strip_prefix("```") {
        if let Some(idx) = rest.find('\n') {
            let body = &rest[idx + 1..];
            if let Some(end) = body.rfind("```") {
                return body[..end].trim();
            }
        }
    }
    content
}

/// Extracts entities from `text` via the language model. Any failure —
/// model error, malformed JSON — is logged and yields an empty result so
/// the caller can still persist the fact without entities.
pub async fn extract(model: &dyn LanguageModelProvider, temperature: f32, text: &str) -> ExtractionResult {
    let prompt = EXTRACTION_PROMPT.replace("{text}", text);
    let messages = [ChatMessage::user(prompt)];
    let schema = schema();

    let completion = match model.complete(&messages, Some(&schema), temperature).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "entity extraction failed");
            return ExtractionResult::default();
        }
    };

    let content = strip_code_fence(&completion.content);
    #[derive(serde::Deserialize)]
    struct EntitySchema {
        name: String,
        #[serde(default = "default_entity_type")]
        entity_type: String,
    }
    fn default_entity_type() -> String {
        "unknown".to_string()
    }
    #[derive(serde::Deserialize)]
    struct ExtractionSchema {
        #[serde(default)]
        entities: Vec<EntitySchema>,
    }

    match serde_json::from_str::<ExtractionSchema>(content) {
        Ok(parsed) => ExtractionResult {
            entities: parsed.entities.into_iter().map(|e| ExtractedEntity { name: e.name, entity_type: e.entity_type }).collect(),
        },
        Err(e) => {
            tracing::warn!(error = %e, "entity extraction produced malformed JSON");
            ExtractionResult::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fenced_json() {
        let raw = "```json\n{\"entities\": []}\n```";
        assert_eq!(strip_code_fence(raw), "{\"entities\": []}");
    }

    #[test]
    fn passes_through_unfenced_json() {
        let raw = "{\"entities\": []}";
        assert_eq!(strip_code_fence(raw), raw);
    }
}
