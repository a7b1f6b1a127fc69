//! Abstract external collaborators.
//!
//! The embedding provider, the language-model provider, and the reranker
//! are explicitly out of scope for this engine: it only ever talks to
//! them through these narrow interfaces. A caller wires up a concrete
//! implementation (local ONNX inference, a hosted API, whatever) and
//! hands an `Arc<dyn ...>` to the facade.

use async_trait::async_trait;
use serde_json::Value;

/// Produces L2-normalized embedding vectors for arbitrary text.
///
/// Implementations are expected to truncate inputs to whatever character
/// limit the underlying model enforces rather than erroring.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, String>;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed_one(t).await?);
        }
        Ok(out)
    }

    /// Dimensionality of the vectors this provider returns.
    fn dimensions(&self) -> usize;
}

/// A single chat-style message passed to the language model.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Result of a language-model completion call.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Free text, or a JSON document matching the requested schema.
    pub content: String,
}

/// Structured-output capable language model access.
///
/// The engine only ever requests structured outputs (consolidation,
/// extraction, dream generation all pass a JSON schema); plain
/// completions are not exercised by anything in this crate.
#[async_trait]
pub trait LanguageModelProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        response_schema: Option<&Value>,
        temperature: f32,
    ) -> Result<Completion, String>;
}

/// A reordered candidate returned by a reranker call.
#[derive(Debug, Clone)]
pub struct RerankedIndex {
    pub index: usize,
    pub relevance_score: f32,
}

/// Cross-encoder reranking over a query and a list of candidate documents.
///
/// Failure (timeout, network, unauthorized, empty output) is not
/// surfaced as an error from `rerank` itself — implementations return an
/// empty vector, which the retrieval pipeline interprets as "use
/// fallback scoring".
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String]) -> Vec<RerankedIndex>;
}

/// A reranker that always declines, used when no external cross-encoder
/// is configured. Retrieval always has well-defined fallback scoring, so
/// this is a legitimate default rather than a stub.
pub struct NoopReranker;

#[async_trait]
impl Reranker for NoopReranker {
    async fn rerank(&self, _query: &str, _documents: &[String]) -> Vec<RerankedIndex> {
        Vec::new()
    }
}

#[cfg(feature = "reranker")]
pub mod http {
    use super::*;
    use std::time::Duration;

    const MAX_RETRIES: u32 = 3;
    const INITIAL_RETRY_DELAY_MS: u64 = 1000;

    fn is_retryable_status(status: u16) -> bool {
        matches!(status, 429 | 500 | 502 | 503 | 529)
    }

    /// A reranker backed by an HTTP cross-encoder endpoint speaking the
    /// `{model, query, documents}` -> `{results: [{index, relevance_score}]}`
    /// contract.
    pub struct HttpReranker {
        client: reqwest::Client,
        endpoint: String,
        model: String,
        api_key: Option<String>,
    }

    impl HttpReranker {
        pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
            Self {
                client: reqwest::Client::new(),
                endpoint: endpoint.into(),
                model: model.into(),
                api_key,
            }
        }

        async fn post(&self, body: &Value) -> Result<Value, String> {
            let mut delay = INITIAL_RETRY_DELAY_MS;
            let mut last_err = String::new();

            for attempt in 0..=MAX_RETRIES {
                let mut req = self.client.post(&self.endpoint).json(body).timeout(Duration::from_secs(30));
                if let Some(key) = &self.api_key {
                    req = req.bearer_auth(key);
                }

                match req.send().await {
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        if resp.status().is_success() {
                            return resp.json::<Value>().await.map_err(|e| e.to_string());
                        }
                        if !is_retryable_status(status) || attempt == MAX_RETRIES {
                            return Err(format!("reranker returned status {status}"));
                        }
                        last_err = format!("status {status}");
                    }
                    Err(e) => {
                        if attempt == MAX_RETRIES {
                            return Err(e.to_string());
                        }
                        last_err = e.to_string();
                    }
                }

                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay *= 2;
            }

            Err(last_err)
        }
    }

    #[async_trait]
    impl Reranker for HttpReranker {
        async fn rerank(&self, query: &str, documents: &[String]) -> Vec<RerankedIndex> {
            if documents.is_empty() {
                return Vec::new();
            }

            let body = serde_json::json!({
                "model": self.model,
                "query": query,
                "documents": documents,
            });

            let result = match self.post(&body).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "reranker failed, falling back to base scoring");
                    return Vec::new();
                }
            };

            let Some(results) = result.get("results").and_then(|r| r.as_array()) else {
                return Vec::new();
            };

            let mut out: Vec<RerankedIndex> = results
                .iter()
                .filter_map(|r| {
                    let index = r.get("index")?.as_u64()? as usize;
                    let score = r.get("relevance_score")?.as_f64()? as f32;
                    Some(RerankedIndex { index, relevance_score: score })
                })
                .collect();
            out.sort_by(|a, b| b.relevance_score.partial_cmp(&a.relevance_score).unwrap());
            out
        }
    }
}
