//! The dream pass: k-means cluster the fact embedding space, cross
//! pollinate pairs of clusters into bridge/insight candidates, then
//! filter the whole batch through one comparative evaluator call.
//!
//! Clustering uses a small deterministic PRNG (splitmix64) rather than
//! pulling in a dependency nothing else in the crate needs; the only
//! requirement is a reproducible k-means++ seed, not cryptographic
//! quality randomness.

use std::collections::HashMap;

use crate::error::Result;
use crate::providers::{ChatMessage, LanguageModelProvider};
use crate::storage::Storage;

const DREAM_PROMPT: &str = "Two unrelated areas of knowledge sometimes share an underlying structure. \
Look at these two clusters of facts and decide whether there's a genuine structural analogy between \
them, not just a surface-level coincidence.

CLUSTER A core fact: \"{core_a}\"
CLUSTER A supporting facts:
{supporters_a}

CLUSTER B core fact: \"{core_b}\"
CLUSTER B supporting facts:
{supporters_b}

If there's a real bridge, describe it briefly and state the insight it yields. If not, return both as null.

Return a single JSON object:
{{\"bridge\": \"...\" or null, \"insight\": \"...\" or null}}

Return ONLY the JSON object.";

const DREAM_EVALUATOR_PROMPT: &str = "Here are {n} candidate analogies produced by comparing clusters of \
unrelated facts. Most surface-level analogies are not worth surfacing to a person; only the genuinely \
illuminating ones are.

{candidates}

Select the indices of the candidates worth keeping and explain briefly why.

Return a single JSON object:
{{\"selected\": [0, 2], \"reasoning\": \"...\"}}

Return ONLY the JSON object.";

fn generation_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "bridge": { "type": ["string", "null"] },
            "insight": { "type": ["string", "null"] }
        },
        "required": ["bridge", "insight"]
    })
}

fn evaluator_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "selected": { "type": "array", "items": { "type": "integer" } },
            "reasoning": { "type": "string" }
        },
        "required": ["selected", "reasoning"]
    })
}

#[derive(Debug, Clone, serde::Deserialize)]
struct DreamGeneration {
    bridge: Option<String>,
    insight: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct DreamEvaluation {
    selected: Vec<usize>,
}

struct DreamCandidate {
    bridge: String,
    insight: String,
    source_fact_ids: Vec<i64>,
}

/// splitmix64: minimal, deterministic, good enough for k-means++
/// candidate selection.
struct Rng(u64);

impl Rng {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn choose_index(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
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

/// k-means with k-means++ initialization, over cosine distance. `ids`
/// fixes iteration order so the seeded RNG produces the same clustering
/// on every run (`facts` alone, being a hash map, would not). Returns a
/// map from arbitrary cluster index to the member fact ids.
fn kmeans(ids: &[i64], facts: &HashMap<i64, (String, Vec<f32>)>, k: usize, iterations: usize) -> HashMap<usize, Vec<i64>> {
    if ids.len() < k {
        return HashMap::from([(0, ids.to_vec())]);
    }

    let mut rng = Rng(42);
    let dim = facts[&ids[0]].1.len();

    let mut centroids: Vec<Vec<f32>> = vec![facts[&ids[rng.choose_index(ids.len())]].1.clone()];
    for _ in 1..k {
        let dists: Vec<f64> = ids
            .iter()
            .map(|id| {
                let emb = &facts[id].1;
                let min_d = centroids.iter().map(|c| 1.0 - cosine(emb, c)).fold(f64::INFINITY, f64::min);
                min_d * min_d
            })
            .collect();
        let total: f64 = dists.iter().sum();
        if total <= 0.0 {
            centroids.push(facts[&ids[rng.choose_index(ids.len())]].1.clone());
            continue;
        }
        let r = rng.next_f64() * total;
        let mut cumulative = 0.0;
        let mut chosen = ids.len() - 1;
        for (i, d) in dists.iter().enumerate() {
            cumulative += d;
            if cumulative >= r {
                chosen = i;
                break;
            }
        }
        centroids.push(facts[&ids[chosen]].1.clone());
    }

    let mut clusters: HashMap<usize, Vec<i64>> = HashMap::new();
    for _ in 0..iterations {
        clusters = HashMap::new();
        for id in &ids {
            let emb = &facts[id].1;
            let best = (0..k)
                .max_by(|&a, &b| cosine(emb, &centroids[a]).partial_cmp(&cosine(emb, &centroids[b])).unwrap())
                .unwrap();
            clusters.entry(best).or_default().push(*id);
        }
        for ki in 0..k {
            let Some(members) = clusters.get(&ki) else { continue };
            if members.is_empty() {
                continue;
            }
            let mut new_centroid = vec![0.0f32; dim];
            for id in members {
                for (i, v) in facts[id].1.iter().enumerate() {
                    new_centroid[i] += v;
                }
            }
            let n = members.len() as f32;
            for v in &mut new_centroid {
                *v /= n;
            }
            centroids[ki] = new_centroid;
        }
    }

    clusters
}

fn centroid_nearest(facts: &HashMap<i64, (String, Vec<f32>)>, cluster: &[i64]) -> i64 {
    let dim = facts[&cluster[0]].1.len();
    let mut centroid = vec![0.0f32; dim];
    for id in cluster {
        for (i, v) in facts[id].1.iter().enumerate() {
            centroid[i] += v;
        }
    }
    let n = cluster.len() as f32;
    for v in &mut centroid {
        *v /= n;
    }
    *cluster
        .iter()
        .max_by(|&&a, &&b| cosine(&facts[&a].1, &centroid).partial_cmp(&cosine(&facts[&b].1, &centroid)).unwrap())
        .unwrap()
}

fn supporters(facts: &HashMap<i64, (String, Vec<f32>)>, seed: i64, cluster: &[i64], n: usize) -> Vec<i64> {
    let seed_emb = &facts[&seed].1;
    let mut scored: Vec<(i64, f64)> = cluster.iter().filter(|&&id| id != seed).map(|&id| (id, cosine(seed_emb, &facts[&id].1))).collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(n).map(|(id, _)| id).collect()
}

async fn generate_dream(
    model: &dyn LanguageModelProvider,
    facts: &HashMap<i64, (String, Vec<f32>)>,
    core_a: i64,
    supporters_a: &[i64],
    core_b: i64,
    supporters_b: &[i64],
    temperature: f32,
) -> Option<DreamGeneration> {
    let format_supporters = |ids: &[i64]| -> String {
        if ids.is_empty() {
            return "    (none)".to_string();
        }
        ids.iter().map(|id| format!("    - \"{}\"", truncate(&facts[id].0, 120))).collect::<Vec<_>>().join("\n")
    };

    let prompt = DREAM_PROMPT
        .replace("{core_a}", &facts[&core_a].0)
        .replace("{supporters_a}", &format_supporters(supporters_a))
        .replace("{core_b}", &facts[&core_b].0)
        .replace("{supporters_b}", &format_supporters(supporters_b));

    let completion = match model.complete(&[ChatMessage::user(prompt)], Some(&generation_schema()), temperature).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "dream generation failed");
            return None;
        }
    };

    match serde_json::from_str::<DreamGeneration>(&completion.content) {
        Ok(g) if g.bridge.is_some() && g.insight.is_some() => Some(g),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "dream generation produced malformed JSON");
            None
        }
    }
}

async fn evaluate_batch(model: &dyn LanguageModelProvider, candidates: &[DreamCandidate], temperature: f32) -> Vec<usize> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let formatted = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[{i}] BRIDGE: {}\n    DREAM: {}", c.bridge, c.insight))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = DREAM_EVALUATOR_PROMPT.replace("{n}", &candidates.len().to_string()).replace("{candidates}", &formatted);

    let completion = match model.complete(&[ChatMessage::user(prompt)], Some(&evaluator_schema()), temperature).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "dream evaluation failed");
            return Vec::new();
        }
    };

    match serde_json::from_str::<DreamEvaluation>(&completion.content) {
        Ok(e) => e.selected.into_iter().filter(|&i| i < candidates.len()).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "dream evaluation produced malformed JSON");
            Vec::new()
        }
    }
}

fn truncate(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub async fn run(storage: &Storage, model: &dyn LanguageModelProvider) -> Result<usize> {
    let cfg = &storage.config;
    let all_facts = storage.list_all_facts_with_embeddings()?;
    if all_facts.len() < cfg.dream_min_facts {
        return Ok(0);
    }

    let ordered_ids: Vec<i64> = all_facts.iter().filter(|f| f.embedding.is_some()).map(|f| f.id).collect();
    let facts: HashMap<i64, (String, Vec<f32>)> = all_facts.into_iter().filter_map(|f| f.embedding.clone().map(|e| (f.id, (f.text, e)))).collect();
    if facts.len() < cfg.dream_min_facts {
        return Ok(0);
    }

    let k = (4usize).max(((facts.len() as f64 / cfg.dream_cluster_factor as f64).sqrt()) as usize);
    let clusters = kmeans(&ordered_ids, &facts, k, 20);
    let valid: Vec<usize> = clusters.iter().filter(|(_, members)| members.len() >= 2).map(|(&ki, _)| ki).collect();
    if valid.len() < 2 {
        return Ok(0);
    }

    let mut candidates: Vec<DreamCandidate> = Vec::new();
    for i in 0..valid.len() {
        for j in (i + 1)..valid.len() {
            let cluster_a = &clusters[&valid[i]];
            let cluster_b = &clusters[&valid[j]];
            let core_a = centroid_nearest(&facts, cluster_a);
            let core_b = centroid_nearest(&facts, cluster_b);
            let sup_a = supporters(&facts, core_a, cluster_a, 2);
            let sup_b = supporters(&facts, core_b, cluster_b, 2);

            if let Some(gen) = generate_dream(model, &facts, core_a, &sup_a, core_b, &sup_b, cfg.dream_temperature).await {
                let mut source_fact_ids = vec![core_a, core_b];
                source_fact_ids.extend(&sup_a);
                source_fact_ids.extend(&sup_b);
                candidates.push(DreamCandidate {
                    bridge: gen.bridge.unwrap(),
                    insight: gen.insight.unwrap(),
                    source_fact_ids,
                });
            }
        }
    }

    if candidates.is_empty() {
        return Ok(0);
    }

    let selected = evaluate_batch(model, &candidates, cfg.dream_eval_temperature).await;
    let mut stored = 0;
    for idx in selected {
        let c = &candidates[idx];
        storage.create_dream(&c.bridge, &c.insight, &c.source_fact_ids, None)?;
        stored += 1;
    }

    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::memory::model::FactType;
    use async_trait::async_trait;
    use serde_json::Value;

    fn storage() -> Storage {
        let mut cfg = MemoryConfig::default();
        cfg.dream_min_facts = 4;
        cfg.embedding_dim = 8;
        Storage::open_in_memory(cfg).unwrap()
    }

    struct StubModel(&'static str, &'static str);
    #[async_trait]
    impl LanguageModelProvider for StubModel {
        async fn complete(&self, messages: &[ChatMessage], _schema: Option<&Value>, _temp: f32) -> std::result::Result<crate::providers::Completion, String> {
            let content = if messages[0].content.contains("BRIDGE:") { self.1 } else { self.0 };
            Ok(crate::providers::Completion { content: content.to_string() })
        }
    }

    fn emb(seed: f32) -> Vec<f32> {
        let mut v = vec![0.0; 8];
        v[0] = seed;
        v
    }

    #[tokio::test]
    async fn below_min_facts_is_a_noop() {
        let s = storage();
        s.create_fact("a", FactType::World, "user", None, Some(&emb(1.0)), None).unwrap();
        let model = StubModel("{}", "{}");
        let stored = run(&s, &model).await.unwrap();
        assert_eq!(stored, 0);
    }

    #[tokio::test]
    async fn generates_and_stores_selected_dream() {
        let s = storage();
        for _ in 0..2 {
            s.create_fact("Alice enjoys tea ceremonies", FactType::World, "user", None, Some(&emb(1.0)), None).unwrap();
        }
        for _ in 0..2 {
            s.create_fact("Neural nets use backpropagation", FactType::World, "user", None, Some(&emb(-1.0)), None).unwrap();
        }

        let model = StubModel(
            r#"{"bridge": "iterative refinement", "insight": "both tea ceremonies and backprop refine through repetition"}"#,
            r#"{"selected": [0], "reasoning": "genuinely illuminating"}"#,
        );
        let stored = run(&s, &model).await.unwrap();
        assert_eq!(stored, 1);
        assert_eq!(s.count_dreams().unwrap(), 1);
    }
}
