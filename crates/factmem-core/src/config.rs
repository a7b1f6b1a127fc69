//! Tunable constants for ranking, resolution, and consolidation.
//!
//! The source implementation couples several of these (RRF-k, the
//! overfetch factor, the entity-expansion IDF floor, merge thresholds) to
//! literal values without published tuning data. They are exposed here as
//! configuration rather than buried as magic numbers, per the open
//! question in the design notes.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Dimensionality `D` of stored embeddings. Changing this rebuilds
    /// the vector tables on next open.
    pub embedding_dim: usize,

    // --- decay / recency ---
    pub memory_decay_rate: f64,
    pub recency_sigma_hours: f64,

    // --- entity resolution ---
    pub entity_candidates_limit: usize,
    pub entity_name_sim_floor: f64,
    pub entity_auto_merge_threshold: f64,
    pub entity_temporal_sigma_hours: f64,
    pub entity_temporal_neutral: f64,
    pub entity_score_cooccurrence_weight: f64,
    pub entity_score_name_weight: f64,
    pub entity_score_temporal_weight: f64,

    // --- link creation ---
    pub link_temporal_sigma_hours: f64,
    pub link_temporal_min_weight: f64,
    pub link_semantic_threshold: f64,
    pub link_semantic_search_limit: usize,
    pub link_entity_search_limit: usize,

    // --- forget ---
    pub forget_search_limit: usize,
    pub forget_similarity_threshold: f64,

    // --- retrieval ---
    pub recall_search_limit: usize,
    pub recall_observation_limit: usize,
    pub recall_standalone_fact_limit: usize,
    pub bundled_display_limit: usize,
    pub rrf_k: f64,
    pub rrf_overfetch_factor: usize,
    pub entity_expansion_idf_floor: f64,
    pub entity_expansion_max_facts: usize,
    pub entity_expansion_per_entity_limit: usize,
    pub temporal_expansion_limit: usize,
    pub temporal_expansion_base_score: f64,

    // --- consolidation ---
    pub consolidation_batch_size: usize,
    pub consolidation_search_limit: usize,
    pub consolidation_temperature: f32,
    pub extraction_temperature: f32,
    pub observation_merge_similarity_threshold: f64,
    pub observation_merge_temperature: f32,
    pub fact_merge_similarity_threshold: f64,
    pub fact_merge_temperature: f32,

    // --- temporal pattern mining ---
    pub temporal_min_facts: usize,
    pub temporal_window_days: i64,

    // --- dreams ---
    pub dream_min_facts: usize,
    pub dream_cluster_factor: usize,
    pub dream_temperature: f32,
    pub dream_eval_temperature: f32,

    // --- consolidation loop scheduling ---
    pub consolidation_interval: Duration,
    pub consolidation_backoff_cap: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 768,

            memory_decay_rate: 0.99,
            recency_sigma_hours: 72.0,

            entity_candidates_limit: 50,
            entity_name_sim_floor: 0.5,
            entity_auto_merge_threshold: 0.85,
            entity_temporal_sigma_hours: 168.0,
            entity_temporal_neutral: 0.5,
            entity_score_cooccurrence_weight: 0.5,
            entity_score_name_weight: 0.3,
            entity_score_temporal_weight: 0.2,

            link_temporal_sigma_hours: 12.0,
            link_temporal_min_weight: 0.01,
            link_semantic_threshold: 0.7,
            link_semantic_search_limit: 20,
            link_entity_search_limit: 20,

            forget_search_limit: 10,
            forget_similarity_threshold: 0.8,

            recall_search_limit: 5,
            recall_observation_limit: 5,
            recall_standalone_fact_limit: 20,
            bundled_display_limit: 5,
            rrf_k: 60.0,
            rrf_overfetch_factor: 4,
            entity_expansion_idf_floor: 0.15,
            entity_expansion_max_facts: 30,
            entity_expansion_per_entity_limit: 10,
            temporal_expansion_limit: 10,
            temporal_expansion_base_score: 0.5,

            consolidation_batch_size: 10,
            consolidation_search_limit: 5,
            consolidation_temperature: 0.1,
            extraction_temperature: 0.0,
            observation_merge_similarity_threshold: 0.85,
            observation_merge_temperature: 0.1,
            fact_merge_similarity_threshold: 0.9,
            fact_merge_temperature: 0.1,

            temporal_min_facts: 5,
            temporal_window_days: 30,

            dream_min_facts: 20,
            dream_cluster_factor: 10,
            dream_temperature: 0.7,
            dream_eval_temperature: 0.2,

            consolidation_interval: Duration::from_secs(300),
            consolidation_backoff_cap: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent() {
        let cfg = MemoryConfig::default();
        assert!(cfg.entity_auto_merge_threshold > cfg.entity_name_sim_floor);
        assert!(cfg.rrf_overfetch_factor >= 1);
        assert!(cfg.observation_merge_similarity_threshold < 1.0);
    }
}
