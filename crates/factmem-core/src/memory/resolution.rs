//! Multi-signal entity resolution: name similarity, co-occurrence, and
//! temporal proximity combine into a single composite score used to
//! decide whether a new entity mention should merge into an existing
//! entity or mint a new one.

use chrono::{DateTime, Utc};

use crate::config::MemoryConfig;

const PREFIX_BASE: f64 = 0.7;
const PREFIX_RANGE: f64 = 0.3;
const COOCCURRENCE_THRESHOLD: f64 = 0.8;
const COOCCURRENCE_BASE: f64 = 0.7;
const COOCCURRENCE_NAME_RANGE: f64 = 0.3;
const HIGH_NAME_SIM_THRESHOLD: f64 = 0.95;
const HIGH_NAME_SIM_BASE: f64 = 0.5;

/// Longest-common-subsequence length between two byte slices.
fn lcs_len(a: &[u8], b: &[u8]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for &ac in a {
        for (j, &bc) in b.iter().enumerate() {
            cur[j + 1] = if ac == bc { prev[j] + 1 } else { prev[j + 1].max(cur[j]) };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Name similarity in `[0, 1]`.
///
/// 1.0 on case-insensitive equality; `0.7 + 0.3 * min_len/max_len` when
/// one name is a prefix of the other (case-insensitive); otherwise the
/// character-level LCS ratio.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();

    if a_lower == b_lower {
        return 1.0;
    }

    if a_lower.starts_with(&b_lower) || b_lower.starts_with(&a_lower) {
        let min_len = a_lower.len().min(b_lower.len()) as f64;
        let max_len = a_lower.len().max(b_lower.len()) as f64;
        return PREFIX_BASE + PREFIX_RANGE * (min_len / max_len);
    }

    let lcs = lcs_len(a_lower.as_bytes(), b_lower.as_bytes()) as f64;
    let max_len = a_lower.len().max(b_lower.len()) as f64;
    if max_len == 0.0 {
        0.0
    } else {
        lcs / max_len
    }
}

/// Exponential decay of the absolute difference between `now` and a
/// candidate's last mention, sigma = one week. Returns the configured
/// neutral value when the candidate has no prior mention.
pub fn temporal_proximity_score(
    last_mention: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    sigma_hours: f64,
    neutral: f64,
) -> f64 {
    match last_mention {
        None => neutral,
        Some(t) => {
            let hours = (now - t).num_seconds() as f64 / 3600.0;
            (-hours.abs() / sigma_hours).exp()
        }
    }
}

/// Composite resolution score combining co-occurrence, name similarity,
/// and temporal proximity. Branches on co-occurrence strength because a
/// shared source is a much stronger identity signal than name alone.
pub fn compute_resolution_score(name_sim: f64, co_occurrence: f64, temporal: f64, cfg: &MemoryConfig) -> f64 {
    if co_occurrence >= COOCCURRENCE_THRESHOLD {
        COOCCURRENCE_BASE + COOCCURRENCE_NAME_RANGE * name_sim
    } else if co_occurrence == 0.0 {
        if name_sim >= HIGH_NAME_SIM_THRESHOLD {
            HIGH_NAME_SIM_BASE + cfg.entity_score_temporal_weight * temporal
        } else {
            cfg.entity_score_name_weight * name_sim
        }
    } else {
        cfg.entity_score_cooccurrence_weight * co_occurrence
            + cfg.entity_score_name_weight * name_sim
            + cfg.entity_score_temporal_weight * temporal
    }
}

/// A resolution candidate and its resulting composite score.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub entity_id: i64,
    pub score: f64,
}

/// Ranks candidates by composite score, discarding any below the
/// configured name-similarity floor, and reports whether the top
/// candidate clears the auto-merge threshold.
pub fn resolve(
    candidates: &[(i64, f64, f64, f64)], // (entity_id, name_sim, co_occurrence, temporal)
    cfg: &MemoryConfig,
) -> Option<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = candidates
        .iter()
        .filter(|(_, name_sim, _, _)| *name_sim >= cfg.entity_name_sim_floor)
        .map(|(id, name_sim, cooc, temporal)| ScoredCandidate {
            entity_id: *id,
            score: compute_resolution_score(*name_sim, *cooc, *temporal, cfg),
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
    let top = scored.into_iter().next()?;
    if top.score >= cfg.entity_auto_merge_threshold {
        Some(top)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_one() {
        assert_eq!(name_similarity("Alex", "alex"), 1.0);
    }

    #[test]
    fn prefix_match_scales_with_length_ratio() {
        let score = name_similarity("Alex", "Alexander");
        assert!(score > PREFIX_BASE && score < 1.0);
    }

    #[test]
    fn unrelated_names_score_low() {
        assert!(name_similarity("Alex", "Zephyr") < 0.5);
    }

    #[test]
    fn high_cooccurrence_dominates_score() {
        let cfg = MemoryConfig::default();
        let score = compute_resolution_score(0.7, 1.0, 0.0, &cfg);
        assert!(score > 0.9);
    }

    #[test]
    fn zero_cooccurrence_with_high_name_sim_uses_temporal() {
        let cfg = MemoryConfig::default();
        let score = compute_resolution_score(0.96, 0.0, 1.0, &cfg);
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn resolve_returns_none_below_auto_merge_threshold() {
        let cfg = MemoryConfig::default();
        let candidates = vec![(1, 0.6, 0.0, 0.5)];
        assert!(resolve(&candidates, &cfg).is_none());
    }

    #[test]
    fn resolve_picks_best_candidate_above_threshold() {
        let cfg = MemoryConfig::default();
        let candidates = vec![(1, 0.7, 1.0, 0.5), (2, 0.5, 0.0, 0.5)];
        let result = resolve(&candidates, &cfg).unwrap();
        assert_eq!(result.entity_id, 1);
    }
}
