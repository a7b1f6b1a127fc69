//! Reciprocal rank fusion over ranked candidate lists.

use std::collections::HashMap;

/// Fuses any number of ranked lists by reciprocal rank: each item at
/// 0-based rank `r` in a list contributes `1 / (k + r + 1)` to its
/// running total. Items absent from a list simply don't receive that
/// list's contribution. Returned in descending score order.
pub fn reciprocal_rank_fusion(ranked_lists: &[Vec<i64>], k: f64) -> Vec<(i64, f64)> {
    let mut scores: HashMap<i64, f64> = HashMap::new();

    for list in ranked_lists {
        for (rank, id) in list.iter().enumerate() {
            *scores.entry(*id).or_default() += 1.0 / (k + rank as f64 + 1.0);
        }
    }

    let mut results: Vec<(i64, f64)> = scores.into_iter().collect();
    results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_in_both_lists_outrank_single_appearances() {
        let vector = vec![2, 1, 4];
        let fts = vec![1, 3, 2];
        let fused = reciprocal_rank_fusion(&[vector, fts], 60.0);
        let pos = |id: i64| fused.iter().position(|(x, _)| *x == id).unwrap();
        assert!(pos(1) < pos(4));
        assert!(pos(2) < pos(4));
    }

    #[test]
    fn empty_lists_produce_no_results() {
        let fused = reciprocal_rank_fusion(&[], 60.0);
        assert!(fused.is_empty());
    }

    #[test]
    fn single_list_preserves_its_order() {
        let fused = reciprocal_rank_fusion(&[vec![5, 9, 1]], 60.0);
        assert_eq!(fused.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![5, 9, 1]);
    }
}
