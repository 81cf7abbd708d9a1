use std::cmp::Ordering;
use std::collections::HashMap;

/// Constant in the reciprocal-rank denominator. The usual literature value;
/// large enough that rank differences deep in the list stay gentle.
const RRF_K: f32 = 60.0;

pub const fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

/// Merge several ranked id lists with reciprocal-rank fusion, then normalise
/// the fused scores to [0,1]. Input lists are best-first.
pub fn reciprocal_rank_fusion(rankings: &[Vec<String>]) -> HashMap<String, f32> {
    let mut fused: HashMap<String, f32> = HashMap::new();

    for ranking in rankings {
        for (rank, id) in ranking.iter().enumerate() {
            let contribution = 1.0 / (RRF_K + rank as f32 + 1.0);
            *fused.entry(id.clone()).or_insert(0.0) += contribution;
        }
    }

    if fused.is_empty() {
        return fused;
    }

    let max = fused.values().fold(f32::MIN, |a, &b| a.max(b));
    let min = fused.values().fold(f32::MAX, |a, &b| a.min(b));
    if (max - min).abs() < f32::EPSILON {
        for value in fused.values_mut() {
            *value = 1.0;
        }
        return fused;
    }

    for value in fused.values_mut() {
        *value = clamp_unit((*value - min) / (max - min));
    }
    fused
}

/// Sort best-first with a stable id tiebreak so equal scores don't jitter
/// between runs.
pub fn sort_scored_desc<T, F, G>(items: &mut [T], score_of: F, id_of: G)
where
    F: Fn(&T) -> f32,
    G: Fn(&T) -> &str,
{
    items.sort_by(|a, b| {
        score_of(b)
            .partial_cmp(&score_of(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| id_of(a).cmp(id_of(b)))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrf_prefers_items_present_in_both_rankings() {
        let dense = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let keyword = vec!["b".to_string(), "d".to_string()];

        let fused = reciprocal_rank_fusion(&[dense, keyword]);

        // "b" appears in both lists; it must beat everything ranked once.
        let b = fused["b"];
        assert!(b > fused["a"]);
        assert!(b > fused["c"]);
        assert!(b > fused["d"]);
        assert!(fused.values().all(|s| (0.0..=1.0).contains(s)));
    }

    #[test]
    fn rrf_of_single_list_preserves_order() {
        let only = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        let fused = reciprocal_rank_fusion(&[only]);
        assert!(fused["x"] > fused["y"]);
        assert!(fused["y"] > fused["z"]);
    }

    #[test]
    fn rrf_handles_empty_input() {
        assert!(reciprocal_rank_fusion(&[]).is_empty());
        assert!(reciprocal_rank_fusion(&[Vec::new()]).is_empty());
    }

    #[test]
    fn sort_is_descending_with_stable_tiebreak() {
        let mut items = vec![("b", 0.5f32), ("a", 0.5), ("c", 0.9)];
        sort_scored_desc(&mut items, |i| i.1, |i| i.0);
        assert_eq!(items[0].0, "c");
        assert_eq!(items[1].0, "a");
        assert_eq!(items[2].0, "b");
    }
}
