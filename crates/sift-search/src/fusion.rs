//! Weighted Reciprocal Rank Fusion.
//!
//! Merges a keyword ranking and a vector ranking into one list.
//!
//! # Algorithm
//!
//! For an entity at 1-based rank `r` in a list with weight `w`, the
//! contribution is `w / (k + r)`. The keyword list has weight `alpha`, the
//! vector list `1 - alpha`. Contributions are summed per entity over the
//! union of both lists.
//!
//! Ties are broken by keyword rank (entities present in the keyword list
//! first, lower rank first), then by vector rank, then by entity key, so
//! the output order is fully deterministic.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sift_core::EntityKey;
use sift_store::VectorMatch;

/// Which lists an entity was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitSource {
    /// Keyword list only.
    Keyword,
    /// Vector list only.
    Vector,
    /// Both lists.
    Hybrid,
}

/// One fused result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedHit {
    /// Matched entity.
    pub key: EntityKey,
    /// Summed weighted RRF score (higher is better).
    pub score: f64,
    /// 1-based keyword rank.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_rank: Option<usize>,
    /// 1-based vector rank.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_rank: Option<usize>,
    /// Cosine similarity of the best chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    /// Text of the best chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl FusedHit {
    /// Which lists contributed.
    pub fn source(&self) -> HitSource {
        match (self.keyword_rank.is_some(), self.vector_rank.is_some()) {
            (true, true) => HitSource::Hybrid,
            (false, true) => HitSource::Vector,
            _ => HitSource::Keyword,
        }
    }
}

/// RRF contribution of a 1-based `rank` in a list with `weight`.
pub fn rrf_contribution(weight: f64, k: u32, rank: usize) -> f64 {
    weight / (f64::from(k) + rank as f64)
}

/// Fuse `keyword` and `vector` rankings.
///
/// Duplicate keys within one list keep their first (best) rank. The result
/// holds at most `limit` entries.
pub fn weighted_rrf(
    keyword: &[EntityKey],
    vector: &[VectorMatch],
    alpha: f64,
    k: u32,
    limit: usize,
) -> Vec<FusedHit> {
    let mut hits: HashMap<&EntityKey, FusedHit> = HashMap::new();

    for (i, key) in keyword.iter().enumerate() {
        let rank = i + 1;
        let hit = hits.entry(key).or_insert_with(|| empty_hit(key));
        if hit.keyword_rank.is_none() {
            hit.keyword_rank = Some(rank);
            hit.score += rrf_contribution(alpha, k, rank);
        }
    }

    let vector_weight = 1.0 - alpha;
    for (i, candidate) in vector.iter().enumerate() {
        let rank = i + 1;
        let hit = hits
            .entry(&candidate.key)
            .or_insert_with(|| empty_hit(&candidate.key));
        if hit.vector_rank.is_none() {
            hit.vector_rank = Some(rank);
            hit.similarity = Some(candidate.similarity);
            hit.snippet = Some(candidate.text.clone());
            hit.score += rrf_contribution(vector_weight, k, rank);
        }
    }

    let mut fused: Vec<FusedHit> = hits.into_values().collect();
    fused.sort_by(compare_hits);
    fused.truncate(limit);
    fused
}

fn empty_hit(key: &EntityKey) -> FusedHit {
    FusedHit {
        key: key.clone(),
        score: 0.0,
        keyword_rank: None,
        vector_rank: None,
        similarity: None,
        snippet: None,
    }
}

fn compare_hits(a: &FusedHit, b: &FusedHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| compare_rank(a.keyword_rank, b.keyword_rank))
        .then_with(|| compare_rank(a.vector_rank, b.vector_rank))
        .then_with(|| a.key.cmp(&b.key))
}

// Present before absent, then ascending.
fn compare_rank(a: Option<usize>, b: Option<usize>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sift_core::EntityType;

    fn key(id: &str) -> EntityKey {
        EntityKey::new(EntityType::Documentation, id)
    }

    fn keywords(ids: &[&str]) -> Vec<EntityKey> {
        ids.iter().map(|id| key(id)).collect()
    }

    fn vectors(ids: &[&str]) -> Vec<VectorMatch> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| VectorMatch {
                key: key(id),
                chunk_index: 0,
                text: format!("chunk of {id}"),
                similarity: 0.9 - i as f32 * 0.1,
            })
            .collect()
    }

    fn ids(hits: &[FusedHit]) -> Vec<&str> {
        hits.iter().map(|h| h.key.entity_id.as_str()).collect()
    }

    #[test]
    fn test_worked_example_ordering() {
        let results = weighted_rrf(
            &keywords(&["A", "B", "C"]),
            &vectors(&["B", "D", "A"]),
            0.5,
            60,
            10,
        );
        assert_eq!(ids(&results), vec!["B", "A", "D", "C"]);

        let a = results.iter().find(|h| h.key.entity_id == "A").unwrap();
        let b = results.iter().find(|h| h.key.entity_id == "B").unwrap();
        assert!((a.score - (0.5 / 61.0 + 0.5 / 63.0)).abs() < 1e-12);
        assert!((b.score - (0.5 / 62.0 + 0.5 / 61.0)).abs() < 1e-12);
        assert_eq!(a.source(), HitSource::Hybrid);
    }

    #[test]
    fn test_union_not_intersection() {
        let results = weighted_rrf(&keywords(&["k"]), &vectors(&["v"]), 0.3, 60, 10);
        assert_eq!(results.len(), 2);
        // Vector weight 0.7 beats keyword weight 0.3 at equal rank.
        assert_eq!(ids(&results), vec!["v", "k"]);
        assert_eq!(results[0].source(), HitSource::Vector);
        assert_eq!(results[1].source(), HitSource::Keyword);
    }

    #[test]
    fn test_single_side() {
        let results = weighted_rrf(&[], &vectors(&["a", "b"]), 0.3, 60, 10);
        assert_eq!(ids(&results), vec!["a", "b"]);
        assert_eq!(results[0].snippet.as_deref(), Some("chunk of a"));

        let results = weighted_rrf(&keywords(&["x", "y"]), &[], 0.3, 60, 10);
        assert_eq!(ids(&results), vec!["x", "y"]);
        assert!(results.iter().all(|h| h.similarity.is_none()));
    }

    #[test]
    fn test_ties_prefer_keyword_rank() {
        // alpha 0.5: keyword rank 1 and vector rank 1 contribute equally.
        let results = weighted_rrf(&keywords(&["k"]), &vectors(&["v"]), 0.5, 60, 10);
        assert_eq!(ids(&results), vec!["k", "v"]);
    }

    #[test]
    fn test_ties_fall_back_to_vector_rank() {
        // alpha 1.0 zeroes every vector contribution.
        let results = weighted_rrf(&[], &vectors(&["b", "a"]), 1.0, 60, 10);
        assert_eq!(ids(&results), vec!["b", "a"]);
        assert!(results.iter().all(|h| h.score == 0.0));
    }

    #[test]
    fn test_duplicates_keep_best_rank() {
        let results = weighted_rrf(&keywords(&["a", "b", "a"]), &[], 0.5, 60, 10);
        assert_eq!(results.len(), 2);
        let a = &results[0];
        assert_eq!(a.keyword_rank, Some(1));
        assert!((a.score - 0.5 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_limit() {
        let results = weighted_rrf(
            &keywords(&["a", "b", "c"]),
            &vectors(&["d", "e", "f"]),
            0.3,
            60,
            2,
        );
        assert_eq!(results.len(), 2);
        assert!(weighted_rrf(&[], &[], 0.3, 60, 10).is_empty());
    }

    #[test]
    fn test_k_parameter_effect() {
        let k1 = weighted_rrf(&keywords(&["a"]), &vectors(&["a"]), 0.5, 1, 10);
        let k60 = weighted_rrf(&keywords(&["a"]), &vectors(&["a"]), 0.5, 60, 10);
        assert!((k1[0].score - 0.5).abs() < 1e-12);
        assert!(k1[0].score > k60[0].score);
    }
}
