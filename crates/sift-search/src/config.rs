//! Hybrid search configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sift_core::{Error, Result};

/// Default RRF constant.
pub const DEFAULT_RRF_K: u32 = 60;

/// Settings for [`HybridSearchService`](crate::HybridSearchService).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    /// Keyword weight in fusion; the vector side gets `1 - alpha`.
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Vector candidates below this cosine similarity are dropped before
    /// fusion.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,

    /// RRF constant `k`.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,

    /// Deadline for each sub-query, in milliseconds.
    #[serde(default = "default_sub_query_timeout_ms")]
    pub sub_query_timeout_ms: u64,

    /// Each side fetches `limit * candidate_multiplier` candidates.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,

    /// Result count when the caller does not ask for one.
    #[serde(default = "default_limit")]
    pub default_limit: usize,
}

fn default_alpha() -> f64 {
    0.3
}

fn default_min_similarity() -> f32 {
    0.5
}

fn default_rrf_k() -> u32 {
    DEFAULT_RRF_K
}

fn default_sub_query_timeout_ms() -> u64 {
    5_000
}

fn default_candidate_multiplier() -> usize {
    2
}

fn default_limit() -> usize {
    10
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            min_similarity: default_min_similarity(),
            rrf_k: default_rrf_k(),
            sub_query_timeout_ms: default_sub_query_timeout_ms(),
            candidate_multiplier: default_candidate_multiplier(),
            default_limit: default_limit(),
        }
    }
}

impl HybridConfig {
    /// Per-side deadline.
    pub fn sub_query_timeout(&self) -> Duration {
        Duration::from_millis(self.sub_query_timeout_ms)
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(Error::config(format!(
                "search.alpha must be within [0, 1], got {}",
                self.alpha
            )));
        }
        if !(-1.0..=1.0).contains(&self.min_similarity) {
            return Err(Error::config(format!(
                "search.min_similarity must be within [-1, 1], got {}",
                self.min_similarity
            )));
        }
        if self.sub_query_timeout_ms == 0 {
            return Err(Error::config("search.sub_query_timeout_ms must be at least 1"));
        }
        if self.candidate_multiplier == 0 {
            return Err(Error::config("search.candidate_multiplier must be at least 1"));
        }
        Ok(())
    }
}
