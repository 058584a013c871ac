//! The keyword side of hybrid search.
//!
//! Ranking internals belong to the keyword index; this crate only consumes
//! its ordered result list.

use async_trait::async_trait;
use sift_core::{EntityKey, EntityType, Result};

/// A keyword query.
#[derive(Debug, Clone)]
pub struct KeywordQuery<'a> {
    /// Query text, already trimmed.
    pub text: &'a str,
    /// Maximum results wanted.
    pub limit: usize,
    /// Restrict to one entity type.
    pub entity_type: Option<EntityType>,
}

/// A full-text index that returns entities in relevance order.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    /// Entities matching `query`, best first.
    async fn keyword_search(&self, query: &KeywordQuery<'_>) -> Result<Vec<EntityKey>>;
}
