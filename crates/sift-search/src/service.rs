//! Hybrid search service.
//!
//! Runs the keyword query and the vector query concurrently, each under its
//! own deadline, then fuses the two rankings. Losing one side degrades the
//! response instead of failing it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sift_core::{EntityKey, EntityType, Error, Result};
use sift_embed::EmbeddingProvider;
use sift_store::{NearestQuery, VectorMatch, VectorStore};
use tracing::{debug, warn};

use crate::config::HybridConfig;
use crate::fusion::{FusedHit, weighted_rrf};
use crate::keyword::{KeywordIndex, KeywordQuery};

/// Per-request search options. Unset fields fall back to [`HybridConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Maximum hits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Floor on vector candidate similarity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_similarity: Option<f32>,
    /// Restrict both sides to one entity type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
}

/// A half of the hybrid query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSide {
    /// The keyword index.
    Keyword,
    /// Embedding plus nearest-neighbour lookup.
    Vector,
}

impl fmt::Display for SearchSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyword => write!(f, "keyword"),
            Self::Vector => write!(f, "vector"),
        }
    }
}

/// Fused search results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Hits, best first.
    pub hits: Vec<FusedHit>,
    /// Set when only one side contributed.
    pub partial: bool,
    /// Sides that failed or timed out.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<SearchSide>,
}

/// Fans a query out to keyword and vector search and fuses the results.
pub struct HybridSearchService {
    provider: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    keyword: Arc<dyn KeywordIndex>,
    config: HybridConfig,
}

impl HybridSearchService {
    /// Create a service, validating `config`.
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        keyword: Arc<dyn KeywordIndex>,
        config: HybridConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            vectors,
            keyword,
            config,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &HybridConfig {
        &self.config
    }

    /// Search for `query`.
    ///
    /// A blank query or a zero limit returns an empty, complete response.
    /// If one side fails or misses its deadline, the other side's ranking is
    /// returned alone with `partial` set. If both fail the search fails with
    /// [`Error::SearchUnavailable`].
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
        let text = query.trim();
        let limit = options.limit.unwrap_or(self.config.default_limit);
        if text.is_empty() || limit == 0 {
            return Ok(SearchResponse::default());
        }

        let candidates = limit.saturating_mul(self.config.candidate_multiplier);
        let min_similarity = options.min_similarity.unwrap_or(self.config.min_similarity);
        let started = Instant::now();

        let keyword_query = KeywordQuery {
            text,
            limit: candidates,
            entity_type: options.entity_type,
        };
        let (keyword, vector) = tokio::join!(
            self.bounded(self.keyword_side(&keyword_query)),
            self.bounded(self.vector_side(text, candidates, min_similarity, options.entity_type)),
        );

        let mut degraded = Vec::new();
        let keyword = match keyword {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Keyword search degraded");
                degraded.push((SearchSide::Keyword, e));
                Vec::new()
            }
        };
        let vector = match vector {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Vector search degraded");
                degraded.push((SearchSide::Vector, e));
                Vec::new()
            }
        };

        if degraded.len() == 2 {
            let mut messages = degraded.into_iter().map(|(_, e)| e);
            return Err(Error::SearchUnavailable {
                keyword: messages.next().unwrap_or_default(),
                vector: messages.next().unwrap_or_default(),
            });
        }

        let hits = weighted_rrf(&keyword, &vector, self.config.alpha, self.config.rrf_k, limit);
        debug!(
            query = text,
            keyword = keyword.len(),
            vector = vector.len(),
            hits = hits.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Hybrid search"
        );

        Ok(SearchResponse {
            hits,
            partial: !degraded.is_empty(),
            degraded: degraded.into_iter().map(|(side, _)| side).collect(),
        })
    }

    async fn bounded<T>(&self, side: impl Future<Output = Result<T>>) -> std::result::Result<T, String> {
        let deadline = self.config.sub_query_timeout();
        match tokio::time::timeout(deadline, side).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}ms", deadline.as_millis())),
        }
    }

    async fn keyword_side(&self, query: &KeywordQuery<'_>) -> Result<Vec<EntityKey>> {
        let mut keys = self.keyword.keyword_search(query).await?;
        if let Some(entity_type) = query.entity_type {
            keys.retain(|k| k.entity_type == entity_type);
        }
        keys.truncate(query.limit);
        Ok(keys)
    }

    async fn vector_side(
        &self,
        text: &str,
        limit: usize,
        min_similarity: f32,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<VectorMatch>> {
        let embedding = self.provider.embed(text).await?;
        self.vectors
            .nearest(&NearestQuery {
                embedding: &embedding,
                model: self.provider.model(),
                limit,
                min_similarity,
                entity_type,
            })
            .await
    }
}

impl fmt::Debug for HybridSearchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridSearchService")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use sift_core::Chunk;
    use sift_embed::MockEmbeddingProvider;
    use sift_store::RedbStore;

    enum Behavior {
        Results(Vec<EntityKey>),
        Fail,
        Hang,
    }

    struct FakeKeywordIndex(Behavior);

    #[async_trait]
    impl KeywordIndex for FakeKeywordIndex {
        async fn keyword_search(&self, query: &KeywordQuery<'_>) -> Result<Vec<EntityKey>> {
            match &self.0 {
                Behavior::Results(keys) => Ok(keys.iter().take(query.limit).cloned().collect()),
                Behavior::Fail => Err(Error::store("index offline")),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
            }
        }
    }

    fn key(entity_type: EntityType, id: &str) -> EntityKey {
        EntityKey::new(entity_type, id)
    }

    fn doc(id: &str) -> EntityKey {
        key(EntityType::Documentation, id)
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    async fn store_entity(store: &RedbStore, key: &EntityKey, embedding: Vec<f32>) {
        let chunk = Chunk {
            key: key.clone(),
            chunk_index: 0,
            text: format!("text of {}", key.entity_id),
            token_count: 3,
            embedding,
            embedding_model: "mock-embedding".into(),
            content_hash: "h".into(),
            created_at: Utc::now(),
        };
        store.replace_entity_chunks(key, vec![chunk]).await.unwrap();
    }

    /// Vector side ranks D, B, A for the query "q"; C has no chunks.
    async fn fixture(keyword: Behavior) -> (HybridSearchService, Arc<MockEmbeddingProvider>) {
        let store = RedbStore::in_memory().unwrap();
        let mock = Arc::new(MockEmbeddingProvider::new(4));
        mock.set_vector("q", vec![1.0, 0.0, 0.0, 0.0]);

        store_entity(&store, &doc("D"), vec![1.0, 0.0, 0.0, 0.0]).await;
        store_entity(&store, &doc("B"), vec![0.9, 0.1, 0.0, 0.0]).await;
        store_entity(&store, &doc("A"), vec![0.7, 0.7, 0.0, 0.0]).await;
        store_entity(&store, &doc("far"), unit(4, 3)).await;
        store_entity(&store, &key(EntityType::Flavor, "F"), vec![1.0, 0.0, 0.0, 0.0]).await;

        let config = HybridConfig {
            sub_query_timeout_ms: 100,
            ..HybridConfig::default()
        };
        let service = HybridSearchService::new(
            mock.clone(),
            Arc::new(store),
            Arc::new(FakeKeywordIndex(keyword)),
            config,
        )
        .unwrap();
        (service, mock)
    }

    fn ids(response: &SearchResponse) -> Vec<&str> {
        response.hits.iter().map(|h| h.key.entity_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_fuses_both_sides() {
        let keyword = Behavior::Results(vec![doc("A"), doc("B"), doc("C")]);
        let (service, _) = fixture(keyword).await;
        let options = SearchOptions {
            entity_type: Some(EntityType::Documentation),
            ..SearchOptions::default()
        };

        let response = service.search("q", &options).await.unwrap();
        assert!(!response.partial);
        assert!(response.degraded.is_empty());
        let ids = ids(&response);
        assert_eq!(ids[0], "B");
        assert!(ids.contains(&"C"));
        assert!(!ids.contains(&"far"), "below the similarity floor");
        assert!(!ids.contains(&"F"), "filtered by entity type");
    }

    #[tokio::test]
    async fn test_blank_query_is_empty() {
        let (service, mock) = fixture(Behavior::Fail).await;
        let response = service.search("   ", &SearchOptions::default()).await.unwrap();
        assert!(response.hits.is_empty());
        assert!(!response.partial);
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_keyword_failure_is_partial() {
        let (service, _) = fixture(Behavior::Fail).await;
        let response = service.search("q", &SearchOptions::default()).await.unwrap();
        assert!(response.partial);
        assert_eq!(response.degraded, vec![SearchSide::Keyword]);
        assert_eq!(ids(&response)[0], "D");
        assert!(response.hits.iter().all(|h| h.keyword_rank.is_none()));
    }

    #[tokio::test]
    async fn test_keyword_timeout_is_partial() {
        let (service, _) = fixture(Behavior::Hang).await;
        let response = service.search("q", &SearchOptions::default()).await.unwrap();
        assert!(response.partial);
        assert_eq!(response.degraded, vec![SearchSide::Keyword]);
        assert!(!response.hits.is_empty());
    }

    #[tokio::test]
    async fn test_vector_failure_is_partial() {
        let (service, mock) = fixture(Behavior::Results(vec![doc("A"), doc("C")])).await;
        mock.set_available(false);
        let response = service.search("q", &SearchOptions::default()).await.unwrap();
        assert!(response.partial);
        assert_eq!(response.degraded, vec![SearchSide::Vector]);
        assert_eq!(ids(&response), vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_both_failing_is_an_error() {
        let (service, mock) = fixture(Behavior::Fail).await;
        mock.set_available(false);
        let err = service.search("q", &SearchOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::SearchUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_limit_and_similarity_override() {
        let (service, _) = fixture(Behavior::Results(vec![])).await;
        let options = SearchOptions {
            limit: Some(2),
            min_similarity: Some(-1.0),
            ..SearchOptions::default()
        };
        let response = service.search("q", &options).await.unwrap();
        assert_eq!(response.hits.len(), 2);

        let options = SearchOptions {
            limit: Some(0),
            ..SearchOptions::default()
        };
        assert!(service.search("q", &options).await.unwrap().hits.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let store = RedbStore::in_memory().unwrap();
        let result = HybridSearchService::new(
            Arc::new(MockEmbeddingProvider::new(4)),
            Arc::new(store),
            Arc::new(FakeKeywordIndex(Behavior::Fail)),
            HybridConfig {
                alpha: 2.0,
                ..HybridConfig::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_response_serializes() {
        let response = SearchResponse {
            hits: Vec::new(),
            partial: true,
            degraded: vec![SearchSide::Vector],
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""degraded":["vector"]"#));
    }
}
