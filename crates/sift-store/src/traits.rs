//! Storage traits for jobs, chunks, and provider health.
//!
//! The job processor and search service only see these traits. The redb
//! implementation lives in [`crate::redb_store`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sift_core::{Chunk, EmbeddingJob, EntityKey, EntityType, JobRequest, JobStatus, ProviderHealth, Result};

// ============================================================================
// Result types
// ============================================================================

/// What `enqueue` did with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// A new `PENDING` job was created.
    Created(EmbeddingJob),
    /// The request was folded into an existing non-terminal job.
    Merged(EmbeddingJob),
}

impl EnqueueOutcome {
    /// The job the request ended up in.
    pub fn job(&self) -> &EmbeddingJob {
        match self {
            Self::Created(job) | Self::Merged(job) => job,
        }
    }

    /// Consume into the job.
    pub fn into_job(self) -> EmbeddingJob {
        match self {
            Self::Created(job) | Self::Merged(job) => job,
        }
    }
}

/// What `cancel` did.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The job was pending and is now `CANCELLED`.
    Cancelled(EmbeddingJob),
    /// The job is in flight; it will be cancelled if it is requeued.
    Deferred(EmbeddingJob),
    /// No non-terminal job exists for the entity.
    NotFound,
}

/// Job totals by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    /// `PENDING` jobs.
    pub pending: u64,
    /// `IN_PROGRESS` jobs.
    pub in_progress: u64,
    /// `RETRY_PENDING` jobs.
    pub retry_pending: u64,
    /// `COMPLETED` jobs.
    pub completed: u64,
    /// `FAILED` jobs.
    pub failed: u64,
    /// `CANCELLED` jobs.
    pub cancelled: u64,
}

impl JobCounts {
    /// Count one job.
    pub fn add(&mut self, status: JobStatus) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::InProgress => &mut self.in_progress,
            JobStatus::RetryPending => &mut self.retry_pending,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }

    /// Jobs that still have work to do.
    pub fn active(&self) -> u64 {
        self.pending + self.in_progress + self.retry_pending
    }

    /// All jobs.
    pub fn total(&self) -> u64 {
        self.active() + self.completed + self.failed + self.cancelled
    }
}

/// Chunk totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStats {
    /// Entities with at least one chunk.
    pub entities: u64,
    /// Stored chunks.
    pub chunks: u64,
    /// Entities per embedding model.
    pub models: BTreeMap<String, u64>,
    /// Entities per entity type.
    pub entity_types: BTreeMap<String, u64>,
}

/// What the store knows about an entity's current chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFingerprint {
    /// Hash of the text the chunks were derived from.
    pub content_hash: String,
    /// Model that produced the vectors.
    pub embedding_model: String,
    /// Vector length.
    pub dimension: usize,
    /// Number of chunks.
    pub chunk_count: u32,
    /// Time the chunk set was written.
    pub updated_at: DateTime<Utc>,
}

/// A nearest-neighbour query.
#[derive(Debug, Clone)]
pub struct NearestQuery<'a> {
    /// Query vector.
    pub embedding: &'a [f32],
    /// Only chunks produced by this model are comparable.
    pub model: &'a str,
    /// Maximum entities to return.
    pub limit: usize,
    /// Floor on cosine similarity.
    pub min_similarity: f32,
    /// Restrict to one entity type.
    pub entity_type: Option<EntityType>,
}

/// One entity matched by a vector query, represented by its best chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    /// Matched entity.
    pub key: EntityKey,
    /// Best-matching chunk.
    pub chunk_index: u32,
    /// Text of the best-matching chunk.
    pub text: String,
    /// Cosine similarity of the best-matching chunk.
    pub similarity: f32,
}

// ============================================================================
// Traits
// ============================================================================

/// Durable embedding job queue with an enforced state machine.
///
/// Every mutating operation runs in one serialized write transaction, so
/// claims are compare-and-set: no two callers can obtain the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a `PENDING` job, or fold the request into the entity's existing
    /// non-terminal job.
    async fn enqueue(&self, request: JobRequest, now: DateTime<Utc>) -> Result<EnqueueOutcome>;

    /// Claim up to `limit` eligible jobs bound to `provider`, ordered by
    /// priority then id, moving them to `IN_PROGRESS`.
    async fn claim_batch(
        &self,
        provider: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<EmbeddingJob>>;

    /// `IN_PROGRESS → COMPLETED`.
    async fn complete(&self, id: u64, now: DateTime<Utc>) -> Result<EmbeddingJob>;

    /// `IN_PROGRESS → RETRY_PENDING` (or `CANCELLED` if cancellation was
    /// requested while running).
    async fn reschedule(
        &self,
        id: u64,
        error: &str,
        next_retry_at: DateTime<Utc>,
        consume_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<EmbeddingJob>;

    /// `IN_PROGRESS → FAILED`.
    async fn fail(
        &self,
        id: u64,
        error: &str,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<EmbeddingJob>;

    /// Cancel the entity's non-terminal job.
    async fn cancel(&self, key: &EntityKey, now: DateTime<Utc>) -> Result<CancelOutcome>;

    /// Look up a job by id.
    async fn get_job(&self, id: u64) -> Result<Option<EmbeddingJob>>;

    /// The most recent job for an entity, terminal or not.
    async fn latest_job_for(&self, key: &EntityKey) -> Result<Option<EmbeddingJob>>;

    /// Make jobs paused for unavailability eligible immediately.
    async fn release_paused(&self, provider: &str, now: DateTime<Utc>) -> Result<usize>;

    /// Requeue jobs left `IN_PROGRESS` by an unclean shutdown, without
    /// consuming a retry.
    async fn recover_in_flight(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Totals by status.
    async fn job_counts(&self) -> Result<JobCounts>;

    /// Most recent jobs first, optionally filtered by status.
    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize)
    -> Result<Vec<EmbeddingJob>>;

    /// Earliest time a job bound to `provider` becomes eligible.
    async fn next_due_at(&self, provider: &str) -> Result<Option<DateTime<Utc>>>;

    /// Delete terminal jobs that finished before `before`.
    async fn prune_terminal(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Chunk persistence and nearest-neighbour search.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Atomically replace every chunk of `key` with `chunks`.
    ///
    /// All chunks must belong to `key`, share one model, dimension and
    /// content hash, and be indexed `0..n`. An empty set deletes.
    async fn replace_entity_chunks(&self, key: &EntityKey, chunks: Vec<Chunk>) -> Result<()>;

    /// Delete every chunk of `key`. Returns the number removed.
    async fn delete_entity_chunks(&self, key: &EntityKey) -> Result<usize>;

    /// Chunks of `key` in index order.
    async fn entity_chunks(&self, key: &EntityKey) -> Result<Vec<Chunk>>;

    /// Hash, model and shape of `key`'s stored chunks.
    async fn fingerprint(&self, key: &EntityKey) -> Result<Option<EntityFingerprint>>;

    /// Whether the stored chunks were derived from `content_hash` by `model`.
    async fn is_fresh(&self, key: &EntityKey, content_hash: &str, model: &str) -> Result<bool> {
        Ok(self
            .fingerprint(key)
            .await?
            .is_some_and(|f| f.content_hash == content_hash && f.embedding_model == model))
    }

    /// Entities most similar to the query vector, best first.
    async fn nearest(&self, query: &NearestQuery<'_>) -> Result<Vec<VectorMatch>>;

    /// Totals.
    async fn chunk_stats(&self) -> Result<ChunkStats>;
}

/// Provider health rows, keyed by provider name.
#[async_trait]
pub trait HealthStore: Send + Sync {
    /// Insert or replace a provider's row.
    async fn upsert_health(&self, health: &ProviderHealth) -> Result<()>;

    /// One provider's row.
    async fn get_health(&self, provider: &str) -> Result<Option<ProviderHealth>>;

    /// Every provider's row.
    async fn list_health(&self) -> Result<Vec<ProviderHealth>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_counts() {
        let mut counts = JobCounts::default();
        counts.add(JobStatus::Pending);
        counts.add(JobStatus::RetryPending);
        counts.add(JobStatus::Completed);
        counts.add(JobStatus::Failed);
        assert_eq!(counts.active(), 2);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_traits_object_safe() {
        fn _jobs(_: &dyn JobStore) {}
        fn _vectors(_: &dyn VectorStore) {}
        fn _health(_: &dyn HealthStore) {}
    }
}
