//! Embedding service: the entry point other components call.
//!
//! Enqueues jobs on request or in reaction to content events, schedules
//! corpus-wide syncs, and answers status questions. It never embeds
//! anything itself; the [`JobProcessor`](crate::JobProcessor) does.

use chrono::Utc;
use serde::Serialize;
use sift_core::{
    ContentEvent, EmbeddingJob, EntityKey, EntityType, JobRequest, JobType, ProviderHealth,
    Result, priority,
};
use sift_store::{CancelOutcome, ChunkStats, EnqueueOutcome, JobCounts};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::processor::SyncContext;

/// What [`EmbeddingService::handle_event`] did with an event.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    /// A job was created or merged.
    Queued(EnqueueOutcome),
    /// Stored chunks already match the new content.
    AlreadyFresh,
    /// The entity was deleted; this many chunks were removed.
    Removed(usize),
}

/// Result of [`EmbeddingService::sync_corpus`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    /// Entities the content source listed.
    pub listed: usize,
    /// New jobs created.
    pub created: usize,
    /// Requests folded into existing jobs.
    pub merged: usize,
    /// Entities skipped because their chunks were already fresh.
    pub fresh: usize,
}

/// Combined queue, store, and provider statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    /// Provider name.
    pub provider: String,
    /// Model new chunks are tagged with.
    pub model: String,
    /// Jobs by status.
    pub jobs: JobCounts,
    /// Stored chunks.
    pub chunks: ChunkStats,
    /// Current health of the provider.
    pub health: ProviderHealth,
}

/// Enqueues and inspects embedding work.
#[derive(Debug, Clone)]
pub struct EmbeddingService {
    ctx: SyncContext,
    max_retries: u32,
}

impl EmbeddingService {
    /// Create a service. `max_retries` is the retry budget given to new jobs.
    pub fn new(ctx: SyncContext, max_retries: u32) -> Self {
        Self { ctx, max_retries }
    }

    /// Queue a single-entity job, or fold the request into the entity's
    /// active job.
    pub async fn enqueue_embedding_job(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        priority: i32,
    ) -> Result<EnqueueOutcome> {
        let key = EntityKey::new(entity_type, entity_id);
        self.enqueue(key, JobType::SingleEntity, priority).await
    }

    /// Queue a job of any type.
    pub async fn enqueue(
        &self,
        key: EntityKey,
        job_type: JobType,
        priority: i32,
    ) -> Result<EnqueueOutcome> {
        key.validate()?;
        let request = JobRequest {
            key,
            job_type,
            priority,
            provider: self.ctx.provider.name().to_string(),
            model: self.ctx.provider.model().to_string(),
            max_retries: self.max_retries,
        };
        let outcome = self.ctx.jobs.enqueue(request, Utc::now()).await?;
        match &outcome {
            EnqueueOutcome::Created(job) => {
                debug!(id = job.id, entity = %job.key, priority = job.priority, "Job queued");
            }
            EnqueueOutcome::Merged(job) => {
                debug!(id = job.id, entity = %job.key, priority = job.priority, "Request merged");
            }
        }
        self.ctx.wakeup.notify_one();
        Ok(outcome)
    }

    /// React to a change in the content store.
    pub async fn handle_event(&self, event: ContentEvent) -> Result<EventOutcome> {
        match event {
            ContentEvent::Changed { key, content_hash } => {
                if self
                    .ctx
                    .vectors
                    .is_fresh(&key, &content_hash, self.ctx.provider.model())
                    .await?
                {
                    debug!(entity = %key, "Content unchanged");
                    return Ok(EventOutcome::AlreadyFresh);
                }
                let outcome = self
                    .enqueue(key, JobType::Incremental, priority::INCREMENTAL)
                    .await?;
                Ok(EventOutcome::Queued(outcome))
            }
            ContentEvent::Deleted { key } => {
                key.validate()?;
                if let CancelOutcome::Cancelled(job) | CancelOutcome::Deferred(job) =
                    self.ctx.jobs.cancel(&key, Utc::now()).await?
                {
                    debug!(id = job.id, entity = %key, "Cancelled job for deleted entity");
                }
                let removed = self.ctx.vectors.delete_entity_chunks(&key).await?;
                info!(entity = %key, removed, "Entity deleted");
                Ok(EventOutcome::Removed(removed))
            }
        }
    }

    /// Handle events from `events` until the channel closes or `shutdown`
    /// flips to `true`. A failing event is logged and skipped.
    pub async fn consume_events(
        &self,
        mut events: mpsc::Receiver<ContentEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> usize {
        let mut handled = 0;
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let key = event.key().clone();
            match self.handle_event(event).await {
                Ok(_) => handled += 1,
                Err(e) => warn!(entity = %key, error = %e, "Failed to handle content event"),
            }
        }
        handled
    }

    /// Queue every entity the content source lists.
    ///
    /// `Incremental` skips entities whose chunks are already fresh;
    /// `FullSync` queues everything and forces re-embedding.
    pub async fn sync_corpus(
        &self,
        entity_type: Option<EntityType>,
        job_type: JobType,
    ) -> Result<SyncSummary> {
        let types: Vec<EntityType> = match entity_type {
            Some(t) => vec![t],
            None => EntityType::ALL.to_vec(),
        };
        let mut summary = SyncSummary::default();

        for entity_type in types {
            let keys = self.ctx.content.list_entities(entity_type).await?;
            summary.listed += keys.len();
            for key in keys {
                if job_type == JobType::Incremental && self.is_fresh(&key).await? {
                    summary.fresh += 1;
                    continue;
                }
                match self.enqueue(key, job_type, job_type.default_priority()).await? {
                    EnqueueOutcome::Created(_) => summary.created += 1,
                    EnqueueOutcome::Merged(_) => summary.merged += 1,
                }
            }
        }

        info!(
            ?job_type,
            listed = summary.listed,
            created = summary.created,
            merged = summary.merged,
            fresh = summary.fresh,
            "Corpus sync scheduled"
        );
        Ok(summary)
    }

    /// Most recent job for an entity.
    pub async fn get_job_status(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<EmbeddingJob>> {
        let key = EntityKey::new(entity_type, entity_id);
        key.validate()?;
        self.ctx.jobs.latest_job_for(&key).await
    }

    /// Cancel an entity's active job. A running job is cancelled when its
    /// attempt ends.
    pub async fn cancel_job(&self, entity_type: EntityType, entity_id: &str) -> Result<CancelOutcome> {
        let key = EntityKey::new(entity_type, entity_id);
        key.validate()?;
        self.ctx.jobs.cancel(&key, Utc::now()).await
    }

    /// Persisted health rows for every provider seen.
    pub async fn get_provider_health(&self) -> Result<Vec<ProviderHealth>> {
        self.ctx.monitor.history().await
    }

    /// Queue, chunk, and health statistics.
    pub async fn stats(&self) -> Result<ServiceStats> {
        Ok(ServiceStats {
            provider: self.ctx.provider.name().to_string(),
            model: self.ctx.provider.model().to_string(),
            jobs: self.ctx.jobs.job_counts().await?,
            chunks: self.ctx.vectors.chunk_stats().await?,
            health: self.ctx.monitor.current().await,
        })
    }

    async fn is_fresh(&self, key: &EntityKey) -> Result<bool> {
        match self.ctx.content.get_content(key).await? {
            Some(content) => {
                self.ctx
                    .vectors
                    .is_fresh(key, &content.content_hash, self.ctx.provider.model())
                    .await
            }
            None => Ok(false),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
