//! Job processor: a dispatcher feeding a fixed pool of workers.
//!
//! The dispatcher claims work only while the provider is available and only
//! as much as the pool has free capacity for. Each worker runs one job at a
//! time: fetch content, skip if the stored chunks are already fresh,
//! otherwise chunk, embed, and replace the entity's chunks atomically.
//! Failures are classified and routed through [`RetryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use sift_core::{Chunk, ContentSource, EmbeddingJob, Error, JobStatus, JobType, Result};
use sift_embed::{ChunkingConfig, Chunker, EmbeddingProvider, embed_in_batches};
use sift_store::{JobStore, VectorStore};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::backoff::{RetryDecision, RetryPolicy};
use crate::config::{JobConfig, RetryConfig};
use crate::health::HealthMonitor;

const MIN_IDLE: Duration = Duration::from_millis(10);

// ============================================================================
// Shared context
// ============================================================================

/// Everything the processor and the service share.
#[derive(Clone)]
pub struct SyncContext {
    /// Job queue.
    pub jobs: Arc<dyn JobStore>,
    /// Chunk and vector storage.
    pub vectors: Arc<dyn VectorStore>,
    /// Where entity text comes from.
    pub content: Arc<dyn ContentSource>,
    /// The configured embedding provider.
    pub provider: Arc<dyn EmbeddingProvider>,
    /// Health of `provider`.
    pub monitor: Arc<HealthMonitor>,
    /// Signalled whenever new work is queued.
    pub wakeup: Arc<Notify>,
}

impl SyncContext {
    /// Build a context with a fresh wakeup signal.
    pub fn new(
        jobs: Arc<dyn JobStore>,
        vectors: Arc<dyn VectorStore>,
        content: Arc<dyn ContentSource>,
        provider: Arc<dyn EmbeddingProvider>,
        monitor: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            jobs,
            vectors,
            content,
            provider,
            monitor,
            wakeup: Arc::new(Notify::new()),
        }
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("provider", &self.provider.name())
            .field("model", &self.provider.model())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// How a single job ended up after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// New chunks were written.
    Embedded {
        /// Chunks stored for the entity.
        chunks: usize,
    },
    /// Stored chunks already matched the content and model.
    Skipped,
    /// Content was gone or blank, so the entity's chunks were removed.
    Removed,
    /// Back to `RETRY_PENDING`.
    Requeued {
        /// Whether the job is waiting on provider availability.
        paused: bool,
    },
    /// Ended `FAILED`.
    Failed,
    /// Ended `CANCELLED` after a cancel arrived mid-flight.
    Cancelled,
    /// The store rejected the state change; the job stays in flight until
    /// the next startup recovers it.
    Errored,
}

/// Tally of job outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessStats {
    /// Jobs claimed.
    pub claimed: usize,
    /// Jobs that wrote chunks.
    pub embedded: usize,
    /// Chunks written in total.
    pub chunks: usize,
    /// Jobs skipped as already fresh.
    pub skipped: usize,
    /// Jobs whose entity had no content.
    pub removed: usize,
    /// Jobs requeued after a recoverable failure.
    pub retried: usize,
    /// Jobs paused for provider unavailability.
    pub paused: usize,
    /// Jobs that failed terminally.
    pub failed: usize,
    /// Jobs cancelled mid-flight.
    pub cancelled: usize,
    /// Jobs whose final state could not be recorded.
    pub errors: usize,
    /// Set when a pass stopped because the provider was unavailable.
    pub provider_unavailable: bool,
}

impl ProcessStats {
    /// Count one outcome.
    pub fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Embedded { chunks } => {
                self.embedded += 1;
                self.chunks += chunks;
            }
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Removed => self.removed += 1,
            JobOutcome::Requeued { paused: true } => self.paused += 1,
            JobOutcome::Requeued { paused: false } => self.retried += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Cancelled => self.cancelled += 1,
            JobOutcome::Errored => self.errors += 1,
        }
    }

    /// Fold another tally into this one.
    pub fn merge(&mut self, other: &ProcessStats) {
        self.claimed += other.claimed;
        self.embedded += other.embedded;
        self.chunks += other.chunks;
        self.skipped += other.skipped;
        self.removed += other.removed;
        self.retried += other.retried;
        self.paused += other.paused;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.errors += other.errors;
        self.provider_unavailable |= other.provider_unavailable;
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Settings for a [`JobProcessor`].
#[derive(Debug, Clone, Default)]
pub struct ProcessorSettings {
    /// Pool and polling.
    pub jobs: JobConfig,
    /// Job-level retries.
    pub retry: RetryConfig,
    /// Chunk sizing.
    pub chunking: ChunkingConfig,
    /// Texts per provider call. Zero means one call per job.
    pub embed_batch_size: usize,
}

/// Claims embedding jobs and runs them on a worker pool.
#[derive(Debug)]
pub struct JobProcessor {
    ctx: SyncContext,
    chunker: Chunker,
    policy: RetryPolicy,
    config: JobConfig,
    embed_batch_size: usize,
}

impl JobProcessor {
    /// Create a processor, validating its settings.
    pub fn new(ctx: SyncContext, settings: ProcessorSettings) -> Result<Self> {
        settings.jobs.validate()?;
        settings.retry.validate()?;
        let chunker = Chunker::from_config(&settings.chunking)?;
        Ok(Self {
            ctx,
            chunker,
            policy: RetryPolicy::new(settings.retry),
            config: settings.jobs,
            embed_batch_size: settings.embed_batch_size,
        })
    }

    /// Drain everything currently due, then return.
    ///
    /// Stops early when the provider becomes unavailable; paused jobs stay
    /// queued for a later pass.
    pub async fn run_once(&self) -> Result<ProcessStats> {
        let mut stats = ProcessStats::default();
        loop {
            if !self.ctx.monitor.is_available().await {
                stats.provider_unavailable = true;
                break;
            }
            let batch = self
                .ctx
                .jobs
                .claim_batch(self.ctx.provider.name(), self.config.batch_size, Utc::now())
                .await?;
            if batch.is_empty() {
                break;
            }
            stats.claimed += batch.len();
            let outcomes: Vec<JobOutcome> = stream::iter(batch)
                .map(|job| self.run_job(job))
                .buffer_unordered(self.config.workers)
                .collect()
                .await;
            for outcome in outcomes {
                stats.record(outcome);
            }
        }
        Ok(stats)
    }

    /// Run the dispatcher and worker pool until `shutdown` flips to `true`.
    ///
    /// Jobs left `IN_PROGRESS` by a previous run are recovered first. On
    /// shutdown the dispatcher stops claiming and workers finish what they
    /// already hold.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<ProcessStats> {
        let recovered = self.ctx.jobs.recover_in_flight(Utc::now()).await?;
        if recovered > 0 {
            info!(recovered, "Recovered interrupted jobs");
        }
        info!(
            provider = self.ctx.provider.name(),
            model = self.ctx.provider.model(),
            workers = self.config.workers,
            "Job processor started"
        );

        let (tx, rx) = mpsc::channel::<(EmbeddingJob, OwnedSemaphorePermit)>(self.config.workers);
        let rx = Arc::new(Mutex::new(rx));
        let slots = Arc::new(Semaphore::new(self.config.workers));

        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers {
            let this = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            workers.spawn(async move { this.worker_loop(worker, rx).await });
        }

        let mut availability = self.ctx.monitor.subscribe();
        let mut claimed_total = 0usize;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let first = tokio::select! {
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };
            let mut permits = vec![first];
            while permits.len() < self.config.batch_size {
                match Arc::clone(&slots).try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let batch = self.claim(permits.len()).await;
            if batch.is_empty() {
                drop(permits);
                if self.idle(&mut shutdown, &mut availability).await {
                    break;
                }
                continue;
            }

            claimed_total += batch.len();
            let mut closed = false;
            for (job, permit) in batch.into_iter().zip(permits.drain(..)) {
                if tx.send((job, permit)).await.is_err() {
                    closed = true;
                    break;
                }
            }
            if closed {
                error!("Worker pool stopped unexpectedly");
                break;
            }
        }

        drop(tx);
        let mut stats = ProcessStats {
            claimed: claimed_total,
            ..ProcessStats::default()
        };
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(worker_stats) => stats.merge(&worker_stats),
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }
        info!(
            claimed = stats.claimed,
            embedded = stats.embedded,
            failed = stats.failed,
            "Job processor stopped"
        );
        Ok(stats)
    }

    async fn claim(&self, limit: usize) -> Vec<EmbeddingJob> {
        if !self.ctx.monitor.is_available().await {
            return Vec::new();
        }
        match self
            .ctx
            .jobs
            .claim_batch(self.ctx.provider.name(), limit, Utc::now())
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "Failed to claim jobs");
                Vec::new()
            }
        }
    }

    /// Wait for new work, a retry coming due, the provider returning, or
    /// shutdown. Returns `true` on shutdown.
    async fn idle(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        availability: &mut watch::Receiver<bool>,
    ) -> bool {
        let poll = self.config.poll_interval();
        let wait = if *availability.borrow() {
            match self.ctx.jobs.next_due_at(self.ctx.provider.name()).await {
                Ok(Some(at)) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(poll),
                Ok(None) => poll,
                Err(e) => {
                    warn!(error = %e, "Failed to read next due job");
                    poll
                }
            }
        } else {
            poll
        };

        tokio::select! {
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            _ = self.ctx.wakeup.notified() => false,
            changed = availability.changed() => {
                if changed.is_ok() && *availability.borrow_and_update() {
                    self.resume_paused().await;
                }
                false
            }
            _ = tokio::time::sleep(wait.max(MIN_IDLE)) => false,
        }
    }

    async fn resume_paused(&self) {
        match self
            .ctx
            .jobs
            .release_paused(self.ctx.provider.name(), Utc::now())
            .await
        {
            Ok(0) => {}
            Ok(released) => info!(released, "Provider back; resuming paused jobs"),
            Err(e) => warn!(error = %e, "Failed to release paused jobs"),
        }
    }

    async fn worker_loop(
        &self,
        worker: usize,
        rx: Arc<Mutex<mpsc::Receiver<(EmbeddingJob, OwnedSemaphorePermit)>>>,
    ) -> ProcessStats {
        let mut stats = ProcessStats::default();
        loop {
            let next = { rx.lock().await.recv().await };
            let Some((job, _permit)) = next else {
                break;
            };
            stats.record(self.run_job(job).await);
        }
        debug!(worker, "Worker exiting");
        stats
    }

    /// Run one claimed job to its next state.
    pub async fn run_job(&self, job: EmbeddingJob) -> JobOutcome {
        let span = info_span!("job", id = job.id, entity = %job.key);
        async {
            match self.embed_job(&job).await {
                Ok(outcome) => match self.ctx.jobs.complete(job.id, Utc::now()).await {
                    Ok(done) => {
                        debug!(status = %done.status, ?outcome, "Job finished");
                        outcome
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to mark job complete");
                        JobOutcome::Errored
                    }
                },
                Err(err) => self.settle_failure(&job, err).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn embed_job(&self, job: &EmbeddingJob) -> Result<JobOutcome> {
        let Some(content) = self.ctx.content.get_content(&job.key).await? else {
            let removed = self.ctx.vectors.delete_entity_chunks(&job.key).await?;
            debug!(removed, "Entity has no content");
            return Ok(JobOutcome::Removed);
        };
        if content.text.trim().is_empty() {
            let removed = self.ctx.vectors.delete_entity_chunks(&job.key).await?;
            debug!(removed, "Entity content is blank");
            return Ok(JobOutcome::Removed);
        }

        let model = self.ctx.provider.model();
        if job.job_type != JobType::FullSync
            && self
                .ctx
                .vectors
                .is_fresh(&job.key, &content.content_hash, model)
                .await?
        {
            return Ok(JobOutcome::Skipped);
        }

        let pieces = self.chunker.chunk(&content.text);
        let texts: Vec<&str> = pieces.iter().map(|p| p.text.as_str()).collect();
        let batch_size = if self.embed_batch_size == 0 {
            texts.len().max(1)
        } else {
            self.embed_batch_size
        };
        let vectors = embed_in_batches(self.ctx.provider.as_ref(), &texts, batch_size).await?;

        let now = Utc::now();
        let chunks: Vec<Chunk> = pieces
            .into_iter()
            .zip(vectors)
            .map(|(piece, embedding)| Chunk {
                key: job.key.clone(),
                chunk_index: piece.index,
                text: piece.text,
                token_count: piece.token_count,
                embedding,
                embedding_model: model.to_string(),
                content_hash: content.content_hash.clone(),
                created_at: now,
            })
            .collect();
        let count = chunks.len();
        self.ctx.vectors.replace_entity_chunks(&job.key, chunks).await?;
        Ok(JobOutcome::Embedded { chunks: count })
    }

    async fn settle_failure(&self, job: &EmbeddingJob, err: Error) -> JobOutcome {
        if err.is_unavailable() {
            self.ctx.monitor.report_failure(&err).await;
        }
        let now = Utc::now();
        let message = err.to_string();

        match self.policy.decide(job, &err, now) {
            RetryDecision::Requeue { at, consume_attempt } => {
                match self
                    .ctx
                    .jobs
                    .reschedule(job.id, &message, at, consume_attempt, now)
                    .await
                {
                    Ok(updated) if updated.status == JobStatus::Cancelled => {
                        info!("Job cancelled while running");
                        JobOutcome::Cancelled
                    }
                    Ok(updated) => {
                        if consume_attempt {
                            warn!(
                                error = %message,
                                retry_count = updated.retry_count,
                                next_retry_at = %at,
                                "Job failed; will retry"
                            );
                        } else {
                            debug!(next_retry_at = %at, "Job paused for provider unavailability");
                        }
                        JobOutcome::Requeued {
                            paused: !consume_attempt,
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to requeue job");
                        JobOutcome::Errored
                    }
                }
            }
            RetryDecision::Fail { retry_count } => {
                match self.ctx.jobs.fail(job.id, &message, retry_count, now).await {
                    Ok(_) => {
                        error!(error = %message, retry_count, "Job failed");
                        JobOutcome::Failed
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to mark job failed");
                        JobOutcome::Errored
                    }
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
