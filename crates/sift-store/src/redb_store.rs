//! Redb-backed job, chunk, and health store.
//!
//! Uses [redb](https://github.com/cberner/redb), a pure Rust, ACID, embedded
//! B-tree database. redb serializes write transactions, which is what makes
//! job claims compare-and-set.
//!
//! # Tables
//!
//! - `jobs`: job id (u64) → EmbeddingJob (JSON)
//! - `job_queue`: job id (u64) → () for every non-terminal job
//! - `entity_jobs`: entity key → id of the entity's latest job
//! - `chunks`: chunk key → chunk record without its vector (JSON)
//! - `embeddings`: chunk key → `Vec<f32>` (raw bytes, little-endian)
//! - `entities`: entity key → fingerprint of the stored chunk set (JSON)
//! - `provider_health`: provider name → ProviderHealth (JSON)
//! - `meta`: name → u64 counters
//!
//! Entity keys are `TYPE\0id`; chunk keys append `\0{index:08}`, so one
//! entity's chunks form a contiguous key range.
//!
//! Nearest-neighbour queries are answered from a [`VectorIndex`] built from
//! `embeddings` on first use and updated by the chunk write paths.

use std::fmt::Display;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, Table, TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};
use sift_core::{
    Chunk, EmbeddingJob, EntityKey, Error, JobRequest, JobStatus, ProviderHealth, Result,
};

use crate::traits::{
    CancelOutcome, ChunkStats, EnqueueOutcome, EntityFingerprint, HealthStore, JobCounts,
    JobStore, NearestQuery, VectorMatch, VectorStore,
};
use crate::vector_index::VectorIndex;

// Table definitions
const JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("jobs");
const JOB_QUEUE: TableDefinition<u64, ()> = TableDefinition::new("job_queue");
const ENTITY_JOBS: TableDefinition<&str, u64> = TableDefinition::new("entity_jobs");
const CHUNKS: TableDefinition<&str, &[u8]> = TableDefinition::new("chunks");
const EMBEDDINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("embeddings");
const ENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");
const HEALTH: TableDefinition<&str, &[u8]> = TableDefinition::new("provider_health");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

// Meta keys
const JOB_SEQ_KEY: &str = "job_seq";

const RECOVERED_ERROR: &str = "interrupted before completion";

// ============================================================================
// Helpers
// ============================================================================

trait StoreResultExt<T> {
    fn ctx(self, what: &str) -> Result<T>;
}

impl<T, E: Display> StoreResultExt<T> for std::result::Result<T, E> {
    fn ctx(self, what: &str) -> Result<T> {
        self.map_err(|e| Error::store(format!("Failed to {what}: {e}")))
    }
}

fn entity_key(key: &EntityKey) -> String {
    format!("{}\0{}", key.entity_type.as_str(), key.entity_id)
}

fn chunk_key(entity: &str, index: u32) -> String {
    format!("{entity}\0{index:08}")
}

/// Half-open key range covering every chunk of `entity`.
fn chunk_range(entity: &str) -> (String, String) {
    (format!("{entity}\0"), format!("{entity}\u{1}"))
}

/// Chunk index encoded in the suffix of a chunk key.
fn chunk_index_of(chunk_key: &str) -> Option<u32> {
    chunk_key.rsplit('\0').next()?.parse().ok()
}

/// Serializes an embedding to little-endian f32 bytes.
fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Deserializes an embedding from little-endian f32 bytes.
fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn write_txn<T>(db: &Database, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
    let txn = db.begin_write().ctx("begin write transaction")?;
    match f(&txn) {
        Ok(value) => {
            txn.commit().ctx("commit transaction")?;
            Ok(value)
        }
        Err(e) => {
            if let Err(abort) = txn.abort() {
                log::warn!("Failed to abort transaction after error ({e}): {abort}");
            }
            Err(e)
        }
    }
}

fn read_txn<T>(db: &Database, f: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T> {
    let txn = db.begin_read().ctx("begin read transaction")?;
    f(&txn)
}

/// Chunk row without its vector, which lives in `embeddings`.
#[derive(Debug, Serialize, Deserialize)]
struct StoredChunk {
    chunk_index: u32,
    text: String,
    token_count: u32,
    embedding_model: String,
    content_hash: String,
    created_at: DateTime<Utc>,
}

/// Row of the `entities` table.
#[derive(Debug, Serialize, Deserialize)]
struct EntityRecord {
    #[serde(flatten)]
    key: EntityKey,
    #[serde(flatten)]
    fingerprint: EntityFingerprint,
}

// ============================================================================
// Job tables
// ============================================================================

/// The job tables of one write transaction.
struct JobTables<'txn> {
    jobs: Table<'txn, u64, &'static [u8]>,
    queue: Table<'txn, u64, ()>,
    entity_jobs: Table<'txn, &'static str, u64>,
    meta: Table<'txn, &'static str, u64>,
}

impl<'txn> JobTables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> Result<Self> {
        Ok(Self {
            jobs: txn.open_table(JOBS).ctx("open jobs table")?,
            queue: txn.open_table(JOB_QUEUE).ctx("open job_queue table")?,
            entity_jobs: txn.open_table(ENTITY_JOBS).ctx("open entity_jobs table")?,
            meta: txn.open_table(META).ctx("open meta table")?,
        })
    }

    fn load(&self, id: u64) -> Result<Option<EmbeddingJob>> {
        load_job(&self.jobs, id)
    }

    fn load_required(&self, id: u64) -> Result<EmbeddingJob> {
        self.load(id)?
            .ok_or_else(|| Error::not_found(format!("job {id}")))
    }

    /// Persist a job and keep `job_queue` in step with its status.
    fn save(&mut self, job: &EmbeddingJob) -> Result<()> {
        let bytes = serde_json::to_vec(job)?;
        self.jobs
            .insert(job.id, bytes.as_slice())
            .ctx("insert job")?;
        if job.status.is_terminal() {
            self.queue.remove(job.id).ctx("dequeue job")?;
        } else {
            self.queue.insert(job.id, ()).ctx("queue job")?;
        }
        Ok(())
    }

    fn next_id(&mut self) -> Result<u64> {
        let current = self
            .meta
            .get(JOB_SEQ_KEY)
            .ctx("read job sequence")?
            .map(|g| g.value())
            .unwrap_or(0);
        let next = current + 1;
        self.meta
            .insert(JOB_SEQ_KEY, next)
            .ctx("advance job sequence")?;
        Ok(next)
    }

    fn create(&mut self, request: JobRequest, now: DateTime<Utc>) -> Result<EmbeddingJob> {
        let id = self.next_id()?;
        let ek = entity_key(&request.key);
        let job = EmbeddingJob::new(id, request, now);
        self.save(&job)?;
        self.entity_jobs
            .insert(ek.as_str(), id)
            .ctx("index job by entity")?;
        Ok(job)
    }

    /// Persist a job after a transition, spawning the follow-up job if a
    /// request arrived while it was running.
    fn finish(&mut self, mut job: EmbeddingJob, now: DateTime<Utc>) -> Result<EmbeddingJob> {
        let rerun = job.rerun_requested && job.status.is_terminal();
        if rerun {
            job.rerun_requested = false;
        }
        self.save(&job)?;
        if rerun {
            let follow_up = self.create(job.follow_up_request(), now)?;
            log::debug!(
                "Job {} for {} finished {}; queued follow-up job {}",
                job.id,
                job.key,
                job.status,
                follow_up.id
            );
        }
        Ok(job)
    }

    fn entity_job(&self, key: &EntityKey) -> Result<Option<EmbeddingJob>> {
        let ek = entity_key(key);
        let id = self
            .entity_jobs
            .get(ek.as_str())
            .ctx("read entity job index")?
            .map(|g| g.value());
        match id {
            Some(id) => self.load(id),
            None => Ok(None),
        }
    }

    /// Every non-terminal job.
    fn queued(&self) -> Result<Vec<EmbeddingJob>> {
        let mut ids = Vec::new();
        for entry in self.queue.iter().ctx("scan job queue")? {
            let (key, _) = entry.ctx("read job queue entry")?;
            ids.push(key.value());
        }
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(id)? {
                Some(job) => jobs.push(job),
                None => log::warn!("Job queue references missing job {id}"),
            }
        }
        Ok(jobs)
    }
}

fn load_job<T: ReadableTable<u64, &'static [u8]>>(
    table: &T,
    id: u64,
) -> Result<Option<EmbeddingJob>> {
    match table.get(id).ctx("read job")? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

// ============================================================================
// Store
// ============================================================================

/// Redb-backed implementation of [`JobStore`], [`VectorStore`] and
/// [`HealthStore`].
///
/// Cloning is cheap; clones share the database.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    /// `None` until the first nearest query, or after a rebuild is requested.
    index: Arc<Mutex<Option<VectorIndex>>>,
}

impl RedbStore {
    /// Opens or creates a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).ctx("open database")?;
        log::debug!("Opened store at {}", path.display());
        Self::init(db)
    }

    /// Creates a database that lives only in memory.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .ctx("create in-memory database")?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        write_txn(&db, |txn| {
            txn.open_table(JOBS).ctx("create jobs table")?;
            txn.open_table(JOB_QUEUE).ctx("create job_queue table")?;
            txn.open_table(ENTITY_JOBS).ctx("create entity_jobs table")?;
            txn.open_table(CHUNKS).ctx("create chunks table")?;
            txn.open_table(EMBEDDINGS).ctx("create embeddings table")?;
            txn.open_table(ENTITIES).ctx("create entities table")?;
            txn.open_table(HEALTH).ctx("create provider_health table")?;
            txn.open_table(META).ctx("create meta table")?;
            Ok(())
        })?;
        Ok(Self {
            db: Arc::new(db),
            index: Arc::new(Mutex::new(None)),
        })
    }

    /// Run `f` against the database on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| Error::store(format!("storage task failed: {e}")))?
    }

    /// Run `f` against the job tables in one write transaction.
    async fn with_jobs<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut JobTables<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.blocking(move |db| {
            write_txn(db, |txn| {
                let mut tables = JobTables::open(txn)?;
                f(&mut tables)
            })
        })
        .await
    }
}

fn lock_index(index: &Mutex<Option<VectorIndex>>) -> Result<MutexGuard<'_, Option<VectorIndex>>> {
    index
        .lock()
        .map_err(|_| Error::store("vector index lock poisoned"))
}

/// Drop an index with too many tombstones; the next query rebuilds it.
fn drop_if_stale(index: &mut Option<VectorIndex>) {
    if index.as_ref().is_some_and(VectorIndex::needs_rebuild) {
        log::debug!("Dropping vector index for rebuild");
        *index = None;
    }
}

/// Build a [`VectorIndex`] from every stored vector.
fn load_index(db: &Database) -> Result<VectorIndex> {
    read_txn(db, |txn| {
        let entities = txn.open_table(ENTITIES).ctx("open entities table")?;
        let embedding_table = txn.open_table(EMBEDDINGS).ctx("open embeddings table")?;
        let mut index = VectorIndex::default();
        for entry in entities.iter().ctx("scan entities")? {
            let (ek, value) = entry.ctx("read entity record")?;
            let record: EntityRecord = serde_json::from_slice(value.value())?;
            let (start, end) = chunk_range(ek.value());
            let mut vectors = Vec::new();
            for chunk in embedding_table
                .range(start.as_str()..end.as_str())
                .ctx("scan embeddings")?
            {
                let (ck, vector) = chunk.ctx("read embedding")?;
                let Some(chunk_index) = chunk_index_of(ck.value()) else {
                    log::warn!("Skipping embedding with malformed key {:?}", ck.value());
                    continue;
                };
                vectors.push((chunk_index, deserialize_embedding(vector.value())));
            }
            index.insert_entity(&record.key, &record.fingerprint.embedding_model, vectors);
        }
        log::debug!("Built vector index over {} chunk(s)", index.len());
        Ok(index)
    })
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

// ============================================================================
// JobStore
// ============================================================================

#[async_trait]
impl JobStore for RedbStore {
    async fn enqueue(&self, request: JobRequest, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        request.key.validate()?;
        self.with_jobs(move |t| {
            if let Some(mut job) = t.entity_job(&request.key)?
                && !job.status.is_terminal()
            {
                job.merge_request(request.priority, now);
                t.save(&job)?;
                return Ok(EnqueueOutcome::Merged(job));
            }
            let job = t.create(request, now)?;
            log::debug!("Queued job {} for {} (priority {})", job.id, job.key, job.priority);
            Ok(EnqueueOutcome::Created(job))
        })
        .await
    }

    async fn claim_batch(
        &self,
        provider: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<EmbeddingJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let provider = provider.to_string();
        self.with_jobs(move |t| {
            let mut due: Vec<EmbeddingJob> = t
                .queued()?
                .into_iter()
                .filter(|j| j.provider == provider && j.is_due(now))
                .collect();
            due.sort_by_key(|j| (j.priority, j.id));
            due.truncate(limit);
            for job in &mut due {
                job.start(now)?;
                t.save(job)?;
            }
            if !due.is_empty() {
                log::debug!("Claimed {} job(s) for {provider}", due.len());
            }
            Ok(due)
        })
        .await
    }

    async fn complete(&self, id: u64, now: DateTime<Utc>) -> Result<EmbeddingJob> {
        self.with_jobs(move |t| {
            let mut job = t.load_required(id)?;
            job.complete(now)?;
            t.finish(job, now)
        })
        .await
    }

    async fn reschedule(
        &self,
        id: u64,
        error: &str,
        next_retry_at: DateTime<Utc>,
        consume_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<EmbeddingJob> {
        let error = error.to_string();
        self.with_jobs(move |t| {
            let mut job = t.load_required(id)?;
            job.reschedule(error, next_retry_at, consume_attempt, now)?;
            if !job.status.is_terminal() {
                // The retry itself serves any request that arrived meanwhile.
                job.rerun_requested = false;
            }
            t.finish(job, now)
        })
        .await
    }

    async fn fail(
        &self,
        id: u64,
        error: &str,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<EmbeddingJob> {
        let error = error.to_string();
        self.with_jobs(move |t| {
            let mut job = t.load_required(id)?;
            job.fail(error, retry_count, now)?;
            t.finish(job, now)
        })
        .await
    }

    async fn cancel(&self, key: &EntityKey, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let key = key.clone();
        self.with_jobs(move |t| {
            let Some(mut job) = t.entity_job(&key)? else {
                return Ok(CancelOutcome::NotFound);
            };
            if job.status.is_terminal() {
                return Ok(CancelOutcome::NotFound);
            }
            if job.cancel(now)? {
                Ok(CancelOutcome::Cancelled(t.finish(job, now)?))
            } else {
                t.save(&job)?;
                Ok(CancelOutcome::Deferred(job))
            }
        })
        .await
    }

    async fn get_job(&self, id: u64) -> Result<Option<EmbeddingJob>> {
        self.blocking(move |db| {
            read_txn(db, |txn| {
                let jobs = txn.open_table(JOBS).ctx("open jobs table")?;
                load_job(&jobs, id)
            })
        })
        .await
    }

    async fn latest_job_for(&self, key: &EntityKey) -> Result<Option<EmbeddingJob>> {
        let ek = entity_key(key);
        self.blocking(move |db| {
            read_txn(db, |txn| {
                let index = txn.open_table(ENTITY_JOBS).ctx("open entity_jobs table")?;
                let jobs = txn.open_table(JOBS).ctx("open jobs table")?;
                let id = index
                    .get(ek.as_str())
                    .ctx("read entity job index")?
                    .map(|g| g.value());
                match id {
                    Some(id) => load_job(&jobs, id),
                    None => Ok(None),
                }
            })
        })
        .await
    }

    async fn release_paused(&self, provider: &str, now: DateTime<Utc>) -> Result<usize> {
        let provider = provider.to_string();
        self.with_jobs(move |t| {
            let mut released = 0;
            for mut job in t.queued()? {
                if job.provider == provider
                    && job.status == JobStatus::RetryPending
                    && job.paused_for_unavailability
                {
                    job.next_retry_at = Some(now);
                    job.updated_at = now;
                    t.save(&job)?;
                    released += 1;
                }
            }
            Ok(released)
        })
        .await
    }

    async fn recover_in_flight(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_jobs(move |t| {
            let mut recovered = 0;
            for mut job in t.queued()? {
                if job.status == JobStatus::InProgress {
                    job.reschedule(RECOVERED_ERROR, now, false, now)?;
                    t.finish(job, now)?;
                    recovered += 1;
                }
            }
            if recovered > 0 {
                log::info!("Requeued {recovered} job(s) interrupted by shutdown");
            }
            Ok(recovered)
        })
        .await
    }

    async fn job_counts(&self) -> Result<JobCounts> {
        self.blocking(|db| {
            read_txn(db, |txn| {
                let jobs = txn.open_table(JOBS).ctx("open jobs table")?;
                let mut counts = JobCounts::default();
                for entry in jobs.iter().ctx("scan jobs")? {
                    let (_, value) = entry.ctx("read job")?;
                    let job: EmbeddingJob = serde_json::from_slice(value.value())?;
                    counts.add(job.status);
                }
                Ok(counts)
            })
        })
        .await
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<EmbeddingJob>> {
        self.blocking(move |db| {
            read_txn(db, |txn| {
                let jobs = txn.open_table(JOBS).ctx("open jobs table")?;
                let mut out = Vec::new();
                for entry in jobs.iter().ctx("scan jobs")?.rev() {
                    if out.len() >= limit {
                        break;
                    }
                    let (_, value) = entry.ctx("read job")?;
                    let job: EmbeddingJob = serde_json::from_slice(value.value())?;
                    if status.is_none_or(|s| s == job.status) {
                        out.push(job);
                    }
                }
                Ok(out)
            })
        })
        .await
    }

    async fn next_due_at(&self, provider: &str) -> Result<Option<DateTime<Utc>>> {
        let provider = provider.to_string();
        self.with_jobs(move |t| {
            Ok(t.queued()?
                .into_iter()
                .filter(|j| j.provider == provider)
                .filter_map(|j| match j.status {
                    JobStatus::Pending => Some(j.updated_at),
                    JobStatus::RetryPending => Some(j.next_retry_at.unwrap_or(j.updated_at)),
                    _ => None,
                })
                .min())
        })
        .await
    }

    async fn prune_terminal(&self, before: DateTime<Utc>) -> Result<usize> {
        self.with_jobs(move |t| {
            let mut doomed = Vec::new();
            for entry in t.jobs.iter().ctx("scan jobs")? {
                let (_, value) = entry.ctx("read job")?;
                let job: EmbeddingJob = serde_json::from_slice(value.value())?;
                if job.status.is_terminal() && job.completed_at.unwrap_or(job.updated_at) < before
                {
                    doomed.push(job);
                }
            }
            for job in &doomed {
                t.jobs.remove(job.id).ctx("delete job")?;
                let ek = entity_key(&job.key);
                let points_here = t
                    .entity_jobs
                    .get(ek.as_str())
                    .ctx("read entity job index")?
                    .is_some_and(|g| g.value() == job.id);
                if points_here {
                    t.entity_jobs
                        .remove(ek.as_str())
                        .ctx("delete entity job index")?;
                }
            }
            if !doomed.is_empty() {
                log::info!("Pruned {} terminal job(s)", doomed.len());
            }
            Ok(doomed.len())
        })
        .await
    }
}

// ============================================================================
// VectorStore
// ============================================================================

/// Check that `chunks` form one consistent chunk set for `key`, returning
/// the set's fingerprint.
fn validate_chunk_set(
    key: &EntityKey,
    chunks: &mut [Chunk],
    now: DateTime<Utc>,
) -> Result<Option<EntityFingerprint>> {
    chunks.sort_by_key(|c| c.chunk_index);
    let Some(first) = chunks.first() else {
        return Ok(None);
    };
    let fingerprint = EntityFingerprint {
        content_hash: first.content_hash.clone(),
        embedding_model: first.embedding_model.clone(),
        dimension: first.dimension(),
        chunk_count: u32::try_from(chunks.len())
            .map_err(|_| Error::validation(format!("too many chunks for {key}")))?,
        updated_at: now,
    };
    for (expected, chunk) in chunks.iter().enumerate() {
        chunk.validate()?;
        if &chunk.key != key {
            return Err(Error::validation(format!(
                "chunk for {} passed while replacing {key}",
                chunk.key
            )));
        }
        if chunk.chunk_index as usize != expected {
            return Err(Error::validation(format!(
                "chunk indices of {key} are not contiguous from 0"
            )));
        }
        if chunk.embedding_model != fingerprint.embedding_model
            || chunk.dimension() != fingerprint.dimension
            || chunk.content_hash != fingerprint.content_hash
        {
            return Err(Error::validation(format!(
                "chunks of {key} disagree on model, dimension or content hash"
            )));
        }
    }
    Ok(Some(fingerprint))
}

/// Delete every chunk and vector of `entity`. Returns the number of chunks.
fn remove_chunks(
    chunks: &mut Table<'_, &'static str, &'static [u8]>,
    embeddings: &mut Table<'_, &'static str, &'static [u8]>,
    entity: &str,
) -> Result<usize> {
    let (start, end) = chunk_range(entity);
    let mut keys = Vec::new();
    for entry in chunks
        .range(start.as_str()..end.as_str())
        .ctx("scan chunks")?
    {
        let (k, _) = entry.ctx("read chunk key")?;
        keys.push(k.value().to_string());
    }
    for k in &keys {
        chunks.remove(k.as_str()).ctx("delete chunk")?;
        embeddings.remove(k.as_str()).ctx("delete embedding")?;
    }
    Ok(keys.len())
}

#[async_trait]
impl VectorStore for RedbStore {
    async fn replace_entity_chunks(&self, key: &EntityKey, mut chunks: Vec<Chunk>) -> Result<()> {
        key.validate()?;
        let fingerprint = validate_chunk_set(key, &mut chunks, Utc::now())?;
        let key = key.clone();
        let index = self.index.clone();
        self.blocking(move |db| {
            let mut index = lock_index(&index)?;
            let written = write_txn(db, |txn| {
                let ek = entity_key(&key);
                let mut chunk_table = txn.open_table(CHUNKS).ctx("open chunks table")?;
                let mut embedding_table =
                    txn.open_table(EMBEDDINGS).ctx("open embeddings table")?;
                let mut entities = txn.open_table(ENTITIES).ctx("open entities table")?;

                let removed = remove_chunks(&mut chunk_table, &mut embedding_table, &ek)?;

                let Some(fingerprint) = fingerprint else {
                    entities.remove(ek.as_str()).ctx("delete entity record")?;
                    return Ok(None);
                };

                let mut vectors = Vec::with_capacity(chunks.len());
                for chunk in chunks {
                    let ck = chunk_key(&ek, chunk.chunk_index);
                    let stored = StoredChunk {
                        chunk_index: chunk.chunk_index,
                        text: chunk.text,
                        token_count: chunk.token_count,
                        embedding_model: chunk.embedding_model,
                        content_hash: chunk.content_hash,
                        created_at: chunk.created_at,
                    };
                    let bytes = serde_json::to_vec(&stored)?;
                    chunk_table
                        .insert(ck.as_str(), bytes.as_slice())
                        .ctx("insert chunk")?;
                    let vector = serialize_embedding(&chunk.embedding);
                    embedding_table
                        .insert(ck.as_str(), vector.as_slice())
                        .ctx("insert embedding")?;
                    vectors.push((chunk.chunk_index, chunk.embedding));
                }

                log::debug!(
                    "Replaced {removed} chunk(s) of {key} with {} ({})",
                    fingerprint.chunk_count,
                    fingerprint.embedding_model
                );
                let model = fingerprint.embedding_model.clone();
                let record = serde_json::to_vec(&EntityRecord {
                    key: key.clone(),
                    fingerprint,
                })?;
                entities
                    .insert(ek.as_str(), record.as_slice())
                    .ctx("insert entity record")?;
                Ok(Some((model, vectors)))
            })?;

            if let Some(loaded) = index.as_mut() {
                match written {
                    Some((model, vectors)) => loaded.insert_entity(&key, &model, vectors),
                    None => {
                        loaded.remove_entity(&key);
                    }
                }
            }
            drop_if_stale(&mut index);
            Ok(())
        })
        .await
    }

    async fn delete_entity_chunks(&self, key: &EntityKey) -> Result<usize> {
        let ek = entity_key(key);
        let key = key.clone();
        let index = self.index.clone();
        self.blocking(move |db| {
            let mut index = lock_index(&index)?;
            let removed = write_txn(db, |txn| {
                let mut chunk_table = txn.open_table(CHUNKS).ctx("open chunks table")?;
                let mut embedding_table =
                    txn.open_table(EMBEDDINGS).ctx("open embeddings table")?;
                let mut entities = txn.open_table(ENTITIES).ctx("open entities table")?;
                let removed = remove_chunks(&mut chunk_table, &mut embedding_table, &ek)?;
                entities.remove(ek.as_str()).ctx("delete entity record")?;
                Ok(removed)
            })?;
            if let Some(loaded) = index.as_mut() {
                loaded.remove_entity(&key);
            }
            drop_if_stale(&mut index);
            Ok(removed)
        })
        .await
    }

    async fn entity_chunks(&self, key: &EntityKey) -> Result<Vec<Chunk>> {
        let key = key.clone();
        self.blocking(move |db| {
            read_txn(db, |txn| {
                let chunk_table = txn.open_table(CHUNKS).ctx("open chunks table")?;
                let embedding_table = txn.open_table(EMBEDDINGS).ctx("open embeddings table")?;
                let ek = entity_key(&key);
                let (start, end) = chunk_range(&ek);

                let mut out = Vec::new();
                for entry in chunk_table
                    .range(start.as_str()..end.as_str())
                    .ctx("scan chunks")?
                {
                    let (k, v) = entry.ctx("read chunk")?;
                    let stored: StoredChunk = serde_json::from_slice(v.value())?;
                    let embedding = embedding_table
                        .get(k.value())
                        .ctx("read embedding")?
                        .map(|g| deserialize_embedding(g.value()))
                        .unwrap_or_default();
                    out.push(Chunk {
                        key: key.clone(),
                        chunk_index: stored.chunk_index,
                        text: stored.text,
                        token_count: stored.token_count,
                        embedding,
                        embedding_model: stored.embedding_model,
                        content_hash: stored.content_hash,
                        created_at: stored.created_at,
                    });
                }
                Ok(out)
            })
        })
        .await
    }

    async fn fingerprint(&self, key: &EntityKey) -> Result<Option<EntityFingerprint>> {
        let ek = entity_key(key);
        self.blocking(move |db| {
            read_txn(db, |txn| {
                let entities = txn.open_table(ENTITIES).ctx("open entities table")?;
                match entities.get(ek.as_str()).ctx("read entity record")? {
                    Some(guard) => {
                        let record: EntityRecord = serde_json::from_slice(guard.value())?;
                        Ok(Some(record.fingerprint))
                    }
                    None => Ok(None),
                }
            })
        })
        .await
    }

    async fn nearest(&self, query: &NearestQuery<'_>) -> Result<Vec<VectorMatch>> {
        if query.limit == 0 || query.embedding.is_empty() {
            return Ok(Vec::new());
        }
        let embedding = query.embedding.to_vec();
        let model = query.model.to_string();
        let limit = query.limit;
        let min_similarity = query.min_similarity;
        let entity_type = query.entity_type;
        let index = self.index.clone();

        self.blocking(move |db| {
            // Held through the chunk reads so hits and rows come from the same commit.
            let mut index = lock_index(&index)?;
            if index.is_none() {
                *index = Some(load_index(db)?);
            }
            let Some(loaded) = index.as_mut() else {
                return Ok(Vec::new());
            };
            let hits = loaded.nearest(&embedding, &model, limit, min_similarity, entity_type);

            read_txn(db, |txn| {
                let chunk_table = txn.open_table(CHUNKS).ctx("open chunks table")?;
                let mut out = Vec::with_capacity(hits.len());
                for hit in hits {
                    let ck = chunk_key(&entity_key(&hit.key), hit.chunk_index);
                    let Some(guard) = chunk_table.get(ck.as_str()).ctx("read chunk")? else {
                        log::warn!("Vector index references missing chunk {ck:?}");
                        continue;
                    };
                    let stored: StoredChunk = serde_json::from_slice(guard.value())?;
                    out.push(VectorMatch {
                        key: hit.key,
                        chunk_index: stored.chunk_index,
                        text: stored.text,
                        similarity: hit.similarity,
                    });
                }
                Ok(out)
            })
        })
        .await
    }

    async fn chunk_stats(&self) -> Result<ChunkStats> {
        self.blocking(|db| {
            read_txn(db, |txn| {
                let entities = txn.open_table(ENTITIES).ctx("open entities table")?;
                let mut stats = ChunkStats::default();
                for entry in entities.iter().ctx("scan entities")? {
                    let (_, value) = entry.ctx("read entity record")?;
                    let record: EntityRecord = serde_json::from_slice(value.value())?;
                    stats.entities += 1;
                    stats.chunks += u64::from(record.fingerprint.chunk_count);
                    *stats
                        .models
                        .entry(record.fingerprint.embedding_model)
                        .or_insert(0) += 1;
                    *stats
                        .entity_types
                        .entry(record.key.entity_type.to_string())
                        .or_insert(0) += 1;
                }
                Ok(stats)
            })
        })
        .await
    }
}

// ============================================================================
// HealthStore
// ============================================================================

#[async_trait]
impl HealthStore for RedbStore {
    async fn upsert_health(&self, health: &ProviderHealth) -> Result<()> {
        let bytes = serde_json::to_vec(health)?;
        let provider = health.provider.clone();
        self.blocking(move |db| {
            write_txn(db, |txn| {
                let mut table = txn.open_table(HEALTH).ctx("open provider_health table")?;
                table
                    .insert(provider.as_str(), bytes.as_slice())
                    .ctx("upsert provider health")?;
                Ok(())
            })
        })
        .await
    }

    async fn get_health(&self, provider: &str) -> Result<Option<ProviderHealth>> {
        let provider = provider.to_string();
        self.blocking(move |db| {
            read_txn(db, |txn| {
                let table = txn.open_table(HEALTH).ctx("open provider_health table")?;
                match table.get(provider.as_str()).ctx("read provider health")? {
                    Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
                    None => Ok(None),
                }
            })
        })
        .await
    }

    async fn list_health(&self) -> Result<Vec<ProviderHealth>> {
        self.blocking(|db| {
            read_txn(db, |txn| {
                let table = txn.open_table(HEALTH).ctx("open provider_health table")?;
                let mut out = Vec::new();
                for entry in table.iter().ctx("scan provider health")? {
                    let (_, value) = entry.ctx("read provider health")?;
                    out.push(serde_json::from_slice(value.value())?);
                }
                Ok(out)
            })
        })
        .await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sift_core::{EntityType, JobType, hash_content, priority};
    use std::collections::HashSet;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn doc(id: &str) -> EntityKey {
        EntityKey::new(EntityType::Documentation, id)
    }

    fn request(key: EntityKey, priority: i32) -> JobRequest {
        JobRequest {
            key,
            job_type: JobType::SingleEntity,
            priority,
            provider: "mock".to_string(),
            model: "m".to_string(),
            max_retries: 3,
        }
    }

    fn chunks(key: &EntityKey, text_hash: &str, vectors: &[Vec<f32>]) -> Vec<Chunk> {
        vectors
            .iter()
            .enumerate()
            .map(|(i, v)| Chunk {
                key: key.clone(),
                chunk_index: i as u32,
                text: format!("chunk {i}"),
                token_count: 2,
                embedding: v.clone(),
                embedding_model: "m".to_string(),
                content_hash: text_hash.to_string(),
                created_at: t0(),
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_enqueue_creates_then_merges() {
        let store = RedbStore::in_memory().unwrap();

        let first = store.enqueue(request(doc("a"), priority::BULK), t0()).await.unwrap();
        assert!(matches!(first, EnqueueOutcome::Created(_)));
        assert_eq!(first.job().id, 1);

        let later = t0() + Duration::seconds(10);
        let second = store.enqueue(request(doc("a"), priority::USER), later).await.unwrap();
        assert!(matches!(second, EnqueueOutcome::Merged(_)));
        let job = second.into_job();
        assert_eq!(job.id, 1);
        assert_eq!(job.priority, priority::USER);
        assert_eq!(job.updated_at, later);

        let counts = store.job_counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_key() {
        let store = RedbStore::in_memory().unwrap();
        let err = store.enqueue(request(doc(""), 5), t0()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_id() {
        let store = RedbStore::in_memory().unwrap();
        store.enqueue(request(doc("low"), 10), t0()).await.unwrap();
        store.enqueue(request(doc("high-1"), 1), t0()).await.unwrap();
        store.enqueue(request(doc("high-2"), 1), t0()).await.unwrap();

        let claimed = store.claim_batch("mock", 2, t0()).await.unwrap();
        let ids: Vec<&str> = claimed.iter().map(|j| j.key.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["high-1", "high-2"]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::InProgress));

        let rest = store.claim_batch("mock", 10, t0()).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(store.claim_batch("mock", 10, t0()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_filters_by_provider() {
        let store = RedbStore::in_memory().unwrap();
        store.enqueue(request(doc("a"), 5), t0()).await.unwrap();
        assert!(store.claim_batch("ollama", 10, t0()).await.unwrap().is_empty());
        assert_eq!(store.claim_batch("mock", 10, t0()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_pending_waits_for_next_retry_at() {
        let store = RedbStore::in_memory().unwrap();
        store.enqueue(request(doc("a"), 5), t0()).await.unwrap();
        let job = store.claim_batch("mock", 1, t0()).await.unwrap().remove(0);

        let retry_at = t0() + Duration::seconds(5);
        let job = store.reschedule(job.id, "boom", retry_at, true, t0()).await.unwrap();
        assert_eq!(job.status, JobStatus::RetryPending);
        assert_eq!(job.retry_count, 1);

        assert!(store.claim_batch("mock", 1, t0()).await.unwrap().is_empty());
        assert_eq!(store.next_due_at("mock").await.unwrap(), Some(retry_at));

        let claimed = store.claim_batch("mock", 1, retry_at).await.unwrap().remove(0);
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::InProgress);
        assert_eq!(claimed.retry_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_transitions_rejected() {
        let store = RedbStore::in_memory().unwrap();
        let job = store.enqueue(request(doc("a"), 5), t0()).await.unwrap().into_job();

        let err = store.complete(job.id, t0()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let err = store.fail(job.id, "x", 0, t0()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(matches!(
            store.complete(999, t0()).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_complete_removes_from_queue() {
        let store = RedbStore::in_memory().unwrap();
        store.enqueue(request(doc("a"), 5), t0()).await.unwrap();
        let job = store.claim_batch("mock", 1, t0()).await.unwrap().remove(0);
        let done = store.complete(job.id, t0()).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(store.next_due_at("mock").await.unwrap(), None);

        // A new request after completion creates a fresh job.
        let next = store.enqueue(request(doc("a"), 5), t0()).await.unwrap();
        assert!(matches!(next, EnqueueOutcome::Created(ref j) if j.id == 2));
        assert_eq!(store.latest_job_for(&doc("a")).await.unwrap().unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_request_during_flight_spawns_follow_up() {
        let store = RedbStore::in_memory().unwrap();
        store.enqueue(request(doc("a"), 5), t0()).await.unwrap();
        let job = store.claim_batch("mock", 1, t0()).await.unwrap().remove(0);

        let merged = store.enqueue(request(doc("a"), 1), t0()).await.unwrap();
        assert!(matches!(merged, EnqueueOutcome::Merged(ref j) if j.rerun_requested));

        store.complete(job.id, t0()).await.unwrap();
        let follow_up = store.latest_job_for(&doc("a")).await.unwrap().unwrap();
        assert_ne!(follow_up.id, job.id);
        assert_eq!(follow_up.status, JobStatus::Pending);
        assert_eq!(follow_up.priority, 1);
        assert_eq!(follow_up.retry_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_pending_and_deferred() {
        let store = RedbStore::in_memory().unwrap();
        store.enqueue(request(doc("a"), 5), t0()).await.unwrap();
        store.enqueue(request(doc("b"), 5), t0()).await.unwrap();

        let outcome = store.cancel(&doc("a"), t0()).await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Cancelled(ref j) if j.status == JobStatus::Cancelled));

        let job = store.claim_batch("mock", 1, t0()).await.unwrap().remove(0);
        assert_eq!(job.key, doc("b"));
        let outcome = store.cancel(&doc("b"), t0()).await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Deferred(_)));

        let requeued = store.reschedule(job.id, "boom", t0(), true, t0()).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Cancelled);

        assert!(matches!(
            store.cancel(&doc("b"), t0()).await.unwrap(),
            CancelOutcome::NotFound
        ));
        assert!(matches!(
            store.cancel(&doc("zzz"), t0()).await.unwrap(),
            CancelOutcome::NotFound
        ));
    }

    #[tokio::test]
    async fn test_release_paused_and_recover_in_flight() {
        let store = RedbStore::in_memory().unwrap();
        store.enqueue(request(doc("a"), 5), t0()).await.unwrap();
        store.enqueue(request(doc("b"), 5), t0()).await.unwrap();
        let claimed = store.claim_batch("mock", 2, t0()).await.unwrap();

        let far = t0() + Duration::minutes(10);
        store.reschedule(claimed[0].id, "down", far, false, t0()).await.unwrap();
        assert_eq!(store.release_paused("mock", t0()).await.unwrap(), 1);
        assert_eq!(store.claim_batch("mock", 5, t0()).await.unwrap().len(), 1);

        // Both jobs are now in flight; simulate a crash.
        assert_eq!(store.recover_in_flight(t0()).await.unwrap(), 2);
        let recovered = store.claim_batch("mock", 5, t0()).await.unwrap();
        assert_eq!(recovered.len(), 2);
        assert!(recovered.iter().all(|j| j.retry_count == 0));
    }

    #[tokio::test]
    async fn test_list_and_prune() {
        let store = RedbStore::in_memory().unwrap();
        for id in ["a", "b", "c"] {
            store.enqueue(request(doc(id), 5), t0()).await.unwrap();
        }
        let job = store.claim_batch("mock", 1, t0()).await.unwrap().remove(0);
        store.complete(job.id, t0()).await.unwrap();

        let listed = store.list_jobs(None, 2).await.unwrap();
        assert_eq!(listed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![3, 2]);
        let done = store.list_jobs(Some(JobStatus::Completed), 10).await.unwrap();
        assert_eq!(done.len(), 1);

        let pruned = store.prune_terminal(t0() + Duration::seconds(1)).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_job(job.id).await.unwrap().is_none());
        assert!(store.latest_job_for(&job.key).await.unwrap().is_none());
        assert_eq!(store.job_counts().await.unwrap().total(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_overlap() {
        let store = RedbStore::in_memory().unwrap();
        for i in 0..40 {
            store
                .enqueue(request(doc(&format!("e{i}")), 5), t0())
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_batch("mock", 3, t0()).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|j| j.id));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 40);
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sift.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.enqueue(request(doc("a"), 5), t0()).await.unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        let job = store.latest_job_for(&doc("a")).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        let next = store.enqueue(request(doc("b"), 5), t0()).await.unwrap();
        assert_eq!(next.job().id, 2);
    }

    // ------------------------------------------------------------------------
    // Chunks
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_replace_and_read_chunks() {
        let store = RedbStore::in_memory().unwrap();
        let key = doc("a");
        let h1 = hash_content("v1");
        store
            .replace_entity_chunks(&key, chunks(&key, &h1, &[vec![1.0, 0.0], vec![0.0, 1.0]]))
            .await
            .unwrap();

        let stored = store.entity_chunks(&key).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].embedding, vec![0.0, 1.0]);
        assert!(store.is_fresh(&key, &h1, "m").await.unwrap());
        assert!(!store.is_fresh(&key, &h1, "other-model").await.unwrap());

        let h2 = hash_content("v2");
        store
            .replace_entity_chunks(&key, chunks(&key, &h2, &[vec![0.5, 0.5]]))
            .await
            .unwrap();
        let stored = store.entity_chunks(&key).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored.iter().all(|c| c.content_hash == h2));
        assert!(!store.is_fresh(&key, &h1, "m").await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_rejects_inconsistent_set() {
        let store = RedbStore::in_memory().unwrap();
        let key = doc("a");
        let h1 = hash_content("v1");
        store
            .replace_entity_chunks(&key, chunks(&key, &h1, &[vec![1.0, 0.0]]))
            .await
            .unwrap();

        let mut bad = chunks(&key, &h1, &[vec![1.0, 0.0], vec![1.0, 0.0, 0.0]]);
        assert!(store.replace_entity_chunks(&key, bad.clone()).await.is_err());
        bad[1].embedding = vec![];
        assert!(store.replace_entity_chunks(&key, bad).await.is_err());
        let foreign = chunks(&doc("b"), &h1, &[vec![1.0, 0.0]]);
        assert!(store.replace_entity_chunks(&key, foreign).await.is_err());

        // The original set is untouched.
        assert_eq!(store.entity_chunks(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_chunks_is_scoped_to_entity() {
        let store = RedbStore::in_memory().unwrap();
        let h = hash_content("x");
        for id in ["a", "ab", "a b"] {
            let key = doc(id);
            store
                .replace_entity_chunks(&key, chunks(&key, &h, &[vec![1.0], vec![0.5]]))
                .await
                .unwrap();
        }
        assert_eq!(store.delete_entity_chunks(&doc("a")).await.unwrap(), 2);
        assert!(store.entity_chunks(&doc("a")).await.unwrap().is_empty());
        assert_eq!(store.entity_chunks(&doc("ab")).await.unwrap().len(), 2);
        assert_eq!(store.entity_chunks(&doc("a b")).await.unwrap().len(), 2);

        let stats = store.chunk_stats().await.unwrap();
        assert_eq!(stats.entities, 2);
        assert_eq!(stats.chunks, 4);
        assert_eq!(stats.models.get("m"), Some(&2));
    }

    #[tokio::test]
    async fn test_nearest_best_chunk_per_entity() {
        let store = RedbStore::in_memory().unwrap();
        let h = hash_content("x");
        let a = doc("a");
        let b = doc("b");
        let flavor = EntityKey::new(EntityType::Flavor, "f");
        store
            .replace_entity_chunks(&a, chunks(&a, &h, &[vec![0.0, 1.0], vec![0.9, 0.1]]))
            .await
            .unwrap();
        store
            .replace_entity_chunks(&b, chunks(&b, &h, &[vec![0.6, 0.4]]))
            .await
            .unwrap();
        store
            .replace_entity_chunks(&flavor, chunks(&flavor, &h, &[vec![1.0, 0.0]]))
            .await
            .unwrap();

        let query = [1.0, 0.0];
        let all = store
            .nearest(&NearestQuery {
                embedding: &query,
                model: "m",
                limit: 10,
                min_similarity: 0.0,
                entity_type: None,
            })
            .await
            .unwrap();
        let keys: Vec<&str> = all.iter().map(|m| m.key.entity_id.as_str()).collect();
        assert_eq!(keys, vec!["f", "a", "b"]);
        assert_eq!(all[1].chunk_index, 1);
        assert_eq!(all[1].text, "chunk 1");

        let docs_only = store
            .nearest(&NearestQuery {
                embedding: &query,
                model: "m",
                limit: 10,
                min_similarity: 0.9,
                entity_type: Some(EntityType::Documentation),
            })
            .await
            .unwrap();
        assert_eq!(docs_only.len(), 1);
        assert_eq!(docs_only[0].key, a);

        let other_model = store
            .nearest(&NearestQuery {
                embedding: &query,
                model: "other",
                limit: 10,
                min_similarity: 0.0,
                entity_type: None,
            })
            .await
            .unwrap();
        assert!(other_model.is_empty());
    }

    fn query(embedding: &[f32], min_similarity: f32) -> NearestQuery<'_> {
        NearestQuery {
            embedding,
            model: "m",
            limit: 10,
            min_similarity,
            entity_type: None,
        }
    }

    #[tokio::test]
    async fn test_nearest_drops_replaced_and_deleted_vectors() {
        let store = RedbStore::in_memory().unwrap();
        let a = doc("a");
        let b = doc("b");
        let h1 = hash_content("v1");
        store
            .replace_entity_chunks(&a, chunks(&a, &h1, &[vec![1.0, 0.0]]))
            .await
            .unwrap();
        store
            .replace_entity_chunks(&b, chunks(&b, &h1, &[vec![0.8, 0.6]]))
            .await
            .unwrap();

        // Loads the index before the writes below.
        let before = store.nearest(&query(&[1.0, 0.0], 0.5)).await.unwrap();
        assert_eq!(before.len(), 2);

        let h2 = hash_content("v2");
        store
            .replace_entity_chunks(&a, chunks(&a, &h2, &[vec![0.0, 1.0]]))
            .await
            .unwrap();
        store.delete_entity_chunks(&b).await.unwrap();

        let after = store.nearest(&query(&[1.0, 0.0], 0.5)).await.unwrap();
        assert!(after.is_empty(), "{after:?}");

        let current = store.nearest(&query(&[0.0, 1.0], 0.5)).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].key, a);
    }

    #[tokio::test]
    async fn test_nearest_rebuilds_index_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sift.redb");
        let key = doc("a");
        {
            let store = RedbStore::open(&path).unwrap();
            store
                .replace_entity_chunks(&key, chunks(&key, &hash_content("x"), &[vec![0.6, 0.8]]))
                .await
                .unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        let hits = store.nearest(&query(&[0.6, 0.8], 0.9)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, key);
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_health_upsert() {
        let store = RedbStore::in_memory().unwrap();
        assert!(store.get_health("mock").await.unwrap().is_none());

        let mut health = ProviderHealth::new("mock");
        health.record_failure("down", t0());
        store.upsert_health(&health).await.unwrap();
        health.record_success(t0());
        store.upsert_health(&health).await.unwrap();

        let stored = store.get_health("mock").await.unwrap().unwrap();
        assert!(stored.is_available);
        assert_eq!(store.list_health().await.unwrap().len(), 1);
    }

    #[test]
    fn test_embedding_bytes_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(deserialize_embedding(&serialize_embedding(&v)), v);
    }
}
