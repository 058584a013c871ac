//! Domain types shared by every Sift crate.
//!
//! These are the persisted shapes of the three logical tables (chunks,
//! embedding jobs, provider health) plus the identifiers and events that
//! connect them to the external content store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Entity identity
// ============================================================================

/// The kind of content entity that owns embeddable text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    /// Reference documentation page.
    Documentation,
    /// Migration transformation (old pattern → new pattern).
    Transformation,
    /// Curated flavor/guideline.
    Flavor,
    /// Code example.
    CodeExample,
    /// Wiki release notes.
    WikiReleaseNotes,
    /// Wiki migration guide.
    WikiMigrationGuide,
    /// Project description.
    Project,
}

impl EntityType {
    /// Every entity type, in a stable order.
    pub const ALL: [EntityType; 7] = [
        EntityType::Documentation,
        EntityType::Transformation,
        EntityType::Flavor,
        EntityType::CodeExample,
        EntityType::WikiReleaseNotes,
        EntityType::WikiMigrationGuide,
        EntityType::Project,
    ];

    /// Canonical tag as stored and displayed.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Documentation => "DOCUMENTATION",
            Self::Transformation => "TRANSFORMATION",
            Self::Flavor => "FLAVOR",
            Self::CodeExample => "CODE_EXAMPLE",
            Self::WikiReleaseNotes => "WIKI_RELEASE_NOTES",
            Self::WikiMigrationGuide => "WIKI_MIGRATION_GUIDE",
            Self::Project => "PROJECT",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| Error::validation(format!("Unknown entity type: '{s}'")))
    }
}

/// Identifies one content entity: `(entity_type, entity_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Kind of the owning entity.
    pub entity_type: EntityType,
    /// Identifier assigned by the content store.
    pub entity_id: String,
}

impl EntityKey {
    /// Create a new entity key.
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    /// Reject ids that cannot be stored.
    pub fn validate(&self) -> Result<()> {
        if self.entity_id.trim().is_empty() {
            return Err(Error::validation(format!(
                "{} entity id must not be empty",
                self.entity_type
            )));
        }
        if self.entity_id.contains('\0') {
            return Err(Error::validation(format!(
                "{} entity id must not contain NUL",
                self.entity_type
            )));
        }
        Ok(())
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.entity_type, self.entity_id)
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// Job priorities. Lower values are served first.
pub mod priority {
    /// Manually requested, single-entity work.
    pub const USER: i32 = 1;
    /// Triggered by a content change event.
    pub const INCREMENTAL: i32 = 5;
    /// Corpus-wide re-sync.
    pub const BULK: i32 = 10;
}

/// Why a job exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Part of a corpus-wide re-embedding pass.
    FullSync,
    /// Part of a pass over stale or unembedded entities only.
    Incremental,
    /// A single entity, requested directly or by a change event.
    SingleEntity,
}

impl JobType {
    /// Default priority for jobs of this type.
    pub fn default_priority(&self) -> i32 {
        match self {
            Self::FullSync => priority::BULK,
            Self::Incremental => priority::INCREMENTAL,
            Self::SingleEntity => priority::USER,
        }
    }
}

/// Embedding job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Waiting for `next_retry_at` before being claimed again.
    RetryPending,
    /// Finished successfully.
    Completed,
    /// Retries exhausted or unrecoverable.
    Failed,
    /// Cancelled before it ran.
    Cancelled,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::RetryPending,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Terminal states are append-only history.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, RetryPending)
                | (RetryPending, InProgress)
                | (InProgress, Failed)
                | (Pending, Cancelled)
                | (RetryPending, Cancelled)
        )
    }

    /// Canonical tag as stored and displayed.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::RetryPending => "RETRY_PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == normalized)
            .ok_or_else(|| Error::validation(format!("Unknown job status: '{s}'")))
    }
}

/// A request to (re-)embed one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Entity to embed.
    pub key: EntityKey,
    /// Why the job exists.
    pub job_type: JobType,
    /// Lower is more urgent.
    pub priority: i32,
    /// Provider the job is bound to.
    pub provider: String,
    /// Model the job embeds with.
    pub model: String,
    /// Retry budget for recoverable failures.
    pub max_retries: u32,
}

/// Durable record of embedding work for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingJob {
    /// Monotonic identifier; also the insertion order.
    pub id: u64,
    /// Entity to embed.
    #[serde(flatten)]
    pub key: EntityKey,
    /// Why the job exists.
    pub job_type: JobType,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Lower is more urgent.
    pub priority: i32,
    /// Recoverable failures so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Earliest time a `RETRY_PENDING` job may be claimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Provider the job is bound to.
    pub provider: String,
    /// Model the job embeds with.
    pub model: String,
    /// Last requeue was caused by provider unavailability.
    #[serde(default)]
    pub paused_for_unavailability: bool,
    /// Cancellation requested while in flight.
    #[serde(default)]
    pub cancel_requested: bool,
    /// A new request arrived while in flight.
    #[serde(default)]
    pub rerun_requested: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Last claim time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl EmbeddingJob {
    /// Create a `PENDING` job from a request.
    pub fn new(id: u64, request: JobRequest, now: DateTime<Utc>) -> Self {
        Self {
            id,
            key: request.key,
            job_type: request.job_type,
            status: JobStatus::Pending,
            priority: request.priority,
            retry_count: 0,
            max_retries: request.max_retries,
            next_retry_at: None,
            last_error: None,
            provider: request.provider,
            model: request.model,
            paused_for_unavailability: false,
            cancel_requested: false,
            rerun_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::RetryPending => self.next_retry_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// Claim: `PENDING | RETRY_PENDING → IN_PROGRESS`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::InProgress, now)?;
        self.started_at = Some(now);
        self.next_retry_at = None;
        self.paused_for_unavailability = false;
        Ok(())
    }

    /// `IN_PROGRESS → COMPLETED`. A deferred cancellation is moot once the
    /// work is done.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Completed, now)?;
        self.completed_at = Some(now);
        self.last_error = None;
        self.cancel_requested = false;
        Ok(())
    }

    /// `IN_PROGRESS → RETRY_PENDING`, or on to `CANCELLED` when a
    /// cancellation was requested while the job was running.
    pub fn reschedule(
        &mut self,
        error: impl Into<String>,
        next_retry_at: DateTime<Utc>,
        consume_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(JobStatus::RetryPending, now)?;
        self.last_error = Some(error.into());
        self.next_retry_at = Some(next_retry_at);
        self.paused_for_unavailability = !consume_attempt;
        if consume_attempt {
            self.retry_count += 1;
        }
        if self.cancel_requested {
            self.transition(JobStatus::Cancelled, now)?;
            self.cancel_requested = false;
            self.next_retry_at = None;
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// `IN_PROGRESS → FAILED`.
    pub fn fail(&mut self, error: impl Into<String>, retry_count: u32, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Failed, now)?;
        self.last_error = Some(error.into());
        self.retry_count = retry_count;
        self.cancel_requested = false;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Cancel now if claimable, otherwise record the request for later.
    ///
    /// Returns `true` when the job was cancelled immediately.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<bool> {
        match self.status {
            JobStatus::Pending | JobStatus::RetryPending => {
                self.transition(JobStatus::Cancelled, now)?;
                self.next_retry_at = None;
                self.completed_at = Some(now);
                Ok(true)
            }
            JobStatus::InProgress => {
                self.cancel_requested = true;
                self.rerun_requested = false;
                self.updated_at = now;
                Ok(false)
            }
            terminal => Err(Error::invalid_state(format!(
                "job {} is already {terminal}",
                self.id
            ))),
        }
    }

    /// Fold a duplicate request into this non-terminal job.
    pub fn merge_request(&mut self, priority: i32, now: DateTime<Utc>) {
        self.priority = self.priority.min(priority);
        self.updated_at = now;
        if self.status == JobStatus::InProgress {
            self.rerun_requested = true;
            self.cancel_requested = false;
        }
    }

    /// The request a follow-up job should be created from.
    pub fn follow_up_request(&self) -> JobRequest {
        JobRequest {
            key: self.key.clone(),
            job_type: self.job_type,
            priority: self.priority,
            provider: self.provider.clone(),
            model: self.model.clone(),
            max_retries: self.max_retries,
        }
    }
}

// ============================================================================
// Chunks
// ============================================================================

/// An embedded text segment of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Owning entity.
    #[serde(flatten)]
    pub key: EntityKey,
    /// 0-based position within the entity.
    pub chunk_index: u32,
    /// Segment text.
    pub text: String,
    /// Estimated token count of `text`.
    pub token_count: u32,
    /// Embedding vector.
    pub embedding: Vec<f32>,
    /// Model that produced `embedding`.
    pub embedding_model: String,
    /// Hash of the entity text this chunk was derived from.
    pub content_hash: String,
    /// Write time.
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Embedding dimension.
    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }

    /// A chunk's vector and model tag are only ever written together.
    pub fn validate(&self) -> Result<()> {
        self.key.validate()?;
        if self.embedding.is_empty() {
            return Err(Error::validation(format!(
                "chunk {} of {} has an empty embedding",
                self.chunk_index, self.key
            )));
        }
        if self.embedding_model.trim().is_empty() {
            return Err(Error::validation(format!(
                "chunk {} of {} has no embedding model",
                self.chunk_index, self.key
            )));
        }
        if self.embedding.iter().any(|v| !v.is_finite()) {
            return Err(Error::validation(format!(
                "chunk {} of {} has non-finite embedding values",
                self.chunk_index, self.key
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Provider health
// ============================================================================

/// Health of one embedding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    /// Provider name.
    pub provider: String,
    /// Result of the last probe.
    pub is_available: bool,
    /// Time of the last probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<DateTime<Utc>>,
    /// Time of the last successful probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    /// Last failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

impl ProviderHealth {
    /// Initial state: unavailable, never checked.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            is_available: false,
            last_check_at: None,
            last_success_at: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }

    /// Record a successful probe.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.is_available = true;
        self.last_check_at = Some(now);
        self.last_success_at = Some(now);
        self.last_error = None;
        self.consecutive_failures = 0;
    }

    /// Record a failed probe.
    pub fn record_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.is_available = false;
        self.last_check_at = Some(now);
        self.last_error = Some(error.into());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// Whether the last check is younger than `interval`.
    pub fn is_fresh(&self, interval: Duration, now: DateTime<Utc>) -> bool {
        self.last_check_at.is_some_and(|at| now - at < interval)
    }

    /// This row as it reads at `now`. Availability lapses once the last
    /// success is older than `interval`, so a row left behind by a stopped
    /// monitor does not keep claiming the provider is up.
    pub fn as_of(mut self, interval: Duration, now: DateTime<Utc>) -> Self {
        let confirmed = self.last_success_at.is_some_and(|at| now - at < interval);
        if self.is_available && !confirmed {
            self.is_available = false;
        }
        self
    }
}

// ============================================================================
// Content
// ============================================================================

/// Current text of an entity as reported by the content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// Embeddable text.
    pub text: String,
    /// Hash used to detect staleness of stored chunks.
    pub content_hash: String,
}

impl Content {
    /// Wrap text, hashing it with blake3.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let content_hash = hash_content(&text);
        Self { text, content_hash }
    }

    /// Wrap text with a hash supplied by the content store.
    pub fn with_hash(text: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            content_hash: content_hash.into(),
        }
    }
}

/// Hex-encoded blake3 hash of `text`.
pub fn hash_content(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Content-store notification, delivered as a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ContentEvent {
    /// Entity created or updated.
    Changed {
        /// Entity that changed.
        key: EntityKey,
        /// Hash of the new content.
        content_hash: String,
    },
    /// Entity removed.
    Deleted {
        /// Entity that was removed.
        key: EntityKey,
    },
}

impl ContentEvent {
    /// Entity the event refers to.
    pub fn key(&self) -> &EntityKey {
        match self {
            Self::Changed { key, .. } | Self::Deleted { key } => key,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request() -> JobRequest {
        JobRequest {
            key: EntityKey::new(EntityType::Documentation, "42"),
            job_type: JobType::SingleEntity,
            priority: priority::USER,
            provider: "mock".to_string(),
            model: "mock-8".to_string(),
            max_retries: 3,
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    // ------------------------------------------------------------------------
    // Entity identity
    // ------------------------------------------------------------------------

    #[test]
    fn test_entity_type_parse() {
        assert_eq!(
            "code_example".parse::<EntityType>().unwrap(),
            EntityType::CodeExample
        );
        assert_eq!(
            "wiki-release-notes".parse::<EntityType>().unwrap(),
            EntityType::WikiReleaseNotes
        );
        assert!("nonsense".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_entity_type_serde_tag() {
        let json = serde_json::to_string(&EntityType::WikiMigrationGuide).unwrap();
        assert_eq!(json, "\"WIKI_MIGRATION_GUIDE\"");
    }

    #[test]
    fn test_entity_key_validate() {
        assert!(EntityKey::new(EntityType::Flavor, "ok").validate().is_ok());
        assert!(EntityKey::new(EntityType::Flavor, "  ").validate().is_err());
        assert!(EntityKey::new(EntityType::Flavor, "a\0b").validate().is_err());
    }

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey::new(EntityType::Project, "spring-boot");
        assert_eq!(key.to_string(), "PROJECT #spring-boot");
    }

    // ------------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------------

    #[test]
    fn test_status_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(RetryPending));
        assert!(RetryPending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(RetryPending.can_transition_to(Cancelled));

        assert!(!InProgress.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(RetryPending));
        assert!(!Cancelled.can_transition_to(Pending));
    }

    #[test]
    fn test_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::RetryPending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_job_happy_path() {
        let mut job = EmbeddingJob::new(1, request(), now());
        assert_eq!(job.status, JobStatus::Pending);

        job.start(now()).unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.started_at, Some(now()));

        job.complete(now()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_job_invalid_transition_rejected() {
        let mut job = EmbeddingJob::new(1, request(), now());
        let err = job.complete(now()).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_reschedule_consumes_attempt() {
        let mut job = EmbeddingJob::new(1, request(), now());
        job.start(now()).unwrap();
        let later = now() + Duration::seconds(5);
        job.reschedule("bad input", later, true, now()).unwrap();

        assert_eq!(job.status, JobStatus::RetryPending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.next_retry_at, Some(later));
        assert!(!job.paused_for_unavailability);
        assert!(!job.is_due(now()));
        assert!(job.is_due(later));
    }

    #[test]
    fn test_reschedule_pause_keeps_retry_count() {
        let mut job = EmbeddingJob::new(1, request(), now());
        job.start(now()).unwrap();
        job.reschedule("down", now(), false, now()).unwrap();

        assert_eq!(job.retry_count, 0);
        assert!(job.paused_for_unavailability);
    }

    #[test]
    fn test_cancel_pending_is_immediate() {
        let mut job = EmbeddingJob::new(1, request(), now());
        assert!(job.cancel(now()).unwrap());
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_cancel_in_flight_is_deferred_to_retry() {
        let mut job = EmbeddingJob::new(1, request(), now());
        job.start(now()).unwrap();
        assert!(!job.cancel(now()).unwrap());
        assert_eq!(job.status, JobStatus::InProgress);
        assert!(job.cancel_requested);

        job.reschedule("bad input", now(), true, now()).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(!job.cancel_requested);
    }

    #[test]
    fn test_cancel_in_flight_moot_after_completion() {
        let mut job = EmbeddingJob::new(1, request(), now());
        job.start(now()).unwrap();
        job.cancel(now()).unwrap();
        job.complete(now()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(!job.cancel_requested);
    }

    #[test]
    fn test_cancel_terminal_rejected() {
        let mut job = EmbeddingJob::new(1, request(), now());
        job.start(now()).unwrap();
        job.complete(now()).unwrap();
        assert!(job.cancel(now()).is_err());
    }

    #[test]
    fn test_merge_request_keeps_most_urgent_priority() {
        let mut job = EmbeddingJob::new(1, request(), now());
        job.merge_request(priority::BULK, now());
        assert_eq!(job.priority, priority::USER);
        assert!(!job.rerun_requested);

        job.start(now()).unwrap();
        job.merge_request(0, now());
        assert_eq!(job.priority, 0);
        assert!(job.rerun_requested);
    }

    #[test]
    fn test_job_serialization_flattens_key() {
        let job = EmbeddingJob::new(7, request(), now());
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"entity_type\":\"DOCUMENTATION\""));
        assert!(json.contains("\"status\":\"PENDING\""));
        assert!(!json.contains("next_retry_at"));

        let back: EmbeddingJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }

    // ------------------------------------------------------------------------
    // Chunks, health, content
    // ------------------------------------------------------------------------

    #[test]
    fn test_chunk_validate() {
        let mut chunk = Chunk {
            key: EntityKey::new(EntityType::Documentation, "1"),
            chunk_index: 0,
            text: "hello".to_string(),
            token_count: 2,
            embedding: vec![0.1, 0.2],
            embedding_model: "m".to_string(),
            content_hash: hash_content("hello"),
            created_at: now(),
        };
        assert!(chunk.validate().is_ok());

        chunk.embedding_model.clear();
        assert!(chunk.validate().is_err());

        chunk.embedding_model = "m".to_string();
        chunk.embedding.clear();
        assert!(chunk.validate().is_err());

        chunk.embedding = vec![f32::NAN];
        assert!(chunk.validate().is_err());
    }

    #[test]
    fn test_provider_health_lifecycle() {
        let mut health = ProviderHealth::new("ollama");
        assert!(!health.is_available);
        assert!(!health.is_fresh(Duration::seconds(60), now()));

        health.record_failure("refused", now());
        health.record_failure("refused", now());
        assert_eq!(health.consecutive_failures, 2);
        assert!(!health.is_available);

        health.record_success(now());
        assert!(health.is_available);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_error.is_none());
        assert!(health.is_fresh(Duration::seconds(60), now() + Duration::seconds(30)));
        assert!(!health.is_fresh(Duration::seconds(60), now() + Duration::seconds(61)));
    }

    #[test]
    fn test_provider_health_lapses_without_success() {
        let mut health = ProviderHealth::new("ollama");
        health.record_success(now());

        let recent = health.clone().as_of(Duration::seconds(1), now());
        assert!(recent.is_available);

        let later = now() + Duration::milliseconds(1500);
        let lapsed = health.clone().as_of(Duration::seconds(1), later);
        assert!(!lapsed.is_available);
        assert_eq!(lapsed.last_success_at, health.last_success_at);

        health.record_failure("refused", now());
        assert!(!health.as_of(Duration::seconds(60), now()).is_available);
    }

    #[test]
    fn test_content_hash_stable() {
        let a = Content::new("same text");
        let b = Content::new("same text");
        let c = Content::new("other text");
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);
        assert_eq!(a.content_hash.len(), 64);
    }

    #[test]
    fn test_content_event_serialization() {
        let event = ContentEvent::Deleted {
            key: EntityKey::new(EntityType::Flavor, "f1"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"deleted\""));
        assert_eq!(event.key().entity_id, "f1");
    }
}
