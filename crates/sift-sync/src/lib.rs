//! Embedding synchronization for Sift.
//!
//! Keeps stored chunk embeddings in step with the content store: content
//! events and corpus syncs enqueue jobs, a worker pool chunks and embeds
//! the text, and a health monitor pauses the whole pipeline while the
//! provider is down.
//!
//! # Modules
//!
//! - [`service`]: [`EmbeddingService`], enqueueing and status queries
//! - [`processor`]: [`JobProcessor`], the dispatcher and worker pool
//! - [`health`]: [`HealthMonitor`], cached provider availability
//! - [`backoff`]: [`RetryPolicy`], job-level retry decisions
//! - [`config`]: job, retry, and health settings

pub mod backoff;
pub mod config;
pub mod health;
pub mod processor;
pub mod service;

pub use backoff::{RetryDecision, RetryPolicy};
pub use config::{HealthConfig, JobConfig, RetryConfig};
pub use health::HealthMonitor;
pub use processor::{JobOutcome, JobProcessor, ProcessStats, ProcessorSettings, SyncContext};
pub use service::{EmbeddingService, EventOutcome, ServiceStats, SyncSummary};
