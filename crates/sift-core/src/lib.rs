//! Shared types, errors, and the content-source seam for Sift.
//!
//! This crate provides the foundational types used across all Sift crates.
//! It has no internal Sift dependencies.
//!
//! # Modules
//!
//! - [`error`]: Error type, failure taxonomy, and Result alias
//! - [`types`]: Entities, jobs, chunks, provider health, content events
//! - [`content`]: The [`ContentSource`] trait and an in-memory implementation

pub mod content;
pub mod error;
pub mod types;

// Re-export key types at crate root for convenience
pub use content::{ContentSource, MemoryContentSource};
pub use error::{Error, FailureKind, Result};
pub use types::{
    Chunk, Content, ContentEvent, EmbeddingJob, EntityKey, EntityType, JobRequest, JobStatus,
    JobType, ProviderHealth, hash_content, priority,
};
