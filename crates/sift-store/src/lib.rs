//! Persistence for Sift: the embedding job queue, the chunk/vector store,
//! and provider health rows.
//!
//! # Modules
//!
//! - [`traits`]: [`JobStore`], [`VectorStore`], [`HealthStore`] and their result types
//! - [`redb_store`]: [`RedbStore`], one redb database implementing all three,
//!   with an in-memory HNSW index answering nearest-neighbour queries
//! - [`config`]: [`StoreConfig`]

pub mod config;
pub mod redb_store;
pub mod traits;
mod vector_index;

pub use config::StoreConfig;
pub use redb_store::RedbStore;
pub use traits::{
    CancelOutcome, ChunkStats, EnqueueOutcome, EntityFingerprint, HealthStore, JobCounts,
    JobStore, NearestQuery, VectorMatch, VectorStore,
};
