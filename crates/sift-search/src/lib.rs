//! Hybrid search for Sift.
//!
//! Combines an external keyword index with vector similarity over stored
//! chunk embeddings using weighted Reciprocal Rank Fusion.
//!
//! # Example
//!
//! ```rust,ignore
//! use sift_search::{HybridSearchService, SearchOptions};
//!
//! let service = HybridSearchService::new(provider, store, keyword_index, config)?;
//! let response = service.search("borrow checker", &SearchOptions::default()).await?;
//! for hit in &response.hits {
//!     println!("{} {:.4}", hit.key, hit.score);
//! }
//! ```

pub mod config;
pub mod fusion;
pub mod keyword;
pub mod service;

pub use config::HybridConfig;
pub use fusion::{FusedHit, HitSource, rrf_contribution, weighted_rrf};
pub use keyword::{KeywordIndex, KeywordQuery};
pub use service::{HybridSearchService, SearchOptions, SearchResponse, SearchSide};
