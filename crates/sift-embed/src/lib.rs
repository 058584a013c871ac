//! Chunking and embedding providers for Sift.
//!
//! # Features
//!
//! - `local-fastembed`: Enable in-process embedding generation via fastembed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       sift-embed                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Chunker (text-splitter, estimated tokens, with overlap)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  EmbeddingProvider trait                                    │
//! │  ├── OllamaProvider (POST /api/embed)                       │
//! │  ├── OpenAiProvider (POST /v1/embeddings)                   │
//! │  ├── FastEmbedProvider (feature: local-fastembed)           │
//! │  ├── MockEmbeddingProvider (always available)               │
//! │  └── RetryingProvider (in-call retry of unavailability)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  create_provider (selection from ProviderConfig)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod chunker;
pub mod config;
pub mod factory;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod retry;

#[cfg(feature = "local-fastembed")]
pub mod fastembed;

pub use chunker::{Chunker, EstimatedTokens, TextChunk, chunk, estimate_tokens};
pub use config::{ChunkingConfig, MAX_CALL_RETRY_DELAY, ProviderConfig, ProviderKind};
pub use factory::create_provider;
pub use mock::{MockEmbeddingProvider, MockFailure};
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use provider::{EmbeddingProvider, embed_in_batches, validate_embeddings};
pub use retry::RetryingProvider;

#[cfg(feature = "local-fastembed")]
pub use fastembed::FastEmbedProvider;
