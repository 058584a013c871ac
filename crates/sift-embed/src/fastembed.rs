//! In-process embedding via the `fastembed` crate.
//!
//! `fastembed::TextEmbedding` is not `Sync`, so the model sits behind
//! `Arc<Mutex<>>` and every call runs on the blocking pool. A call that
//! outlives the configured timeout is reported as unavailability; the
//! blocking work itself cannot be interrupted and finishes in the background.
//!
//! Requires the `local-fastembed` feature.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sift_core::{Error, Result};
use tokio::task::JoinHandle;

use crate::provider::{EmbeddingProvider, validate_embeddings};

const NAME: &str = "fastembed";

/// Map a model name string to a fastembed `EmbeddingModel` enum variant.
fn resolve_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => Err(Error::config(format!(
            "Unknown fastembed model: '{other}'. Supported: bge-small-en-v1.5, bge-base-en-v1.5, all-minilm-l6-v2, nomic-embed-text-v1.5"
        ))),
    }
}

/// Wait for a blocking embedding task, giving up after `timeout`.
async fn bounded<T>(timeout: Duration, task: JoinHandle<Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => {
            joined.map_err(|e| Error::provider(NAME, format!("embedding task failed: {e}")))?
        }
        Err(_) => Err(Error::unavailable(
            NAME,
            format!("embedding timed out after {timeout:?}"),
        )),
    }
}

/// Embedding provider running a local ONNX model.
pub struct FastEmbedProvider {
    model: Arc<Mutex<fastembed::TextEmbedding>>,
    dimensions: usize,
    model_name: String,
    timeout: Duration,
}

impl FastEmbedProvider {
    /// Load (downloading if needed) the named model. Each embedding call is
    /// bounded by `timeout`.
    pub fn new(model_name: &str, cache_path: Option<&str>, timeout: Duration) -> Result<Self> {
        let model_enum = resolve_model(model_name)?;

        let mut init = fastembed::InitOptions::new(model_enum);
        if let Some(path) = cache_path {
            init = init.with_cache_dir(std::path::PathBuf::from(path));
        }

        let mut text_embedding = fastembed::TextEmbedding::try_new(init)
            .map_err(|e| Error::unavailable(NAME, format!("failed to load model: {e}")))?;

        let probe = text_embedding
            .embed(vec!["dimension probe"], None)
            .map_err(|e| Error::unavailable(NAME, format!("failed to probe dimension: {e}")))?;
        let dimensions = probe
            .first()
            .map(|v| v.len())
            .ok_or_else(|| Error::provider(NAME, "empty probe embedding"))?;

        log::info!("Loaded fastembed model {model_name} ({dimensions} dims)");

        Ok(Self {
            model: Arc::new(Mutex::new(text_embedding)),
            dimensions,
            model_name: model_name.to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model.clone();
        let owned: Vec<String> = texts.iter().map(|t| t.to_string()).collect();

        let task = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|e| Error::provider(NAME, format!("model lock poisoned: {e}")))?;
            model
                .embed(owned, None)
                .map_err(|e| Error::provider(NAME, format!("batch embedding failed: {e}")))
        });
        let vectors = bounded(self.timeout, task).await?;

        validate_embeddings(NAME, texts.len(), self.dimensions, &vectors)?;
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        NAME
    }

    fn model(&self) -> &str {
        &self.model_name
    }
}

impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("model", &self.model_name)
            .field("dimensions", &self.dimensions)
            .field("timeout", &self.timeout)
            .finish()
    }
}
