//! Embedding provider trait and shared helpers.
//!
//! This module defines the `EmbeddingProvider` trait that abstracts over
//! embedding backends (Ollama, OpenAI, fastembed, mock) plus the batching
//! and validation logic every caller needs.
//!
//! # Failure mapping
//!
//! Providers report two kinds of failure:
//!
//! - [`Error::ProviderUnavailable`]: the backend cannot be reached right now
//!   (connection refused, timeout, auth, rate limit, 5xx). Callers should
//!   pause rather than burn retries.
//! - [`Error::Provider`]: the backend answered but the request or the
//!   response is unusable (400/413/422, malformed body, wrong count or
//!   dimension).

use async_trait::async_trait;
use sift_core::{Error, Result};

/// Trait for generating text embeddings.
///
/// Implementations must honor a per-call timeout and must return exactly one
/// vector of [`dimensions`](Self::dimensions) floats per input text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of texts, in input order.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider(self.name(), "no embedding returned"))
    }

    /// The embedding dimension.
    fn dimensions(&self) -> usize;

    /// The provider name, used in jobs, health rows, and logs.
    fn name(&self) -> &str;

    /// The model identifier chunks are tagged with.
    fn model(&self) -> &str;
}

/// Embed `texts` in batches of at most `batch_size`, validating the count
/// and dimension of every returned vector.
pub async fn embed_in_batches(
    provider: &dyn EmbeddingProvider,
    texts: &[&str],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    if batch_size == 0 {
        return Err(Error::config("embedding batch size must be at least 1"));
    }
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size) {
        log::debug!(
            "Embedding batch of {} text(s) with {}/{}",
            batch.len(),
            provider.name(),
            provider.model()
        );
        let vectors = provider.embed_batch(batch).await?;
        validate_embeddings(provider.name(), batch.len(), provider.dimensions(), &vectors)?;
        out.extend(vectors);
    }
    Ok(out)
}

/// Check that a provider returned `expected` vectors of `dimensions` finite
/// floats each.
pub fn validate_embeddings(
    provider: &str,
    expected: usize,
    dimensions: usize,
    vectors: &[Vec<f32>],
) -> Result<()> {
    if vectors.len() != expected {
        return Err(Error::provider(
            provider,
            format!("expected {expected} embeddings, got {}", vectors.len()),
        ));
    }
    for (i, v) in vectors.iter().enumerate() {
        if v.len() != dimensions {
            return Err(Error::provider(
                provider,
                format!(
                    "embedding {i} has dimension {}, expected {dimensions}",
                    v.len()
                ),
            ));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(Error::provider(
                provider,
                format!("embedding {i} contains non-finite values"),
            ));
        }
    }
    Ok(())
}

// ============================================================================
// HTTP failure classification
// ============================================================================

/// Map a non-success HTTP status to the failure taxonomy.
pub(crate) fn classify_status(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let code = status.as_u16();
    let detail = body.chars().take(200).collect::<String>();
    let message = format!("HTTP {status}: {detail}");
    match code {
        401 | 403 | 404 | 408 | 429 => Error::unavailable(provider, message),
        500..=599 => Error::unavailable(provider, message),
        _ => Error::provider(provider, message),
    }
}

/// Map a transport-level reqwest error to the failure taxonomy.
pub(crate) fn classify_transport(provider: &str, err: reqwest::Error) -> Error {
    if err.is_decode() {
        Error::provider(provider, format!("malformed response: {err}"))
    } else if err.is_timeout() {
        Error::unavailable(provider, format!("request timed out: {err}"))
    } else {
        Error::unavailable(provider, format!("request failed: {err}"))
    }
}

// ============================================================================
// Tests
// ============================================================================
