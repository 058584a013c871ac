//! Deterministic mock embedding provider.
//!
//! Generates vectors from the input bytes so equal texts always embed
//! equally, and lets tests switch the provider offline or inject failures.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use sift_core::{Error, Result};

use crate::provider::EmbeddingProvider;

/// A failure the mock should return instead of embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Behave as if the backend were unreachable.
    Unavailable,
    /// Behave as if the backend rejected the request.
    Rejected,
    /// Return vectors of the wrong dimension.
    WrongDimension,
}

/// A mock embedding provider for testing.
pub struct MockEmbeddingProvider {
    dimension: usize,
    model: String,
    available: AtomicBool,
    failures: Mutex<VecDeque<MockFailure>>,
    fixed: Mutex<HashMap<String, Vec<f32>>>,
    calls: AtomicUsize,
}

impl MockEmbeddingProvider {
    /// Create a new mock provider with the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self::with_model(dimension, "mock-embedding")
    }

    /// Create a mock provider reporting the given model name.
    pub fn with_model(dimension: usize, model: impl Into<String>) -> Self {
        Self {
            dimension,
            model: model.into(),
            available: AtomicBool::new(true),
            failures: Mutex::new(VecDeque::new()),
            fixed: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Switch the provider on or off. While off every call fails with
    /// [`Error::ProviderUnavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `times` calls with `failure`.
    pub fn fail_next(&self, failure: MockFailure, times: usize) {
        if let Ok(mut queue) = self.failures.lock() {
            queue.extend(std::iter::repeat_n(failure, times));
        }
    }

    /// Return `vector` for `text` instead of the derived embedding.
    pub fn set_vector(&self, text: impl Into<String>, vector: Vec<f32>) {
        if let Ok(mut fixed) = self.fixed.lock() {
            fixed.insert(text.into(), vector);
        }
    }

    /// Number of `embed_batch` calls so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Generate a deterministic embedding from text.
    fn deterministic_embedding(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.fixed.lock().ok().and_then(|f| f.get(text).cloned()) {
            return v;
        }

        let mut embedding = vec![0.0f32; self.dimension];
        let bytes = text.as_bytes();

        for (i, val) in embedding.iter_mut().enumerate() {
            let byte_val = bytes.get(i % bytes.len().max(1)).copied().unwrap_or(0);
            *val = ((byte_val as f32 + i as f32) % 256.0) / 256.0 + 0.001;
        }

        // Normalize to unit vector
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for val in &mut embedding {
                *val /= norm;
            }
        }

        embedding
    }

    fn next_failure(&self) -> Option<MockFailure> {
        self.failures.lock().ok().and_then(|mut q| q.pop_front())
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::unavailable("mock", "provider offline"));
        }
        match self.next_failure() {
            Some(MockFailure::Unavailable) => {
                return Err(Error::unavailable("mock", "injected unavailability"));
            }
            Some(MockFailure::Rejected) => {
                return Err(Error::provider("mock", "injected rejection"));
            }
            Some(MockFailure::WrongDimension) => {
                return Ok(texts.iter().map(|_| vec![0.5; self.dimension + 1]).collect());
            }
            None => {}
        }

        Ok(texts
            .iter()
            .map(|t| self.deterministic_embedding(t))
            .collect())
    }

    fn dimensions(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

impl std::fmt::Debug for MockEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEmbeddingProvider")
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
