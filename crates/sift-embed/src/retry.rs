//! Retry wrapper for embedding providers.
//!
//! Retries short, transient unavailability inside a single call. Longer
//! outages are left to the job-level retry policy and the health monitor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use sift_core::{Error, Result};

use crate::provider::EmbeddingProvider;

/// Wraps an embedding provider with retry logic.
pub struct RetryingProvider {
    inner: Arc<dyn EmbeddingProvider>,
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryingProvider {
    /// Creates a new retry wrapper with default settings.
    ///
    /// Default settings:
    /// - Max retries: 2
    /// - Initial delay: 500 ms
    /// - Max delay: 5 seconds
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            inner: provider,
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }

    /// Sets the maximum number of retries after the first attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial delay between retries.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay between retries.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Only unavailability is worth retrying within a call.
    fn should_retry(error: &Error) -> bool {
        error.is_unavailable()
    }
}

#[async_trait]
impl EmbeddingProvider for RetryingProvider {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries as usize);

        let provider = self.inner.clone();

        (|| async { provider.embed_batch(texts).await })
            .retry(backoff)
            .when(Self::should_retry)
            .notify(|err, dur| {
                log::warn!(
                    "{} call failed ({err}); retrying in {dur:?}",
                    self.inner.name()
                );
            })
            .await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mock::{MockEmbeddingProvider, MockFailure};

    fn fast(mock: Arc<MockEmbeddingProvider>) -> RetryingProvider {
        RetryingProvider::new(mock)
            .with_max_retries(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_retries_transient_unavailability() {
        let mock = Arc::new(MockEmbeddingProvider::new(4));
        mock.fail_next(MockFailure::Unavailable, 2);

        let vectors = fast(mock.clone()).embed_batch(&["a"]).await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mock = Arc::new(MockEmbeddingProvider::new(4));
        mock.set_available(false);

        let err = fast(mock.clone()).embed_batch(&["a"]).await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(mock.calls(), 4);
    }

    #[tokio::test]
    async fn test_does_not_retry_rejections() {
        let mock = Arc::new(MockEmbeddingProvider::new(4));
        mock.fail_next(MockFailure::Rejected, 1);

        let err = fast(mock.clone()).embed_batch(&["a"]).await.unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn test_retry_wrapper_builder() {
        let mock = Arc::new(MockEmbeddingProvider::new(4));
        let retry = RetryingProvider::new(mock)
            .with_max_retries(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2));

        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_secs(2));
        assert_eq!(retry.name(), "mock");
    }
}
