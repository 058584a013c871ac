//! Provider selection from configuration.

use std::sync::Arc;
use std::time::Duration;

use sift_core::{Error, Result};

use crate::config::{MAX_CALL_RETRY_DELAY, ProviderConfig, ProviderKind};
use crate::mock::MockEmbeddingProvider;
use crate::ollama::OllamaProvider;
use crate::openai::OpenAiProvider;
use crate::provider::EmbeddingProvider;
use crate::retry::RetryingProvider;

/// Build the configured embedding provider.
///
/// The result is wrapped in a [`RetryingProvider`] when
/// `call_retries > 0`.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    config.validate()?;

    let provider: Arc<dyn EmbeddingProvider> = match config.kind {
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(
            config.base_url(),
            config.model(),
            config.dimensions(),
            config.timeout(),
        )?),
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(
            config.base_url(),
            config.api_key.clone().unwrap_or_default(),
            config.model(),
            config.dimensions(),
            config.timeout(),
        )?),
        ProviderKind::FastEmbed => create_fastembed(config)?,
        ProviderKind::Mock => Arc::new(MockEmbeddingProvider::with_model(
            config.dimensions(),
            config.model(),
        )),
    };

    log::info!(
        "Embedding provider: {} (model {}, {} dims)",
        provider.name(),
        provider.model(),
        provider.dimensions()
    );

    if config.call_retries == 0 {
        return Ok(provider);
    }
    Ok(Arc::new(
        RetryingProvider::new(provider)
            .with_max_retries(config.call_retries)
            .with_initial_delay(Duration::from_millis(config.call_retry_delay_ms))
            .with_max_delay(MAX_CALL_RETRY_DELAY),
    ))
}

#[cfg(feature = "local-fastembed")]
fn create_fastembed(config: &ProviderConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let provider = crate::fastembed::FastEmbedProvider::new(
        config.model(),
        config.cache_path.as_deref(),
        config.timeout(),
    )?;
    if let Some(expected) = config.dimensions
        && expected != provider.dimensions()
    {
        return Err(Error::config(format!(
            "provider.dimensions is {expected} but {} produces {}",
            config.model(),
            provider.dimensions()
        )));
    }
    Ok(Arc::new(provider))
}

#[cfg(not(feature = "local-fastembed"))]
fn create_fastembed(_config: &ProviderConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    Err(Error::config(
        "the fastembed provider requires building with the `local-fastembed` feature",
    ))
}
