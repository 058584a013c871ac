//! Configuration for chunking and embedding providers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sift_core::{Error, Result};

// ============================================================================
// Provider
// ============================================================================

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local Ollama model server.
    #[default]
    Ollama,
    /// OpenAI embeddings API.
    OpenAi,
    /// In-process fastembed model (feature `local-fastembed`).
    FastEmbed,
    /// Deterministic mock for tests and dry runs.
    Mock,
}

impl ProviderKind {
    /// Provider name used in jobs, health rows, and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
            Self::FastEmbed => "fastembed",
            Self::Mock => "mock",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Self::Ollama => "nomic-embed-text",
            Self::OpenAi => "text-embedding-3-small",
            Self::FastEmbed => "bge-small-en-v1.5",
            Self::Mock => "mock-embedding",
        }
    }

    fn default_dimensions(&self) -> usize {
        match self {
            Self::Ollama => 768,
            Self::OpenAi => 1536,
            Self::FastEmbed => 384,
            Self::Mock => 384,
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            _ => "http://localhost:11434",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Embedding provider configuration.
///
/// Unset model, dimension, and URL fields fall back to the defaults of the
/// selected provider kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Backend: "ollama", "openai", "fastembed" or "mock".
    #[serde(default)]
    pub kind: ProviderKind,

    /// Base URL of the provider's HTTP API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Embedding model name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Embedding dimension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,

    /// API key (OpenAI only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model cache directory (fastembed only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<String>,

    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum texts per provider call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// In-call retries for transient unavailability.
    #[serde(default = "default_call_retries")]
    pub call_retries: u32,

    /// Initial delay between in-call retries, in milliseconds.
    #[serde(default = "default_call_retry_delay_ms")]
    pub call_retry_delay_ms: u64,
}

fn default_timeout_secs() -> u64 {
    2
}

fn default_batch_size() -> usize {
    50
}

fn default_call_retries() -> u32 {
    1
}

fn default_call_retry_delay_ms() -> u64 {
    250
}

/// Longest pause between in-call retries.
pub const MAX_CALL_RETRY_DELAY: Duration = Duration::from_secs(5);

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            base_url: None,
            model: None,
            dimensions: None,
            api_key: None,
            cache_path: None,
            timeout_secs: default_timeout_secs(),
            batch_size: default_batch_size(),
            call_retries: default_call_retries(),
            call_retry_delay_ms: default_call_retry_delay_ms(),
        }
    }
}

impl ProviderConfig {
    /// Configuration for the given kind with all defaults.
    pub fn for_kind(kind: ProviderKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Provider name.
    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Effective model name.
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.kind.default_model())
    }

    /// Effective embedding dimension.
    pub fn dimensions(&self) -> usize {
        self.dimensions
            .unwrap_or_else(|| self.kind.default_dimensions())
    }

    /// Effective base URL, without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.kind.default_base_url())
            .trim_end_matches('/')
    }

    /// Per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Worst case for one call through the retry wrapper: every attempt
    /// times out and every retry waits its full backoff.
    pub fn call_budget(&self) -> Duration {
        let attempts = self.call_retries.saturating_add(1);
        let mut total = self.timeout().saturating_mul(attempts);
        let mut delay = Duration::from_millis(self.call_retry_delay_ms);
        for done in 0..self.call_retries {
            if delay >= MAX_CALL_RETRY_DELAY {
                let rest = self.call_retries - done;
                return total.saturating_add(MAX_CALL_RETRY_DELAY.saturating_mul(rest));
            }
            total = total.saturating_add(delay);
            delay = delay.saturating_mul(2);
        }
        total
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("provider.batch_size must be at least 1"));
        }
        if self.timeout_secs == 0 {
            return Err(Error::config("provider.timeout_secs must be at least 1"));
        }
        if self.dimensions() == 0 {
            return Err(Error::config("provider.dimensions must be at least 1"));
        }
        if self.model().trim().is_empty() {
            return Err(Error::config("provider.model must not be empty"));
        }
        if self.kind == ProviderKind::OpenAi
            && self.api_key.as_deref().is_none_or(|k| k.trim().is_empty())
        {
            return Err(Error::config("provider.api_key is required for openai"));
        }
        Ok(())
    }
}

// ============================================================================
// Chunking
// ============================================================================

/// Chunking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum estimated tokens per chunk.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Estimated tokens shared between consecutive chunks.
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: u32,
}

fn default_max_tokens() -> u32 {
    512
}

fn default_overlap_tokens() -> u32 {
    50
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

impl ChunkingConfig {
    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(Error::config("chunking.max_tokens must be at least 1"));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err(Error::config(format!(
                "chunking.overlap_tokens ({}) must be less than max_tokens ({})",
                self.overlap_tokens, self.max_tokens
            )));
        }
        Ok(())
    }
}
