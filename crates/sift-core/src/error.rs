//! Error types for Sift operations.
//!
//! This module provides the common `Error` type and `Result<T>` alias used
//! across all Sift crates. Uses `thiserror` for derive macros.
//!
//! The variants double as the failure taxonomy of the embedding pipeline:
//! [`Error::failure_kind`] tells the job processor whether a failure is an
//! infrastructure condition (pause and requeue), a recoverable defect (retry
//! with backoff), or fatal (fail the job now).

use thiserror::Error;

/// Errors that can occur in Sift operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error (invalid or inconsistent settings).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The embedding provider cannot be reached right now (network, auth,
    /// rate limit, timeout).
    #[error("Provider '{provider}' unavailable: {message}")]
    ProviderUnavailable {
        /// Provider name.
        provider: String,
        /// Failure description.
        message: String,
    },

    /// The embedding provider rejected the request or returned garbage.
    #[error("Provider '{provider}' error: {message}")]
    Provider {
        /// Provider name.
        provider: String,
        /// Failure description.
        message: String,
    },

    /// Malformed job, chunk, or entity data.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Persistence failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Requested item does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A state transition that the job state machine does not allow.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Both halves of a hybrid search failed.
    #[error("Search unavailable (keyword: {keyword}; vector: {vector})")]
    SearchUnavailable {
        /// Keyword sub-query failure.
        keyword: String,
        /// Vector sub-query failure.
        vector: String,
    },
}

/// How the job processor should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Infrastructure condition: requeue without consuming a retry.
    Unavailable,
    /// Job-level defect that may succeed later: consume a retry.
    Recoverable,
    /// Never going to succeed: fail immediately.
    Fatal,
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a provider-unavailable error.
    pub fn unavailable(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a provider error.
    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Classify this error for retry decisions.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::ProviderUnavailable { .. } => FailureKind::Unavailable,
            Self::Validation(_) | Self::Config(_) | Self::InvalidState(_) => FailureKind::Fatal,
            _ => FailureKind::Recoverable,
        }
    }

    /// Whether this error reflects provider unavailability.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ProviderUnavailable { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type alias using Sift's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_taxonomy() {
        assert_eq!(
            Error::unavailable("ollama", "connection refused").failure_kind(),
            FailureKind::Unavailable
        );
        assert_eq!(
            Error::provider("ollama", "bad input").failure_kind(),
            FailureKind::Recoverable
        );
        assert_eq!(
            Error::store("disk full").failure_kind(),
            FailureKind::Recoverable
        );
        assert_eq!(
            Error::validation("empty id").failure_kind(),
            FailureKind::Fatal
        );
        assert_eq!(
            Error::config("overlap >= size").failure_kind(),
            FailureKind::Fatal
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::unavailable("openai", "HTTP 429");
        assert_eq!(err.to_string(), "Provider 'openai' unavailable: HTTP 429");
        assert!(err.is_unavailable());

        let err = Error::SearchUnavailable {
            keyword: "timeout".into(),
            vector: "down".into(),
        };
        assert!(err.to_string().contains("keyword: timeout"));
    }

    #[test]
    fn test_from_serde_json() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
