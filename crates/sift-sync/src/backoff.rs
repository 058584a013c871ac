//! Job-level retry policy.
//!
//! `delay = initial * multiplier^min(retry_count, cap_exponent)`, capped at
//! `max_delay`. Provider unavailability requeues at a fixed delay without
//! consuming a retry; recoverable failures consume one; fatal failures end
//! the job immediately.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sift_core::{EmbeddingJob, Error, FailureKind};

use crate::config::RetryConfig;

/// What to do with a job whose attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Move to `RETRY_PENDING`.
    Requeue {
        /// Earliest next attempt.
        at: DateTime<Utc>,
        /// Whether this failure counts against `max_retries`.
        consume_attempt: bool,
    },
    /// Move to `FAILED` with the given final retry count.
    Fail {
        /// Final `retry_count`.
        retry_count: u32,
    },
}

/// Exponential backoff with a separate lane for unavailability.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the attempt that follows `retry_count` failures.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(self.config.cap_exponent);
        let factor = self
            .config
            .multiplier
            .powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let millis = (self.config.initial_delay_ms as f64 * factor)
            .min(self.config.max_delay_ms as f64)
            .max(0.0);
        Duration::from_millis(millis as u64)
    }

    /// Delay used when the provider is unavailable.
    pub fn unavailable_delay(&self) -> Duration {
        Duration::from_millis(self.config.unavailable_delay_ms)
    }

    /// Decide the fate of `job` after `error`.
    pub fn decide(&self, job: &EmbeddingJob, error: &Error, now: DateTime<Utc>) -> RetryDecision {
        match error.failure_kind() {
            FailureKind::Unavailable => RetryDecision::Requeue {
                at: now + to_chrono(self.unavailable_delay()),
                consume_attempt: false,
            },
            FailureKind::Fatal => RetryDecision::Fail {
                retry_count: job.retry_count,
            },
            FailureKind::Recoverable => {
                let attempts = job.retry_count.saturating_add(1);
                if attempts >= job.max_retries {
                    RetryDecision::Fail {
                        retry_count: attempts.min(job.max_retries),
                    }
                } else {
                    RetryDecision::Requeue {
                        at: now + to_chrono(self.delay_for(job.retry_count)),
                        consume_attempt: true,
                    }
                }
            }
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
