//! Configuration for the job processor, retry policy, and health monitor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sift_core::{Error, Result};

// ============================================================================
// Jobs
// ============================================================================

/// Job processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Worker tasks in the pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum jobs claimed per dispatch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds between queue polls when nothing wakes the dispatcher.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_workers() -> usize {
    2
}

fn default_batch_size() -> usize {
    50
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl JobConfig {
    /// Poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("jobs.workers must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("jobs.batch_size must be at least 1"));
        }
        if self.poll_interval_secs == 0 {
            return Err(Error::config("jobs.poll_interval_secs must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Job-level retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Recoverable failures allowed before a job fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Ceiling on any retry delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor per retry.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Exponent cap, so `multiplier^n` cannot overflow.
    #[serde(default = "default_cap_exponent")]
    pub cap_exponent: u32,

    /// Fixed requeue delay after provider unavailability, in milliseconds.
    #[serde(default = "default_unavailable_delay_ms")]
    pub unavailable_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_cap_exponent() -> u32 {
    10
}

fn default_unavailable_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            cap_exponent: default_cap_exponent(),
            unavailable_delay_ms: default_unavailable_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(Error::config(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Health
// ============================================================================

/// Provider health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between probes; also how long a probe result stays fresh.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Probe timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl HealthConfig {
    /// Probe interval.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Probe timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.check_interval_secs == 0 {
            return Err(Error::config("health.check_interval_secs must be at least 1"));
        }
        if self.timeout_secs == 0 {
            return Err(Error::config("health.timeout_secs must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let jobs = JobConfig::default();
        assert_eq!(jobs.workers, 2);
        assert_eq!(jobs.batch_size, 50);
        assert_eq!(jobs.poll_interval(), Duration::from_secs(30));

        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.initial_delay_ms, 5_000);
        assert_eq!(retry.max_delay_ms, 300_000);
        assert_eq!(retry.unavailable_delay_ms, 60_000);

        let health = HealthConfig::default();
        assert_eq!(health.check_interval(), Duration::from_secs(60));
        assert_eq!(health.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let retry: RetryConfig = serde_json::from_str(r#"{"max_retries": 7}"#).unwrap();
        assert_eq!(retry.max_retries, 7);
        assert_eq!(retry.multiplier, 2.0);
    }

    #[test]
    fn test_validate() {
        assert!(JobConfig::default().validate().is_ok());
        assert!(
            JobConfig {
                workers: 0,
                ..JobConfig::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            RetryConfig {
                multiplier: 0.5,
                ..RetryConfig::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            HealthConfig {
                timeout_secs: 0,
                ..HealthConfig::default()
            }
            .validate()
            .is_err()
        );
    }
}
