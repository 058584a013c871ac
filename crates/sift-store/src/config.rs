//! Store configuration.

use std::path::PathBuf;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Where state lives and how long job history is kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file. When unset the CLI uses its data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Terminal jobs older than this many days are pruned at startup.
    /// Unset keeps history forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
}

impl StoreConfig {
    /// Retention window, if one is configured.
    pub fn retention(&self) -> Option<Duration> {
        self.retention_days.map(|d| Duration::days(i64::from(d)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention() {
        assert!(StoreConfig::default().retention().is_none());
        let config = StoreConfig {
            retention_days: Some(7),
            ..StoreConfig::default()
        };
        assert_eq!(config.retention(), Some(Duration::days(7)));
    }
}
