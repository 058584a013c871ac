//! Configuration for the `sift` command.
//!
//! [`SiftConfig`] aggregates the section structs owned by each crate and
//! loads from TOML files, environment variables, and defaults using the
//! `confyg` crate.
//!
//! # Loading Priority
//!
//! 1. Explicit `--config <path>` flag
//! 2. `SIFT_CONFIG` environment variable
//! 3. XDG default: `~/.config/sift/config.toml`
//! 4. Built-in defaults
//!
//! `SIFT_<SECTION>_<KEY>` environment variables override file values.

use std::path::PathBuf;

use confyg::{Confygery, env};
use serde::{Deserialize, Serialize};
use sift_core::{Error, Result};
use sift_embed::{ChunkingConfig, ProviderConfig};
use sift_search::HybridConfig;
use sift_store::StoreConfig;
use sift_sync::{HealthConfig, JobConfig, RetryConfig};

const ENV_PREFIX: &str = "SIFT";
const SECTIONS: [&str; 7] = [
    "provider", "chunking", "store", "jobs", "retry", "health", "search",
];

/// Complete configuration for the `sift` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SiftConfig {
    /// Directory for the database when `store.path` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Embedding provider.
    pub provider: ProviderConfig,

    /// Chunk sizing.
    pub chunking: ChunkingConfig,

    /// Persistence.
    pub store: StoreConfig,

    /// Worker pool and polling.
    pub jobs: JobConfig,

    /// Job-level retry policy.
    pub retry: RetryConfig,

    /// Provider health checks.
    pub health: HealthConfig,

    /// Hybrid search.
    pub search: HybridConfig,
}

impl SiftConfig {
    /// Load configuration from file, environment, and defaults, then
    /// validate it.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder =
            Confygery::new().map_err(|e| Error::config(format!("config init: {e}")))?;

        if let Some(path) = Self::resolve_config_path(config_path)
            && path.exists()
        {
            builder
                .add_file(&path.to_string_lossy())
                .map_err(|e| Error::config(format!("config file: {e}")))?;
        }

        let mut env_opts = env::Options::with_top_level(ENV_PREFIX);
        for section in SECTIONS {
            env_opts.add_section(section);
        }
        builder
            .add_env(env_opts)
            .map_err(|e| Error::config(format!("config env: {e}")))?;

        let config: Self = builder
            .build()
            .map_err(|e| Error::config(format!("config build: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file path from explicit flag, env var, or XDG default.
    pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("SIFT_CONFIG") {
            return Some(PathBuf::from(path));
        }
        Self::default_config_path()
    }

    /// Return the XDG default config path.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sift").join("config.toml"))
    }

    /// Database file: `store.path`, else `<data_dir>/sift.redb`, else the
    /// platform data directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.store.path {
            return Ok(path.clone());
        }
        let dir = match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .map(|d| d.join("sift"))
                .ok_or_else(|| Error::config("Could not determine data directory"))?,
        };
        Ok(dir.join("sift.redb"))
    }

    /// Reject inconsistent settings across every section.
    ///
    /// A provider call, retries included, must finish inside both caller
    /// deadlines that wrap it: the health probe and the search sub-query.
    pub fn validate(&self) -> Result<()> {
        self.provider.validate()?;
        self.chunking.validate()?;
        self.jobs.validate()?;
        self.retry.validate()?;
        self.health.validate()?;
        self.search.validate()?;

        let budget = self.provider.call_budget();
        for (name, deadline) in [
            ("health.timeout_secs", self.health.timeout()),
            ("search.sub_query_timeout_ms", self.search.sub_query_timeout()),
        ] {
            if budget >= deadline {
                return Err(Error::config(format!(
                    "provider call budget of {budget:?} (timeout_secs x (call_retries + 1) \
                     plus retry delays) must be shorter than {name} ({deadline:?})"
                )));
            }
        }
        Ok(())
    }

    /// Serialize this config to a pretty-printed TOML string.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================
