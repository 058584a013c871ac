//! CLI argument parsing and command definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sift_core::{EntityType, JobStatus};

// ============================================================================
// CLI argument types
// ============================================================================

/// Embedding synchronization and hybrid search.
#[derive(Parser, Debug)]
#[command(name = "sift", author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file.
    #[arg(short, long, env = "SIFT_CONFIG", global = true)]
    pub config: Option<String>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Identifies one entity.
#[derive(clap::Args, Debug, Clone)]
pub struct EntityArgs {
    /// Entity type, e.g. `documentation` or `code-example`.
    pub entity_type: EntityType,

    /// Entity id.
    pub entity_id: String,
}

/// A directory used as the content source.
#[derive(clap::Args, Debug, Clone)]
pub struct SourceArgs {
    /// Directory holding one file per entity.
    pub dir: PathBuf,

    /// Entity type assigned to every file.
    #[arg(short = 't', long, default_value = "documentation")]
    pub entity_type: EntityType,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Configuration operations.
    Config(ConfigCommand),

    /// Queue an embedding job for one entity.
    Enqueue {
        /// The entity.
        #[command(flatten)]
        entity: EntityArgs,

        /// Priority (lower runs first). Defaults to the user priority.
        #[arg(short, long)]
        priority: Option<i32>,
    },

    /// Show the latest job for one entity.
    Status {
        /// The entity.
        #[command(flatten)]
        entity: EntityArgs,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List jobs, most recent first.
    Jobs {
        /// Only jobs in this status, e.g. `failed`.
        #[arg(short, long)]
        status: Option<JobStatus>,

        /// Maximum jobs to show.
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Cancel the active job for one entity.
    Cancel {
        /// The entity.
        #[command(flatten)]
        entity: EntityArgs,
    },

    /// Show provider health.
    Health {
        /// Probe the provider now instead of reading stored state.
        #[arg(long)]
        probe: bool,
    },

    /// Show queue and chunk statistics.
    Stats {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Queue every file in a directory for embedding.
    Sync {
        /// Content source.
        #[command(flatten)]
        source: SourceArgs,

        /// Re-embed everything instead of only stale entities.
        #[arg(long)]
        full: bool,
    },

    /// Process queued jobs against a directory content source.
    Run {
        /// Content source.
        #[command(flatten)]
        source: SourceArgs,

        /// Drain the queue once and exit instead of running until Ctrl-C.
        #[arg(long)]
        once: bool,
    },

    /// Hybrid search over a directory content source.
    Search {
        /// Content source, also used as the keyword index.
        #[command(flatten)]
        source: SourceArgs,

        /// Query text.
        query: String,

        /// Maximum results.
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Config-specific subcommands.
#[derive(Parser, Debug)]
pub struct ConfigCommand {
    /// Config subcommand to execute.
    #[command(subcommand)]
    pub command: ConfigAction,
}

/// Available config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the resolved config file path.
    Path,

    /// Print the effective configuration as TOML.
    Show,

    /// Create a default configuration file.
    Init {
        /// Output file path (defaults to XDG config path).
        #[arg(short, long)]
        file: Option<String>,

        /// Overwrite existing file.
        #[arg(long)]
        force: bool,
    },
}

// ============================================================================
// Tests
// ============================================================================
