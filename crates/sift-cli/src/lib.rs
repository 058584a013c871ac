//! Command-line interface for sift.
//!
//! Wires the sift crates together behind a `sift` binary: a redb store, the
//! configured embedding provider, the job processor, and hybrid search over
//! a directory of text files.
//!
//! # Usage
//!
//! ```bash
//! sift config init
//! sift sync ./docs
//! sift run ./docs --once
//! sift search ./docs "borrow checker" -n 5
//! sift jobs --status failed
//! ```

pub mod app;
pub mod cli;
pub mod config;
pub mod config_handlers;
pub mod content_dir;

pub use app::{SiftApp, init_logging, run};
pub use cli::{CliArgs, Command, ConfigAction};
pub use config::SiftConfig;
pub use content_dir::DirectoryContentSource;
