//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: process the backlog for a content type
//! - status: show checkpoint totals for a content type
//! - reset: delete a checkpoint or clear its failures

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Batchforge - resilient batch generation over a document backlog
#[derive(Parser, Debug)]
#[command(name = "batchforge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr instead of the log file
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process pending documents for a content type
    Run {
        /// Content type name from the config
        content_type: String,

        /// Stop after selecting this many items
        #[arg(short, long)]
        limit: Option<u64>,

        /// Call a mock API and write nothing back to the store
        #[arg(long)]
        dry_run: bool,
    },

    /// Show checkpoint totals for a content type
    Status {
        /// Content type name from the config
        content_type: String,
    },

    /// Reset the checkpoint for a content type
    Reset {
        /// Content type name from the config
        content_type: String,

        /// Only forget recorded failures
        #[arg(long)]
        failed_only: bool,
    },
}
