//! CLI module for batchforge - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands to run a content type,
//! inspect its checkpoint, and reset it.

pub mod commands;

pub use commands::Cli;
