//! Command-line interface for modflow.
//!
//! Provides commands for repository setup, pipeline runs, catalog edits and
//! the scheduling daemon.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
