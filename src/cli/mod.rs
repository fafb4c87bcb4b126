//! Command-line interface for debate-arena.
//!
//! Provides commands for running tournaments, validating configurations
//! and recomputing standings.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
