//! Command-line interface for gencore.
//!
//! Provides commands to run the orchestration core, validate configuration
//! and dump metrics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
