//! Command-line interface for docker-runner.
//!
//! Provides commands for running job files and validating them.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, JobFile};
