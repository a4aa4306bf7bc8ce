//! docker-runner: runs component containers for job rows.
//!
//! A job row is executed as an ordered pipeline of containers (processors
//! and the main component) sharing one working directory. The library
//! resolves images, computes resource limits, stages data between stages,
//! classifies container failures and persists the component state.

// Core modules
pub mod cli;
pub mod component;
pub mod config;
pub mod error;
pub mod execution;
pub mod image;
pub mod metrics;
pub mod pipeline;
pub mod state;
pub mod workspace;

// Re-export commonly used types
pub use error::{ErrorKind, FailureDetails, RunnerError};
pub use pipeline::{PipelineOrchestrator, PipelineResult, RunMode, RunOptions};
