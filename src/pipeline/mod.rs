//! Pipeline orchestration for job rows.
//!
//! A job row runs as an ordered list of stages sharing one working
//! directory: `before` processors, the main component, `after` processors.
//!
//! # Architecture
//!
//! - **Orchestrator**: sequences image resolution, limits, staging and
//!   container runs, captures and persists the main stage's state
//! - **Config file**: renders the `config.json` each stage reads
//! - **Collaborators**: data transfer and processor lookup, injected as traits
//! - **Result**: digests, main output, state handle and cleanup report
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use docker_runner::config::RunnerConfig;
//! use docker_runner::execution::DockerClient;
//! use docker_runner::pipeline::{PipelineOrchestrator, RunOptions};
//! use docker_runner::state::{HttpEncryptor, HttpStateStore};
//!
//! let config = RunnerConfig::from_env()?;
//! let orchestrator = PipelineOrchestrator::new(
//!     config.clone(),
//!     Arc::new(DockerClient::new()?),
//!     Arc::new(HttpStateStore::new(&config.storage_api_url, token)?),
//!     Arc::new(HttpEncryptor::new(&config.encryption_api_url)?),
//! );
//!
//! let results = orchestrator.run(&context, &rows, &RunOptions::new()).await?;
//! for result in &results {
//!     println!("{}: state persisted = {}", result.row, result.state_persisted);
//! }
//! ```

pub mod collaborators;
pub mod config_file;
pub mod orchestrator;
pub mod result;

pub use collaborators::{ComponentCatalog, DataTransfer, InMemoryCatalog, NoopDataTransfer};
pub use config_file::render_config;
pub use orchestrator::{PipelineOrchestrator, RunMode, RunOptions, DEFAULT_ACTION};
pub use result::{ImageDigests, PipelineResult};
