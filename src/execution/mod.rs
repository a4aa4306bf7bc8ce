//! Container execution layer.
//!
//! Turns a resolved stage into a running container and back into a
//! classified result.
//!
//! # Architecture
//!
//! ```text
//! LimitsPolicy ─► ResourceLimits ─┐
//! build_environment / labels ─────┼─► RunSpec ─► Container::run ─► ContainerRun
//!                                 │                 │
//!                  ContainerEngine (DockerClient) ◄─┘ (+ LogListener)
//! ```

pub mod container;
pub mod docker_client;
pub mod log_listener;
pub mod output;
pub mod resources;
pub mod run_spec;

pub use container::{
    classify, CleanupOutcome, CleanupStep, Container, ContainerRun, ContainerSettings,
    ContainerStatus, ExitContext,
};
pub use docker_client::{
    ContainerEngine, ContainerInspection, DockerClient, ProcessOutput, RegistryCredentials,
};
pub use log_listener::{LogEvent, LogListener, LogSummary};
pub use output::{truncate_message, OutputBuffer};
pub use resources::{LimitsPolicy, NetworkMode, ResourceLimits};
pub use run_spec::{build_environment, build_labels, EnvironmentInputs, LaunchCommand, RunSpec, VolumeMount};
