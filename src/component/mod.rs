//! Component descriptors and job rows.
//!
//! These are the inputs of the pipeline: what to run
//! ([`ComponentDescriptor`]) and against which configuration and prior
//! state ([`JobRow`]).

pub mod descriptor;
pub mod job;

pub use descriptor::{
    Capabilities, ComponentDescriptor, ImageDefinition, LoggingMode, RepositoryOptions,
};
pub use job::{
    JobConfiguration, JobContext, JobRow, ProcessorDefinition, ProcessorSpec, Processors,
    RuntimeSettings, TokenInfo,
};
