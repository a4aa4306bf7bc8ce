//! Error types for docker-runner operations.
//!
//! Defines the error types for every subsystem plus the classified
//! [`RunnerError`] surfaced to callers of the pipeline:
//! - Runner configuration
//! - Docker engine interaction
//! - Image resolution
//! - Resource limit computation
//! - Working directory staging
//! - State checkpoint persistence

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Errors raised while loading or validating the runner configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Failed to inspect image '{image}': {reason}")]
    InspectFailed { image: String, reason: String },

    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Failed to remove container '{id}': {reason}")]
    RemoveFailed { id: String, reason: String },

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while resolving a component image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Unknown image registry type '{0}'")]
    UnknownRegistry(String),

    #[error("Invalid image definition: {0}")]
    InvalidDefinition(String),

    #[error("Component '{0}' not found")]
    ComponentNotFound(String),

    #[error(transparent)]
    Docker(#[from] DockerError),
}

/// Errors that can occur while computing container resource limits.
#[derive(Debug, Error)]
pub enum LimitsError {
    #[error("Invalid limit '{name}' value '{value}': {reason}")]
    InvalidProjectLimit {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Invalid memory value '{0}'")]
    InvalidMemory(String),

    #[error("Unknown backend size '{0}'")]
    UnknownBackendSize(String),
}

/// Errors that can occur while managing the working directory.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Working directory path '{0}' already exists")]
    AlreadyExists(String),

    #[error("Working directory has not been created")]
    NotCreated,

    #[error("Failed to move '{from}' to '{to}': {reason}")]
    MoveFailed {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Failed to archive working directory: {0}")]
    ArchiveFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading or persisting job state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("State file '{path}' is not valid: {reason}")]
    InvalidStateFile { path: String, reason: String },

    #[error("Failed to store state: {0}")]
    NotFound(String),

    #[error("State storage request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to encrypt state: {0}")]
    EncryptionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classification of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Stack or descriptor misconfiguration; never retried.
    Configuration,
    /// Recoverable by whoever operates the job.
    User,
    /// Container was killed for exceeding its memory limit.
    OutOfMemory,
    /// Unexpected failure of the component or the runner itself.
    Application,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::User => write!(f, "user"),
            ErrorKind::OutOfMemory => write!(f, "out_of_memory"),
            ErrorKind::Application => write!(f, "application"),
        }
    }
}

/// Diagnostic payload attached to container failures.
///
/// Kept out of the error message so the message stays bounded while the
/// full (size-capped) output is still available to operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailureDetails {
    pub exit_code: Option<i32>,
    pub output: String,
    pub error_output: String,
    pub duration: Option<Duration>,
}

/// Classified error returned by the pipeline.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{message}")]
    Configuration { message: String },

    #[error("{message}")]
    User {
        message: String,
        details: Option<Box<FailureDetails>>,
    },

    #[error("{message}")]
    OutOfMemory {
        message: String,
        details: Option<Box<FailureDetails>>,
    },

    #[error("{message}")]
    Application {
        message: String,
        details: Option<Box<FailureDetails>>,
    },
}

impl RunnerError {
    pub fn configuration(message: impl Into<String>) -> Self {
        RunnerError::Configuration {
            message: message.into(),
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        RunnerError::User {
            message: message.into(),
            details: None,
        }
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        RunnerError::OutOfMemory {
            message: message.into(),
            details: None,
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        RunnerError::Application {
            message: message.into(),
            details: None,
        }
    }

    /// Attaches diagnostic details to a user, OOM or application error.
    pub fn with_details(self, details: FailureDetails) -> Self {
        let boxed = Some(Box::new(details));
        match self {
            RunnerError::User { message, .. } => RunnerError::User {
                message,
                details: boxed,
            },
            RunnerError::OutOfMemory { message, .. } => RunnerError::OutOfMemory {
                message,
                details: boxed,
            },
            RunnerError::Application { message, .. } => RunnerError::Application {
                message,
                details: boxed,
            },
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RunnerError::Configuration { .. } => ErrorKind::Configuration,
            RunnerError::User { .. } => ErrorKind::User,
            RunnerError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            RunnerError::Application { .. } => ErrorKind::Application,
        }
    }

    /// Out-of-memory failures are a subtype of user errors.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            RunnerError::User { .. } | RunnerError::OutOfMemory { .. }
        )
    }

    pub fn details(&self) -> Option<&FailureDetails> {
        match self {
            RunnerError::User { details, .. }
            | RunnerError::OutOfMemory { details, .. }
            | RunnerError::Application { details, .. } => details.as_deref(),
            RunnerError::Configuration { .. } => None,
        }
    }
}

impl From<ConfigError> for RunnerError {
    fn from(e: ConfigError) -> Self {
        RunnerError::configuration(e.to_string())
    }
}

impl From<LimitsError> for RunnerError {
    fn from(e: LimitsError) -> Self {
        RunnerError::configuration(e.to_string())
    }
}

impl From<ImageError> for RunnerError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::Docker(inner) => RunnerError::from(inner),
            other => RunnerError::configuration(other.to_string()),
        }
    }
}

impl From<DockerError> for RunnerError {
    fn from(e: DockerError) -> Self {
        RunnerError::application(e.to_string())
    }
}

impl From<WorkspaceError> for RunnerError {
    fn from(e: WorkspaceError) -> Self {
        RunnerError::application(e.to_string())
    }
}

impl From<StateError> for RunnerError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(_) | StateError::InvalidStateFile { .. } => {
                RunnerError::user(e.to_string())
            }
            other => RunnerError::application(other.to_string()),
        }
    }
}
