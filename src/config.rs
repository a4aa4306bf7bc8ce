//! Runner configuration.
//!
//! Instance-wide defaults that used to be compiled-in constants: the
//! structured-log port range, process timeouts, the uid:gid used for
//! non-root containers, retry policy for digest lookups and the caps on
//! captured output. A `RunnerConfig` is built once and handed to the
//! orchestrator at construction.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::image::RetryPolicy;

/// Transport used by the structured-log listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogTransport {
    #[default]
    Udp,
    Tcp,
}

impl std::str::FromStr for LogTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "udp" => Ok(LogTransport::Udp),
            "tcp" => Ok(LogTransport::Tcp),
            other => Err(format!("unknown log transport '{}'", other)),
        }
    }
}

/// Configuration for the runner instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    // Process settings
    /// Docker CLI binary used to launch containers.
    pub docker_binary: String,
    /// Binary imposing the hard timeout around `docker run`.
    pub timeout_binary: String,
    /// Parent directory for per-job working directories.
    pub work_root: PathBuf,
    /// uid:gid used for containers that do not opt into root.
    pub container_user: String,

    // Instance limits
    /// CPU count available to a single container on this instance.
    pub instance_cpu_limit: f64,
    /// Memory used when a component declares none.
    pub default_memory: String,
    /// Process timeout used when a component declares none.
    pub default_process_timeout_secs: u64,

    // Structured logging
    /// First port of the structured-log listener range.
    pub log_port_min: u16,
    /// Last port (inclusive) of the structured-log listener range.
    pub log_port_max: u16,
    /// Transport for the structured-log listener.
    pub log_transport: LogTransport,
    /// Address containers use to reach the listener.
    pub log_host: String,

    // Retry and limits
    /// Retry policy for image digest inspection.
    pub retry: RetryPolicy,
    /// Cap for captured stdout/stderr, in bytes per stream.
    pub max_output_bytes: usize,
    /// Cap for error messages, in characters.
    pub max_message_chars: usize,

    // Cleanup
    /// Timeout for removing a finished container.
    pub container_removal_timeout_secs: u64,
    /// Timeout for the permission normalization container.
    pub permission_normalization_timeout_secs: u64,
    /// Image used to normalize file ownership after root stages.
    pub permission_normalization_image: String,

    // External services
    /// Base URL of the storage API used to persist state.
    pub storage_api_url: String,
    /// Base URL of the encryption API.
    pub encryption_api_url: String,
    /// Token forwarded to external services.
    pub storage_token: Option<String>,
    /// Stack identifier exposed to components.
    pub stack_id: String,

    /// Directory receiving stage archives in debug mode.
    pub debug_archive_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            timeout_binary: "timeout".to_string(),
            work_root: std::env::temp_dir().join("docker-runner"),
            container_user: "1000:1000".to_string(),

            instance_cpu_limit: 2.0,
            default_memory: "256m".to_string(),
            default_process_timeout_secs: 3600,

            log_port_min: 12202,
            log_port_max: 12299,
            log_transport: LogTransport::Udp,
            log_host: "172.17.0.1".to_string(),

            retry: RetryPolicy::default(),
            max_output_bytes: 1024 * 1024,
            max_message_chars: 4000,

            container_removal_timeout_secs: 60,
            permission_normalization_timeout_secs: 600,
            permission_normalization_image: "alpine:3.19".to_string(),

            storage_api_url: "https://connection.keboola.com".to_string(),
            encryption_api_url: "https://encryption.keboola.com".to_string(),
            storage_token: None,
            stack_id: "connection.keboola.com".to_string(),

            debug_archive_dir: PathBuf::from("./debug"),
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML (or JSON) file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RUNNER_DOCKER_BINARY`: Docker CLI binary (default: docker)
    /// - `RUNNER_WORK_ROOT`: Parent directory for working directories
    /// - `RUNNER_CONTAINER_USER`: uid:gid for non-root containers (default: 1000:1000)
    /// - `RUNNER_CPU_LIMIT`: Instance CPU limit (default: 2.0)
    /// - `RUNNER_LOG_PORT_MIN` / `RUNNER_LOG_PORT_MAX`: Log listener port range
    /// - `RUNNER_LOG_TRANSPORT`: udp or tcp (default: udp)
    /// - `RUNNER_LOG_HOST`: Listener address handed to containers
    /// - `RUNNER_MAX_ATTEMPTS`: Digest inspection attempts (default: 20)
    /// - `RUNNER_STORAGE_API_URL`: Storage API base URL
    /// - `RUNNER_ENCRYPTION_API_URL`: Encryption API base URL
    /// - `RUNNER_STORAGE_TOKEN`: Token for external services
    /// - `RUNNER_DEBUG_DIR`: Debug archive directory
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("RUNNER_DOCKER_BINARY") {
            config.docker_binary = val;
        }
        if let Ok(val) = std::env::var("RUNNER_WORK_ROOT") {
            config.work_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("RUNNER_CONTAINER_USER") {
            config.container_user = val;
        }
        if let Ok(val) = std::env::var("RUNNER_CPU_LIMIT") {
            config.instance_cpu_limit = parse_env_value(&val, "RUNNER_CPU_LIMIT")?;
        }
        if let Ok(val) = std::env::var("RUNNER_LOG_PORT_MIN") {
            config.log_port_min = parse_env_value(&val, "RUNNER_LOG_PORT_MIN")?;
        }
        if let Ok(val) = std::env::var("RUNNER_LOG_PORT_MAX") {
            config.log_port_max = parse_env_value(&val, "RUNNER_LOG_PORT_MAX")?;
        }
        if let Ok(val) = std::env::var("RUNNER_LOG_TRANSPORT") {
            config.log_transport = parse_env_value(&val, "RUNNER_LOG_TRANSPORT")?;
        }
        if let Ok(val) = std::env::var("RUNNER_LOG_HOST") {
            config.log_host = val;
        }
        if let Ok(val) = std::env::var("RUNNER_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_env_value(&val, "RUNNER_MAX_ATTEMPTS")?;
        }
        if let Ok(val) = std::env::var("RUNNER_STORAGE_API_URL") {
            config.storage_api_url = val;
        }
        if let Ok(val) = std::env::var("RUNNER_ENCRYPTION_API_URL") {
            config.encryption_api_url = val;
        }
        if let Ok(val) = std::env::var("RUNNER_STORAGE_TOKEN") {
            config.storage_token = Some(val);
        }
        if let Ok(val) = std::env::var("RUNNER_DEBUG_DIR") {
            config.debug_archive_dir = PathBuf::from(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_port_min == 0 || self.log_port_min > self.log_port_max {
            return Err(ConfigError::ValidationFailed(format!(
                "log port range {}..={} is empty",
                self.log_port_min, self.log_port_max
            )));
        }
        if self.instance_cpu_limit <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "instance_cpu_limit must be positive".to_string(),
            ));
        }
        if self.default_process_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_process_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_message_chars < 20 {
            return Err(ConfigError::ValidationFailed(
                "max_message_chars must be at least 20".to_string(),
            ));
        }
        let user_ok = self
            .container_user
            .split_once(':')
            .map(|(uid, gid)| uid.parse::<u32>().is_ok() && gid.parse::<u32>().is_ok())
            .unwrap_or(false);
        if !user_ok {
            return Err(ConfigError::InvalidValue {
                key: "container_user".to_string(),
                message: format!("expected uid:gid, got '{}'", self.container_user),
            });
        }
        Ok(())
    }

    pub fn log_port_range(&self) -> RangeInclusive<u16> {
        self.log_port_min..=self.log_port_max
    }

    pub fn container_removal_timeout(&self) -> Duration {
        Duration::from_secs(self.container_removal_timeout_secs)
    }

    pub fn permission_normalization_timeout(&self) -> Duration {
        Duration::from_secs(self.permission_normalization_timeout_secs)
    }

    /// Sets the working directory root.
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = root.into();
        self
    }

    /// Sets the digest inspection retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the instance CPU limit.
    pub fn with_instance_cpu_limit(mut self, cpus: f64) -> Self {
        self.instance_cpu_limit = cpus;
        self
    }

    /// Sets the structured-log port range.
    pub fn with_log_ports(mut self, min: u16, max: u16) -> Self {
        self.log_port_min = min;
        self.log_port_max = max;
        self
    }

    /// Sets the debug archive directory.
    pub fn with_debug_archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.debug_archive_dir = dir.into();
        self
    }
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
