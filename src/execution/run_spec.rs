//! Fully resolved container launch parameters.
//!
//! A [`RunSpec`] is built per stage right before launch and turned into the
//! exact `timeout … docker run …` invocation by [`RunSpec::launch_command`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::component::{Capabilities, JobContext, JobRow};
use crate::error::RunnerError;
use crate::execution::resources::ResourceLimits;

/// Container path of the data volume.
pub const DATA_DIR: &str = "/data";
/// Container path of the temp volume.
pub const TMP_DIR: &str = "/tmp";
/// Prefix of every label set on runner containers.
pub const LABEL_PREFIX: &str = "com.keboola.docker-runner.";
/// Prefix of injected parameter variables.
pub const PARAMETER_ENV_PREFIX: &str = "KBC_PARAMETER_";

const REDACTED: &str = "*****";

/// A host directory mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

impl VolumeMount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
        }
    }

    /// Returns the Docker mount string format.
    pub fn to_docker_mount(&self) -> String {
        format!("{}:{}", self.host_path.display(), self.container_path)
    }
}

/// Program and arguments of a process launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Values replaced by a placeholder when the command is displayed.
    secrets: Vec<String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            secrets: Vec::new(),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self
    }

    /// Command line safe for logs.
    pub fn redacted(&self) -> String {
        let mut line = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        for secret in &self.secrets {
            line = line.replace(secret.as_str(), REDACTED);
        }
        line
    }
}

/// Container launch parameters for one stage.
#[derive(Debug, Clone, Serialize)]
pub struct RunSpec {
    pub container_name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub limits: ResourceLimits,
    /// uid:gid to run as; `None` runs as the image's default (root).
    pub user: Option<String>,
    /// Hard timeout for the whole `docker run` invocation.
    pub timeout_secs: u64,
}

impl RunSpec {
    /// Builds the hard-timeout-wrapped `docker run` invocation.
    pub fn launch_command(&self, timeout_binary: &str, docker_binary: &str) -> LaunchCommand {
        let mut args = vec![
            "--signal=SIGKILL".to_string(),
            self.timeout_secs.to_string(),
            docker_binary.to_string(),
            "run".to_string(),
        ];
        for volume in &self.volumes {
            args.push(format!("--volume={}", volume.to_docker_mount()));
        }
        args.push(format!("--memory={}", self.limits.memory_string()));
        if let Some(swap) = self.limits.memory_swap_string() {
            args.push(format!("--memory-swap={}", swap));
        }
        args.push(format!("--cpus={}", self.limits.cpu_string()));
        args.push(format!("--net={}", self.limits.network));
        if let Some(user) = &self.user {
            args.push(format!("--user={}", user));
        }
        for (key, value) in &self.env {
            args.push(format!("--env={}={}", key, value));
        }
        for (key, value) in &self.labels {
            args.push(format!("--label={}={}", key, value));
        }
        args.push(format!("--name={}", self.container_name));
        args.push(self.image.clone());

        let mut command = LaunchCommand::new(timeout_binary, args);
        if let Some(token) = self.env.get("KBC_TOKEN") {
            command = command.with_secret(token.clone());
        }
        command
    }
}

/// Inputs for the environment of one stage.
pub struct EnvironmentInputs<'a> {
    pub context: &'a JobContext,
    pub row: &'a JobRow,
    pub component_id: &'a str,
    pub capabilities: Capabilities,
    pub storage_url: &'a str,
    pub stack_id: &'a str,
    /// Stage parameters exposed when parameter injection is enabled.
    pub parameters: &'a Map<String, Value>,
}

/// Builds the `KBC_*` environment of one stage.
pub fn build_environment(
    inputs: &EnvironmentInputs<'_>,
) -> Result<BTreeMap<String, String>, RunnerError> {
    let mut env = BTreeMap::new();
    let context = inputs.context;
    let row = inputs.row;

    env.insert("KBC_RUNID".to_string(), context.run_id.clone());
    env.insert("KBC_JOBID".to_string(), context.job_id.clone());
    env.insert("KBC_PROJECTID".to_string(), context.project_id.clone());
    env.insert("KBC_DATADIR".to_string(), format!("{}/", DATA_DIR));
    env.insert("KBC_COMPONENTID".to_string(), inputs.component_id.to_string());
    env.insert("KBC_BRANCHID".to_string(), context.branch_id.clone());
    env.insert("KBC_STACKID".to_string(), inputs.stack_id.to_string());
    if !context.project_name.is_empty() {
        env.insert("KBC_PROJECTNAME".to_string(), context.project_name.clone());
    }
    if let Some(config_id) = &row.config_id {
        env.insert("KBC_CONFIGID".to_string(), config_id.clone());
    }
    if let Some(row_id) = &row.row_id {
        env.insert("KBC_CONFIGROWID".to_string(), row_id.clone());
    }
    if let Some(version) = &row.config_version {
        env.insert("KBC_CONFIGVERSION".to_string(), version.clone());
    }

    if let Some(token) = &context.token {
        env.insert("KBC_TOKENID".to_string(), token.id.clone());
        if inputs.capabilities.forward_token_details {
            env.insert("KBC_TOKENDESC".to_string(), token.description.clone());
        }
        if inputs.capabilities.forward_token {
            env.insert("KBC_TOKEN".to_string(), token.token.clone());
            env.insert("KBC_URL".to_string(), inputs.storage_url.to_string());
        }
    }

    if inputs.capabilities.inject_environment {
        for (key, value) in inputs.parameters {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(RunnerError::user(format!(
                        "Only scalar values can be injected into the environment, parameter '{}' is not scalar",
                        key
                    )))
                }
            };
            env.insert(parameter_env_name(key), rendered);
        }
    }

    Ok(env)
}

/// Points the container at its structured-log listener.
pub fn set_logger_address(env: &mut BTreeMap<String, String>, host: &str, port: u16) {
    env.insert("KBC_LOGGER_ADDR".to_string(), host.to_string());
    env.insert("KBC_LOGGER_PORT".to_string(), port.to_string());
}

/// `KBC_PARAMETER_` + upper-cased key with non-alphanumerics replaced.
pub fn parameter_env_name(key: &str) -> String {
    let normalized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", PARAMETER_ENV_PREFIX, normalized)
}

/// Labels carrying job, run, row and project identifiers.
pub fn build_labels(
    context: &JobContext,
    row: &JobRow,
    component_id: &str,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut put = |key: &str, value: &str| {
        labels.insert(format!("{}{}", LABEL_PREFIX, key), value.to_string());
    };
    put("jobId", &context.job_id);
    put("runId", &context.run_id);
    put("projectId", &context.project_id);
    put("componentId", component_id);
    put("branchId", &context.branch_id);
    if let Some(config_id) = &row.config_id {
        put("configId", config_id);
    }
    if let Some(row_id) = &row.row_id {
        put("rowId", row_id);
    }
    labels
}

fn invalid_name_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_.-]+").expect("valid regex"))
}

/// Docker-safe unique container name for one stage.
pub fn container_name(job_id: &str, component_id: &str, priority: usize) -> String {
    let raw = format!("{}-{}-{}", job_id, component_id, priority);
    let sanitized = invalid_name_chars().replace_all(&raw, "-");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", sanitized.trim_start_matches(['-', '.', '_']), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentDescriptor, ImageDefinition, TokenInfo};
    use crate::execution::resources::NetworkMode;
    use serde_json::json;

    fn row() -> JobRow {
        let component = ComponentDescriptor::new(
            "keboola.python",
            ImageDefinition {
                registry: "dockerhub".to_string(),
                uri: "keboola/python".to_string(),
                tag: "1.0".to_string(),
                digest: None,
                repository: None,
            },
        );
        JobRow::new(component, json!({})).with_config_id("cfg-1")
    }

    fn context() -> JobContext {
        let mut context = JobContext::new("job-1", "123");
        context.token = Some(TokenInfo {
            id: "tok-1".to_string(),
            description: "my token".to_string(),
            token: "secret-token".to_string(),
        });
        context
    }

    fn spec(user: Option<&str>, swap: Option<u64>) -> RunSpec {
        let mut env = BTreeMap::new();
        env.insert("KBC_PROJECTID".to_string(), "123".to_string());
        env.insert("KBC_TOKEN".to_string(), "secret-token".to_string());
        let mut labels = BTreeMap::new();
        labels.insert(format!("{}jobId", LABEL_PREFIX), "job-1".to_string());
        RunSpec {
            container_name: "job-1-keboola.python-0-abcd1234".to_string(),
            image: "keboola/python:1.0".to_string(),
            env,
            labels,
            volumes: vec![
                VolumeMount::new("/work/data", DATA_DIR),
                VolumeMount::new("/work/tmp", TMP_DIR),
            ],
            limits: ResourceLimits {
                cpu_count: 2.0,
                memory_bytes: 512 * 1024 * 1024,
                memory_swap_bytes: swap,
                network: NetworkMode::Bridge,
            },
            user: user.map(String::from),
            timeout_secs: 3600,
        }
    }

    #[test]
    fn test_launch_command_is_exact() {
        let command = spec(Some("1000:1000"), Some(512 * 1024 * 1024)).launch_command("timeout", "docker");
        assert_eq!(command.program, "timeout");
        assert_eq!(
            command.args,
            vec![
                "--signal=SIGKILL",
                "3600",
                "docker",
                "run",
                "--volume=/work/data:/data",
                "--volume=/work/tmp:/tmp",
                "--memory=512m",
                "--memory-swap=512m",
                "--cpus=2",
                "--net=bridge",
                "--user=1000:1000",
                "--env=KBC_PROJECTID=123",
                "--env=KBC_TOKEN=secret-token",
                "--label=com.keboola.docker-runner.jobId=job-1",
                "--name=job-1-keboola.python-0-abcd1234",
                "keboola/python:1.0",
            ]
        );
    }

    #[test]
    fn test_launch_command_root_without_swap() {
        let command = spec(None, None).launch_command("timeout", "docker");
        assert!(!command.args.iter().any(|a| a.starts_with("--user")));
        assert!(!command.args.iter().any(|a| a.starts_with("--memory-swap")));
    }

    #[test]
    fn test_redacted_hides_token() {
        let command = spec(None, None).launch_command("timeout", "docker");
        let line = command.redacted();
        assert!(!line.contains("secret-token"));
        assert!(line.contains("KBC_TOKEN=*****"));
    }

    #[test]
    fn test_environment_without_token_forwarding() {
        let row = row();
        let context = context();
        let params = Map::new();
        let env = build_environment(&EnvironmentInputs {
            context: &context,
            row: &row,
            component_id: "keboola.python",
            capabilities: Capabilities::default(),
            storage_url: "https://connection.example.com",
            stack_id: "connection.example.com",
            parameters: &params,
        })
        .unwrap();

        assert_eq!(env["KBC_PROJECTID"], "123");
        assert_eq!(env["KBC_CONFIGID"], "cfg-1");
        assert_eq!(env["KBC_TOKENID"], "tok-1");
        assert_eq!(env["KBC_DATADIR"], "/data/");
        assert!(!env.contains_key("KBC_TOKEN"));
        assert!(!env.contains_key("KBC_TOKENDESC"));
        assert!(!env.contains_key("KBC_CONFIGROWID"));
    }

    #[test]
    fn test_environment_with_token_forwarding() {
        let row = row();
        let context = context();
        let params = Map::new();
        let capabilities = Capabilities {
            forward_token: true,
            forward_token_details: true,
            ..Default::default()
        };
        let env = build_environment(&EnvironmentInputs {
            context: &context,
            row: &row,
            component_id: "keboola.python",
            capabilities,
            storage_url: "https://connection.example.com",
            stack_id: "connection.example.com",
            parameters: &params,
        })
        .unwrap();

        assert_eq!(env["KBC_TOKEN"], "secret-token");
        assert_eq!(env["KBC_TOKENDESC"], "my token");
        assert_eq!(env["KBC_URL"], "https://connection.example.com");
    }

    #[test]
    fn test_parameter_injection() {
        let row = row();
        let context = context();
        let params = json!({"api-key": "abc", "limit": 10, "debug": true});
        let params = params.as_object().unwrap();
        let capabilities = Capabilities {
            inject_environment: true,
            ..Default::default()
        };
        let env = build_environment(&EnvironmentInputs {
            context: &context,
            row: &row,
            component_id: "keboola.python",
            capabilities,
            storage_url: "",
            stack_id: "",
            parameters: params,
        })
        .unwrap();

        assert_eq!(env["KBC_PARAMETER_API_KEY"], "abc");
        assert_eq!(env["KBC_PARAMETER_LIMIT"], "10");
        assert_eq!(env["KBC_PARAMETER_DEBUG"], "true");
    }

    #[test]
    fn test_parameter_injection_rejects_non_scalar() {
        let row = row();
        let context = context();
        let params = json!({"nested": {"a": 1}});
        let capabilities = Capabilities {
            inject_environment: true,
            ..Default::default()
        };
        let err = build_environment(&EnvironmentInputs {
            context: &context,
            row: &row,
            component_id: "keboola.python",
            capabilities,
            storage_url: "",
            stack_id: "",
            parameters: params.as_object().unwrap(),
        })
        .unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("nested"));
    }

    #[test]
    fn test_labels() {
        let labels = build_labels(&context(), &row().with_row_id("r-1"), "keboola.python");
        assert_eq!(labels["com.keboola.docker-runner.jobId"], "job-1");
        assert_eq!(labels["com.keboola.docker-runner.rowId"], "r-1");
        assert_eq!(labels["com.keboola.docker-runner.configId"], "cfg-1");
        assert_eq!(labels["com.keboola.docker-runner.projectId"], "123");
    }

    #[test]
    fn test_container_name_is_sanitized() {
        let name = container_name("job 1", "keboola/processor:x", 2);
        assert!(name.starts_with("job-1-keboola-processor-x-2-"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')));
    }
}
