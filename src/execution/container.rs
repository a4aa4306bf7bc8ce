//! Container lifecycle for one pipeline stage.
//!
//! ```text
//! Created → Running → {Succeeded, Failed, TimedOut, OomKilled} → Cleaned
//! ```
//!
//! Removal is always attempted once the run finished, whatever the
//! outcome. Its result is reported as a [`CleanupOutcome`] and never
//! replaces the run's own result.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::component::Capabilities;
use crate::config::{LogTransport, RunnerConfig};
use crate::error::{DockerError, FailureDetails, RunnerError};
use crate::execution::docker_client::{ContainerEngine, ProcessOutput};
use crate::execution::log_listener::{Correlator, LogListener, LogSummary};
use crate::execution::output::truncate_message;
use crate::execution::resources::format_memory;
use crate::execution::run_spec::{set_logger_address, RunSpec};

/// Exit codes produced when the process was killed (`timeout` or the engine).
pub const KILLED_EXIT_CODES: [i32; 2] = [124, 137];

/// Lifecycle state of a managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    OomKilled,
    Cleaned,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Succeeded => write!(f, "succeeded"),
            ContainerStatus::Failed => write!(f, "failed"),
            ContainerStatus::TimedOut => write!(f, "timed_out"),
            ContainerStatus::OomKilled => write!(f, "oom_killed"),
            ContainerStatus::Cleaned => write!(f, "cleaned"),
        }
    }
}

/// Best-effort cleanup steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    ContainerRemoval,
    PermissionNormalization,
    WorkingDirectoryRemoval,
}

impl CleanupStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupStep::ContainerRemoval => "container_removal",
            CleanupStep::PermissionNormalization => "permission_normalization",
            CleanupStep::WorkingDirectoryRemoval => "working_directory_removal",
        }
    }
}

/// Recorded result of a cleanup step. Failures are reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupOutcome {
    pub step: CleanupStep,
    pub target: String,
    pub error: Option<String>,
}

impl CleanupOutcome {
    pub fn succeeded(step: CleanupStep, target: impl Into<String>) -> Self {
        Self {
            step,
            target: target.into(),
            error: None,
        }
    }

    pub fn failed(step: CleanupStep, target: impl Into<String>, error: impl ToString) -> Self {
        let outcome = Self {
            step,
            target: target.into(),
            error: Some(error.to_string()),
        };
        warn!(
            step = outcome.step.as_str(),
            target = %outcome.target,
            error = outcome.error.as_deref().unwrap_or_default(),
            "Cleanup step failed"
        );
        outcome
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
struct LoggingSettings {
    transport: LogTransport,
    ports: RangeInclusive<u16>,
    host: String,
}

/// Launch settings derived from the runner configuration and the stage's
/// component capabilities.
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub timeout_binary: String,
    pub docker_binary: String,
    pub max_output_bytes: usize,
    pub max_message_chars: usize,
    pub removal_timeout: Duration,
    pub disable_application_errors: bool,
    logging: Option<LoggingSettings>,
}

impl ContainerSettings {
    pub fn new(config: &RunnerConfig, capabilities: Capabilities) -> Self {
        let logging = capabilities.structured_logging.then(|| LoggingSettings {
            transport: config.log_transport,
            ports: config.log_port_range(),
            host: config.log_host.clone(),
        });
        Self {
            timeout_binary: config.timeout_binary.clone(),
            docker_binary: config.docker_binary.clone(),
            max_output_bytes: config.max_output_bytes,
            max_message_chars: config.max_message_chars,
            removal_timeout: config.container_removal_timeout(),
            disable_application_errors: capabilities.disable_application_errors,
            logging,
        }
    }

    pub fn uses_structured_logging(&self) -> bool {
        self.logging.is_some()
    }
}

/// Result of one container run plus its cleanup record.
#[derive(Debug)]
pub struct ContainerRun {
    pub result: Result<ProcessOutput, RunnerError>,
    pub cleanup: CleanupOutcome,
    pub log_summary: Option<LogSummary>,
}

/// A single container execution.
pub struct Container {
    spec: RunSpec,
    engine: Arc<dyn ContainerEngine>,
    settings: ContainerSettings,
    status: ContainerStatus,
}

impl Container {
    pub fn new(spec: RunSpec, engine: Arc<dyn ContainerEngine>, settings: ContainerSettings) -> Self {
        Self {
            spec,
            engine,
            settings,
            status: ContainerStatus::Created,
        }
    }

    pub fn status(&self) -> ContainerStatus {
        self.status
    }

    pub fn name(&self) -> &str {
        &self.spec.container_name
    }

    /// Runs the container to completion, classifies the exit and removes
    /// the container.
    pub async fn run(&mut self) -> ContainerRun {
        let (result, log_summary) = self.launch().await;
        let result = match result {
            Ok(output) => self.finish(output, log_summary.as_ref()).await,
            Err(e) => {
                self.status = ContainerStatus::Failed;
                Err(e)
            }
        };

        let cleanup = self.remove().await;
        self.status = ContainerStatus::Cleaned;

        ContainerRun {
            result,
            cleanup,
            log_summary,
        }
    }

    async fn launch(&mut self) -> (Result<ProcessOutput, RunnerError>, Option<LogSummary>) {
        let listener = match &self.settings.logging {
            Some(logging) => {
                let correlator = Correlator::new(Arc::clone(&self.engine), &self.spec.container_name);
                match LogListener::start(logging.transport, logging.ports.clone(), correlator).await {
                    Ok(listener) => {
                        set_logger_address(&mut self.spec.env, &logging.host, listener.port());
                        Some(listener)
                    }
                    Err(e) => return (Err(e.into()), None),
                }
            }
            None => None,
        };

        let command = self
            .spec
            .launch_command(&self.settings.timeout_binary, &self.settings.docker_binary);
        info!(
            container = %self.spec.container_name,
            image = %self.spec.image,
            memory = %self.spec.limits.memory_string(),
            cpus = %self.spec.limits.cpu_string(),
            network = %self.spec.limits.network,
            "Running container"
        );
        self.status = ContainerStatus::Running;

        let result = self
            .engine
            .run(&command, self.settings.max_output_bytes)
            .await
            .map_err(RunnerError::from);

        let summary = match listener {
            Some(listener) => Some(listener.shutdown().await),
            None => None,
        };
        (result, summary)
    }

    async fn finish(
        &mut self,
        output: ProcessOutput,
        log_summary: Option<&LogSummary>,
    ) -> Result<ProcessOutput, RunnerError> {
        let oom_killed = if output.exit_code == 0 || KILLED_EXIT_CODES.contains(&output.exit_code) {
            self.inspect_oom().await
        } else {
            false
        };

        let classification = classify(
            &output,
            &ExitContext {
                oom_killed,
                timeout: Duration::from_secs(self.spec.timeout_secs),
                memory_bytes: self.spec.limits.memory_bytes,
                disable_application_errors: self.settings.disable_application_errors,
                last_log_error: log_summary.and_then(|s| s.last_error.as_deref()),
                max_message_chars: self.settings.max_message_chars,
            },
        );
        self.status = classification.status;

        info!(
            container = %self.spec.container_name,
            exit_code = output.exit_code,
            duration_ms = output.duration.as_millis() as u64,
            status = %self.status,
            "Container finished"
        );

        match classification.error {
            None => Ok(output),
            Some(e) => Err(e),
        }
    }

    async fn inspect_oom(&self) -> bool {
        match self.engine.inspect_container(&self.spec.container_name).await {
            Ok(inspection) => inspection.oom_killed,
            Err(e) => {
                warn!(container = %self.spec.container_name, error = %e, "Container inspection failed");
                false
            }
        }
    }

    async fn remove(&self) -> CleanupOutcome {
        let name = &self.spec.container_name;
        let removal = tokio::time::timeout(
            self.settings.removal_timeout,
            self.engine.remove_container(name),
        )
        .await;

        match removal {
            Ok(Ok(())) | Ok(Err(DockerError::ContainerNotFound { .. })) => {
                debug!(container = %name, "Container removed");
                CleanupOutcome::succeeded(CleanupStep::ContainerRemoval, name.clone())
            }
            Ok(Err(e)) => CleanupOutcome::failed(CleanupStep::ContainerRemoval, name.clone(), e),
            Err(_) => CleanupOutcome::failed(
                CleanupStep::ContainerRemoval,
                name.clone(),
                DockerError::Timeout {
                    seconds: self.settings.removal_timeout.as_secs(),
                },
            ),
        }
    }
}

/// Post-exit facts used to classify a run.
#[derive(Debug, Clone)]
pub struct ExitContext<'a> {
    pub oom_killed: bool,
    pub timeout: Duration,
    pub memory_bytes: u64,
    pub disable_application_errors: bool,
    pub last_log_error: Option<&'a str>,
    pub max_message_chars: usize,
}

#[derive(Debug)]
pub struct Classification {
    pub status: ContainerStatus,
    pub error: Option<RunnerError>,
}

/// Maps an exit code and post-exit inspection onto a terminal state.
pub fn classify(output: &ProcessOutput, ctx: &ExitContext<'_>) -> Classification {
    let details = FailureDetails {
        exit_code: Some(output.exit_code),
        output: output.stdout.clone(),
        error_output: output.stderr.clone(),
        duration: Some(output.duration),
    };

    let killed = KILLED_EXIT_CODES.contains(&output.exit_code);
    if killed && output.duration >= ctx.timeout {
        return Classification {
            status: ContainerStatus::TimedOut,
            error: Some(
                RunnerError::user(format!(
                    "Running container exceeded the timeout of {} seconds.",
                    ctx.timeout.as_secs()
                ))
                .with_details(details),
            ),
        };
    }

    if killed || (ctx.oom_killed && output.exit_code != 1) {
        return Classification {
            status: ContainerStatus::OomKilled,
            error: Some(
                RunnerError::out_of_memory(format!(
                    "Component out of memory (exceeded {})",
                    format_memory(ctx.memory_bytes)
                ))
                .with_details(details),
            ),
        };
    }

    if output.exit_code == 0 {
        return Classification {
            status: ContainerStatus::Succeeded,
            error: None,
        };
    }

    let message = truncate_message(
        &failure_message(output, ctx.last_log_error),
        ctx.max_message_chars,
    );
    let error = if output.exit_code == 1 || ctx.disable_application_errors {
        RunnerError::user(message)
    } else {
        RunnerError::application(message)
    };

    Classification {
        status: ContainerStatus::Failed,
        error: Some(error.with_details(details)),
    }
}

fn failure_message(output: &ProcessOutput, last_log_error: Option<&str>) -> String {
    let combined = [output.stderr.trim(), output.stdout.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if !combined.is_empty() {
        return combined;
    }
    match last_log_error {
        Some(line) if !line.trim().is_empty() => line.trim().to_string(),
        _ => format!("Container exited with code {}", output.exit_code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentDescriptor, ImageDefinition, LoggingMode};
    use crate::error::ErrorKind;
    use crate::execution::docker_client::tests::{env_arg, exit_with, FakeEngine};
    use crate::execution::resources::{NetworkMode, ResourceLimits};
    use std::collections::BTreeMap;

    fn output(exit_code: i32, stdout: &str, stderr: &str, secs: u64) -> ProcessOutput {
        ProcessOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            duration: Duration::from_secs(secs),
        }
    }

    fn ctx() -> ExitContext<'static> {
        ExitContext {
            oom_killed: false,
            timeout: Duration::from_secs(100),
            memory_bytes: 256 * 1024 * 1024,
            disable_application_errors: false,
            last_log_error: None,
            max_message_chars: 4000,
        }
    }

    fn descriptor(logging: LoggingMode) -> ComponentDescriptor {
        ComponentDescriptor::new(
            "keboola.ex-db",
            ImageDefinition {
                registry: "dockerhub".to_string(),
                uri: "keboola/ex-db".to_string(),
                tag: "latest".to_string(),
                digest: None,
                repository: None,
            },
        )
        .with_logging(logging)
    }

    fn spec() -> RunSpec {
        RunSpec {
            container_name: "job-1-keboola-ex-db-0".to_string(),
            image: "keboola/ex-db:latest".to_string(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            volumes: Vec::new(),
            limits: ResourceLimits {
                cpu_count: 1.0,
                memory_bytes: 256 * 1024 * 1024,
                memory_swap_bytes: Some(256 * 1024 * 1024),
                network: NetworkMode::Bridge,
            },
            user: None,
            timeout_secs: 100,
        }
    }

    fn container(engine: Arc<FakeEngine>, logging: LoggingMode, ports: (u16, u16)) -> Container {
        let config = RunnerConfig::default().with_log_ports(ports.0, ports.1);
        let settings = ContainerSettings::new(&config, descriptor(logging).capabilities());
        Container::new(spec(), engine, settings)
    }

    #[tokio::test]
    async fn test_run_binds_log_listener_before_launch() {
        let engine = Arc::new(FakeEngine::new());
        let mut container = container(Arc::clone(&engine), LoggingMode::Gelf, (42600, 42600));
        assert!(container.settings.uses_structured_logging());

        let run = container.run().await;
        assert!(run.result.is_ok());
        assert!(run.log_summary.is_some());
        assert_eq!(container.status(), ContainerStatus::Cleaned);

        let runs = engine.runs.lock().unwrap();
        assert_eq!(env_arg(&runs[0], "KBC_LOGGER_PORT"), Some("42600"));
        assert_eq!(env_arg(&runs[0], "KBC_LOGGER_ADDR"), Some("172.17.0.1"));
        drop(runs);

        let rebound = LogListener::start(
            LogTransport::Udp,
            42600..=42600,
            Correlator::new(engine, "other"),
        )
        .await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_run_without_structured_logging() {
        let engine = Arc::new(FakeEngine::new());
        let mut container = container(Arc::clone(&engine), LoggingMode::Standard, (42610, 42619));
        assert!(!container.settings.uses_structured_logging());

        let run = container.run().await;
        assert!(run.result.is_ok());
        assert!(run.log_summary.is_none());
        assert!(env_arg(&engine.runs.lock().unwrap()[0], "KBC_LOGGER_PORT").is_none());
    }

    #[tokio::test]
    async fn test_run_reports_last_structured_log_error() {
        let mut engine = FakeEngine::new().with_run(exit_with(1, "", 2));
        engine.log_events = vec![
            (6, "connecting".to_string()),
            (3, "fatal: bad credentials".to_string()),
        ];
        let engine = Arc::new(engine);
        let mut container = container(Arc::clone(&engine), LoggingMode::Gelf, (42620, 42629));

        let run = container.run().await;
        let err = run.result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
        assert_eq!(err.to_string(), "fatal: bad credentials");
        assert_eq!(run.log_summary.unwrap().delivered, 2);
        assert!(run.cleanup.is_success());
    }

    #[tokio::test]
    async fn test_run_reads_oom_flag_from_inspection() {
        let mut engine = FakeEngine::new().with_run(exit_with(0, "", 3));
        engine.oom_killed = true;
        let engine = Arc::new(engine);
        let mut container = container(Arc::clone(&engine), LoggingMode::Standard, (42630, 42639));

        let run = container.run().await;
        let err = run.result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert!(err.to_string().contains("256m"));
        assert_eq!(engine.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_oom_flag_ignored_for_user_error_exit() {
        let mut engine = FakeEngine::new().with_run(exit_with(1, "Invalid credentials", 3));
        engine.oom_killed = true;
        let mut container = container(Arc::new(engine), LoggingMode::Standard, (42640, 42649));

        let err = container.run().await.result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
        assert_eq!(err.to_string(), "Invalid credentials");
    }

    #[tokio::test]
    async fn test_removal_timeout_keeps_run_result() {
        let mut engine = FakeEngine::new();
        engine.removal_delay = Some(Duration::from_secs(5));
        let mut container = container(Arc::new(engine), LoggingMode::Standard, (42650, 42659));
        container.settings.removal_timeout = Duration::from_millis(50);

        let run = container.run().await;
        assert!(run.result.is_ok());
        assert_eq!(run.cleanup.step, CleanupStep::ContainerRemoval);
        assert!(!run.cleanup.is_success());
        assert!(run.cleanup.error.unwrap().contains("timed out"));
        assert_eq!(container.status(), ContainerStatus::Cleaned);
    }

    #[test]
    fn test_success() {
        let c = classify(&output(0, "done", "", 5), &ctx());
        assert_eq!(c.status, ContainerStatus::Succeeded);
        assert!(c.error.is_none());
    }

    #[test]
    fn test_exit_one_is_user_error_with_details() {
        let c = classify(&output(1, "some log", "Invalid credentials", 5), &ctx());
        assert_eq!(c.status, ContainerStatus::Failed);
        let err = c.error.unwrap();
        assert_eq!(err.kind(), ErrorKind::User);
        assert_eq!(err.to_string(), "Invalid credentials\nsome log");
        let details = err.details().unwrap();
        assert_eq!(details.exit_code, Some(1));
        assert_eq!(details.error_output, "Invalid credentials");
    }

    #[test]
    fn test_falls_back_to_last_log_error() {
        let mut context = ctx();
        context.last_log_error = Some("GELF says no");
        let err = classify(&output(1, "", "  ", 5), &context).error.unwrap();
        assert_eq!(err.to_string(), "GELF says no");
    }

    #[test]
    fn test_other_exit_is_application_error() {
        let err = classify(&output(2, "", "Traceback", 5), &ctx()).error.unwrap();
        assert_eq!(err.kind(), ErrorKind::Application);
        assert_eq!(err.to_string(), "Traceback");
    }

    #[test]
    fn test_application_errors_can_be_disabled() {
        let mut context = ctx();
        context.disable_application_errors = true;
        let err = classify(&output(2, "", "Traceback", 5), &context).error.unwrap();
        assert_eq!(err.kind(), ErrorKind::User);
        assert_eq!(err.to_string(), "Traceback");
    }

    #[test]
    fn test_killed_after_timeout_is_timeout() {
        let c = classify(&output(137, "", "", 100), &ctx());
        assert_eq!(c.status, ContainerStatus::TimedOut);
        let err = c.error.unwrap();
        assert_eq!(err.kind(), ErrorKind::User);
        assert!(err.to_string().contains("timeout of 100 seconds"));
    }

    #[test]
    fn test_killed_before_timeout_is_oom() {
        let c = classify(&output(137, "", "", 10), &ctx());
        assert_eq!(c.status, ContainerStatus::OomKilled);
        let err = c.error.unwrap();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert!(err.is_user_error());
        assert!(err.to_string().contains("256m"));
    }

    #[test]
    fn test_oom_flag_with_zero_exit() {
        let mut context = ctx();
        context.oom_killed = true;
        let c = classify(&output(0, "", "", 10), &context);
        assert_eq!(c.status, ContainerStatus::OomKilled);
    }

    #[test]
    fn test_message_is_truncated() {
        let mut context = ctx();
        context.max_message_chars = 50;
        let long = "x".repeat(500);
        let err = classify(&output(1, "", &long, 1), &context).error.unwrap();
        assert_eq!(err.to_string().chars().count(), 50);
        assert_eq!(err.details().unwrap().error_output.len(), 500);
    }

    #[test]
    fn test_empty_output_message() {
        let err = classify(&output(3, "", "", 1), &ctx()).error.unwrap();
        assert_eq!(err.to_string(), "Container exited with code 3");
    }

    #[test]
    fn test_cleanup_outcome() {
        let ok = CleanupOutcome::succeeded(CleanupStep::ContainerRemoval, "c1");
        assert!(ok.is_success());
        let failed = CleanupOutcome::failed(CleanupStep::ContainerRemoval, "c1", "daemon gone");
        assert!(!failed.is_success());
        assert_eq!(failed.error.as_deref(), Some("daemon gone"));
        assert_eq!(CleanupStep::PermissionNormalization.as_str(), "permission_normalization");
    }
}
