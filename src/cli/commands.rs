//! CLI command definitions for docker-runner.
//!
//! `run` executes the rows of a job file; `check` only loads and validates
//! the job file and the runner configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::component::{ComponentDescriptor, JobConfiguration, JobContext, JobRow};
use crate::config::RunnerConfig;
use crate::execution::DockerClient;
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{InMemoryCatalog, PipelineOrchestrator, RunMode, RunOptions, DEFAULT_ACTION};
use crate::state::{HttpEncryptor, HttpStateStore};

/// Runs component containers for job rows.
#[derive(Parser)]
#[command(name = "docker-runner")]
#[command(about = "Run component containers for job rows")]
#[command(version)]
#[command(
    long_about = "docker-runner executes a component, with its processors, against each row of a job.\n\nExample usage:\n  docker-runner run --job job.yaml --config runner.yaml --mode debug"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the rows of a job file.
    Run(RunArgs),

    /// Validate a job file and the runner configuration without running anything.
    Check(CheckArgs),
}

/// Arguments for `docker-runner run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Job file (YAML or JSON) with the context, rows and processor descriptors.
    #[arg(short, long)]
    pub job: PathBuf,

    /// Runner configuration file; `RUNNER_*` environment variables are used otherwise.
    #[arg(short, long, env = "RUNNER_CONFIG")]
    pub config: Option<PathBuf>,

    /// `run` stores outputs and state, `debug` archives stage data instead.
    #[arg(short, long, default_value = "run")]
    pub mode: RunMode,

    /// Component action.
    #[arg(short, long, default_value = DEFAULT_ACTION)]
    pub action: String,

    /// Run only this row, even if it is disabled.
    #[arg(long)]
    pub row_id: Option<String>,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `docker-runner check`.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Job file (YAML or JSON).
    #[arg(short, long)]
    pub job: PathBuf,

    /// Runner configuration file.
    #[arg(short, long, env = "RUNNER_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Contents of a job file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFile {
    pub context: JobContext,
    pub rows: Vec<JobRow>,
    /// Descriptors of processors referenced by the rows.
    #[serde(default)]
    pub processors: Vec<ComponentDescriptor>,
}

impl JobFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse job file {}", path.display()))
    }

    fn catalog(&self) -> InMemoryCatalog {
        self.processors
            .iter()
            .cloned()
            .fold(InMemoryCatalog::new(), InMemoryCatalog::with_component)
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_job_command(args).await,
        Commands::Check(args) => run_check_command(args),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RunnerConfig> {
    let config = match path {
        Some(path) => RunnerConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load runner configuration {}", path.display()))?,
        None => RunnerConfig::from_env()?,
    };
    Ok(config)
}

async fn run_job_command(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let job = JobFile::load(&args.job)?;
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let token = config
        .storage_token
        .clone()
        .or_else(|| job.context.token.as_ref().map(|t| t.token.clone()))
        .unwrap_or_default();
    if token.is_empty() && args.mode == RunMode::Run {
        warn!("No storage token configured, state cannot be stored");
    }

    let engine = DockerClient::new().context("Failed to connect to Docker")?;
    let store = HttpStateStore::new(&config.storage_api_url, token)?;
    let encryptor = HttpEncryptor::new(&config.encryption_api_url)?;
    let orchestrator = PipelineOrchestrator::new(
        config,
        Arc::new(engine),
        Arc::new(store),
        Arc::new(encryptor),
    )
    .with_catalog(Arc::new(job.catalog()));

    let mut options = RunOptions::new()
        .with_action(args.action)
        .with_mode(args.mode);
    if let Some(row_id) = args.row_id {
        options = options.with_row_id(row_id);
    }

    let outcome = orchestrator.run(&job.context, &job.rows, &options).await;
    if args.metrics {
        println!("{}", export_metrics());
    }

    let results = match outcome {
        Ok(results) => results,
        Err(e) => {
            let report = serde_json::json!({
                "error": e.to_string(),
                "kind": e.kind(),
                "details": e.details(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            anyhow::bail!("Job {} failed: {}", job.context.job_id, e);
        }
    };

    for result in &results {
        if !result.output.is_empty() {
            info!(row = %result.row, "Main stage output:\n{}", result.output);
        }
    }
    let summaries: Vec<_> = results.iter().map(|r| r.summary()).collect();
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

fn run_check_command(args: CheckArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let job = JobFile::load(&args.job)?;

    for row in &job.rows {
        JobConfiguration::parse(&row.configuration)
            .with_context(|| format!("Row {} has an invalid configuration", row.label()))?;
    }
    info!(
        job = %job.context.job_id,
        rows = job.rows.len(),
        processors = job.processors.len(),
        work_root = %config.work_root.display(),
        "Job file is valid"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["docker-runner", "run", "--job", "job.yaml"]).expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.job, PathBuf::from("job.yaml"));
                assert_eq!(args.mode, RunMode::Run);
                assert_eq!(args.action, "run");
                assert!(args.row_id.is_none());
                assert!(!args.metrics);
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_run_command_with_all_options() {
        let cli = Cli::try_parse_from([
            "docker-runner",
            "run",
            "--job",
            "job.json",
            "--config",
            "runner.yaml",
            "--mode",
            "debug",
            "--action",
            "testConnection",
            "--row-id",
            "42",
            "--metrics",
            "--log-level",
            "debug",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, Some(PathBuf::from("runner.yaml")));
                assert_eq!(args.mode, RunMode::Debug);
                assert_eq!(args.action, "testConnection");
                assert_eq!(args.row_id.as_deref(), Some("42"));
                assert!(args.metrics);
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_job_file_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("job.yaml");
        std::fs::write(
            &path,
            r#"
context:
  job_id: "1001"
  run_id: "1001"
  project_id: "12"
rows:
  - component:
      id: keboola.ex-db
      image: {type: dockerhub, uri: keboola/ex-db}
    configuration:
      parameters: {db: main}
      processors:
        after:
          - definition: {component: keboola.processor-move-files}
    config_id: "55"
processors:
  - id: keboola.processor-move-files
    image: {type: dockerhub, uri: keboola/processor-move-files}
"#,
        )
        .unwrap();

        let job = JobFile::load(&path).unwrap();
        assert_eq!(job.context.job_id, "1001");
        assert_eq!(job.rows.len(), 1);
        assert_eq!(job.rows[0].config_id.as_deref(), Some("55"));
        assert_eq!(job.catalog().len(), 1);

        let check = run_check_command(CheckArgs {
            job: path,
            config: None,
        });
        assert!(check.is_ok());
    }

    #[test]
    fn test_job_file_missing() {
        let err = JobFile::load(Path::new("/nonexistent/job.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read job file"));
    }
}
