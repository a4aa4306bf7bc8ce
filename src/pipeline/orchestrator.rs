//! Pipeline orchestrator for job rows.
//!
//! This module provides the `PipelineOrchestrator` that coordinates:
//! - Row selection (disabled rows, explicitly targeted rows)
//! - Image resolution for processors and the main component
//! - Resource limits per stage
//! - Working directory staging between stages
//! - State capture from the main stage and its persistence
//!
//! # Row flow
//!
//! ```text
//! resolve images ─► compute limits ─► create working dir ─► load inputs
//!   ─► for each stage: config.json (+ in/state.json for main) ─► container
//!        ─► main: capture out/state.json ─► move out → in (except last)
//!   ─► store outputs ─► persist state ─► drop working dir
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::component::{Capabilities, JobConfiguration, JobContext, JobRow, ProcessorSpec};
use crate::config::RunnerConfig;
use crate::error::{ImageError, RunnerError};
use crate::execution::run_spec::{container_name, DATA_DIR, TMP_DIR};
use crate::execution::{
    build_environment, build_labels, CleanupOutcome, Container, ContainerEngine,
    ContainerSettings, EnvironmentInputs, LimitsPolicy, ResourceLimits, RunSpec, VolumeMount,
};
use crate::image::{ImageRequest, ImageResolver, ResolvedImage, Sleeper, StageRole, TokioSleeper};
use crate::metrics::MetricsCollector;
use crate::state::{
    EncryptionScope, SecretEncryptor, StateCheckpoint, StateSnapshot, StateStore, StateTarget,
};
use crate::workspace::{
    archive_directory, stage_archive_name, PermissionNormalizer, StageInput, StageOutput,
    WorkingDirectory,
};

use super::collaborators::{ComponentCatalog, DataTransfer, InMemoryCatalog, NoopDataTransfer};
use super::config_file::render_config;
use super::result::{ImageDigests, PipelineResult};

/// The default action; every other action is a synchronous check.
pub const DEFAULT_ACTION: &str = "run";

/// How outputs and state are treated after the stages ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Store outputs and persist state.
    #[default]
    Run,
    /// Archive every stage's data instead of storing anything.
    Debug,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Run => write!(f, "run"),
            RunMode::Debug => write!(f, "debug"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "run" => Ok(RunMode::Run),
            "debug" => Ok(RunMode::Debug),
            other => Err(format!("unknown run mode '{}'", other)),
        }
    }
}

/// Caller choices for one `run` call.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub action: String,
    pub mode: RunMode,
    /// Runs only this row, even when it is disabled.
    pub row_id: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            action: DEFAULT_ACTION.to_string(),
            mode: RunMode::Run,
            row_id: None,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_row_id(mut self, row_id: impl Into<String>) -> Self {
        self.row_id = Some(row_id.into());
        self
    }

    fn is_default_action(&self) -> bool {
        self.action == DEFAULT_ACTION
    }

    /// Outputs and state are only written by real runs of the default action.
    fn stores_results(&self) -> bool {
        self.mode == RunMode::Run && self.is_default_action()
    }
}

/// A resolved stage with its precomputed limits.
struct Stage {
    image: ResolvedImage,
    limits: ResourceLimits,
}

/// Mutable bookkeeping of one row run.
struct RowRun<'a> {
    context: &'a JobContext,
    row: &'a JobRow,
    configuration: &'a JobConfiguration,
    options: &'a RunOptions,
    workdir: &'a WorkingDirectory,
    checkpoint: StateCheckpoint,
    cleanup: Vec<CleanupOutcome>,
    main_output: String,
}

/// Main pipeline orchestrator running job rows stage by stage.
pub struct PipelineOrchestrator {
    config: RunnerConfig,
    engine: Arc<dyn ContainerEngine>,
    resolver: ImageResolver,
    store: Arc<dyn StateStore>,
    encryptor: Arc<dyn SecretEncryptor>,
    data_transfer: Arc<dyn DataTransfer>,
    catalog: Arc<dyn ComponentCatalog>,
    metrics: MetricsCollector,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator with no data transfer and an empty catalog.
    pub fn new(
        config: RunnerConfig,
        engine: Arc<dyn ContainerEngine>,
        store: Arc<dyn StateStore>,
        encryptor: Arc<dyn SecretEncryptor>,
    ) -> Self {
        let resolver = ImageResolver::new(
            Arc::clone(&engine),
            config.retry.clone(),
            Arc::new(TokioSleeper),
        );
        Self {
            config,
            engine,
            resolver,
            store,
            encryptor,
            data_transfer: Arc::new(NoopDataTransfer),
            catalog: Arc::new(InMemoryCatalog::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_data_transfer(mut self, data_transfer: Arc<dyn DataTransfer>) -> Self {
        self.data_transfer = data_transfer;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ComponentCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Replaces the sleeper used between digest lookup attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.resolver = ImageResolver::new(Arc::clone(&self.engine), self.config.retry.clone(), sleeper);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Runs the selected rows one after another.
    ///
    /// Disabled rows are skipped unless `options.row_id` targets them. The
    /// first failing row aborts the call.
    ///
    /// # Errors
    ///
    /// Returns a user error when `options.row_id` matches no row, otherwise
    /// the classified error of the failing row.
    pub async fn run(
        &self,
        context: &JobContext,
        rows: &[JobRow],
        options: &RunOptions,
    ) -> Result<Vec<PipelineResult>, RunnerError> {
        let selected = select_rows(rows, options.row_id.as_deref())?;
        info!(
            job = %context.job_id,
            rows = selected.len(),
            action = %options.action,
            mode = %options.mode,
            "Running job"
        );

        let mut results = Vec::with_capacity(selected.len());
        for row in selected {
            results.push(self.run_row(context, row, options).await?);
        }
        Ok(results)
    }

    /// Runs all stages of one row.
    pub async fn run_row(
        &self,
        context: &JobContext,
        row: &JobRow,
        options: &RunOptions,
    ) -> Result<PipelineResult, RunnerError> {
        let started_at = Utc::now();
        let capabilities = row.component.capabilities();
        if capabilities.block_branch_jobs && !context.branch_is_default {
            return Err(RunnerError::user(format!(
                "Component '{}' cannot be run in a development branch.",
                row.component.id
            )));
        }

        let configuration = JobConfiguration::parse(&row.configuration)?;
        let stages = self.prepare_stages(context, row, &configuration, options).await?;
        let images: Vec<ImageDigests> = stages.iter().map(|s| ImageDigests::from(&s.image)).collect();
        info!(
            row = %row.label(),
            stages = stages.len(),
            "Stages resolved"
        );

        let mut workdir = WorkingDirectory::new(&self.config.work_root, &context.job_id);
        let created = workdir.create().await;
        let mut run = RowRun {
            context,
            row,
            configuration: &configuration,
            options,
            workdir: &workdir,
            checkpoint: self.checkpoint(context, row),
            cleanup: Vec::new(),
            main_output: String::new(),
        };

        let outcome = match created {
            Ok(input) => self.execute(&mut run, &stages, input).await,
            Err(e) => Err(e.into()),
        };
        let RowRun {
            checkpoint,
            mut cleanup,
            main_output,
            ..
        } = run;

        let dropped = workdir.drop_dir().await;
        self.record_cleanup(&dropped);
        cleanup.push(dropped);

        let state_persisted = match outcome {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(row = %row.label(), kind = %e.kind(), error = %e, "Row failed");
                return Err(e);
            }
        };

        let result = PipelineResult {
            row: row.label(),
            images,
            output: main_output,
            config_version: row.config_version.clone(),
            state: checkpoint,
            state_persisted,
            cleanup,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            row = %result.row,
            state_persisted = result.state_persisted,
            cleanup_failures = result.cleanup_failures().count(),
            "Row finished"
        );
        Ok(result)
    }

    /// Resolves every stage image and computes its limits before anything runs.
    async fn prepare_stages(
        &self,
        context: &JobContext,
        row: &JobRow,
        configuration: &JobConfiguration,
        options: &RunOptions,
    ) -> Result<Vec<Stage>, RunnerError> {
        let run_processors = options.is_default_action();
        if !run_processors
            && !(configuration.processors.before.is_empty() && configuration.processors.after.is_empty())
        {
            info!(action = %options.action, "Processors are skipped for synchronous actions");
        }

        let mut requests = Vec::new();
        if run_processors {
            for spec in &configuration.processors.before {
                requests.push(self.processor_request(spec, StageRole::Before).await?);
            }
        }
        requests.push(ImageRequest {
            descriptor: row.component.clone(),
            role: StageRole::Main,
            priority: 0,
            tag: configuration.runtime.image_tag.clone(),
            parameters: configuration.parameters.clone(),
        });
        if run_processors {
            for spec in &configuration.processors.after {
                requests.push(self.processor_request(spec, StageRole::After).await?);
            }
        }

        let mut stages = Vec::with_capacity(requests.len());
        for (priority, mut request) in requests.into_iter().enumerate() {
            request.priority = priority;
            let image = self.resolver.resolve(request).await?;
            let backend_size = if image.is_main() {
                configuration.backend_size().map(str::to_string)
            } else {
                None
            };
            let limits = LimitsPolicy::new(self.config.instance_cpu_limit, self.config.default_memory.clone())
                .with_project_features(context.project_features.clone())
                .with_project_limits(context.project_limits.clone())
                .with_backend_size(backend_size)
                .limits_for(&image.descriptor)?;
            stages.push(Stage { image, limits });
        }
        Ok(stages)
    }

    async fn processor_request(
        &self,
        spec: &ProcessorSpec,
        role: StageRole,
    ) -> Result<ImageRequest, RunnerError> {
        let descriptor = self
            .catalog
            .component(&spec.definition.component)
            .await
            .map_err(|e| match e {
                ImageError::ComponentNotFound(id) => {
                    RunnerError::user(format!("Processor component '{}' not found.", id))
                }
                other => other.into(),
            })?;
        Ok(ImageRequest {
            descriptor,
            role,
            priority: 0,
            tag: spec.definition.tag.clone(),
            parameters: spec.parameters.clone(),
        })
    }

    fn checkpoint(&self, context: &JobContext, row: &JobRow) -> StateCheckpoint {
        let target = row.config_id.as_ref().map(|config_id| {
            StateTarget::new(
                context.branch_id.clone(),
                row.component.id.clone(),
                config_id.clone(),
                row.row_id.clone(),
            )
        });
        let scope = EncryptionScope {
            project_id: context.project_id.clone(),
            component_id: row.component.id.clone(),
            config_id: row.config_id.clone(),
        };
        StateCheckpoint::new(
            target,
            scope,
            StateSnapshot::from_value(&row.state),
            Arc::clone(&self.store),
            Arc::clone(&self.encryptor),
        )
    }

    /// Runs the stages and stores results. Returns whether state was written.
    async fn execute(
        &self,
        run: &mut RowRun<'_>,
        stages: &[Stage],
        mut input: StageInput,
    ) -> Result<bool, RunnerError> {
        let Some((last, leading)) = stages.split_last() else {
            return Err(RunnerError::application("No stages to run"));
        };

        let input_state = self
            .data_transfer
            .load_inputs(run.context, run.row, run.configuration, &run.workdir.data_dir())
            .await?;

        for stage in leading {
            let output = self.run_stage(run, stage, input).await?;
            input = run.workdir.move_output_to_input(output).await?;
        }
        self.run_stage(run, last, input).await?.finish();

        if !run.options.stores_results() {
            info!(
                mode = %run.options.mode,
                action = %run.options.action,
                "Outputs and state are not stored"
            );
            return Ok(false);
        }

        self.data_transfer
            .store_outputs(run.context, run.row, run.configuration, &run.workdir.data_dir())
            .await?;
        Ok(run.checkpoint.persist(input_state).await?)
    }

    async fn run_stage(
        &self,
        run: &mut RowRun<'_>,
        stage: &Stage,
        input: StageInput,
    ) -> Result<StageOutput, RunnerError> {
        let image = &stage.image;
        let capabilities = image.descriptor.capabilities();

        run.workdir
            .write_config(&render_config(run.configuration, image, &run.options.action))
            .await?;
        if image.is_main() {
            run.workdir
                .write_input_state(run.checkpoint.component_state())
                .await?;
        }

        let spec = self.run_spec(run, stage, capabilities)?;
        debug!(
            container = %spec.container_name,
            stage = %image.role,
            priority = image.priority,
            "Launching stage"
        );
        let started = Instant::now();
        let mut container = Container::new(
            spec,
            Arc::clone(&self.engine),
            ContainerSettings::new(&self.config, capabilities),
        );
        let container_run = container.run().await;
        let elapsed = started.elapsed();

        self.record_cleanup(&container_run.cleanup);
        run.cleanup.push(container_run.cleanup);
        if capabilities.run_as_root {
            let normalized = run
                .workdir
                .normalize_permissions(&self.engine, &self.permission_normalizer())
                .await;
            self.record_cleanup(&normalized);
            run.cleanup.push(normalized);
        }

        let output = match container_run.result {
            Ok(output) => {
                self.metrics.record_stage("succeeded", Some(elapsed));
                output
            }
            Err(e) => {
                self.metrics.record_stage(&e.kind().to_string(), Some(elapsed));
                return Err(e);
            }
        };

        if image.is_main() {
            let emitted = run
                .checkpoint
                .load_from_file(&run.workdir.output_state_path())
                .await?;
            run.checkpoint.stash(emitted);
            run.workdir.clear_input_state().await?;
            run.main_output = output.stdout;
        }

        if run.options.mode == RunMode::Debug {
            self.archive_stage(run, image, elapsed).await?;
        }

        Ok(input.complete())
    }

    fn run_spec(
        &self,
        run: &RowRun<'_>,
        stage: &Stage,
        capabilities: Capabilities,
    ) -> Result<RunSpec, RunnerError> {
        let image = &stage.image;
        let env = build_environment(&EnvironmentInputs {
            context: run.context,
            row: run.row,
            component_id: image.component_id(),
            capabilities,
            storage_url: &self.config.storage_api_url,
            stack_id: &self.config.stack_id,
            parameters: &image.parameters,
        })?;

        let runtime_timeout = if image.is_main() {
            run.configuration.runtime.process_timeout
        } else {
            None
        };
        let timeout_secs = runtime_timeout
            .or(image.descriptor.process_timeout)
            .unwrap_or(self.config.default_process_timeout_secs);

        Ok(RunSpec {
            container_name: container_name(&run.context.job_id, image.component_id(), image.priority),
            image: image.reference.clone(),
            env,
            labels: build_labels(run.context, run.row, image.component_id()),
            volumes: vec![
                VolumeMount::new(run.workdir.data_dir(), DATA_DIR),
                VolumeMount::new(run.workdir.tmp_dir(), TMP_DIR),
            ],
            limits: stage.limits.clone(),
            user: if capabilities.run_as_root {
                None
            } else {
                Some(self.config.container_user.clone())
            },
            timeout_secs,
        })
    }

    fn permission_normalizer(&self) -> PermissionNormalizer {
        PermissionNormalizer {
            timeout_binary: self.config.timeout_binary.clone(),
            docker_binary: self.config.docker_binary.clone(),
            image: self.config.permission_normalization_image.clone(),
            owner: self.config.container_user.clone(),
            timeout: self.config.permission_normalization_timeout(),
        }
    }

    async fn archive_stage(
        &self,
        run: &RowRun<'_>,
        image: &ResolvedImage,
        elapsed: Duration,
    ) -> Result<(), RunnerError> {
        let source = run.workdir.data_dir();
        let destination = self
            .config
            .debug_archive_dir
            .join(&run.context.job_id)
            .join(stage_archive_name(image.priority, image.component_id()));

        let archive = tokio::task::spawn_blocking(move || archive_directory(&source, &destination))
            .await
            .map_err(|e| RunnerError::application(format!("Archive task failed: {}", e)))??;
        info!(
            archive = %archive.display(),
            stage = %image.role,
            duration_ms = elapsed.as_millis() as u64,
            "Stage data archived"
        );
        Ok(())
    }

    fn record_cleanup(&self, outcome: &CleanupOutcome) {
        if !outcome.is_success() {
            self.metrics.record_cleanup_failure(outcome.step.as_str());
        }
    }
}

/// Picks the rows to run.
fn select_rows<'a>(rows: &'a [JobRow], row_id: Option<&str>) -> Result<Vec<&'a JobRow>, RunnerError> {
    let Some(row_id) = row_id else {
        return Ok(rows
            .iter()
            .filter(|row| {
                if row.disabled {
                    info!(row = %row.label(), "Skipping disabled row");
                }
                !row.disabled
            })
            .collect());
    };

    let selected: Vec<&JobRow> = rows
        .iter()
        .filter(|row| row.row_id.as_deref() == Some(row_id))
        .collect();
    if selected.is_empty() {
        return Err(RunnerError::user(format!("Row {} not found.", row_id)));
    }
    for row in &selected {
        if row.disabled {
            info!(row = %row.label(), "Row is disabled but was requested explicitly, running anyway");
        }
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentDescriptor, ImageDefinition};
    use crate::execution::docker_client::tests::{exit_with, FakeEngine};
    use crate::image::retry::tests::RecordingSleeper;
    use crate::image::RetryPolicy;
    use crate::state::encryptor::tests::PrefixEncryptor;
    use crate::state::InMemoryStateStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn descriptor(id: &str) -> ComponentDescriptor {
        ComponentDescriptor::new(
            id,
            ImageDefinition {
                registry: "dockerhub".to_string(),
                uri: format!("keboola/{}", id),
                tag: "latest".to_string(),
                digest: None,
                repository: None,
            },
        )
    }

    fn orchestrator(
        tmp: &TempDir,
        engine: Arc<FakeEngine>,
        store: Arc<InMemoryStateStore>,
    ) -> PipelineOrchestrator {
        let config = RunnerConfig::default()
            .with_work_root(tmp.path().join("work"))
            .with_debug_archive_dir(tmp.path().join("debug"))
            .with_retry(RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)));
        PipelineOrchestrator::new(config, engine, store, Arc::new(PrefixEncryptor::default()))
            .with_sleeper(Arc::new(RecordingSleeper::default()))
            .with_catalog(Arc::new(
                InMemoryCatalog::new()
                    .with_component(descriptor("keboola.processor-a"))
                    .with_component(descriptor("keboola.processor-b")),
            ))
    }

    fn row_with_processors() -> JobRow {
        JobRow::new(
            descriptor("keboola.ex-db"),
            json!({
                "parameters": {"db": "main"},
                "processors": {
                    "before": [{"definition": {"component": "keboola.processor-a"}}],
                    "after": [{"definition": {"component": "keboola.processor-b"}}]
                }
            }),
        )
        .with_config_id("cfg-1")
    }

    #[test]
    fn test_select_rows_skips_disabled() {
        let rows = vec![
            row_with_processors().with_row_id("1"),
            row_with_processors().with_row_id("2").disabled(),
        ];
        let selected = select_rows(&rows, None).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].row_id.as_deref(), Some("1"));
    }

    #[test]
    fn test_select_rows_targeted_disabled_row_runs() {
        let rows = vec![
            row_with_processors().with_row_id("1"),
            row_with_processors().with_row_id("2").disabled(),
        ];
        let selected = select_rows(&rows, Some("2")).unwrap();
        assert_eq!(selected.len(), 1);
        assert!(selected[0].disabled);
    }

    #[test]
    fn test_select_rows_unknown_row_is_user_error() {
        let rows = vec![row_with_processors().with_row_id("1")];
        let err = select_rows(&rows, Some("9")).unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(err.to_string(), "Row 9 not found.");
    }

    #[test]
    fn test_run_mode_from_str() {
        assert_eq!("debug".parse::<RunMode>(), Ok(RunMode::Debug));
        assert_eq!("Run".parse::<RunMode>(), Ok(RunMode::Run));
        assert!("dry".parse::<RunMode>().is_err());
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let store = Arc::new(InMemoryStateStore::new());
        let orchestrator = orchestrator(&tmp, Arc::clone(&engine), Arc::clone(&store));

        let results = orchestrator
            .run(&JobContext::new("job-1", "123"), &[row_with_processors()], &RunOptions::new())
            .await
            .unwrap();

        let result = &results[0];
        let order: Vec<&str> = result.images.iter().map(|i| i.component_id.as_str()).collect();
        assert_eq!(order, vec!["keboola.processor-a", "keboola.ex-db", "keboola.processor-b"]);

        let runs = engine.runs.lock().unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs[0].args.iter().any(|a| a == "keboola/keboola.processor-a:latest"));
        assert!(runs[1].args.iter().any(|a| a == "keboola/keboola.ex-db:latest"));
        assert!(runs[1].args.iter().any(|a| a == "--user=1000:1000"));
        assert!(!result.state_persisted);
        assert!(store.writes().is_empty());
        assert!(result.cleanup.iter().all(CleanupOutcome::is_success));
        assert!(!tmp.path().join("work").read_dir().unwrap().any(|_| true));
    }

    #[tokio::test]
    async fn test_sync_action_skips_processors_and_state() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let store = Arc::new(InMemoryStateStore::new());
        let orchestrator = orchestrator(&tmp, Arc::clone(&engine), Arc::clone(&store));

        let results = orchestrator
            .run(
                &JobContext::new("job-1", "123"),
                &[row_with_processors()],
                &RunOptions::new().with_action("testConnection"),
            )
            .await
            .unwrap();

        assert_eq!(results[0].images.len(), 1);
        assert_eq!(engine.runs.lock().unwrap().len(), 1);
        assert!(!results[0].state_persisted);
    }

    #[tokio::test]
    async fn test_failed_stage_stops_pipeline_and_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(
            FakeEngine::new()
                .with_run(exit_with(0, "", 1))
                .with_run(exit_with(1, "Invalid credentials", 1)),
        );
        let orchestrator = orchestrator(&tmp, Arc::clone(&engine), Arc::new(InMemoryStateStore::new()));

        let err = orchestrator
            .run(&JobContext::new("job-1", "123"), &[row_with_processors()], &RunOptions::new())
            .await
            .unwrap_err();

        assert!(err.is_user_error());
        assert_eq!(err.to_string(), "Invalid credentials");
        assert_eq!(engine.runs.lock().unwrap().len(), 2);
        assert_eq!(engine.removed.lock().unwrap().len(), 2);
        assert!(!tmp.path().join("work").read_dir().unwrap().any(|_| true));
    }

    #[tokio::test]
    async fn test_unusable_work_root_fails_before_launch() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("work"), b"not a directory").unwrap();
        let engine = Arc::new(FakeEngine::new());
        let orchestrator = orchestrator(&tmp, Arc::clone(&engine), Arc::new(InMemoryStateStore::new()));

        let result = orchestrator
            .run(&JobContext::new("job-1", "123"), &[row_with_processors()], &RunOptions::new())
            .await;

        assert!(result.is_err());
        assert!(engine.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dev_branch_guard() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let orchestrator = orchestrator(&tmp, Arc::clone(&engine), Arc::new(InMemoryStateStore::new()));
        let mut context = JobContext::new("job-1", "123");
        context.branch_id = "456".to_string();
        context.branch_is_default = false;
        let row = JobRow::new(
            descriptor("keboola.wr-db").with_feature("dev-branch-job-blocked"),
            json!({}),
        );

        let err = orchestrator
            .run(&context, &[row], &RunOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_user_error());
        assert!(engine.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_processor_is_user_error() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let orchestrator = orchestrator(&tmp, Arc::clone(&engine), Arc::new(InMemoryStateStore::new()));
        let row = JobRow::new(
            descriptor("keboola.ex-db"),
            json!({"processors": {"before": [{"definition": {"component": "keboola.missing"}}]}}),
        );

        let err = orchestrator
            .run(&JobContext::new("job-1", "123"), &[row], &RunOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("keboola.missing"));
        assert!(engine.pulls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_project_limit_fails_before_launch() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let orchestrator = orchestrator(&tmp, Arc::clone(&engine), Arc::new(InMemoryStateStore::new()));
        let mut context = JobContext::new("job-1", "123");
        context
            .project_limits
            .insert("runner.keboola.ex-db.memoryLimitMBs".to_string(), json!(999_999));

        let err = orchestrator
            .run(&context, &[row_with_processors()], &RunOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
        assert!(engine.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_debug_mode_archives_stages() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let store = Arc::new(InMemoryStateStore::new());
        let orchestrator = orchestrator(&tmp, Arc::clone(&engine), Arc::clone(&store));
        let row = row_with_processors().with_state(json!({"component": {"a": 1}}));

        let results = orchestrator
            .run(
                &JobContext::new("job-1", "123"),
                &[row],
                &RunOptions::new().with_mode(RunMode::Debug),
            )
            .await
            .unwrap();

        let archives = tmp.path().join("debug").join("job-1");
        assert!(archives.join("stage-0-keboola.processor-a.tar.gz").exists());
        assert!(archives.join("stage-1-keboola.ex-db.tar.gz").exists());
        assert!(archives.join("stage-2-keboola.processor-b.tar.gz").exists());
        assert!(!results[0].state_persisted);
        assert!(store.writes().is_empty());
    }
}
