//! Per-row working directory shared by all stages.
//!
//! Layout under the root:
//!
//! ```text
//! data/
//!   config.json
//!   in/{tables,files,user}   in/state.json (main stage only)
//!   out/{tables,files}       out/state.json (written by the main stage)
//! tmp/
//! ```
//!
//! Stages hand data to each other through [`StageInput`] and [`StageOutput`]
//! tokens. A token is produced once and consumed once, so a stage cannot run
//! against input that was already consumed or skip the output move.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::WorkspaceError;
use crate::execution::container::{CleanupOutcome, CleanupStep};
use crate::execution::docker_client::ContainerEngine;
use crate::execution::run_spec::{LaunchCommand, DATA_DIR};

pub const STATE_FILE: &str = "state.json";
pub const CONFIG_FILE: &str = "config.json";

const DATA_SUBDIRS: [&str; 5] = ["in/tables", "in/files", "in/user", "out/tables", "out/files"];
const MOVED_SUBDIRS: [&str; 2] = ["tables", "files"];

/// Input area ready for the next stage.
#[derive(Debug)]
#[must_use = "a stage input must be handed to a stage"]
pub struct StageInput {
    _private: (),
}

impl StageInput {
    /// Marks the stage that consumed this input as finished.
    pub fn complete(self) -> StageOutput {
        StageOutput { _private: () }
    }
}

/// Output area of a finished stage, waiting to become the next input.
#[derive(Debug)]
#[must_use = "stage output must be moved to input or discarded"]
pub struct StageOutput {
    _private: (),
}

impl StageOutput {
    /// Ends the staging protocol after the last stage.
    pub fn finish(self) {}
}

/// Settings for the container that hands produced files back to the runner.
#[derive(Debug, Clone)]
pub struct PermissionNormalizer {
    pub timeout_binary: String,
    pub docker_binary: String,
    pub image: String,
    pub owner: String,
    pub timeout: Duration,
}

/// Ephemeral directory tree owned by one job row execution.
#[derive(Debug)]
pub struct WorkingDirectory {
    root: PathBuf,
    created: bool,
}

impl WorkingDirectory {
    /// Picks a unique root below `work_root`; nothing is created yet.
    pub fn new(work_root: impl AsRef<Path>, job_id: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", sanitize(job_id), &suffix[..12]);
        Self::at(work_root.as_ref().join(name))
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            created: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir().join(CONFIG_FILE)
    }

    pub fn input_state_path(&self) -> PathBuf {
        self.data_dir().join("in").join(STATE_FILE)
    }

    pub fn output_state_path(&self) -> PathBuf {
        self.data_dir().join("out").join(STATE_FILE)
    }

    /// Creates the fixed subtree and returns the first stage's input.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::AlreadyExists` if any path of the layout is
    /// already present.
    pub async fn create(&mut self) -> Result<StageInput, WorkspaceError> {
        let data = self.data_dir();
        let mut paths = vec![self.root.clone(), data.clone(), self.tmp_dir()];
        paths.extend(DATA_SUBDIRS.iter().map(|sub| data.join(sub)));

        for path in &paths {
            if tokio::fs::try_exists(path).await? {
                return Err(WorkspaceError::AlreadyExists(path.display().to_string()));
            }
        }

        self.created = true;
        for path in &paths {
            tokio::fs::create_dir_all(path).await?;
        }
        debug!(root = %self.root.display(), "Working directory created");

        Ok(StageInput { _private: () })
    }

    fn ensure_created(&self) -> Result<(), WorkspaceError> {
        if self.created {
            Ok(())
        } else {
            Err(WorkspaceError::NotCreated)
        }
    }

    pub async fn write_config(&self, config: &Value) -> Result<(), WorkspaceError> {
        self.ensure_created()?;
        let body = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(self.config_path(), body).await?;
        Ok(())
    }

    /// Writes the component state the main stage starts from.
    pub async fn write_input_state(&self, state: &Value) -> Result<(), WorkspaceError> {
        self.ensure_created()?;
        let body = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(self.input_state_path(), body).await?;
        Ok(())
    }

    /// Removes the input state file so later stages never see it.
    pub async fn clear_input_state(&self) -> Result<(), WorkspaceError> {
        remove_file_if_exists(&self.input_state_path()).await
    }

    /// Moves `out/{tables,files}` to `in/{tables,files}`.
    ///
    /// Does nothing when the output area is empty. A state file left in the
    /// output area is discarded, never carried over.
    pub async fn move_output_to_input(
        &self,
        output: StageOutput,
    ) -> Result<StageInput, WorkspaceError> {
        self.ensure_created()?;
        let StageOutput { _private: () } = output;
        let data = self.data_dir();

        remove_file_if_exists(&self.output_state_path()).await?;

        if self.output_is_empty().await? {
            debug!("Stage produced no output, input left unchanged");
            return Ok(StageInput { _private: () });
        }

        for sub in MOVED_SUBDIRS {
            let from = data.join("out").join(sub);
            let to = data.join("in").join(sub);
            if tokio::fs::try_exists(&to).await? {
                tokio::fs::remove_dir_all(&to).await?;
            }
            tokio::fs::rename(&from, &to)
                .await
                .map_err(|e| WorkspaceError::MoveFailed {
                    from: from.display().to_string(),
                    to: to.display().to_string(),
                    reason: e.to_string(),
                })?;
            tokio::fs::create_dir_all(&from).await?;
        }
        info!("Moved stage output to input");

        Ok(StageInput { _private: () })
    }

    async fn output_is_empty(&self) -> Result<bool, WorkspaceError> {
        let out = self.data_dir().join("out");
        for sub in MOVED_SUBDIRS {
            let dir = out.join(sub);
            if !tokio::fs::try_exists(&dir).await? {
                continue;
            }
            let mut entries = tokio::fs::read_dir(&dir).await?;
            if entries.next_entry().await?.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Hands files written by a root container back to the runner's user.
    ///
    /// Bounded by the normalizer's timeout; failures are reported, not raised.
    pub async fn normalize_permissions(
        &self,
        engine: &Arc<dyn ContainerEngine>,
        normalizer: &PermissionNormalizer,
    ) -> CleanupOutcome {
        let target = self.data_dir().display().to_string();
        let command = LaunchCommand::new(
            normalizer.timeout_binary.clone(),
            vec![
                "--signal=SIGKILL".to_string(),
                normalizer.timeout.as_secs().to_string(),
                normalizer.docker_binary.clone(),
                "run".to_string(),
                "--rm".to_string(),
                format!("--volume={}:{}", target, DATA_DIR),
                "--net=none".to_string(),
                normalizer.image.clone(),
                "sh".to_string(),
                "-c".to_string(),
                format!("chown -R {} {} && chmod -R u+rwX {}", normalizer.owner, DATA_DIR, DATA_DIR),
            ],
        );

        let grace = normalizer.timeout + Duration::from_secs(5);
        match tokio::time::timeout(grace, engine.run(&command, 64 * 1024)).await {
            Ok(Ok(output)) if output.exit_code == 0 => {
                debug!(target = %target, "Permissions normalized");
                CleanupOutcome::succeeded(CleanupStep::PermissionNormalization, target)
            }
            Ok(Ok(output)) => CleanupOutcome::failed(
                CleanupStep::PermissionNormalization,
                target,
                format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
            ),
            Ok(Err(e)) => CleanupOutcome::failed(CleanupStep::PermissionNormalization, target, e),
            Err(_) => CleanupOutcome::failed(
                CleanupStep::PermissionNormalization,
                target,
                format!("timed out after {} seconds", grace.as_secs()),
            ),
        }
    }

    /// Removes the whole tree. Safe to call after a partial `create`.
    pub async fn drop_dir(&mut self) -> CleanupOutcome {
        let target = self.root.display().to_string();
        let result = match tokio::fs::try_exists(&self.root).await {
            Ok(true) => tokio::fs::remove_dir_all(&self.root).await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        self.created = false;

        match result {
            Ok(()) => {
                debug!(root = %target, "Working directory removed");
                CleanupOutcome::succeeded(CleanupStep::WorkingDirectoryRemoval, target)
            }
            Err(e) => {
                warn!(root = %target, error = %e, "Cannot remove working directory");
                CleanupOutcome::failed(CleanupStep::WorkingDirectoryRemoval, target, e)
            }
        }
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<(), WorkspaceError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
