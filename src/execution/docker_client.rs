//! Docker engine access.
//!
//! Image and container bookkeeping (pull, inspect, remove) goes through the
//! Docker API using the bollard crate. Containers themselves are launched
//! through the `docker` CLI wrapped in `timeout`, so the hard timeout holds
//! even when the daemon connection stalls.

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{InspectContainerOptions, RemoveContainerOptions};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, warn};

use crate::error::DockerError;
use crate::execution::output::OutputBuffer;
use crate::execution::run_spec::LaunchCommand;

/// Registry login used for a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub server: Option<String>,
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Post-mortem information about a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInspection {
    pub id: String,
    pub oom_killed: bool,
}

/// Operations the runner needs from a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pulls an image, optionally with registry credentials.
    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<(), DockerError>;

    /// Repository digests of a locally present image.
    async fn image_digests(&self, reference: &str) -> Result<Vec<String>, DockerError>;

    /// Runs a process to completion, capturing at most `max_output_bytes`
    /// of each stream.
    async fn run(
        &self,
        command: &LaunchCommand,
        max_output_bytes: usize,
    ) -> Result<ProcessOutput, DockerError>;

    async fn inspect_container(&self, name: &str) -> Result<ContainerInspection, DockerError>;

    /// Force-removes a container together with its anonymous volumes.
    async fn remove_container(&self, name: &str) -> Result<(), DockerError>;
}

/// [`ContainerEngine`] backed by the local Docker daemon.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DockerError::DaemonUnavailable` if the Docker daemon is not accessible.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerEngine for DockerClient {
    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<(), DockerError> {
        let options = CreateImageOptions {
            from_image: reference,
            ..Default::default()
        };
        let credentials = credentials.map(|c| DockerCredentials {
            username: Some(c.username.clone()),
            password: Some(c.password.clone()),
            serveraddress: c.server.clone(),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(result) = stream.next().await {
            let progress = result.map_err(|e| DockerError::PullFailed {
                image: reference.to_string(),
                reason: e.to_string(),
            })?;
            if let Some(status) = progress.status {
                debug!(image = %reference, status = %status, "Pull progress");
            }
        }

        Ok(())
    }

    async fn image_digests(&self, reference: &str) -> Result<Vec<String>, DockerError> {
        let image = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(|e| DockerError::InspectFailed {
                image: reference.to_string(),
                reason: e.to_string(),
            })?;

        Ok(image.repo_digests.unwrap_or_default())
    }

    async fn run(
        &self,
        command: &LaunchCommand,
        max_output_bytes: usize,
    ) -> Result<ProcessOutput, DockerError> {
        debug!(command = %command.redacted(), "Launching process");
        let started = Instant::now();

        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DockerError::RunFailed(format!("Failed to spawn {}: {e}", command.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DockerError::RunFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DockerError::RunFailed("stderr not captured".to_string()))?;

        let (stdout, stderr, status) = tokio::join!(
            collect_stream(stdout, max_output_bytes, StreamKind::Stdout),
            collect_stream(stderr, max_output_bytes, StreamKind::Stderr),
            child.wait()
        );
        let status = status?;

        Ok(ProcessOutput {
            exit_code: exit_code(&status),
            stdout: stdout?,
            stderr: stderr?,
            duration: started.elapsed(),
        })
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInspection, DockerError> {
        let info = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    DockerError::ContainerNotFound { id: name.to_string() }
                } else {
                    DockerError::RunFailed(format!("Failed to inspect container: {e}"))
                }
            })?;

        Ok(ContainerInspection {
            id: info.id.unwrap_or_default(),
            oom_killed: info.state.and_then(|s| s.oom_killed).unwrap_or(false),
        })
    }

    async fn remove_container(&self, name: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    DockerError::ContainerNotFound { id: name.to_string() }
                } else {
                    DockerError::RemoveFailed {
                        id: name.to_string(),
                        reason: e.to_string(),
                    }
                }
            })
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Forwards each line to the log and keeps a bounded copy.
async fn collect_stream<R>(
    reader: R,
    limit: usize,
    kind: StreamKind,
) -> Result<String, DockerError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buffer = OutputBuffer::new(limit);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);
        match kind {
            StreamKind::Stdout => info!(target: "container", "{}", text),
            StreamKind::Stderr => warn!(target: "container", "{}", text),
        }
        buffer.push_line(text);
    }

    Ok(buffer.into_string())
}

/// Exit code with signal terminations mapped to `128 + signal`.
fn exit_code(status: &ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}
