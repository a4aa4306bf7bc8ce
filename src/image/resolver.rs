//! Image resolution: pull, digest lookup and verification.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::component::ComponentDescriptor;
use crate::error::ImageError;
use crate::execution::docker_client::ContainerEngine;
use crate::image::registry::RegistryKind;
use crate::image::retry::{RetryPolicy, Sleeper};
use crate::metrics::MetricsCollector;

const PULL_ATTEMPTS: u32 = 3;

/// Position of a stage in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    Before,
    Main,
    After,
}

impl std::fmt::Display for StageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageRole::Before => write!(f, "before"),
            StageRole::Main => write!(f, "main"),
            StageRole::After => write!(f, "after"),
        }
    }
}

/// What to resolve for one stage.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub descriptor: ComponentDescriptor,
    pub role: StageRole,
    pub priority: usize,
    /// Tag replacing the descriptor's tag.
    pub tag: Option<String>,
    /// Stage parameters rendered into its config file.
    pub parameters: Map<String, Value>,
}

/// A descriptor bound to its stage, with the pulled image's digests.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedImage {
    pub descriptor: ComponentDescriptor,
    pub role: StageRole,
    pub priority: usize,
    pub reference: String,
    pub parameters: Map<String, Value>,
    pub digests: Vec<String>,
    /// `None` when no digest was pinned or none could be read.
    pub digest_verified: Option<bool>,
}

impl ResolvedImage {
    pub fn is_main(&self) -> bool {
        self.role == StageRole::Main
    }

    pub fn component_id(&self) -> &str {
        &self.descriptor.id
    }
}

/// Pulls images and records their digests.
pub struct ImageResolver {
    engine: Arc<dyn ContainerEngine>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    metrics: MetricsCollector,
}

impl ImageResolver {
    pub fn new(engine: Arc<dyn ContainerEngine>, retry: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            engine,
            retry,
            sleeper,
            metrics: MetricsCollector::new(),
        }
    }

    /// Pulls the image and reads its digests.
    ///
    /// An unknown registry fails immediately. Digest lookups are retried
    /// with backoff and degrade to an empty list when every attempt fails.
    pub async fn resolve(&self, request: ImageRequest) -> Result<ResolvedImage, ImageError> {
        let definition = &request.descriptor.image;
        let registry = RegistryKind::from_definition(definition)?;
        if definition.uri.trim().is_empty() {
            return Err(ImageError::InvalidDefinition(format!(
                "component '{}' has an empty image uri",
                request.descriptor.id
            )));
        }
        let tag = request.tag.as_deref().unwrap_or(&definition.tag);
        let reference = registry.reference(&definition.uri, tag);

        info!(
            component = %request.descriptor.id,
            stage = %request.role,
            registry = registry.name(),
            image = %reference,
            "Pulling image"
        );
        let pull_policy = RetryPolicy {
            max_attempts: self.retry.max_attempts.min(PULL_ATTEMPTS),
            ..self.retry.clone()
        };
        pull_policy
            .retry(self.sleeper.as_ref(), |_| {
                self.engine.pull_image(&reference, registry.credentials())
            })
            .await?;

        let digests = self.lookup_digests(&reference).await;
        let digest_verified = verify_digest(definition.digest.as_deref(), &digests);
        if digest_verified == Some(false) {
            warn!(
                component = %request.descriptor.id,
                expected = definition.digest.as_deref().unwrap_or_default(),
                actual = ?digests,
                "Image digest does not match the declared digest"
            );
        }

        Ok(ResolvedImage {
            descriptor: request.descriptor,
            role: request.role,
            priority: request.priority,
            reference,
            parameters: request.parameters,
            digests,
            digest_verified,
        })
    }

    async fn lookup_digests(&self, reference: &str) -> Vec<String> {
        let result = self
            .retry
            .retry(self.sleeper.as_ref(), |_| self.engine.image_digests(reference))
            .await;

        match result {
            Ok(digests) => {
                info!(image = %reference, digests = ?digests, "Image digests");
                digests
            }
            Err(e) => {
                info!(image = %reference, error = %e, "Cannot read image digests, continuing without them");
                self.metrics.record_digest_lookup_failure();
                Vec::new()
            }
        }
    }
}

/// Compares a pinned digest with the repository digests (`repo@sha256:...`).
fn verify_digest(expected: Option<&str>, digests: &[String]) -> Option<bool> {
    let expected = expected.filter(|d| !d.is_empty())?;
    if digests.is_empty() {
        return None;
    }
    Some(digests.iter().any(|d| {
        d == expected || d.rsplit_once('@').map(|(_, hash)| hash == expected).unwrap_or(false)
    }))
}
