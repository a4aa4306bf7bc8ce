//! Aggregate result of one job row.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::execution::CleanupOutcome;
use crate::image::{ResolvedImage, StageRole};
use crate::state::StateCheckpoint;

/// Digests recorded for one stage image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageDigests {
    pub component_id: String,
    pub role: StageRole,
    pub reference: String,
    pub digests: Vec<String>,
}

impl From<&ResolvedImage> for ImageDigests {
    fn from(image: &ResolvedImage) -> Self {
        Self {
            component_id: image.descriptor.id.clone(),
            role: image.role,
            reference: image.reference.clone(),
            digests: image.digests.clone(),
        }
    }
}

/// Outcome of a successful job row run.
#[derive(Debug)]
pub struct PipelineResult {
    /// Row label, see [`JobRow::label`](crate::component::JobRow::label).
    pub row: String,
    /// Stage images in execution order.
    pub images: Vec<ImageDigests>,
    /// Captured stdout of the main stage.
    pub output: String,
    pub config_version: Option<String>,
    /// Final checkpoint; already persisted when `state_persisted` is set.
    pub state: StateCheckpoint,
    pub state_persisted: bool,
    /// Best-effort cleanup steps in the order they ran.
    pub cleanup: Vec<CleanupOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineResult {
    pub fn cleanup_failures(&self) -> impl Iterator<Item = &CleanupOutcome> {
        self.cleanup.iter().filter(|c| !c.is_success())
    }

    /// JSON report without the captured output.
    pub fn summary(&self) -> Value {
        json!({
            "row": self.row,
            "images": self.images,
            "config_version": self.config_version,
            "state": self.state.loaded().to_value(),
            "state_persisted": self.state_persisted,
            "cleanup": self.cleanup,
            "started_at": self.started_at.to_rfc3339(),
            "finished_at": self.finished_at.to_rfc3339(),
            "duration_ms": (self.finished_at - self.started_at).num_milliseconds(),
        })
    }
}
