//! Prometheus metrics for pipeline runs.
//!
//! # Example
//!
//! ```ignore
//! use docker_runner::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_stage("succeeded", None);
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    CLEANUP_FAILURES_TOTAL, DIGEST_LOOKUP_FAILURES_TOTAL, REGISTRY, STAGES_TOTAL, STAGE_DURATION,
};
