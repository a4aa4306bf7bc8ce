//! Recording helpers for runner metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus statics so callers never deal
//! with uninitialized metrics: every method is a no-op until
//! [`init_metrics`](super::init_metrics) ran.

use std::time::Duration;

use super::prometheus::{
    CLEANUP_FAILURES_TOTAL, DIGEST_LOOKUP_FAILURES_TOTAL, STAGES_TOTAL, STAGE_DURATION,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished stage.
    ///
    /// # Arguments
    ///
    /// * `outcome` - `succeeded`, `skipped` or an error kind such as `user`
    /// * `duration` - Container run time, when a container ran
    pub fn record_stage(&self, outcome: &str, duration: Option<Duration>) {
        if let Some(stages) = STAGES_TOTAL.get() {
            stages.with_label_values(&[outcome]).inc();
        }

        if let (Some(histogram), Some(duration)) = (STAGE_DURATION.get(), duration) {
            histogram.observe(duration.as_secs_f64());
        }

        tracing::trace!(outcome = outcome, "Recorded stage metric");
    }

    pub fn record_cleanup_failure(&self, step: &str) {
        if let Some(failures) = CLEANUP_FAILURES_TOTAL.get() {
            failures.with_label_values(&[step]).inc();
        }

        tracing::trace!(step = step, "Recorded cleanup failure metric");
    }

    pub fn record_digest_lookup_failure(&self) {
        if let Some(failures) = DIGEST_LOOKUP_FAILURES_TOTAL.get() {
            failures.inc();
        }
    }
}
