//! Prometheus metrics registration and export.
//!
//! Defines the runner's metrics and provides functions for initializing,
//! registering, and exporting them.

use prometheus::{Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all runner metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Stages executed, labeled by outcome (`succeeded`, `user_error`, ...).
pub static STAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Container run duration in seconds.
pub static STAGE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Failed best-effort cleanup steps, labeled by step.
pub static CLEANUP_FAILURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Digest lookups that exhausted every retry.
pub static DIGEST_LOOKUP_FAILURES_TOTAL: OnceLock<Counter> = OnceLock::new();

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Calling it more than once is harmless; the first registration wins.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let stages_total = CounterVec::new(
        Opts::new("runner_stages_total", "Total number of pipeline stages executed"),
        &["outcome"],
    )?;

    let stage_duration = Histogram::with_opts(
        HistogramOpts::new(
            "runner_stage_duration_seconds",
            "Container run duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]),
    )?;

    let cleanup_failures_total = CounterVec::new(
        Opts::new(
            "runner_cleanup_failures_total",
            "Best-effort cleanup steps that failed",
        ),
        &["step"],
    )?;

    let digest_lookup_failures_total = Counter::new(
        "runner_digest_lookup_failures_total",
        "Image digest lookups that failed after all retries",
    )?;

    registry.register(Box::new(stages_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(cleanup_failures_total.clone()))?;
    registry.register(Box::new(digest_lookup_failures_total.clone()))?;

    let _ = STAGES_TOTAL.set(stages_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = CLEANUP_FAILURES_TOTAL.set(cleanup_failures_total);
    let _ = DIGEST_LOOKUP_FAILURES_TOTAL.set(digest_lookup_failures_total);
    let _ = REGISTRY.set(registry);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// text is a comment describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
