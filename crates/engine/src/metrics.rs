//! Prometheus metrics for the upload engine.
//!
//! Metrics are registered with [`REGISTRY`] on first engine construction.
//! Embedders expose them with [`encode_metrics`].

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload lifecycle
pub static UPLOADS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tusk_uploads_created_total", "Total number of uploads created")
        .expect("metric creation failed")
});

pub static UPLOADS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tusk_uploads_completed_total",
        "Total number of uploads finalized in the backend",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tusk_uploads_aborted_total", "Total number of uploads aborted")
        .expect("metric creation failed")
});

// Part assembly
pub static PARTS_COMMITTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tusk_parts_committed_total",
        "Total number of parts uploaded and recorded",
    )
    .expect("metric creation failed")
});

pub static BYTES_COMMITTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tusk_bytes_committed_total",
        "Total bytes durably committed to the backend",
    )
    .expect("metric creation failed")
});

pub static PART_UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "tusk_part_upload_duration_seconds",
            "Time taken to upload a single part",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .expect("metric creation failed")
});

// Current state gauges
pub static BYTES_BUFFERED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "tusk_bytes_buffered",
        "Bytes received but not yet committed as a part",
    )
    .expect("metric creation failed")
});

pub static ACTIVE_UPLOADS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "tusk_active_uploads",
        "Uploads with a session slot in this process",
    )
    .expect("metric creation failed")
});

// Errors
pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("tusk_upload_errors_total", "Total upload errors by error code"),
        &["code"],
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent: calls after the first are no-ops.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(UPLOADS_CREATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_COMPLETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_ABORTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PARTS_COMMITTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_COMMITTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PART_UPLOAD_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_BUFFERED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ACTIVE_UPLOADS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_ERRORS.clone()))
            .expect("metric registration failed");
    });
}

/// Render all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Helper to record engine errors by code.
pub fn record_upload_error(code: &str) {
    UPLOAD_ERRORS.with_label_values(&[code]).inc();
}
