//! # Metrics
//!
//! Prometheus metrics for monitoring the terminator.
//!
//! ## Metrics Exposed
//!
//! - `sidecar_terminator_pod_events_total` - Pod notifications received, by event type
//! - `sidecar_terminator_pods_completed_total` - Owned pods found complete with running sidecars
//! - `sidecar_terminator_dispatch_dropped_total` - Termination jobs dropped because a worker queue was full
//! - `sidecar_terminator_terminations_total` - Sidecar termination attempts by strategy and outcome
//! - `sidecar_terminator_termination_duration_seconds` - Duration of one sidecar termination
//! - `sidecar_terminator_watch_errors_total` - Errors returned by pod watches
//! - `sidecar_terminator_is_leader` - 1 while this replica holds the leadership lock

use anyhow::Result;
use prometheus::{HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static POD_EVENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "sidecar_terminator_pod_events_total",
            "Total number of pod notifications by event type",
        ),
        &["event"],
    )
    .expect("Failed to create POD_EVENTS_TOTAL metric - this should never happen")
});

static PODS_COMPLETED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "sidecar_terminator_pods_completed_total",
        "Total number of completed workload pods with running sidecars",
    )
    .expect("Failed to create PODS_COMPLETED_TOTAL metric - this should never happen")
});

static DISPATCH_DROPPED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "sidecar_terminator_dispatch_dropped_total",
        "Total number of termination jobs dropped because the worker queue was full",
    )
    .expect("Failed to create DISPATCH_DROPPED_TOTAL metric - this should never happen")
});

static TERMINATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "sidecar_terminator_terminations_total",
            "Total number of sidecar termination attempts by strategy and outcome",
        ),
        &["strategy", "outcome"],
    )
    .expect("Failed to create TERMINATIONS_TOTAL metric - this should never happen")
});

static TERMINATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "sidecar_terminator_termination_duration_seconds",
            "Duration of a single sidecar termination in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["strategy"],
    )
    .expect("Failed to create TERMINATION_DURATION metric - this should never happen")
});

static WATCH_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "sidecar_terminator_watch_errors_total",
        "Total number of errors returned by pod watches",
    )
    .expect("Failed to create WATCH_ERRORS_TOTAL metric - this should never happen")
});

static IS_LEADER: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "sidecar_terminator_is_leader",
        "Whether this replica currently holds the leadership lock",
    )
    .expect("Failed to create IS_LEADER metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(POD_EVENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PODS_COMPLETED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISPATCH_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TERMINATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TERMINATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(WATCH_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(IS_LEADER.clone()))?;

    Ok(())
}

pub fn increment_pod_event(event: &str) {
    POD_EVENTS_TOTAL.with_label_values(&[event]).inc();
}

pub fn increment_pods_completed() {
    PODS_COMPLETED_TOTAL.inc();
}

pub fn increment_dispatch_dropped() {
    DISPATCH_DROPPED_TOTAL.inc();
}

/// Record one sidecar termination and how long it took
pub fn observe_termination(strategy: &str, outcome: &str, duration: f64) {
    TERMINATIONS_TOTAL
        .with_label_values(&[strategy, outcome])
        .inc();
    TERMINATION_DURATION
        .with_label_values(&[strategy])
        .observe(duration);
}

pub fn increment_watch_errors() {
    WATCH_ERRORS_TOTAL.inc();
}

pub fn set_leader(leading: bool) {
    IS_LEADER.set(i64::from(leading));
}
