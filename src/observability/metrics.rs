//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `service_catalog_reconciliations_total` - Reconciliations by resource kind
//! - `service_catalog_reconciliation_errors_total` - Reconciliation errors by resource kind
//! - `service_catalog_reconciliation_duration_seconds` - Duration of reconciliations
//! - `service_catalog_broker_calls_total` - Broker calls by operation and outcome
//! - `service_catalog_broker_call_duration_seconds` - Duration of broker calls
//! - `service_catalog_broker_polls_total` - Last-operation polls by operation and outcome
//! - `service_catalog_orphan_mitigations_total` - Orphan mitigations started by resource kind
//! - `service_catalog_requeues_total` - Requeues by reason

use anyhow::Result;
use prometheus::{HistogramVec, IntCounterVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_reconciliations_total",
            "Total number of reconciliations by resource kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_reconciliation_errors_total",
            "Total number of reconciliation errors by resource kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "service_catalog_reconciliation_duration_seconds",
            "Duration of reconciliations in seconds by resource kind",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0]),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static BROKER_CALLS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_broker_calls_total",
            "Total number of broker calls by operation and outcome",
        ),
        &["operation", "outcome"],
    )
    .expect("Failed to create BROKER_CALLS_TOTAL metric - this should never happen")
});

static BROKER_CALL_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "service_catalog_broker_call_duration_seconds",
            "Duration of broker calls in seconds by operation",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["operation"],
    )
    .expect("Failed to create BROKER_CALL_DURATION metric - this should never happen")
});

static BROKER_POLLS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_broker_polls_total",
            "Total number of last-operation polls by operation and outcome",
        ),
        &["operation", "outcome"],
    )
    .expect("Failed to create BROKER_POLLS_TOTAL metric - this should never happen")
});

static ORPHAN_MITIGATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_orphan_mitigations_total",
            "Total number of orphan mitigations started by resource kind",
        ),
        &["kind"],
    )
    .expect("Failed to create ORPHAN_MITIGATIONS_TOTAL metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_requeues_total",
            "Total number of requeues by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(BROKER_CALLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROKER_CALL_DURATION.clone()))?;
    REGISTRY.register(Box::new(BROKER_POLLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ORPHAN_MITIGATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_reconciliations(kind: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_reconciliation_errors(kind: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_reconciliation_duration(kind: &str, duration: f64) {
    RECONCILIATION_DURATION
        .with_label_values(&[kind])
        .observe(duration);
}

pub fn increment_broker_calls(operation: &str, outcome: &str) {
    BROKER_CALLS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn observe_broker_call_duration(operation: &str, duration: f64) {
    BROKER_CALL_DURATION
        .with_label_values(&[operation])
        .observe(duration);
}

pub fn increment_broker_polls(operation: &str, outcome: &str) {
    BROKER_POLLS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn increment_orphan_mitigations(kind: &str) {
    ORPHAN_MITIGATIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_requeues(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}
