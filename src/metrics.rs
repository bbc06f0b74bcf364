use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::storage::LedgerSnapshot;

/// Metric name prefix for all harvester metrics
const PREFIX: &str = "harvester";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref CANDIDATE_OUTCOMES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_candidate_outcomes_total"), "Candidates settled, by source and outcome"),
        &["source", "outcome"]
    ).expect("Failed to create candidate_outcomes_total metric");

    pub static ref FETCH_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_fetch_failures_total"), "Failed fetch attempts, by source and kind"),
        &["source", "kind"]
    ).expect("Failed to create fetch_failures_total metric");

    pub static ref FETCH_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_fetch_duration_seconds"),
            "Fetch duration in seconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["source"]
    ).expect("Failed to create fetch_duration_seconds metric");

    pub static ref MANIFEST_OUTCOMES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_manifest_outcomes_total"), "Manifests processed, by source and outcome"),
        &["source", "outcome"]
    ).expect("Failed to create manifest_outcomes_total metric");

    pub static ref LEDGER_COMMITTED_BYTES: IntGauge = IntGauge::new(
        format!("{PREFIX}_ledger_committed_bytes"),
        "Bytes committed against the storage cap"
    ).expect("Failed to create ledger_committed_bytes metric");

    pub static ref LEDGER_RESERVED_BYTES: IntGauge = IntGauge::new(
        format!("{PREFIX}_ledger_reserved_bytes"),
        "Bytes reserved by in-flight fetches"
    ).expect("Failed to create ledger_reserved_bytes metric");

    pub static ref LEDGER_CAP_BYTES: IntGauge = IntGauge::new(
        format!("{PREFIX}_ledger_cap_bytes"),
        "Configured storage cap"
    ).expect("Failed to create ledger_cap_bytes metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(CANDIDATE_OUTCOMES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FETCH_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FETCH_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(MANIFEST_OUTCOMES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(LEDGER_COMMITTED_BYTES.clone()));
    let _ = REGISTRY.register(Box::new(LEDGER_RESERVED_BYTES.clone()));
    let _ = REGISTRY.register(Box::new(LEDGER_CAP_BYTES.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_candidate_outcome(source: &str, outcome: &str) {
    CANDIDATE_OUTCOMES_TOTAL
        .with_label_values(&[source, outcome])
        .inc();
}

pub fn record_fetch(source: &str, duration: Duration) {
    FETCH_DURATION_SECONDS
        .with_label_values(&[source])
        .observe(duration.as_secs_f64());
}

pub fn record_fetch_failure(source: &str, kind: &str) {
    FETCH_FAILURES_TOTAL.with_label_values(&[source, kind]).inc();
}

pub fn record_manifest_outcome(source: &str, outcome: &str) {
    MANIFEST_OUTCOMES_TOTAL
        .with_label_values(&[source, outcome])
        .inc();
}

pub fn update_ledger(snapshot: &LedgerSnapshot) {
    LEDGER_COMMITTED_BYTES.set(snapshot.committed_bytes as i64);
    LEDGER_RESERVED_BYTES.set(snapshot.reserved_bytes as i64);
    LEDGER_CAP_BYTES.set(snapshot.cap_bytes as i64);
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Serve `/metrics` on localhost until `shutdown` is cancelled.
pub async fn serve_metrics(port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    tracing::info!("Metrics available at port {}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics();
        record_candidate_outcome("museum", "downloaded");

        let metric_families = REGISTRY.gather();
        assert!(!metric_families.is_empty(), "Metrics should be registered");
    }

    #[test]
    fn test_record_candidate_outcome() {
        init_metrics();
        record_candidate_outcome("archive", "duplicate_exact");
        record_candidate_outcome("archive", "duplicate_exact");

        assert_eq!(
            CANDIDATE_OUTCOMES_TOTAL
                .with_label_values(&["archive", "duplicate_exact"])
                .get(),
            2
        );
    }

    #[test]
    fn test_update_ledger() {
        init_metrics();
        update_ledger(&LedgerSnapshot {
            cap_bytes: 1000,
            committed_bytes: 800,
            reserved_bytes: 100,
            outstanding_reservations: 1,
        });

        let metrics = REGISTRY.gather();
        assert!(metrics
            .iter()
            .any(|m| m.get_name() == "harvester_ledger_committed_bytes"));
    }

    #[tokio::test]
    async fn test_metrics_handler_renders_text() {
        init_metrics();
        record_fetch("museum", Duration::from_millis(250));
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
