//! Prometheus metrics for the waffle gateway.
//!
//! Exposes request outcomes, sync runs, git job results and ledger size.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Labels carry no dataset slugs or user ids, but aggregate traffic is
//! visible. Restrict the endpoint to the scraper at the network level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Request metrics
pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "waffle_requests_total",
            "Dataset requests by kind and outcome",
        ),
        &["kind", "outcome"],
    )
    .expect("metric creation failed")
});

pub static QUERY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "waffle_query_duration_seconds",
            "Time spent answering resolved queries",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )
    .expect("metric creation failed")
});

// Sync metrics
pub static SYNC_RUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("waffle_sync_runs_total", "Top-level sync runs started")
        .expect("metric creation failed")
});

pub static SYNC_ONGOING: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("waffle_sync_ongoing", "1 while a top-level sync runs")
        .expect("metric creation failed")
});

pub static SYNC_BRANCH_RESULTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "waffle_sync_branch_results_total",
            "Per-branch sync results (unchanged, updated, failed)",
        ),
        &["result"],
    )
    .expect("metric creation failed")
});

pub static GIT_JOBS_FINISHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "waffle_git_jobs_finished_total",
            "Git jobs waited on by sync, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

// Ledger metrics
pub static LEDGER_RECORDS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("waffle_ledger_records", "Distinct events in the ledger")
        .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(REQUESTS_TOTAL.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUERY_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SYNC_RUNS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SYNC_ONGOING.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SYNC_BRANCH_RESULTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GIT_JOBS_FINISHED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(LEDGER_RECORDS.clone()))
            .expect("metric registration failed");
    });
}

/// Count one dataset request outcome.
pub fn record_request(kind: &str, status: u16) {
    let outcome = match status {
        200 => "success",
        302 => "redirect",
        400..=499 => "client_error",
        _ => "server_error",
    };
    REQUESTS_TOTAL.with_label_values(&[kind, outcome]).inc();
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}
