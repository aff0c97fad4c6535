//! Prometheus metrics for kvraft.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, records replication state, and exposes the `/metrics`
//! endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::cluster::message::Role;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "kvraft_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "kvraft_http_request_duration_seconds";

/// Current term (gauge).
pub const CLUSTER_TERM: &str = "kvraft_cluster_term";

/// Highest WAL index written locally (gauge).
pub const CLUSTER_LOG_INDEX: &str = "kvraft_cluster_log_index";

/// Highest committed WAL index (gauge).
pub const CLUSTER_COMMIT_INDEX: &str = "kvraft_cluster_commit_index";

/// 1 for the active role, 0 otherwise (gauge). Labels: role.
pub const CLUSTER_ROLE: &str = "kvraft_cluster_role";

/// Elections (counter). Labels: outcome (started, won).
pub const ELECTIONS_TOTAL: &str = "kvraft_elections_total";

/// Leader-side AppendEntries fan-outs (counter). Labels: outcome.
pub const REPLICATION_TOTAL: &str = "kvraft_replication_total";

/// Catch-up traffic (counter). Labels: side (requested, served).
pub const CATCH_UP_TOTAL: &str = "kvraft_catch_up_total";

/// Entries handed to the storage layer (counter). Labels: result.
pub const ENTRIES_APPLIED_TOTAL: &str = "kvraft_entries_applied_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Returns the existing
/// handle when one is already installed.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_gauge!(CLUSTER_TERM, "Current replication term");
    describe_gauge!(CLUSTER_LOG_INDEX, "Highest locally written WAL index");
    describe_gauge!(CLUSTER_COMMIT_INDEX, "Highest committed WAL index");
    describe_gauge!(CLUSTER_ROLE, "Active replication role");
    describe_counter!(ELECTIONS_TOTAL, "Elections started and won");
    describe_counter!(REPLICATION_TOTAL, "AppendEntries fan-outs by outcome");
    describe_counter!(CATCH_UP_TOTAL, "Catch-up requests sent and served");
    describe_counter!(ENTRIES_APPLIED_TOTAL, "Entries applied to storage");
}

// -- Replication state ----------------------------------------------------------

/// Publish the replication indices.
pub fn record_progress(term: u64, log_index: u64, commit_index: u64) {
    gauge!(CLUSTER_TERM).set(term as f64);
    gauge!(CLUSTER_LOG_INDEX).set(log_index as f64);
    gauge!(CLUSTER_COMMIT_INDEX).set(commit_index as f64);
}

/// Publish the active role as a one-hot gauge.
pub fn record_role(active: Role) {
    for role in [Role::Stopped, Role::Follower, Role::Candidate, Role::Leader] {
        let value = if role == active { 1.0 } else { 0.0 };
        gauge!(CLUSTER_ROLE, "role" => role.to_string()).set(value);
    }
}

pub fn record_election(outcome: &'static str) {
    counter!(ELECTIONS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_replication(outcome: &'static str) {
    counter!(REPLICATION_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_catch_up(side: &'static str) {
    counter!(CATCH_UP_TOTAL, "side" => side).increment(1);
}

pub fn record_apply(result: &'static str) {
    counter!(ENTRIES_APPLIED_TOTAL, "result" => result).increment(1);
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// Only the two parameterized routes need rewriting:
/// - `/api/v1/cluster/commit/42` -> `/api/v1/cluster/commit/{index}`
/// - `/api/v1/data/some-key` -> `/api/v1/data/{key}`
///
/// Any other path outside the API is collapsed to `/{other}` so unknown
/// URLs cannot blow up label cardinality.
fn normalize_path(path: &str) -> String {
    if path.starts_with("/api/v1/cluster/commit/") {
        return "/api/v1/cluster/commit/{index}".to_string();
    }
    if path.starts_with("/api/v1/data/") {
        return "/api/v1/data/{key}".to_string();
    }
    match path {
        "/" | "/health" | "/metrics" | "/openapi.json" => path.to_string(),
        p if p.starts_with("/api/v1/") => p.trim_end_matches('/').to_string(),
        _ => "/{other}".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; version=0.0.4")],
            String::new(),
        ),
    }
}

// -- Tests --------------------------------------------------------------------
