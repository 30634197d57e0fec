use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus scrape endpoint for job status and gateway metrics.
pub async fn prometheus_metrics(
    axum::extract::State(handle): axum::extract::State<Arc<PrometheusHandle>>,
) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the job status service and the
/// gateway emit.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "job_status_updates_total",
        "Job snapshots successfully written"
    );
    metrics::describe_counter!(
        "job_status_update_retries_total",
        "Job status updates retried after a transient failure"
    );
    metrics::describe_counter!(
        "job_status_update_failures_total",
        "Job status updates that failed after exhausting retries"
    );
    metrics::describe_counter!(
        "job_status_not_found_total",
        "Updates skipped because the job was missing or expired"
    );
    metrics::describe_counter!(
        "progress_broadcasts_total",
        "Progress snapshots published on the progress channel"
    );
    metrics::describe_counter!(
        "progress_publish_failures_total",
        "Progress snapshots written but not published"
    );
    metrics::describe_gauge!(
        "progress_gateway_connections",
        "Currently open progress WebSocket connections"
    );
}
