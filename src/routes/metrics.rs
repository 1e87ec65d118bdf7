use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::app_state::AppState;

#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub app: AppState,
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    record_queue_gauges(&state.app).await;
    state.handle.render()
}

/// Point-in-time gauges, refreshed on every scrape.
async fn record_queue_gauges(state: &AppState) {
    match state.queue.depth().await {
        Ok(depth) => metrics::gauge!("queue_depth").set(depth as f64),
        Err(e) => tracing::warn!(error = %e, "Failed to read queue depth"),
    }
    match state.submission.queue_stats().await {
        Ok(stats) => {
            metrics::gauge!("jobs_in_status", "status" => "queued").set(stats.queued as f64);
            metrics::gauge!("jobs_in_status", "status" => "processing")
                .set(stats.processing as f64);
        }
        Err(e) => tracing::warn!(error = %e, "Failed to read queue stats"),
    }
}
