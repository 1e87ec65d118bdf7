use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod admin;
pub mod client;
pub mod error;
pub mod health;
pub mod jobs;
pub mod metrics;

/// Build the full HTTP router. `/metrics` is only mounted when a Prometheus handle is given.
pub fn router(
    state: AppState,
    prometheus: Option<Arc<PrometheusHandle>>,
    body_limit: usize,
) -> Router {
    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/jobs", get(jobs::list))
        .route("/api/jobs/upload", post(jobs::upload))
        .route("/api/jobs/queue-stats", get(jobs::queue_stats))
        .route("/api/jobs/{id}", get(jobs::get_job))
        .route("/api/jobs/{id}/cancel", post(jobs::cancel))
        .route("/api/jobs/{id}/retry", post(jobs::retry))
        .route("/api/jobs/{id}/download", get(jobs::download))
        .route("/api/admin/stats", get(admin::stats))
        .with_state(state.clone());

    if let Some(handle) = prometheus {
        app = app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(metrics::MetricsState {
                handle,
                app: state,
            }),
        );
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
}
