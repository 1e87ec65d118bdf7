use std::net::SocketAddr;
use std::sync::Arc;

use artifact_jobs::app_state::AppState;
use artifact_jobs::config::AppConfig;
use artifact_jobs::routes;
use artifact_jobs::services::worker::spawn_pool;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing artifact-jobs server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    describe_metrics();

    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize application state");

    let shutdown = CancellationToken::new();
    let mut background = Vec::new();
    if config.embedded_workers {
        tracing::info!(
            concurrency = config.worker_concurrency,
            "Starting embedded workers and watchdog"
        );
        background.extend(spawn_pool(
            state.worker(&config),
            config.worker_concurrency,
            shutdown.clone(),
        ));
        let watchdog = state.watchdog(&config);
        let cancel = shutdown.clone();
        background.push(tokio::spawn(async move { watchdog.run(cancel).await }));
    } else if config.database_url.is_none() || config.redis_url.is_none() {
        tracing::warn!(
            "In-memory backends without EMBEDDED_WORKERS: a separate worker process cannot see these jobs"
        );
    }

    let app = routes::router(
        state,
        Some(prometheus_handle),
        config.max_request_bytes(),
    );

    tracing::info!("Starting artifact-jobs on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    })
    .await
    .expect("Server error");

    shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }
    tracing::info!("Server stopped");
}

fn describe_metrics() {
    metrics::describe_counter!("jobs_submitted_total", "Jobs created by upload or retry");
    metrics::describe_counter!("jobs_completed_total", "Jobs that finished with a result");
    metrics::describe_counter!("jobs_failed_total", "Jobs that finished with an error");
    metrics::describe_counter!("jobs_cancelled_total", "Jobs cancelled by a user");
    metrics::describe_counter!(
        "jobs_reclaimed_total",
        "Processing jobs failed by the watchdog after going stale"
    );
    metrics::describe_histogram!(
        "job_processing_seconds",
        "Time from start to completion of a job"
    );
    metrics::describe_gauge!("queue_depth", "Messages waiting in the task queue");
    metrics::describe_gauge!(
        "jobs_in_status",
        "Non-expired jobs currently queued or processing"
    );
}
