use std::net::SocketAddr;

use artifact_jobs::app_state::AppState;
use artifact_jobs::config::AppConfig;
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

    tracing::info!("Starting artifact-jobs worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    if config.database_url.is_none() || config.redis_url.is_none() {
        tracing::warn!(
            "DATABASE_URL or REDIS_URL unset: this worker only sees jobs created in its own process"
        );
    }

    if let Some(addr) = &config.worker_metrics_addr {
        let addr: SocketAddr = addr.parse().expect("WORKER_METRICS_ADDR must be host:port");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        tracing::info!(%addr, "Serving worker metrics");
    }

    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize services");

    let shutdown = CancellationToken::new();

    let mut handles = spawn_pool(
        state.worker(&config),
        config.worker_concurrency,
        shutdown.clone(),
    );
    let watchdog = state.watchdog(&config);
    let cancel = shutdown.clone();
    handles.push(tokio::spawn(async move { watchdog.run(cancel).await }));

    tracing::info!(
        concurrency = config.worker_concurrency,
        "Worker ready, starting job processing loop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received, finishing in-flight jobs");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
    tracing::info!("Worker stopped");
}
