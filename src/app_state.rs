use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, StorageBackend};
use crate::db::{self, JobStore, MemoryJobStore, PgJobStore};
use crate::services::methods::{standard_registry, DuplicateMethod, MethodRegistry};
use crate::services::processors::{
    CommandProcessor, ExecutionError, InferenceProcessor, Processors, RasterProcessor,
};
use crate::services::queue::{MemoryTaskQueue, QueueError, RedisTaskQueue, TaskQueue};
use crate::services::rate_limit::RateLimiter;
use crate::services::storage::{BlobStore, LocalBlobStore, S3BlobStore, StorageError};
use crate::services::submission::{SubmissionLimits, SubmissionService};
use crate::services::watchdog::Watchdog;
use crate::services::worker::{Worker, WorkerSettings};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub registry: MethodRegistry,
    pub submission: SubmissionService,
    pub rate_limiter: Arc<RateLimiter>,
    pub admin_api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn TaskQueue>,
        registry: MethodRegistry,
        limits: SubmissionLimits,
        rate_limiter: RateLimiter,
        admin_api_key: Option<String>,
    ) -> Self {
        let submission = SubmissionService::new(
            jobs.clone(),
            blobs.clone(),
            queue.clone(),
            registry.clone(),
            limits,
        );
        Self {
            jobs,
            blobs,
            queue,
            registry,
            submission,
            rate_limiter: Arc::new(rate_limiter),
            admin_api_key: admin_api_key.filter(|k| !k.is_empty()).map(Arc::from),
        }
    }

    /// Connect every backend named by the configuration.
    pub async fn from_config(config: &AppConfig) -> Result<Self, BootstrapError> {
        let jobs: Arc<dyn JobStore> = match &config.database_url {
            Some(url) => {
                tracing::info!("Connecting to PostgreSQL database");
                let pool = db::init_pool(url).await?;
                tracing::info!("Running database migrations");
                db::run_migrations(&pool).await?;
                Arc::new(PgJobStore::new(pool))
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory job store");
                Arc::new(MemoryJobStore::new())
            }
        };

        let queue: Arc<dyn TaskQueue> = match &config.redis_url {
            Some(url) => {
                tracing::info!("Connecting to Redis task queue");
                Arc::new(RedisTaskQueue::new(url)?)
            }
            None => {
                tracing::warn!("REDIS_URL not set, using in-memory task queue");
                Arc::new(MemoryTaskQueue::new())
            }
        };

        let blobs = blob_store(config)?;
        let registry = standard_registry(&processors(config)?)?;
        tracing::info!(methods = ?registry.names().collect::<Vec<_>>(), "Method registry ready");

        Ok(Self::new(
            jobs,
            blobs,
            queue,
            registry,
            config.submission_limits(),
            RateLimiter::new(config.submit_budget(), config.download_budget()),
            config.admin_api_key.clone(),
        ))
    }

    pub fn worker(&self, config: &AppConfig) -> Worker {
        Worker::new(
            self.jobs.clone(),
            self.blobs.clone(),
            self.queue.clone(),
            self.registry.clone(),
            WorkerSettings {
                scratch_dir: config.scratch_dir.clone(),
                max_megapixels: config.max_megapixels,
                poll_interval: Duration::from_millis(config.worker_poll_interval_ms),
            },
        )
    }

    pub fn watchdog(&self, config: &AppConfig) -> Watchdog {
        Watchdog::new(
            self.jobs.clone(),
            self.blobs.clone(),
            config.stale_after(),
            config.watchdog_interval(),
        )
    }
}

fn blob_store(config: &AppConfig) -> Result<Arc<dyn BlobStore>, BootstrapError> {
    match config.storage_backend {
        StorageBackend::Local => {
            tracing::info!(root = %config.local_storage_path.display(), "Using local blob storage");
            Ok(Arc::new(LocalBlobStore::new(&config.local_storage_path)?))
        }
        StorageBackend::S3 => {
            let bucket = config
                .s3_bucket
                .as_deref()
                .ok_or(BootstrapError::Missing("S3_BUCKET"))?;
            tracing::info!(bucket, "Using S3 blob storage");
            Ok(Arc::new(S3BlobStore::new(
                bucket,
                &config.s3_region,
                config.s3_endpoint.as_deref(),
                config.s3_access_key.as_deref(),
                config.s3_secret_key.as_deref(),
                config.s3_path_style,
            )?))
        }
    }
}

fn processors(config: &AppConfig) -> Result<Processors, BootstrapError> {
    if config.inference_url.is_none() {
        tracing::warn!("INFERENCE_URL not set, learned methods will fail at execution");
    }
    Ok(Processors {
        raster: Arc::new(RasterProcessor::new(config.max_megapixels)),
        inference: Arc::new(InferenceProcessor::new(
            config.inference_url.clone(),
            config.inference_api_token.clone(),
            config.processor_timeout(),
        )?),
        pdf: Arc::new(CommandProcessor::new(
            &config.qpdf_path,
            config.processor_timeout(),
        )),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Task queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Blob storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Processor setup error: {0}")]
    Processor(#[from] ExecutionError),

    #[error(transparent)]
    Registry(#[from] DuplicateMethod),

    #[error("{0} must be set")]
    Missing(&'static str),
}
