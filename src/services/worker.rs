use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::{JobStore, StoreError};
use crate::models::job::{self, Job, JobStatus, JobView, Transition, TransitionError};
use crate::services::methods::{MethodHandler, MethodRegistry, ValidationError};
use crate::services::processors::{raster, ExecutionError};
use crate::services::queue::{QueueError, TaskQueue, WorkItem};
use crate::services::storage::{BlobStore, StorageError};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub scratch_dir: PathBuf,
    pub max_megapixels: u64,
    pub poll_interval: Duration,
}

/// What happened to one dequeued work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Job missing or no longer queued; nothing was done.
    Skipped,
    Completed,
    Failed,
    /// The job was cancelled while running; its result was thrown away.
    Discarded,
}

/// Executes queued jobs. Cheap to clone; every clone shares the same handles.
#[derive(Clone)]
pub struct Worker {
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn TaskQueue>,
    registry: MethodRegistry,
    settings: Arc<WorkerSettings>,
}

impl Worker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn TaskQueue>,
        registry: MethodRegistry,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            jobs,
            blobs,
            queue,
            registry,
            settings: Arc::new(settings),
        }
    }

    /// Poll the queue until `cancel` fires. A job already running is finished first.
    pub async fn run(&self, worker_id: usize, cancel: CancellationToken) {
        tracing::info!(worker_id, "Worker started");
        while !cancel.is_cancelled() {
            match self.poll_once().await {
                Ok(Some(outcome)) => {
                    tracing::debug!(worker_id, ?outcome, "Work item handled");
                    continue;
                }
                Ok(None) => {
                    tracing::trace!(worker_id, "No jobs available, sleeping");
                }
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Worker loop error, will retry");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        tracing::info!(worker_id, "Worker stopped");
    }

    /// Take one work item, process it and ack it. `None` when the queue is empty.
    pub async fn poll_once(&self) -> Result<Option<Outcome>, WorkerError> {
        let Some(delivery) = self.queue.dequeue().await? else {
            return Ok(None);
        };

        let outcome = self.process(&delivery.item).await;

        if let Err(e) = self.queue.ack(&delivery).await {
            tracing::warn!(job_id = %delivery.item.job_id, error = %e, "Failed to ack delivery");
        }
        outcome.map(Some)
    }

    /// Run one job end to end. Per-job failures are recorded on the job, not returned.
    pub async fn process(&self, item: &WorkItem) -> Result<Outcome, WorkerError> {
        let id = item.job_id;
        match self.jobs.get(id).await? {
            Some(job) if job.status == JobStatus::Queued => {}
            Some(job) => {
                tracing::info!(job_id = %id, status = %job.status, "Skipping job that is not queued");
                return Ok(Outcome::Skipped);
            }
            None => {
                tracing::info!(job_id = %id, "Skipping missing job");
                return Ok(Outcome::Skipped);
            }
        }

        let job = match self
            .jobs
            .transition(id, Transition::Start { at: Utc::now() })
            .await
        {
            Ok(job) => job,
            Err(StoreError::Transition(e)) => {
                tracing::info!(job_id = %id, error = %e, "Job left queued before start");
                return Ok(Outcome::Skipped);
            }
            Err(StoreError::NotFound(_)) => return Ok(Outcome::Skipped),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(job_id = %id, method = %job.method, "Processing job");
        let started = Instant::now();

        let outcome = match self.run_job(&job).await {
            Ok(outcome) => outcome,
            Err(e) => self.record_failure(id, e).await?,
        };

        match outcome {
            Outcome::Completed => {
                metrics::counter!("jobs_completed_total", "method" => job.method.clone())
                    .increment(1);
                metrics::histogram!("job_processing_seconds", "method" => job.method.clone())
                    .record(started.elapsed().as_secs_f64());
                tracing::info!(
                    job_id = %id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
            }
            Outcome::Failed => {
                metrics::counter!("jobs_failed_total", "method" => job.method.clone())
                    .increment(1);
            }
            Outcome::Discarded => {
                tracing::info!(job_id = %id, "Job cancelled while processing, result discarded");
            }
            Outcome::Skipped => {}
        }
        Ok(outcome)
    }

    async fn record_failure(&self, id: uuid::Uuid, error: WorkerError) -> Result<Outcome, WorkerError> {
        if self.is_cancelled(id).await? {
            return Ok(Outcome::Discarded);
        }
        let message = error.to_string();
        tracing::error!(job_id = %id, error = %message, "Job failed");
        match self
            .jobs
            .transition(
                id,
                Transition::Fail {
                    message,
                    at: Utc::now(),
                },
            )
            .await
        {
            Ok(_) => Ok(Outcome::Failed),
            Err(StoreError::Transition(e)) => {
                tracing::warn!(job_id = %id, error = %e, "Could not record failure");
                Ok(Outcome::Failed)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn is_cancelled(&self, id: uuid::Uuid) -> Result<bool, StoreError> {
        Ok(self
            .jobs
            .get(id)
            .await?
            .is_some_and(|job| job.status == JobStatus::Cancelled))
    }

    async fn progress(&self, id: uuid::Uuid, percent: i32, detail: Option<String>) -> Result<(), WorkerError> {
        self.jobs
            .transition(id, Transition::Progress { percent, detail })
            .await?;
        Ok(())
    }

    async fn run_job(&self, job: &Job) -> Result<Outcome, WorkerError> {
        let handler = self.registry.lookup(&job.method)?;

        tokio::fs::create_dir_all(&self.settings.scratch_dir).await?;
        // Removed on drop, on every exit path.
        let scratch = tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&self.settings.scratch_dir)?;

        let input = self.fetch_inputs(job, scratch.path()).await?;

        if job.input_count().is_none() && handler.checks_raster() {
            self.preflight(&input)?;
        }

        self.progress(job.id, 25, Some(handler.progress_detail(job)))
            .await?;
        self.progress(job.id, 50, None).await?;

        let output = scratch.path().join(handler.output_file(job));
        self.execute(handler.as_ref(), job, &input, &output).await?;
        self.progress(job.id, 75, None).await?;

        if self.is_cancelled(job.id).await? {
            return Ok(Outcome::Discarded);
        }

        self.progress(job.id, 90, Some("Uploading result\u{2026}".to_string()))
            .await?;
        let result_key = job::result_key(job.id);
        self.blobs.put_file(&result_key, &output).await?;

        match self
            .jobs
            .transition(
                job.id,
                Transition::Complete {
                    result_key: result_key.clone(),
                    at: Utc::now(),
                },
            )
            .await
        {
            Ok(_) => Ok(Outcome::Completed),
            Err(StoreError::Transition(TransitionError::Illegal {
                from: JobStatus::Cancelled,
                ..
            })) => {
                if let Err(e) = self.blobs.delete(&result_key).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to delete discarded result");
                }
                Ok(Outcome::Discarded)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_inputs(&self, job: &Job, scratch: &Path) -> Result<PathBuf, WorkerError> {
        let input = scratch.join("input");
        match job.input_count() {
            Some(_) => {
                self.progress(job.id, 15, Some("Downloading images\u{2026}".to_string()))
                    .await?;
                tokio::fs::create_dir_all(&input).await?;
                for (n, key) in job.input_keys().iter().enumerate() {
                    self.blobs.get_to_file(key, &input.join(n.to_string())).await?;
                }
            }
            None => {
                self.progress(job.id, 15, Some("Downloading image\u{2026}".to_string()))
                    .await?;
                tracing::debug!(job_id = %job.id, key = %job.input_key, "Downloading input");
                self.blobs.get_to_file(&job.input_key, &input).await?;
            }
        }
        Ok(input)
    }

    /// Reject inputs over the pixel ceiling. Undecodable headers pass.
    fn preflight(&self, input: &Path) -> Result<(), WorkerError> {
        if let Some((width, height)) = raster::dimensions(input) {
            let pixels = u64::from(width) * u64::from(height);
            if pixels > self.settings.max_megapixels * 1_000_000 {
                return Err(WorkerError::PixelCeiling {
                    limit: self.settings.max_megapixels,
                });
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        handler: &dyn MethodHandler,
        job: &Job,
        input: &Path,
        output: &Path,
    ) -> Result<(), WorkerError> {
        handler.execute(&JobView::from(job), input, output).await?;
        if !tokio::fs::try_exists(output).await? {
            return Err(WorkerError::Execution(ExecutionError::Failed(format!(
                "{} produced no output",
                job.method
            ))));
        }
        Ok(())
    }
}

/// Start `concurrency` worker loops sharing one cancellation token.
pub fn spawn_pool(
    worker: Worker,
    concurrency: usize,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..concurrency.max(1))
        .map(|worker_id| {
            let worker = worker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(worker_id, cancel).await })
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Image exceeds {limit} megapixels")]
    PixelCeiling { limit: u64 },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Scratch I/O error: {0}")]
    Io(#[from] std::io::Error),
}
