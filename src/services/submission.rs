use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::db::{JobStore, StoreError};
use crate::models::api::{QueueStats, StatusCounts};
use crate::models::job::{original_member_key, Job, JobDraft, JobStatus, Transition};
use crate::services::methods::{MethodRegistry, RawParams, ResultName, ValidationError};
use crate::services::processors::raster;
use crate::services::queue::{QueueError, TaskQueue, WorkItem};
use crate::services::storage::{BlobLocation, BlobStore, StorageError};

/// The largest page a recent-jobs listing returns.
pub const MAX_LIST_LIMIT: i64 = 100;

/// Admission limits applied to every batch.
#[derive(Debug, Clone)]
pub struct SubmissionLimits {
    pub max_files_per_batch: usize,
    pub max_mb_per_file: u64,
    pub max_megapixels: u64,
    pub retention: Duration,
}

impl Default for SubmissionLimits {
    fn default() -> Self {
        Self {
            max_files_per_batch: 10,
            max_mb_per_file: 50,
            max_megapixels: 16,
            retention: Duration::minutes(60),
        }
    }
}

impl SubmissionLimits {
    fn max_bytes(&self) -> u64 {
        self.max_mb_per_file * 1024 * 1024
    }

    fn max_pixels(&self) -> u64 {
        self.max_megapixels * 1_000_000
    }
}

/// One uploaded artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub filename: String,
    pub data: Bytes,
}

/// Which jobs a listing should return.
#[derive(Debug, Clone, PartialEq)]
pub enum JobFilter {
    Ids(Vec<Uuid>),
    Recent { limit: i64 },
}

/// A completed result ready to hand to a client.
#[derive(Debug, Clone)]
pub struct Download {
    pub location: BlobLocation,
    pub name: ResultName,
}

/// Validates requests, persists jobs and artifacts, and feeds the task queue.
#[derive(Clone)]
pub struct SubmissionService {
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn TaskQueue>,
    registry: MethodRegistry,
    limits: SubmissionLimits,
}

impl SubmissionService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn TaskQueue>,
        registry: MethodRegistry,
        limits: SubmissionLimits,
    ) -> Self {
        Self {
            jobs,
            blobs,
            queue,
            registry,
            limits,
        }
    }

    fn check_capacity(&self, artifacts: &[Artifact]) -> Result<(), CapacityError> {
        if artifacts.is_empty() {
            return Err(CapacityError::Empty);
        }
        if artifacts.len() > self.limits.max_files_per_batch {
            return Err(CapacityError::TooManyFiles {
                limit: self.limits.max_files_per_batch,
            });
        }
        for artifact in artifacts {
            if artifact.data.len() as u64 > self.limits.max_bytes() {
                return Err(CapacityError::TooLarge {
                    filename: artifact.filename.clone(),
                    limit_mb: self.limits.max_mb_per_file,
                });
            }
            // Artifacts whose header does not decode as a raster skip the pixel check.
            if let Some((width, height)) = raster::dimensions_of(&artifact.data) {
                if u64::from(width) * u64::from(height) > self.limits.max_pixels() {
                    return Err(CapacityError::TooManyPixels {
                        filename: artifact.filename.clone(),
                        limit_mp: self.limits.max_megapixels,
                    });
                }
            }
        }
        Ok(())
    }

    /// Validate and enqueue a batch. Returns the created jobs in upload order.
    pub async fn submit(
        &self,
        method: &str,
        artifacts: Vec<Artifact>,
        raw: &RawParams,
    ) -> Result<Vec<Job>, SubmitError> {
        self.check_capacity(&artifacts)?;

        let handler = self.registry.lookup(method)?;
        handler.arity().check(method, artifacts.len())?;
        let validated = handler.validate(raw, artifacts.len())?;

        let now = Utc::now();
        let draft = |filename: &str| JobDraft {
            method: method.to_string(),
            original_filename: filename.to_string(),
            scale: validated.scale,
            params: validated.params.clone(),
            denoise_first: validated.denoise_first,
            face_enhance: validated.face_enhance,
        };

        // (blob key, data) pairs written before any row exists.
        let mut uploads = Vec::with_capacity(artifacts.len());
        let jobs: Vec<Job> = if validated.params.input_count().is_some() {
            let job = Job::queued(draft(&artifacts[0].filename), now, self.limits.retention);
            for (n, artifact) in artifacts.into_iter().enumerate() {
                uploads.push((original_member_key(job.id, n), artifact.data));
            }
            vec![job]
        } else {
            artifacts
                .into_iter()
                .map(|artifact| {
                    let job = Job::queued(draft(&artifact.filename), now, self.limits.retention);
                    uploads.push((job.input_key.clone(), artifact.data));
                    job
                })
                .collect()
        };

        for (n, (key, data)) in uploads.iter().enumerate() {
            if let Err(e) = self.blobs.put(key, data.clone()).await {
                self.discard_blobs(uploads[..n].iter().map(|(k, _)| k.as_str()))
                    .await;
                return Err(e.into());
            }
        }

        if let Err(e) = self.jobs.insert(&jobs).await {
            self.discard_blobs(uploads.iter().map(|(k, _)| k.as_str()))
                .await;
            return Err(e.into());
        }

        let jobs = self.publish(jobs).await?;

        metrics::counter!("jobs_submitted_total", "method" => method.to_string())
            .increment(jobs.len() as u64);
        tracing::info!(
            method,
            count = jobs.len(),
            job_ids = ?jobs.iter().map(|j| j.id).collect::<Vec<_>>(),
            "Jobs submitted"
        );
        Ok(jobs)
    }

    /// Publish one work item per job. On failure every job in the batch is rolled back.
    async fn publish(&self, mut jobs: Vec<Job>) -> Result<Vec<Job>, SubmitError> {
        let mut published = Vec::new();
        for idx in 0..jobs.len() {
            let id = jobs[idx].id;
            let result = match self.queue.publish(&WorkItem { job_id: id }).await {
                Ok(message_id) => {
                    published.push(message_id.clone());
                    self.jobs
                        .set_queue_message_id(id, &message_id)
                        .await
                        .map(|()| message_id)
                        .map_err(SubmitError::from)
                }
                Err(e) => Err(SubmitError::from(e)),
            };

            match result {
                Ok(message_id) => jobs[idx].queue_message_id = Some(message_id),
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Publishing failed, rolling back batch");
                    self.rollback(&jobs, &published).await;
                    return Err(e);
                }
            }
        }
        Ok(jobs)
    }

    /// Best-effort removal of a batch that never made it fully onto the queue.
    /// The expiry sweep catches whatever this misses.
    async fn rollback(&self, jobs: &[Job], published: &[String]) {
        for message_id in published {
            if let Err(e) = self.queue.revoke(message_id).await {
                tracing::warn!(message_id = %message_id, error = %e, "Failed to revoke message during rollback");
            }
        }
        let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        if let Err(e) = self.jobs.delete(&ids).await {
            tracing::warn!(error = %e, "Failed to delete rows during rollback");
        }
        let mut keys = Vec::new();
        for job in jobs {
            keys.extend(job.input_keys());
            if job.input_count().is_some() {
                keys.push(job.input_key.clone());
            }
        }
        self.discard_blobs(keys.iter().map(String::as_str)).await;
    }

    async fn discard_blobs<'a>(&self, keys: impl Iterator<Item = &'a str>) {
        for key in keys {
            if let Err(e) = self.blobs.delete(key).await {
                tracing::warn!(key, error = %e, "Failed to delete blob");
            }
        }
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, SubmitError> {
        self.jobs.get(id).await?.ok_or(SubmitError::NotFound(id))
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, SubmitError> {
        let jobs = match filter {
            JobFilter::Ids(ids) => self.jobs.get_many(&ids).await?,
            JobFilter::Recent { limit } => {
                self.jobs
                    .list_recent(Utc::now(), limit.clamp(1, MAX_LIST_LIMIT))
                    .await?
            }
        };
        Ok(jobs)
    }

    /// Cancel a queued or processing job. A processing job keeps running until the
    /// worker reaches its final gate, where the result is discarded.
    pub async fn cancel_job(&self, id: Uuid) -> Result<Job, SubmitError> {
        let before = self
            .jobs
            .get(id)
            .await?
            .ok_or(SubmitError::NotCancellable(id))?;

        let job = match self
            .jobs
            .transition(id, Transition::Cancel { at: Utc::now() })
            .await
        {
            Ok(job) => job,
            Err(StoreError::NotFound(_) | StoreError::Transition(_)) => {
                return Err(SubmitError::NotCancellable(id))
            }
            Err(e) => return Err(e.into()),
        };

        // A running job's message is already off the pending list; the worker's
        // cancel gates handle it, so only a queued message needs revoking.
        if before.status == JobStatus::Queued {
            if let Some(message_id) = &job.queue_message_id {
                if let Err(e) = self.queue.revoke(message_id).await {
                    tracing::warn!(job_id = %id, error = %e, "Failed to revoke queued message");
                }
            }
        }

        metrics::counter!("jobs_cancelled_total").increment(1);
        tracing::info!(job_id = %id, from = %before.status, "Job cancelled");
        Ok(job)
    }

    /// Re-run a failed or cancelled job as a new job with copied inputs.
    pub async fn retry_job(&self, id: Uuid) -> Result<Job, SubmitError> {
        let original = self.get_job(id).await?;
        if !matches!(original.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(SubmitError::NotRetryable {
                id,
                status: original.status,
            });
        }

        let job = Job::queued(original.draft(), Utc::now(), self.limits.retention);
        let pairs: Vec<(String, String)> = original
            .input_keys()
            .into_iter()
            .zip(job.input_keys())
            .collect();

        for (n, (from, to)) in pairs.iter().enumerate() {
            if let Err(e) = self.blobs.copy(from, to).await {
                self.discard_blobs(pairs[..n].iter().map(|(_, to)| to.as_str()))
                    .await;
                return Err(e.into());
            }
        }

        if let Err(e) = self.jobs.insert(std::slice::from_ref(&job)).await {
            self.discard_blobs(pairs.iter().map(|(_, to)| to.as_str()))
                .await;
            return Err(e.into());
        }

        let mut jobs = self.publish(vec![job]).await?;
        let job = jobs.remove(0);

        metrics::counter!("jobs_submitted_total", "method" => job.method.clone()).increment(1);
        tracing::info!(job_id = %job.id, retried_from = %id, "Job retried");
        Ok(job)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, SubmitError> {
        let counts = self.jobs.status_counts(Some(Utc::now())).await?;
        Ok(QueueStats {
            queued: counts.get(&JobStatus::Queued).copied().unwrap_or(0),
            processing: counts.get(&JobStatus::Processing).copied().unwrap_or(0),
        })
    }

    pub async fn status_counts(&self) -> Result<StatusCounts, SubmitError> {
        let counts = self.jobs.status_counts(None).await?;
        let count = |status: JobStatus| counts.get(&status).copied().unwrap_or(0);
        Ok(StatusCounts {
            queued: count(JobStatus::Queued),
            processing: count(JobStatus::Processing),
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            cancelled: count(JobStatus::Cancelled),
        })
    }

    pub async fn resolve_download(&self, id: Uuid) -> Result<Download, SubmitError> {
        self.resolve_download_at(id, Utc::now()).await
    }

    pub async fn resolve_download_at(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Download, SubmitError> {
        let job = self.get_job(id).await?;
        let result_key = match (&job.status, &job.result_key) {
            (JobStatus::Completed, Some(key)) => key,
            _ => return Err(SubmitError::ResultUnavailable(id)),
        };
        if job.is_expired(now) {
            return Err(SubmitError::Expired(id));
        }

        let handler = self.registry.lookup(&job.method)?;
        let location = match self.blobs.locate(result_key).await {
            Ok(location) => location,
            Err(StorageError::NotFound(_)) => return Err(SubmitError::ResultUnavailable(id)),
            Err(e) => return Err(e.into()),
        };
        Ok(Download {
            location,
            name: handler.result_name(&job),
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapacityError {
    #[error("No valid files")]
    Empty,

    #[error("Too many files. Max {limit} per batch.")]
    TooManyFiles { limit: usize },

    #[error("File {filename} exceeds {limit_mb} MB.")]
    TooLarge { filename: String, limit_mb: u64 },

    #[error("File {filename} exceeds {limit_mp} megapixels.")]
    TooManyPixels { filename: String, limit_mp: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("Job not found")]
    NotFound(Uuid),

    #[error("Job cannot be cancelled (not found or already completed/failed/cancelled)")]
    NotCancellable(Uuid),

    #[error("Only failed or cancelled jobs can be retried (job is {status})")]
    NotRetryable { id: Uuid, status: JobStatus },

    #[error("Result not available")]
    ResultUnavailable(Uuid),

    #[error("Result expired")]
    Expired(Uuid),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Blob storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Task queue error: {0}")]
    Queue(#[from] QueueError),
}
