use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::Job;

/// Response after submitting artifacts.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub job_ids: Vec<Uuid>,
}

/// Response after retrying a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct RetryResponse {
    pub job_id: Uuid,
}

/// Public shape of a job as returned by the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub status: String,
    pub method: String,
    pub original_filename: String,
    pub result_key: Option<String>,
    pub result_url: Option<String>,
    pub scale: i32,
    pub denoise_first: bool,
    pub face_enhance: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub status_detail: Option<String>,
    pub progress: Option<i32>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        let result_url = job
            .result_key
            .as_ref()
            .map(|_| format!("/api/jobs/{}/download", job.id));
        Self {
            id: job.id,
            status: job.status.to_string(),
            method: job.method.clone(),
            original_filename: job.original_filename.clone(),
            result_key: job.result_key.clone(),
            result_url,
            scale: job.scale,
            denoise_first: job.denoise_first,
            face_enhance: job.face_enhance,
            created_at: job.created_at,
            expires_at: job.expires_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            error_message: job.error_message.clone(),
            status_detail: job.status_detail.clone(),
            progress: job.progress,
        }
    }
}

/// Query string for `GET /api/jobs`.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    /// Comma-separated job ids.
    pub ids: Option<String>,
    pub limit: Option<i64>,
}

/// Live queue counts (non-expired jobs only).
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueStats {
    pub queued: i64,
    pub processing: i64,
}

/// All-time job counts by status.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusCounts {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}
