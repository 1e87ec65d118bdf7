use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::params::MethodParams;

/// Error message recorded on a job cancelled through the API.
pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

/// Error message recorded when the watchdog reclaims a job abandoned mid-processing.
pub const STALE_MESSAGE: &str = "Processing timed out. The worker may have run out of memory\u{2014}try a smaller image or increase worker memory.";

/// Status of a job. `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// The parts of a job fixed at submission time. Retry copies these onto a new job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDraft {
    pub method: String,
    pub original_filename: String,
    pub scale: i32,
    pub params: MethodParams,
    pub denoise_first: bool,
    pub face_enhance: bool,
}

/// A transformation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub method: String,
    pub original_filename: String,
    pub input_key: String,
    pub scale: i32,
    pub params: MethodParams,
    pub denoise_first: bool,
    pub face_enhance: bool,
    pub result_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status_detail: Option<String>,
    pub error_message: Option<String>,
    pub progress: Option<i32>,
    pub queue_message_id: Option<String>,
}

impl Job {
    /// Build a fresh `queued` job. Expiry is fixed here and never moves.
    pub fn queued(draft: JobDraft, now: DateTime<Utc>, retention: Duration) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            status: JobStatus::Queued,
            method: draft.method,
            original_filename: draft.original_filename,
            input_key: original_key(id),
            scale: draft.scale,
            params: draft.params,
            denoise_first: draft.denoise_first,
            face_enhance: draft.face_enhance,
            result_key: None,
            created_at: now,
            expires_at: now + retention,
            started_at: None,
            finished_at: None,
            status_detail: None,
            error_message: None,
            progress: None,
            queue_message_id: None,
        }
    }

    pub fn draft(&self) -> JobDraft {
        JobDraft {
            method: self.method.clone(),
            original_filename: self.original_filename.clone(),
            scale: self.scale,
            params: self.params.clone(),
            denoise_first: self.denoise_first,
            face_enhance: self.face_enhance,
        }
    }

    /// Number of ordered inputs for multi-input jobs, `None` for single-input jobs.
    pub fn input_count(&self) -> Option<usize> {
        self.params.input_count()
    }

    /// Blob keys holding this job's input artifacts, in order.
    pub fn input_keys(&self) -> Vec<String> {
        match self.input_count() {
            Some(count) => (0..count).map(|n| original_member_key(self.id, n)).collect(),
            None => vec![self.input_key.clone()],
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Apply a lifecycle transition, rejecting any the state machine does not allow.
    pub fn apply(mut self, transition: Transition) -> Result<Job, TransitionError> {
        let from = self.status;
        match (from, transition) {
            (JobStatus::Queued, Transition::Start { at }) => {
                self.status = JobStatus::Processing;
                self.started_at = Some(at);
                self.progress = Some(5);
                self.status_detail = Some("Starting\u{2026}".to_string());
            }
            (JobStatus::Processing, Transition::Progress { percent, detail }) => {
                let current = self.progress.unwrap_or(0);
                self.progress = Some(percent.clamp(current, 100));
                if detail.is_some() {
                    self.status_detail = detail;
                }
            }
            (JobStatus::Processing, Transition::Complete { result_key, at }) => {
                self.status = JobStatus::Completed;
                self.result_key = Some(result_key);
                self.finished_at = Some(at);
                self.progress = Some(100);
                self.status_detail = None;
            }
            (JobStatus::Processing, Transition::Fail { message, at }) => {
                self.fail(message, at);
            }
            (JobStatus::Processing, Transition::Reclaim { at }) => {
                self.fail(STALE_MESSAGE.to_string(), at);
            }
            (JobStatus::Queued | JobStatus::Processing, Transition::Cancel { at }) => {
                self.status = JobStatus::Cancelled;
                self.error_message = Some(CANCELLED_MESSAGE.to_string());
                self.finished_at = Some(at);
                self.progress = None;
                self.status_detail = None;
            }
            (from, transition) => {
                return Err(TransitionError::Illegal {
                    from,
                    transition: transition.name(),
                });
            }
        }
        Ok(self)
    }

    fn fail(&mut self, message: String, at: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(message);
        self.finished_at = Some(at);
        self.progress = None;
        self.status_detail = None;
    }
}

/// A requested change to a job's lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Start { at: DateTime<Utc> },
    Progress { percent: i32, detail: Option<String> },
    Complete { result_key: String, at: DateTime<Utc> },
    Fail { message: String, at: DateTime<Utc> },
    Cancel { at: DateTime<Utc> },
    Reclaim { at: DateTime<Utc> },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Start { .. } => "start",
            Transition::Progress { .. } => "progress",
            Transition::Complete { .. } => "complete",
            Transition::Fail { .. } => "fail",
            Transition::Cancel { .. } => "cancel",
            Transition::Reclaim { .. } => "reclaim",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot {transition} a {from} job")]
    Illegal {
        from: JobStatus,
        transition: &'static str,
    },
}

/// Read-only view of a job handed to processors.
#[derive(Debug, Clone, Copy)]
pub struct JobView<'a> {
    pub id: Uuid,
    pub method: &'a str,
    pub params: &'a MethodParams,
    pub scale: i32,
    pub denoise_first: bool,
    pub face_enhance: bool,
}

impl<'a> From<&'a Job> for JobView<'a> {
    fn from(job: &'a Job) -> Self {
        Self {
            id: job.id,
            method: &job.method,
            params: &job.params,
            scale: job.scale,
            denoise_first: job.denoise_first,
            face_enhance: job.face_enhance,
        }
    }
}

pub fn original_key(job_id: Uuid) -> String {
    format!("originals/{job_id}")
}

pub fn original_member_key(job_id: Uuid, index: usize) -> String {
    format!("originals/{job_id}/{index}")
}

pub fn result_key(job_id: Uuid) -> String {
    format!("results/{job_id}")
}
