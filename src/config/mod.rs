use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::services::rate_limit::Budget;
use crate::services::submission::SubmissionLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    S3,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Unset means an in-memory job store.
    pub database_url: Option<String>,

    /// Redis connection string for the task queue. Unset means an in-memory queue.
    pub redis_url: Option<String>,

    #[serde(default = "default_storage_backend")]
    pub storage_backend: StorageBackend,

    #[serde(default = "default_local_storage_path")]
    pub local_storage_path: PathBuf,

    pub s3_bucket: Option<String>,
    #[serde(default = "default_s3_region")]
    pub s3_region: String,
    /// Custom endpoint for S3-compatible stores (MinIO, R2).
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    #[serde(default)]
    pub s3_path_style: bool,

    #[serde(default = "default_job_expiry_minutes")]
    pub job_expiry_minutes: i64,
    #[serde(default = "default_max_files_per_batch")]
    pub max_files_per_batch: usize,
    #[serde(default = "default_max_mb_per_file")]
    pub max_mb_per_file: u64,
    #[serde(default = "default_max_megapixels")]
    pub max_megapixels: u64,

    #[serde(default = "default_stale_processing_minutes")]
    pub stale_processing_minutes: i64,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,

    #[serde(default = "default_submit_rate_limit")]
    pub submit_rate_limit: usize,
    #[serde(default = "default_download_rate_limit")]
    pub download_rate_limit: usize,
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,
    /// Run workers and the watchdog inside the API process.
    #[serde(default)]
    pub embedded_workers: bool,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Prometheus listener for the standalone worker process (e.g. "0.0.0.0:9100").
    pub worker_metrics_addr: Option<String>,

    /// Base URL of the model-serving endpoint for learned methods.
    pub inference_url: Option<String>,
    pub inference_api_token: Option<String>,
    #[serde(default = "default_processor_timeout_secs")]
    pub processor_timeout_secs: u64,
    #[serde(default = "default_qpdf_path")]
    pub qpdf_path: String,

    /// Enables `/api/admin/*` when set.
    pub admin_api_key: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Local
}

fn default_local_storage_path() -> PathBuf {
    PathBuf::from("./data/blobs")
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_job_expiry_minutes() -> i64 {
    60
}

fn default_max_files_per_batch() -> usize {
    10
}

fn default_max_mb_per_file() -> u64 {
    50
}

fn default_max_megapixels() -> u64 {
    16
}

fn default_stale_processing_minutes() -> i64 {
    30
}

fn default_watchdog_interval_secs() -> u64 {
    300
}

fn default_submit_rate_limit() -> usize {
    10
}

fn default_download_rate_limit() -> usize {
    60
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_worker_poll_interval_ms() -> u64 {
    1000
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("artifact-jobs")
}

fn default_processor_timeout_secs() -> u64 {
    600
}

fn default_qpdf_path() -> String {
    "qpdf".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn submission_limits(&self) -> SubmissionLimits {
        SubmissionLimits {
            max_files_per_batch: self.max_files_per_batch,
            max_mb_per_file: self.max_mb_per_file,
            max_megapixels: self.max_megapixels,
            retention: chrono::Duration::minutes(self.job_expiry_minutes),
        }
    }

    pub fn submit_budget(&self) -> Budget {
        Budget {
            count: self.submit_rate_limit,
            window: Duration::from_secs(self.rate_window_secs),
        }
    }

    pub fn download_budget(&self) -> Budget {
        Budget {
            count: self.download_rate_limit,
            window: Duration::from_secs(self.rate_window_secs),
        }
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_processing_minutes)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn processor_timeout(&self) -> Duration {
        Duration::from_secs(self.processor_timeout_secs)
    }

    /// Largest request body the upload route accepts: a full batch plus form overhead.
    pub fn max_request_bytes(&self) -> usize {
        let per_file = (self.max_mb_per_file as usize).saturating_mul(1024 * 1024);
        per_file
            .saturating_mul(self.max_files_per_batch)
            .saturating_add(1024 * 1024)
    }
}
