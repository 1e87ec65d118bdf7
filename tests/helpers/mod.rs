//! Test helper utilities: an in-process server and HTTP client shortcuts
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use artifact_jobs::app_state::AppState;
use artifact_jobs::db::MemoryJobStore;
use artifact_jobs::routes;
use artifact_jobs::services::methods::standard_registry;
use artifact_jobs::services::processors::{
    CommandProcessor, InferenceProcessor, Processors, RasterProcessor,
};
use artifact_jobs::services::queue::MemoryTaskQueue;
use artifact_jobs::services::rate_limit::{Budget, RateLimiter};
use artifact_jobs::services::storage::LocalBlobStore;
use artifact_jobs::services::submission::SubmissionLimits;
use artifact_jobs::services::worker::{spawn_pool, Worker, WorkerSettings};
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::fixtures::MethodFixture;

/// Response from POST /api/jobs/upload
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub job_ids: Vec<Uuid>,
}

/// Response from GET /api/jobs/{id}
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub id: Uuid,
    pub status: String,
    pub method: String,
    pub original_filename: String,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
    pub status_detail: Option<String>,
    pub progress: Option<i32>,
}

/// Error body shared by every route
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
    pub code: String,
}

pub struct AppOptions {
    pub embedded_workers: bool,
    pub admin_api_key: Option<String>,
    pub submit_per_window: usize,
    pub max_megapixels: u64,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            embedded_workers: true,
            admin_api_key: None,
            submit_per_window: 100,
            max_megapixels: 16,
        }
    }
}

/// A running server on an ephemeral port. Dropping it stops the server and workers.
pub struct TestApp {
    pub base_url: String,
    pub client: reqwest::Client,
    pub state: AppState,
    shutdown: CancellationToken,
    _dir: TempDir,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn spawn_app(options: AppOptions) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let processors = Processors {
        raster: Arc::new(RasterProcessor::new(options.max_megapixels)),
        inference: Arc::new(InferenceProcessor::new(None, None, Duration::from_secs(5)).unwrap()),
        pdf: Arc::new(CommandProcessor::new(
            dir.path().join("missing-qpdf"),
            Duration::from_secs(5),
        )),
    };
    let registry = standard_registry(&processors).unwrap();
    let window = Duration::from_secs(60);
    let state = AppState::new(
        Arc::new(MemoryJobStore::new()),
        Arc::new(LocalBlobStore::new(dir.path().join("blobs")).unwrap()),
        Arc::new(MemoryTaskQueue::new()),
        registry,
        SubmissionLimits {
            max_megapixels: options.max_megapixels,
            ..SubmissionLimits::default()
        },
        RateLimiter::new(
            Budget {
                count: options.submit_per_window,
                window,
            },
            Budget { count: 100, window },
        ),
        options.admin_api_key,
    );

    let shutdown = CancellationToken::new();
    if options.embedded_workers {
        let worker = Worker::new(
            state.jobs.clone(),
            state.blobs.clone(),
            state.queue.clone(),
            state.registry.clone(),
            WorkerSettings {
                scratch_dir: dir.path().join("scratch"),
                max_megapixels: options.max_megapixels,
                poll_interval: Duration::from_millis(20),
            },
        );
        spawn_pool(worker, 2, shutdown.clone());
    }

    let app = routes::router(state.clone(), None, 64 * 1024 * 1024);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        state,
        shutdown,
        _dir: dir,
    }
}

/// Upload files for a method fixture
pub async fn upload(
    app: &TestApp,
    fixture: &MethodFixture,
    files: &[(&str, Vec<u8>)],
) -> reqwest::Response {
    let mut form = multipart::Form::new().text("method", fixture.method.to_string());
    if let Some(options) = fixture.options {
        form = form.text("options", options.to_string());
    }
    for (name, bytes) in files {
        form = form.part(
            "files",
            multipart::Part::bytes(bytes.clone())
                .file_name(name.to_string())
                .mime_str("image/png")
                .unwrap(),
        );
    }
    app.client
        .post(format!("{}/api/jobs/upload", app.base_url))
        .multipart(form)
        .send()
        .await
        .expect("upload request failed")
}

/// Poll job status until it reaches a terminal state (with timeout)
pub async fn poll_job_status(
    app: &TestApp,
    job_id: Uuid,
    timeout_secs: u64,
) -> Result<JobStatusResponse, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 20; // Poll every 50ms

    for _ in 0..max_attempts {
        let response = app
            .client
            .get(format!("{}/api/jobs/{}", app.base_url, job_id))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let status_response = response.json::<JobStatusResponse>().await?;

        match status_response.status.as_str() {
            "completed" | "failed" | "cancelled" => return Ok(status_response),
            "queued" | "processing" => sleep(Duration::from_millis(50)).await,
            other => return Err(format!("Unknown job status: {}", other).into()),
        }
    }

    Err(format!("Job did not finish within {} seconds", timeout_secs).into())
}
