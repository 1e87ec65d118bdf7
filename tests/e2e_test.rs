//! End-to-end tests over HTTP against an in-process server
//!
//! Each test starts the full router on an ephemeral port with in-memory job
//! store and queue, a temp-dir blob store and (optionally) embedded workers.
//! The inference endpoint is left unconfigured, so learned methods fail.
//!
//! Run with: cargo test --test e2e_test -- --nocapture

mod fixtures;
mod helpers;

use fixtures::*;
use helpers::*;
use reqwest::StatusCode;

#[tokio::test]
async fn test_e2e_health_check() {
    let app = spawn_app(AppOptions::default()).await;

    let response = app
        .client
        .get(format!("{}/health", app.base_url))
        .send()
        .await
        .expect("Health check failed");

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["job_store"]["status"], "ok");
    assert_eq!(body["checks"]["task_queue"]["status"], "ok");
}

#[tokio::test]
async fn test_e2e_resize_and_download() {
    let app = spawn_app(AppOptions::default()).await;
    println!("Testing: {}", RESIZE_HALF.description);

    let response = upload(&app, &RESIZE_HALF, &[("label.png", png_bytes(8, 6))]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let uploaded: UploadResponse = response.json().await.unwrap();
    assert_eq!(uploaded.job_ids.len(), 1);

    let job = poll_job_status(&app, uploaded.job_ids[0], 10)
        .await
        .expect("job did not finish");
    assert_eq!(job.status, "completed", "error: {:?}", job.error_message);
    assert_eq!(job.progress, Some(100));
    let result_url = job.result_url.expect("completed job has a result url");

    let download = app
        .client
        .get(format!("{}{}", app.base_url, result_url))
        .send()
        .await
        .unwrap();
    assert_eq!(download.status(), StatusCode::OK);
    assert_eq!(download.headers()["content-type"], "image/png");
    let disposition = download.headers()["content-disposition"].to_str().unwrap();
    assert!(disposition.contains(RESIZE_HALF.expected_filename));

    let bytes = download.bytes().await.unwrap();
    let image = image::load_from_memory(&bytes).unwrap();
    assert_eq!((image.width(), image.height()), (4, 3));
}

#[tokio::test]
async fn test_e2e_batch_listing_preserves_requested_order() {
    let app = spawn_app(AppOptions::default()).await;

    let response = upload(
        &app,
        &ROTATE_QUARTER,
        &[("one.png", png_bytes(8, 6)), ("two.png", png_bytes(6, 4))],
    )
    .await;
    let uploaded: UploadResponse = response.json().await.unwrap();
    assert_eq!(uploaded.job_ids.len(), 2);

    for id in &uploaded.job_ids {
        let job = poll_job_status(&app, *id, 10).await.unwrap();
        assert_eq!(job.status, "completed");
    }

    let ids = format!("{},{}", uploaded.job_ids[1], uploaded.job_ids[0]);
    let listed: Vec<JobStatusResponse> = app
        .client
        .get(format!("{}/api/jobs?ids={}", app.base_url, ids))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, uploaded.job_ids[1]);
    assert_eq!(listed[0].original_filename, "two.png");
    assert_eq!(listed[1].id, uploaded.job_ids[0]);
}

#[tokio::test]
async fn test_e2e_unknown_method_is_rejected() {
    let app = spawn_app(AppOptions::default()).await;
    let fixture = MethodFixture {
        method: "sharpen",
        options: None,
        expected_filename: "",
        description: "unregistered method",
    };

    let response = upload(&app, &fixture, &[("label.png", png_bytes(2, 2))]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.code, "VALIDATION_ERROR");
    assert!(body.detail.starts_with("method must be one of:"));
}

#[tokio::test]
async fn test_e2e_oversized_image_is_rejected() {
    let app = spawn_app(AppOptions {
        embedded_workers: false,
        max_megapixels: 1,
        ..AppOptions::default()
    })
    .await;

    let response = upload(&app, &RESIZE_HALF, &[("poster.png", png_bytes(1001, 1000))]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.code, "CAPACITY_EXCEEDED");
    assert_eq!(body.detail, "File poster.png exceeds 1 megapixels.");

    let stats: serde_json::Value = app
        .client
        .get(format!("{}/api/jobs/queue-stats", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["queued"], 0);
}

#[tokio::test]
async fn test_e2e_failed_job_can_be_retried() {
    let app = spawn_app(AppOptions::default()).await;
    println!("Testing: {}", DENOISE_UNWIRED.description);

    let uploaded: UploadResponse = upload(&app, &DENOISE_UNWIRED, &[("label.png", png_bytes(4, 4))])
        .await
        .json()
        .await
        .unwrap();
    let job = poll_job_status(&app, uploaded.job_ids[0], 10).await.unwrap();
    assert_eq!(job.status, "failed");
    assert!(job
        .error_message
        .as_deref()
        .unwrap_or_default()
        .starts_with("Processor unavailable"));
    assert_eq!(job.result_url, None);

    let response = app
        .client
        .post(format!("{}/api/jobs/{}/retry", app.base_url, job.id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let retried: serde_json::Value = response.json().await.unwrap();
    assert_ne!(retried["job_id"], job.id.to_string());

    let download = app
        .client
        .get(format!("{}/api/jobs/{}/download", app.base_url, job.id))
        .send()
        .await
        .unwrap();
    assert_eq!(download.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_e2e_cancel_and_queue_stats() {
    let app = spawn_app(AppOptions {
        embedded_workers: false,
        ..AppOptions::default()
    })
    .await;

    let uploaded: UploadResponse = upload(
        &app,
        &RESIZE_HALF,
        &[("a.png", png_bytes(8, 6)), ("b.png", png_bytes(8, 6))],
    )
    .await
    .json()
    .await
    .unwrap();

    let stats: serde_json::Value = app
        .client
        .get(format!("{}/api/jobs/queue-stats", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["queued"], 2);
    assert_eq!(stats["processing"], 0);

    let cancel_url = format!("{}/api/jobs/{}/cancel", app.base_url, uploaded.job_ids[0]);
    let response = app.client.post(&cancel_url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cancelled: JobStatusResponse = response.json().await.unwrap();
    assert_eq!(cancelled.status, "cancelled");
    assert_eq!(cancelled.error_message.as_deref(), Some("Cancelled by user"));

    let response = app.client.post(&cancel_url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.code, "NOT_CANCELLABLE");

    let response = app
        .client
        .get(format!(
            "{}/api/jobs/{}/download",
            app.base_url, uploaded.job_ids[1]
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.code, "RESULT_UNAVAILABLE");
}

#[tokio::test]
async fn test_e2e_upload_rate_limit() {
    let app = spawn_app(AppOptions {
        embedded_workers: false,
        submit_per_window: 1,
        ..AppOptions::default()
    })
    .await;

    let first = upload(&app, &RESIZE_HALF, &[("a.png", png_bytes(2, 2))]).await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = upload(&app, &RESIZE_HALF, &[("a.png", png_bytes(2, 2))]).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = second.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
}

#[tokio::test]
async fn test_e2e_admin_stats_requires_key() {
    let hidden = spawn_app(AppOptions::default()).await;
    let response = hidden
        .client
        .get(format!("{}/api/admin/stats", hidden.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let app = spawn_app(AppOptions {
        embedded_workers: false,
        admin_api_key: Some("s3cret".to_string()),
        ..AppOptions::default()
    })
    .await;
    upload(&app, &RESIZE_HALF, &[("a.png", png_bytes(2, 2))]).await;

    let url = format!("{}/api/admin/stats", app.base_url);
    let response = app
        .client
        .get(&url)
        .header("X-Admin-Key", "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .client
        .get(&url)
        .header("X-Admin-Key", "s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let counts: serde_json::Value = response.json().await.unwrap();
    assert_eq!(counts["queued"], 1);
    assert_eq!(counts["completed"], 0);

    let response = app
        .client
        .get(format!("{url}?key=s3cret"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
