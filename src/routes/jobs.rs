use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{JobResponse, ListJobsQuery, QueueStats, RetryResponse, UploadResponse};
use crate::routes::client::ClientKey;
use crate::routes::error::{ApiError, ApiResult};
use crate::services::methods::{RawParams, ValidationError};
use crate::services::rate_limit::OperationClass;
use crate::services::storage::BlobLocation;
use crate::services::submission::{Artifact, JobFilter, SubmitError};

const DEFAULT_METHOD: &str = "real_esrgan";
const DEFAULT_LIST_LIMIT: i64 = 50;

/// Form fields of an upload request.
#[derive(Debug, Default)]
struct UploadForm {
    method: Option<String>,
    artifacts: Vec<Artifact>,
    scale: Option<String>,
    denoise_first: Option<String>,
    face_enhance: Option<String>,
    target_format: Option<String>,
    quality: Option<String>,
    options: Option<String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Malformed upload: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "files" {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Malformed upload: {e}")))?;
                // Parts without a filename are not files.
                if !filename.is_empty() {
                    form.artifacts.push(Artifact { filename, data });
                }
                continue;
            }

            let value = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(format!("Malformed upload: {e}")))?;
            let slot = match name.as_str() {
                "method" => &mut form.method,
                "scale" => &mut form.scale,
                "denoise_first" => &mut form.denoise_first,
                "face_enhance" => &mut form.face_enhance,
                "target_format" => &mut form.target_format,
                "quality" => &mut form.quality,
                "options" => &mut form.options,
                other => {
                    tracing::debug!(field = other, "Ignoring unknown upload field");
                    continue;
                }
            };
            *slot = Some(value);
        }
        Ok(form)
    }

    fn raw_params(&self) -> Result<RawParams, ApiError> {
        let scale = match self.scale.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(
                s.parse::<i64>()
                    .map_err(|_| ValidationError::new("scale must be an integer"))?,
            ),
        };
        let flag = |v: &Option<String>| {
            v.as_deref()
                .is_some_and(|s| s.trim().eq_ignore_ascii_case("true"))
        };
        Ok(RawParams {
            scale,
            denoise_first: flag(&self.denoise_first),
            face_enhance: flag(&self.face_enhance),
            target_format: self.target_format.clone().filter(|s| !s.trim().is_empty()),
            quality: self.quality.clone().filter(|s| !s.trim().is_empty()),
            options: RawParams::parse_options(self.options.as_deref())?,
        })
    }
}

/// POST /api/jobs/upload — submit one or more artifacts for a method.
pub async fn upload(
    State(state): State<AppState>,
    client: ClientKey,
    multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    state.rate_limiter.check(OperationClass::Submit, &client.0)?;

    let form = UploadForm::read(multipart).await?;
    let raw = form.raw_params()?;
    let method = form
        .method
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_METHOD);

    let jobs = state.submission.submit(method, form.artifacts, &raw).await?;
    Ok(Json(UploadResponse {
        job_ids: jobs.iter().map(|j| j.id).collect(),
    }))
}

/// GET /api/jobs — by `ids` (comma separated) or the most recent `limit`.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<JobResponse>>> {
    let filter = match query.ids.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(ids) => JobFilter::Ids(parse_ids(ids)?),
        None => JobFilter::Recent {
            limit: query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        },
    };
    let jobs = state.submission.list_jobs(filter).await?;
    tracing::debug!(count = jobs.len(), "Listed jobs");
    Ok(Json(jobs.iter().map(JobResponse::from).collect()))
}

fn parse_ids(raw: &str) -> Result<Vec<Uuid>, ApiError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Uuid::parse_str(s).map_err(|_| ApiError::BadRequest(format!("Invalid job id: {s}")))
        })
        .collect()
}

/// GET /api/jobs/queue-stats
pub async fn queue_stats(State(state): State<AppState>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(state.submission.queue_stats().await?))
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobResponse>> {
    let job = state.submission.get_job(id).await?;
    Ok(Json(JobResponse::from(&job)))
}

/// POST /api/jobs/{id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobResponse>> {
    let job = state.submission.cancel_job(id).await?;
    Ok(Json(JobResponse::from(&job)))
}

/// POST /api/jobs/{id}/retry
pub async fn retry(
    State(state): State<AppState>,
    client: ClientKey,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RetryResponse>> {
    state.rate_limiter.check(OperationClass::Submit, &client.0)?;
    let job = state.submission.retry_job(id).await?;
    Ok(Json(RetryResponse { job_id: job.id }))
}

/// GET /api/jobs/{id}/download — stream a local result or redirect to a presigned URL.
pub async fn download(
    State(state): State<AppState>,
    client: ClientKey,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    state
        .rate_limiter
        .check(OperationClass::Download, &client.0)?;

    let download = state.submission.resolve_download(id).await?;
    match download.location {
        BlobLocation::Url(url) => Ok(Redirect::temporary(&url).into_response()),
        BlobLocation::LocalPath(path) => {
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(SubmitError::ResultUnavailable(id).into())
                }
                Err(e) => return Err(ApiError::Internal(format!("open {}: {e}", path.display()))),
            };
            let body = Body::from_stream(ReaderStream::new(file));
            Ok((
                [
                    (header::CONTENT_TYPE, download.name.media_type.to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        download.name.content_disposition(),
                    ),
                ],
                body,
            )
                .into_response())
        }
    }
}
