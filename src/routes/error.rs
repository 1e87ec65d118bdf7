use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::methods::ValidationError;
use crate::services::rate_limit::Throttled;
use crate::services::submission::SubmitError;

/// Error returned by every API handler. Renders as `{ "detail", "code" }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Throttled(#[from] Throttled),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid or missing admin key")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Submit(SubmitError::Validation(e))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
    code: &'static str,
}

const INTERNAL_DETAIL: &str = "An internal error occurred";

impl ApiError {
    fn classify(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Submit(e) => match e {
                SubmitError::Validation(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
                }
                SubmitError::Capacity(_) => {
                    (StatusCode::BAD_REQUEST, "CAPACITY_EXCEEDED", e.to_string())
                }
                SubmitError::NotCancellable(_) => {
                    (StatusCode::BAD_REQUEST, "NOT_CANCELLABLE", e.to_string())
                }
                SubmitError::NotRetryable { .. } => {
                    (StatusCode::BAD_REQUEST, "NOT_RETRYABLE", e.to_string())
                }
                SubmitError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string()),
                SubmitError::ResultUnavailable(_) => {
                    (StatusCode::NOT_FOUND, "RESULT_UNAVAILABLE", e.to_string())
                }
                SubmitError::Expired(_) => (StatusCode::GONE, "EXPIRED", e.to_string()),
                SubmitError::Store(_) | SubmitError::Storage(_) | SubmitError::Queue(_) => {
                    tracing::error!(error = %e, "Infrastructure error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        INTERNAL_DETAIL.to_string(),
                    )
                }
            },
            ApiError::Throttled(t) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", t.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    INTERNAL_DETAIL.to_string(),
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, detail) = self.classify();
        let mut response = (status, Json(ErrorBody { detail, code })).into_response();

        if let ApiError::Throttled(throttled) = &self {
            let secs = throttled.retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
