use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::models::api::StatusCounts;
use crate::routes::error::{ApiError, ApiResult};

#[derive(Debug, Default, Deserialize)]
pub struct AdminKeyQuery {
    pub key: Option<String>,
}

/// Hidden (404) when no admin key is configured; 401 when the key is missing or wrong.
fn require_admin_key(
    state: &AppState,
    headers: &HeaderMap,
    query: &AdminKeyQuery,
) -> Result<(), ApiError> {
    let Some(expected) = state.admin_api_key.as_deref() else {
        return Err(ApiError::NotFound("Not found".to_string()));
    };
    let provided = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .or(query.key.as_deref());
    match provided {
        Some(key) if key == expected => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

/// GET /api/admin/stats — all-time job counts by status.
pub async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AdminKeyQuery>,
) -> ApiResult<Json<StatusCounts>> {
    require_admin_key(&state, &headers, &query)?;
    Ok(Json(state.submission.status_counts().await?))
}
