//! Usage tracking endpoints. Each mutation kicks off a detached quota
//! recompute; the flag may lag the write.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use tracing::error;

use super::types::TrackRequest;
use crate::api::principal::require_user;
use crate::api::AppState;
use crate::quota;

#[utoipa::path(
    post,
    path = "/track/upload",
    request_body = TrackRequest,
    responses(
        (status = 204, description = "Upload tracked"),
        (status = 401, description = "Not authenticated")
    ),
    tag = "track"
)]
pub async fn upload(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Json(body): Json<TrackRequest>,
) -> impl IntoResponse {
    let identity = match require_user(&headers, &state).await {
        Ok(identity) => identity,
        Err(status) => return status.into_response(),
    };
    if body.size < 0 {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if let Err(err) = quota::record_upload(&state.pool, identity.id, body.size).await {
        error!("Failed to record upload: {err:#}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    quota::spawn_recompute(state.pool.clone(), identity);
    StatusCode::NO_CONTENT.into_response()
}

#[utoipa::path(
    post,
    path = "/track/download",
    request_body = TrackRequest,
    responses(
        (status = 204, description = "Download tracked"),
        (status = 401, description = "Not authenticated")
    ),
    tag = "track"
)]
pub async fn download(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Json(body): Json<TrackRequest>,
) -> impl IntoResponse {
    let identity = match require_user(&headers, &state).await {
        Ok(identity) => identity,
        Err(status) => return status.into_response(),
    };
    if body.size < 0 {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if let Err(err) = quota::record_download(&state.pool, identity.id, body.size).await {
        error!("Failed to record download: {err:#}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    quota::spawn_recompute(state.pool.clone(), identity);
    StatusCode::NO_CONTENT.into_response()
}
