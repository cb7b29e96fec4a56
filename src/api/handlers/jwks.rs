//! Public key-set endpoints.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::{error, info};

use crate::api::AppState;

#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    responses(
        (status = 200, description = "Public verification keys")
    ),
    tag = "keys"
)]
pub async fn jwks(state: Extension<Arc<AppState>>) -> impl IntoResponse {
    // Private components never leave the process; the snapshot carries a
    // public-only set.
    let snapshot = state.keys.snapshot();
    (StatusCode::OK, Json(snapshot.public_set().clone())).into_response()
}

#[utoipa::path(
    post,
    path = "/admin/keys/reload",
    responses(
        (status = 204, description = "Key set reloaded"),
        (status = 500, description = "Reload failed; previous set stays active")
    ),
    tag = "keys"
)]
pub async fn reload(state: Extension<Arc<AppState>>) -> impl IntoResponse {
    match state.keys.reload() {
        Ok(()) => {
            info!("Key set reloaded");
            StatusCode::NO_CONTENT
        }
        Err(err) => {
            error!("Failed to reload key set: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
