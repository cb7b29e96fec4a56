//! Current-user endpoints.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;

use crate::api::principal::{require_user, resolve, Principal};
use crate::api::AppState;
use crate::quota;

#[utoipa::path(
    get,
    path = "/user",
    responses(
        (status = 200, description = "The authenticated identity"),
        (status = 401, description = "Not authenticated")
    ),
    tag = "user"
)]
pub async fn info(headers: HeaderMap, state: Extension<Arc<AppState>>) -> impl IntoResponse {
    match require_user(&headers, &state).await {
        Ok(identity) => (StatusCode::OK, Json(identity)).into_response(),
        Err(status) => status.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/limits",
    responses(
        (status = 200, description = "Limits of every tier")
    ),
    tag = "user"
)]
pub async fn tiers() -> impl IntoResponse {
    // Public; the portal renders the pricing table from this.
    (StatusCode::OK, Json(quota::all_limits()))
}

#[utoipa::path(
    get,
    path = "/user/limits",
    responses(
        (status = 200, description = "Limits in force for the caller")
    ),
    tag = "user"
)]
pub async fn limits(headers: HeaderMap, state: Extension<Arc<AppState>>) -> impl IntoResponse {
    // Anonymous callers get an answer too; only a broken credential fails.
    let principal = match resolve(&headers, &state).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    let identity = match &principal {
        Principal::User(identity) => Some(identity),
        Principal::Anonymous | Principal::ScopedKey { .. } => None,
    };
    let limits = quota::effective_limits(identity);
    (StatusCode::OK, Json(limits)).into_response()
}
