//! API credential lifecycle endpoints.

use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use tracing::error;
use uuid::Uuid;

use super::types::{PatchLinksRequest, ScopedLinksRequest};
use crate::api::principal::require_user;
use crate::api::AppState;
use crate::credentials::{store, KeyError};

fn key_status(err: &KeyError) -> StatusCode {
    match err {
        KeyError::NotFound => StatusCode::NOT_FOUND,
        KeyError::TooManyKeys | KeyError::InvalidFormat | KeyError::InvalidResourceId(_) => {
            StatusCode::BAD_REQUEST
        }
        KeyError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn key_error_response(context: &str, err: &KeyError) -> axum::response::Response {
    let status = key_status(err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("{context}: {err:#}");
    }
    status.into_response()
}

#[utoipa::path(
    get,
    path = "/user/keys",
    responses(
        (status = 200, description = "All credentials owned by the caller"),
        (status = 401, description = "Not authenticated")
    ),
    tag = "keys"
)]
pub async fn list(headers: HeaderMap, state: Extension<Arc<AppState>>) -> impl IntoResponse {
    let identity = match require_user(&headers, &state).await {
        Ok(identity) => identity,
        Err(status) => return status.into_response(),
    };
    match store::list(&state.pool, identity.id).await {
        Ok(credentials) => (StatusCode::OK, Json(credentials)).into_response(),
        Err(err) => key_error_response("Failed to list credentials", &err),
    }
}

#[utoipa::path(
    post,
    path = "/user/keys/full",
    responses(
        (status = 201, description = "Full-access key created; the secret is shown only here"),
        (status = 400, description = "Per-owner key limit reached"),
        (status = 401, description = "Not authenticated")
    ),
    tag = "keys"
)]
pub async fn create_full(headers: HeaderMap, state: Extension<Arc<AppState>>) -> impl IntoResponse {
    let identity = match require_user(&headers, &state).await {
        Ok(identity) => identity,
        Err(status) => return status.into_response(),
    };
    match store::create_full(&state.pool, identity.id, state.max_keys_per_owner).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(err) => key_error_response("Failed to create credential", &err),
    }
}

#[utoipa::path(
    post,
    path = "/user/keys/scoped",
    request_body = ScopedLinksRequest,
    responses(
        (status = 201, description = "Scoped key created; the secret is shown only here"),
        (status = 400, description = "Invalid content link or key limit reached"),
        (status = 401, description = "Not authenticated")
    ),
    tag = "keys"
)]
pub async fn create_scoped(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Json(body): Json<ScopedLinksRequest>,
) -> impl IntoResponse {
    let identity = match require_user(&headers, &state).await {
        Ok(identity) => identity,
        Err(status) => return status.into_response(),
    };
    match store::create_scoped(&state.pool, identity.id, body.links, state.max_keys_per_owner).await
    {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(err) => key_error_response("Failed to create credential", &err),
    }
}

#[utoipa::path(
    put,
    path = "/user/keys/{id}",
    request_body = ScopedLinksRequest,
    responses(
        (status = 204, description = "Allow-list replaced"),
        (status = 404, description = "No such scoped key owned by the caller")
    ),
    tag = "keys"
)]
pub async fn update(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ScopedLinksRequest>,
) -> impl IntoResponse {
    let identity = match require_user(&headers, &state).await {
        Ok(identity) => identity,
        Err(status) => return status.into_response(),
    };
    match store::update(&state.pool, identity.id, id, body.links).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => key_error_response("Failed to update credential", &err),
    }
}

#[utoipa::path(
    patch,
    path = "/user/keys/{id}",
    request_body = PatchLinksRequest,
    responses(
        (status = 204, description = "Allow-list edited"),
        (status = 404, description = "No such scoped key owned by the caller")
    ),
    tag = "keys"
)]
pub async fn patch(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchLinksRequest>,
) -> impl IntoResponse {
    let identity = match require_user(&headers, &state).await {
        Ok(identity) => identity,
        Err(status) => return status.into_response(),
    };
    match store::patch(&state.pool, identity.id, id, body.add, body.remove).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => key_error_response("Failed to patch credential", &err),
    }
}

#[utoipa::path(
    delete,
    path = "/user/keys/{id}",
    responses(
        (status = 204, description = "Credential revoked"),
        (status = 404, description = "No such key owned by the caller")
    ),
    tag = "keys"
)]
pub async fn delete(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let identity = match require_user(&headers, &state).await {
        Ok(identity) => identity,
        Err(status) => return status.into_response(),
    };
    match store::delete(&state.pool, identity.id, id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => key_error_response("Failed to delete credential", &err),
    }
}
