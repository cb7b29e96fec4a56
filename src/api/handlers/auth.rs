//! Login, logout, signup, and the public-key challenge flows.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use tracing::error;

use super::types::{
    ChallengeProof, ChallengeRequest, ChallengeResponse, LoginRequest, SessionResponse,
    SignupRequest,
};
use crate::account::store::{by_sub, create_password_identity, login_record, RegisterOutcome};
use crate::account::{hash_password, verify_password, Identity, PublicKey};
use crate::api::AppState;
use crate::challenge::{ChallengeError, Purpose, CHALLENGE_TTL_SECONDS};
use crate::token::TokenService;

/// Issue a token for `identity` and wrap it into a session cookie.
fn session_with_cookie(
    state: &AppState,
    identity: &Identity,
) -> Result<(HeaderMap, SessionResponse), StatusCode> {
    let (token, expires_at) = state.tokens.issue(identity).map_err(|err| {
        error!("Failed to issue token: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let expires_at_unix = expires_at.timestamp();
    let value = state.cookies.encode(&token, expires_at_unix).map_err(|err| {
        error!("Failed to encode session cookie: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let cookie = state.cookies.set_cookie(&value, expires_at_unix);
    let mut headers = HeaderMap::new();
    let cookie = HeaderValue::from_str(&cookie).map_err(|err| {
        error!("Failed to build session cookie header: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    headers.insert(SET_COOKIE, cookie);
    Ok((
        headers,
        SessionResponse {
            token,
            expires_at: expires_at_unix,
        },
    ))
}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated; session cookie set", body = SessionResponse),
        (status = 400, description = "Neither credentials nor a token presented"),
        (status = 401, description = "Unknown email, wrong password, or invalid token")
    ),
    tag = "auth"
)]
pub async fn login(
    state: Extension<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> impl IntoResponse {
    if let Some(token) = &body.token {
        return login_with_token(&state, token).await;
    }
    let (Some(email), Some(password)) = (&body.email, &body.password) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let record = match login_record(&state.pool, email).await {
        Ok(record) => record,
        Err(err) => {
            error!("Failed to lookup login record: {err:#}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    // Same answer for unknown email and wrong password.
    let Some((identity, Some(stored_hash))) = record else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !verify_password(password, &stored_hash) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match session_with_cookie(&state, &identity) {
        Ok((headers, session)) => (StatusCode::OK, headers, Json(session)).into_response(),
        Err(status) => status.into_response(),
    }
}

/// Wrap an already-issued token into a session cookie.
///
/// The token keeps its original expiry; the cookie expires with it rather
/// than getting a fresh TTL.
async fn login_with_token(state: &AppState, token: &str) -> axum::response::Response {
    let Ok(claims) = state.tokens.validate(token) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Ok((sub, _email)) = TokenService::extract_identity(&claims) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Some(expires_at) = claims.expires_at() else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match by_sub(&state.pool, &sub).await {
        Ok(Some(_)) => {}
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(err) => {
            error!("Failed to lookup identity: {err:#}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let expires_at_unix = expires_at.timestamp();
    let value = match state.cookies.encode(token, expires_at_unix) {
        Ok(value) => value,
        Err(err) => {
            error!("Failed to encode session cookie: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let cookie = state.cookies.set_cookie(&value, expires_at_unix);
    let Ok(cookie) = HeaderValue::from_str(&cookie) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, cookie);
    let session = SessionResponse {
        token: token.to_string(),
        expires_at: expires_at_unix,
    };
    (StatusCode::OK, headers, Json(session)).into_response()
}

#[utoipa::path(
    post,
    path = "/auth/signup",
    request_body = SignupRequest,
    responses(
        (status = 200, description = "Account created; session cookie set", body = SessionResponse),
        (status = 409, description = "Email already in use")
    ),
    tag = "auth"
)]
pub async fn signup(
    state: Extension<Arc<AppState>>,
    Json(body): Json<SignupRequest>,
) -> impl IntoResponse {
    if body.email.is_empty() || body.password.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let password_hash = match hash_password(&body.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password: {err:#}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match create_password_identity(&state.pool, &body.email, &password_hash).await {
        Ok(RegisterOutcome::Created(identity)) => match session_with_cookie(&state, &identity) {
            Ok((headers, session)) => (StatusCode::OK, headers, Json(session)).into_response(),
            Err(status) => status.into_response(),
        },
        Ok(_) => StatusCode::CONFLICT.into_response(),
        Err(err) => {
            error!("Failed to create account: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/auth/logout",
    responses((status = 204, description = "Session cookie cleared")),
    tag = "auth"
)]
pub async fn logout(state: Extension<Arc<AppState>>) -> impl IntoResponse {
    // Tokens are not revocable server-side; clearing the cookie ends the
    // browser session.
    let mut headers = HeaderMap::new();
    if let Ok(cookie) = HeaderValue::from_str(&state.cookies.clear_cookie()) {
        headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::NO_CONTENT, headers)
}

#[utoipa::path(
    post,
    path = "/auth/challenge",
    request_body = ChallengeRequest,
    responses(
        (status = 200, description = "Challenge issued", body = ChallengeResponse),
        (status = 400, description = "Malformed public key")
    ),
    tag = "auth"
)]
pub async fn challenge(
    state: Extension<Arc<AppState>>,
    Json(body): Json<ChallengeRequest>,
) -> impl IntoResponse {
    let Ok(public_key) = PublicKey::from_hex(&body.public_key) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let purpose = match body.email {
        Some(_) => Purpose::Register,
        None => Purpose::Login,
    };
    let challenge = state.challenges.create_challenge(public_key, purpose).await;
    let response = ChallengeResponse {
        nonce: hex::encode(challenge.nonce),
        purpose: match challenge.purpose {
            Purpose::Login => "login".to_string(),
            Purpose::Register => "register".to_string(),
        },
        ttl_seconds: CHALLENGE_TTL_SECONDS,
    };
    (StatusCode::OK, Json(response)).into_response()
}

fn challenge_status(err: &ChallengeError) -> StatusCode {
    match err {
        ChallengeError::NotFound
        | ChallengeError::Expired
        | ChallengeError::AlreadyConsumed
        | ChallengeError::SignatureInvalid => StatusCode::UNAUTHORIZED,
        ChallengeError::PublicKeyAlreadyRegistered | ChallengeError::EmailAlreadyUsed => {
            StatusCode::CONFLICT
        }
        ChallengeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[utoipa::path(
    post,
    path = "/auth/verify",
    request_body = ChallengeProof,
    responses(
        (status = 200, description = "Challenge verified; session cookie set", body = SessionResponse),
        (status = 401, description = "Invalid, expired, or consumed challenge"),
        (status = 409, description = "Public key or email already registered")
    ),
    tag = "auth"
)]
pub async fn verify(
    state: Extension<Arc<AppState>>,
    Json(body): Json<ChallengeProof>,
) -> impl IntoResponse {
    let Ok(public_key) = PublicKey::from_hex(&body.public_key) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let (Ok(response), Ok(signature)) = (hex::decode(&body.response), hex::decode(&body.signature))
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let verified = state
        .challenges
        .verify_response(&public_key, &response, &signature, body.email.as_deref())
        .await;
    match verified {
        Ok(identity) => match session_with_cookie(&state, &identity) {
            Ok((headers, session)) => (StatusCode::OK, headers, Json(session)).into_response(),
            Err(status) => status.into_response(),
        },
        Err(err) => {
            let status = challenge_status(&err);
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!("Failed to verify challenge: {err:#}");
            }
            status.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeAuthenticator;
    use crate::cookie::SessionCookieCodec;
    use crate::keyset::{testutil::test_jwk, KeySet, KeySetManager};

    fn test_state(name: &str) -> Arc<AppState> {
        let path = std::env::temp_dir().join(format!("custodia-auth-{name}.json"));
        let set = KeySet {
            keys: vec![test_jwk("a1")],
        };
        std::fs::write(&path, serde_json::to_string(&set).expect("serialize"))
            .expect("write key set");
        let keys = Arc::new(KeySetManager::load(&path).expect("load key set"));
        std::fs::remove_file(&path).ok();

        // A lazy pool: these tests never reach the database.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");
        let tokens = TokenService::new(Arc::clone(&keys), "https://custodia.dev".to_string(), 900);
        let cookies = SessionCookieCodec::new(&[1u8; 32], &[2u8; 32], "custodia.dev".to_string())
            .expect("cookie codec");
        let challenges = ChallengeAuthenticator::new(pool.clone());
        Arc::new(AppState {
            pool,
            keys,
            tokens,
            cookies,
            challenges,
            max_keys_per_owner: 10,
        })
    }

    #[tokio::test]
    async fn login_rejects_invalid_token() {
        let state = test_state("bad-token");
        let body = LoginRequest {
            token: Some("not.a.token".to_string()),
            ..LoginRequest::default()
        };
        let response = login(Extension(state), Json(body)).await.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_without_credentials_or_token_is_bad_request() {
        let state = test_state("empty-body");
        let response = login(Extension(state), Json(LoginRequest::default()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn login_with_password_but_no_email_is_bad_request() {
        let state = test_state("half-credentials");
        let body = LoginRequest {
            password: Some("hunter2".to_string()),
            ..LoginRequest::default()
        };
        let response = login(Extension(state), Json(body)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
