//! Caller identity resolution.
//!
//! Every request resolves to a [`Principal`] by trying, in priority order:
//! the `Custodia-Api-Key` header, the session cookie, then a bearer token.
//! A present-but-invalid credential fails the request rather than falling
//! through to the next source; only absence falls through. Requests with no
//! credential at all resolve to `Anonymous`.

use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{HeaderMap, StatusCode};
use tracing::error;
use uuid::Uuid;

use super::AppState;
use crate::account::{store as accounts, Identity};
use crate::cookie::COOKIE_NAME;
use crate::credentials::{store as credentials, CredentialScope, KeyError};
use crate::token::TokenService;

/// Header carrying an API credential secret.
pub const API_KEY_HEADER: &str = "custodia-api-key";

/// The resolved caller.
#[derive(Debug, Clone)]
pub enum Principal {
    Anonymous,
    /// A full session: cookie, bearer token, or full-access API key.
    User(Identity),
    /// A scoped API key; privilege is limited to the allow-listed links,
    /// regardless of who presents the key.
    ScopedKey { owner: Uuid, links: Vec<String> },
}

impl Principal {
    /// The identity when the caller holds full-session privilege.
    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Principal::User(identity) => Some(identity),
            _ => None,
        }
    }
}

/// Resolve the request headers to a principal.
///
/// # Errors
///
/// `401` when a presented credential is invalid; `500` on store failure.
pub async fn resolve(headers: &HeaderMap, state: &AppState) -> Result<Principal, StatusCode> {
    if let Some(value) = headers.get(API_KEY_HEADER) {
        let secret = value.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;
        return resolve_api_key(state, secret).await;
    }

    if let Some(value) = session_cookie_value(headers) {
        return resolve_token_source(state, &value).await;
    }

    if let Some(token) = bearer_token(headers) {
        return resolve_bearer(state, token).await;
    }

    Ok(Principal::Anonymous)
}

/// Resolve to a full-session identity, or fail `401`.
pub async fn require_user(headers: &HeaderMap, state: &AppState) -> Result<Identity, StatusCode> {
    match resolve(headers, state).await? {
        Principal::User(identity) => Ok(identity),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn resolve_api_key(state: &AppState, secret: &str) -> Result<Principal, StatusCode> {
    // Full keys outrank scoped ones when a secret matches both lookups.
    match credentials::resolve_full(&state.pool, secret).await {
        Ok(Some(identity)) => return Ok(Principal::User(identity)),
        Ok(None) => {}
        Err(KeyError::InvalidFormat) => return Err(StatusCode::UNAUTHORIZED),
        Err(err) => {
            error!("Failed to resolve api key: {err:#}");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }
    match credentials::resolve_scoped(&state.pool, secret).await {
        Ok(Some(credential)) => {
            let links = match credential.scope {
                CredentialScope::ScopedTo(links) => links,
                CredentialScope::Full => Vec::new(),
            };
            Ok(Principal::ScopedKey {
                owner: credential.owner,
                links,
            })
        }
        Ok(None) => Err(StatusCode::UNAUTHORIZED),
        Err(KeyError::InvalidFormat) => Err(StatusCode::UNAUTHORIZED),
        Err(err) => {
            error!("Failed to resolve api key: {err:#}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn resolve_token_source(state: &AppState, cookie_value: &str) -> Result<Principal, StatusCode> {
    let token = state
        .cookies
        .decode(cookie_value)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    resolve_bearer(state, &token).await
}

async fn resolve_bearer(state: &AppState, token: &str) -> Result<Principal, StatusCode> {
    let claims = state
        .tokens
        .validate(token)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let (sub, _email) =
        TokenService::extract_identity(&claims).map_err(|_| StatusCode::UNAUTHORIZED)?;
    match accounts::by_sub(&state.pool, &sub).await {
        Ok(Some(identity)) => Ok(Principal::User(identity)),
        Ok(None) => Err(StatusCode::UNAUTHORIZED),
        Err(err) => {
            error!("Failed to lookup identity: {err:#}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn session_cookie_value(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == COOKIE_NAME).then(|| value.to_string())
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn cookie_value_is_extracted_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; custodia_session=abc123; lang=en"),
        );
        assert_eq!(session_cookie_value(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_cookie_is_none() {
        let mut headers = HeaderMap::new();
        assert!(session_cookie_value(&headers).is_none());
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark"));
        assert!(session_cookie_value(&headers).is_none());
    }

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(bearer_token(&headers), Some("tok"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);
    }
}
