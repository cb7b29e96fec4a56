//! Request and response bodies for the HTTP surface.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Either `email` + `password`, or an already-issued `token` to wrap into
/// a session cookie.
#[derive(ToSchema, Deserialize, Debug, Default)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
}

/// First step of the public-key flows. `email` marks a registration.
#[derive(ToSchema, Deserialize, Debug)]
pub struct ChallengeRequest {
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct ChallengeResponse {
    /// Hex-encoded nonce to sign.
    pub nonce: String,
    pub purpose: String,
    pub ttl_seconds: i64,
}

/// Second step of the public-key flows.
#[derive(ToSchema, Deserialize, Debug)]
pub struct ChallengeProof {
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
    /// Hex-encoded signed response bytes.
    pub response: String,
    /// Hex-encoded Ed25519 signature over the response bytes.
    pub signature: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct SessionResponse {
    pub token: String,
    pub expires_at: i64,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct ScopedLinksRequest {
    pub links: Vec<String>,
}

#[derive(ToSchema, Deserialize, Debug, Default)]
pub struct PatchLinksRequest {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct TrackRequest {
    /// Size of the transferred content, in bytes.
    pub size: i64,
}
