//! Session token issuance and validation.
//!
//! Tokens are RS256 JWTs signed with the portal key set. The claim layout is
//! fixed: `sub`, `iat`, `exp`, `iss`, plus a `session` block carrying the
//! active flag and the identity's email trait. Claims coming back from the
//! wire are attacker-controlled and decoded defensively; nothing in this
//! module assumes a well-shaped payload.

use std::sync::Arc;

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::account::Identity;
use crate::error::AuthError;
use crate::keyset::{KeySetManager, KeySetSnapshot};

/// Default token lifetime: 720 hours.
pub const DEFAULT_TTL_SECONDS: i64 = 720 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Header {
    alg: String,
    typ: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl Header {
    fn rs256(kid: impl Into<String>) -> Self {
        Self {
            alg: "RS256".to_string(),
            typ: "JWT".to_string(),
            kid: Some(kid.into()),
        }
    }
}

/// The session block we embed in every token. This is the bare minimum the
/// rest of the portal needs from a session claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenSession {
    pub active: bool,
    pub identity: TokenIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenIdentity {
    pub traits: TokenTraits,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenTraits {
    pub email: String,
}

/// Decoded claims. Every field is optional so malformed tokens decode into
/// a value we can inspect instead of failing deep inside serde.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Value>,
}

impl Claims {
    /// The expiry claim as a UTC timestamp.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single())
    }
}

/// Issues and validates portal session tokens.
pub struct TokenService {
    keys: Arc<KeySetManager>,
    issuer: String,
    ttl: Duration,
}

impl TokenService {
    #[must_use]
    pub fn new(keys: Arc<KeySetManager>, issuer: String, ttl_seconds: i64) -> Self {
        Self {
            keys,
            issuer,
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Issue a signed token for `identity`.
    ///
    /// Returns the serialized token together with its expiry, so callers can
    /// align cookie lifetimes without re-parsing.
    ///
    /// # Errors
    ///
    /// `InvalidIdentity` when the subject id or email is empty; key set
    /// errors propagate unchanged.
    pub fn issue(&self, identity: &Identity) -> Result<(String, DateTime<Utc>), AuthError> {
        if identity.sub.is_empty() || identity.email.is_empty() {
            return Err(AuthError::InvalidIdentity);
        }
        let now = Utc::now();
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: Some(identity.sub.clone()),
            iat: Some(now.timestamp()),
            exp: Some(expires_at.timestamp()),
            iss: Some(self.issuer.clone()),
            session: Some(serde_json::to_value(TokenSession {
                active: true,
                identity: TokenIdentity {
                    traits: TokenTraits {
                        email: identity.email.clone(),
                    },
                },
            })
            .map_err(|_| AuthError::Sign)?),
        };

        let snapshot = self.keys.snapshot();
        let serialized = sign(&snapshot, &claims)?;
        Ok((serialized, expires_at))
    }

    /// Validate a serialized token: signature first, then expiry.
    ///
    /// # Errors
    ///
    /// `Unauthenticated` on malformed structure or a bad signature;
    /// `Expired` only after the signature verified, when `exp` is strictly
    /// before the current time (UTC). Issuer and audience are not pinned.
    pub fn validate(&self, serialized: &str) -> Result<Claims, AuthError> {
        let snapshot = self.keys.snapshot();
        let claims = verify(&snapshot, serialized)?;
        match claims.expires_at() {
            Some(expires_at) if expires_at < Utc::now() => Err(AuthError::Expired),
            Some(_) => Ok(claims),
            None => Err(AuthError::MalformedClaims),
        }
    }

    /// Extract the subject id and email from validated claims.
    ///
    /// A missing email is tolerated (empty string); a `session` block with
    /// the wrong shape is not.
    ///
    /// # Errors
    ///
    /// `MissingField` when `sub` is absent or empty or `session` is absent;
    /// `MalformedClaims` when a present field has the wrong type.
    pub fn extract_identity(claims: &Claims) -> Result<(String, String), AuthError> {
        let sub = match claims.sub.as_deref() {
            Some(sub) if !sub.is_empty() => sub.to_string(),
            _ => return Err(AuthError::MissingField),
        };
        let session = claims.session.as_ref().ok_or(AuthError::MissingField)?;
        let email = session_email(session)?;
        Ok((sub, email))
    }
}

/// Walk `session.identity.traits.email` defensively. Absent levels yield an
/// empty email; present-but-wrong-shaped levels are malformed.
fn session_email(session: &Value) -> Result<String, AuthError> {
    let session = session.as_object().ok_or(AuthError::MalformedClaims)?;
    let identity = match session.get("identity") {
        None | Some(Value::Null) => return Ok(String::new()),
        Some(value) => value.as_object().ok_or(AuthError::MalformedClaims)?,
    };
    let traits = match identity.get("traits") {
        None | Some(Value::Null) => return Ok(String::new()),
        Some(value) => value.as_object().ok_or(AuthError::MalformedClaims)?,
    };
    match traits.get("email") {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(email)) => Ok(email.clone()),
        Some(_) => Err(AuthError::MalformedClaims),
    }
}

fn sign(snapshot: &KeySetSnapshot, claims: &Claims) -> Result<String, AuthError> {
    let header = Header::rs256(snapshot.signing_kid());
    let header_b64 = b64e_json(&header)?;
    let claims_b64 = b64e_json(claims)?;
    let signing_input = format!("{header_b64}.{claims_b64}");

    let signature = snapshot.signing_key().sign(signing_input.as_bytes());
    let signature_b64 = Base64UrlUnpadded::encode_string(&signature.to_vec());
    Ok(format!("{signing_input}.{signature_b64}"))
}

fn verify(snapshot: &KeySetSnapshot, serialized: &str) -> Result<Claims, AuthError> {
    let mut parts = serialized.split('.');
    let header_b64 = parts.next().ok_or(AuthError::Unauthenticated)?;
    let claims_b64 = parts.next().ok_or(AuthError::Unauthenticated)?;
    let sig_b64 = parts.next().ok_or(AuthError::Unauthenticated)?;
    if parts.next().is_some() {
        return Err(AuthError::Unauthenticated);
    }

    let header: Header = b64d_json(header_b64)?;
    if header.alg != "RS256" {
        return Err(AuthError::Unauthenticated);
    }

    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature_bytes =
        Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| AuthError::Unauthenticated)?;
    let signature = Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| AuthError::Unauthenticated)?;

    // With a kid we verify against that key only; without one we try every
    // key in the public set.
    let public = snapshot.public_set();
    let candidates: Vec<&crate::keyset::Jwk> = match header.kid.as_deref() {
        Some(kid) => public.find_by_kid(kid).into_iter().collect(),
        None => public.keys.iter().collect(),
    };
    let verified = candidates.iter().any(|jwk| {
        jwk.to_rsa_public_key().is_ok_and(|public_key| {
            VerifyingKey::<Sha256>::new(public_key)
                .verify(signing_input.as_bytes(), &signature)
                .is_ok()
        })
    });
    if !verified {
        return Err(AuthError::Unauthenticated);
    }

    b64d_json(claims_b64)
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, AuthError> {
    let json = serde_json::to_vec(value).map_err(|_| AuthError::Sign)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, AuthError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| AuthError::Unauthenticated)?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::Unauthenticated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Tier;
    use crate::keyset::{testutil::test_jwk, KeySet, KeySetManager};
    use serde_json::json;
    use uuid::Uuid;

    fn test_manager(name: &str) -> Arc<KeySetManager> {
        let path = std::env::temp_dir().join(format!("custodia-token-{name}.json"));
        let set = KeySet {
            keys: vec![test_jwk("t1")],
        };
        std::fs::write(&path, serde_json::to_string(&set).expect("serialize"))
            .expect("write key set");
        let manager = KeySetManager::load(&path).expect("load key set");
        std::fs::remove_file(&path).ok();
        Arc::new(manager)
    }

    fn test_identity(email: &str) -> Identity {
        Identity {
            id: Uuid::new_v4(),
            sub: Uuid::new_v4().to_string(),
            email: email.to_string(),
            tier: Tier::Free,
            quota_exceeded: false,
            stripe_id: None,
        }
    }

    fn service(name: &str, ttl_seconds: i64) -> TokenService {
        TokenService::new(
            test_manager(name),
            "https://custodia.dev".to_string(),
            ttl_seconds,
        )
    }

    #[test]
    fn issue_validate_extract_round_trip() -> anyhow::Result<()> {
        let tokens = service("round-trip", DEFAULT_TTL_SECONDS);
        let identity = test_identity("alice@example.com");

        let (serialized, expires_at) = tokens.issue(&identity)?;
        assert!(expires_at > Utc::now());

        let claims = tokens.validate(&serialized)?;
        assert_eq!(claims.iss.as_deref(), Some("https://custodia.dev"));

        let (sub, email) = TokenService::extract_identity(&claims)?;
        assert_eq!(sub, identity.sub);
        assert_eq!(email, identity.email);
        Ok(())
    }

    #[test]
    fn issue_rejects_empty_subject_or_email() {
        let tokens = service("invalid-identity", DEFAULT_TTL_SECONDS);

        let mut identity = test_identity("alice@example.com");
        identity.sub = String::new();
        assert!(matches!(
            tokens.issue(&identity),
            Err(AuthError::InvalidIdentity)
        ));

        let mut identity = test_identity("");
        identity.sub = Uuid::new_v4().to_string();
        assert!(matches!(
            tokens.issue(&identity),
            Err(AuthError::InvalidIdentity)
        ));
    }

    #[test]
    fn expired_token_fails_expired() -> anyhow::Result<()> {
        let tokens = service("expired", -60);
        let (serialized, _) = tokens.issue(&test_identity("bob@example.com"))?;
        assert!(matches!(
            tokens.validate(&serialized),
            Err(AuthError::Expired)
        ));
        Ok(())
    }

    #[test]
    fn corrupted_signature_fails_unauthenticated_not_expired() -> anyhow::Result<()> {
        // Even an expired token with a bad signature must fail signature
        // verification first.
        let tokens = service("corrupt", -60);
        let (serialized, _) = tokens.issue(&test_identity("carol@example.com"))?;

        let mut corrupted = serialized.clone();
        let last = corrupted.pop().expect("token is non-empty");
        corrupted.push(if last == 'A' { 'B' } else { 'A' });

        assert!(matches!(
            tokens.validate(&corrupted),
            Err(AuthError::Unauthenticated)
        ));
        Ok(())
    }

    #[test]
    fn garbage_input_fails_unauthenticated() {
        let tokens = service("garbage", DEFAULT_TTL_SECONDS);
        for input in ["", "a.b", "a.b.c.d", "not-a-token", "..."] {
            assert!(
                matches!(tokens.validate(input), Err(AuthError::Unauthenticated)),
                "expected Unauthenticated for {input:?}"
            );
        }
    }

    #[test]
    fn extract_requires_sub_and_session() {
        let claims = Claims {
            sub: Some("abc".to_string()),
            session: None,
            ..Claims::default()
        };
        assert!(matches!(
            TokenService::extract_identity(&claims),
            Err(AuthError::MissingField)
        ));

        let claims = Claims {
            sub: Some(String::new()),
            session: Some(json!({})),
            ..Claims::default()
        };
        assert!(matches!(
            TokenService::extract_identity(&claims),
            Err(AuthError::MissingField)
        ));
    }

    #[test]
    fn extract_tolerates_missing_email() -> anyhow::Result<()> {
        let claims = Claims {
            sub: Some("abc".to_string()),
            session: Some(json!({"active": true})),
            ..Claims::default()
        };
        let (sub, email) = TokenService::extract_identity(&claims)?;
        assert_eq!(sub, "abc");
        assert_eq!(email, "");
        Ok(())
    }

    #[test]
    fn extract_rejects_misshapen_session() {
        for session in [
            json!("not an object"),
            json!({"identity": 42}),
            json!({"identity": {"traits": []}}),
            json!({"identity": {"traits": {"email": 7}}}),
        ] {
            let claims = Claims {
                sub: Some("abc".to_string()),
                session: Some(session.clone()),
                ..Claims::default()
            };
            assert!(
                matches!(
                    TokenService::extract_identity(&claims),
                    Err(AuthError::MalformedClaims)
                ),
                "expected MalformedClaims for session {session}"
            );
        }
    }

    #[test]
    fn token_without_exp_is_malformed() -> anyhow::Result<()> {
        let tokens = service("no-exp", DEFAULT_TTL_SECONDS);
        let snapshot = tokens.keys.snapshot();
        let claims = Claims {
            sub: Some("abc".to_string()),
            ..Claims::default()
        };
        let serialized = sign(&snapshot, &claims)?;
        assert!(matches!(
            tokens.validate(&serialized),
            Err(AuthError::MalformedClaims)
        ));
        Ok(())
    }
}
