//! Long-lived API credentials.
//!
//! Two families share one lifecycle: full-access keys, equivalent in
//! privilege to a session for their owner, and scoped keys restricted to an
//! allow-list of content links. The plaintext secret is returned exactly
//! once at creation; only its SHA-256 digest is stored.

pub mod store;

use std::sync::OnceLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Raw length of credential secret material, in bytes.
pub const SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyError {
    /// Unknown id, or the record is not owned by the caller. The two cases
    /// are indistinguishable on purpose.
    #[error("credential not found")]
    NotFound,
    #[error("per-owner credential limit reached")]
    TooManyKeys,
    #[error("malformed credential secret")]
    InvalidFormat,
    #[error("invalid content link: {0}")]
    InvalidResourceId(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Privilege carried by a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "links", rename_all = "lowercase")]
pub enum CredentialScope {
    Full,
    #[serde(rename = "scoped")]
    ScopedTo(Vec<String>),
}

impl CredentialScope {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CredentialScope::Full => "full",
            CredentialScope::ScopedTo(_) => "scoped",
        }
    }
}

/// A stored credential. Carries no secret material.
#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    pub id: Uuid,
    pub owner: Uuid,
    #[serde(flatten)]
    pub scope: CredentialScope,
    pub created_at: DateTime<Utc>,
}

/// Returned from creation only; the secret is not retrievable afterwards.
#[derive(Debug, Serialize)]
pub struct CreatedCredential {
    #[serde(flatten)]
    pub credential: Credential,
    pub secret: String,
}

/// Generate fresh secret material, base64url-encoded without padding.
#[must_use]
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Check that a presented secret decodes to exactly [`SECRET_LEN`] bytes.
///
/// # Errors
///
/// `InvalidFormat` for anything else; resolution never reaches the store
/// with a malformed value.
pub fn validate_secret(secret: &str) -> Result<(), KeyError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(secret)
        .map_err(|_| KeyError::InvalidFormat)?;
    if bytes.len() != SECRET_LEN {
        return Err(KeyError::InvalidFormat);
    }
    Ok(())
}

/// Hex digest of a secret, the form in which secrets are persisted.
#[must_use]
pub fn secret_hash(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn content_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[A-Za-z0-9_-]{46}$").unwrap_or_else(|_| unreachable!()))
}

/// Whether `link` matches the content-link format. Existence of the
/// referenced content is not checked.
#[must_use]
pub fn is_content_link(link: &str) -> bool {
    content_link_pattern().is_match(link)
}

/// Validate every link in an allow-list.
///
/// # Errors
///
/// `InvalidResourceId` naming the first offending link.
pub fn validate_links(links: &[String]) -> Result<(), KeyError> {
    for link in links {
        if !is_content_link(link) {
            return Err(KeyError::InvalidResourceId(link.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(byte: u8) -> String {
        String::from_utf8(vec![b'a' + byte % 26; 46]).unwrap()
    }

    #[test]
    fn generated_secrets_are_valid_and_distinct() -> anyhow::Result<()> {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
        validate_secret(&a)?;
        validate_secret(&b)?;
        Ok(())
    }

    #[test]
    fn secret_format_is_enforced() {
        // Not base64url, wrong decoded length, padded form.
        for bad in ["", "!!!", "AAAA", "shorter", &"A".repeat(44)] {
            assert!(matches!(validate_secret(bad), Err(KeyError::InvalidFormat)));
        }
    }

    #[test]
    fn secret_hash_is_stable_hex() {
        let secret = "0123456789abcdef0123456789abcdef0123456789a";
        let hash = secret_hash(secret);
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, secret_hash(secret));
        assert_ne!(hash, secret_hash("another"));
    }

    #[test]
    fn content_link_format() {
        assert!(is_content_link(&link(0)));
        assert!(is_content_link(&format!("{}_-", "b".repeat(44))));
        assert!(!is_content_link(&"a".repeat(45)));
        assert!(!is_content_link(&"a".repeat(47)));
        assert!(!is_content_link(&format!("{}!", "a".repeat(45))));
        assert!(!is_content_link(""));
    }

    #[test]
    fn validate_links_names_the_offender() {
        let links = vec![link(1), "bogus".to_string()];
        match validate_links(&links) {
            Err(KeyError::InvalidResourceId(offender)) => assert_eq!(offender, "bogus"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn scope_kind_names() {
        assert_eq!(CredentialScope::Full.kind(), "full");
        assert_eq!(CredentialScope::ScopedTo(vec![]).kind(), "scoped");
    }
}
