//! Portal key set: signing and verification key material.
//!
//! The key set is a JWKS-style JSON document holding RSA keys with their
//! private components. A public-only derivation of the set is what token
//! validation (and the `/.well-known` endpoint) sees; the private components
//! never leave this module.
//!
//! The cached state is an immutable snapshot behind a lock. `reload` replaces
//! the snapshot wholesale, so readers either see the old set or the new one,
//! never a mix.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::pkcs1v15::SigningKey;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

/// Signature algorithms this portal can sign and verify with.
pub const SUPPORTED_ALGORITHMS: &[&str] = &["RS256"];

#[derive(Debug, Error)]
pub enum KeySetError {
    #[error("failed to read key set: {0}")]
    Read(#[from] std::io::Error),
    #[error("malformed key set: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("key set contains no keys")]
    EmptySet,
    #[error("no key matches a supported signature algorithm")]
    NoUsableKey,
    #[error("invalid base64url in key material")]
    Base64,
    #[error("invalid RSA key material")]
    KeyParse,
}

/// One RSA key, JWK-encoded. Private components are optional so the same type
/// serves both the full set and its public derivation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    pub kid: String,
    pub n: String,
    pub e: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
}

impl Jwk {
    /// Build a full (private) JWK from an `RsaPrivateKey`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key has fewer than two primes.
    pub fn from_rsa_private_key(
        private_key: &RsaPrivateKey,
        kid: impl Into<String>,
    ) -> Result<Self, KeySetError> {
        let primes = private_key.primes();
        let (p, q) = match (primes.first(), primes.get(1)) {
            (Some(p), Some(q)) => (p, q),
            _ => return Err(KeySetError::KeyParse),
        };
        Ok(Self {
            kty: "RSA".to_string(),
            alg: Some("RS256".to_string()),
            key_use: Some("sig".to_string()),
            kid: kid.into(),
            n: Base64UrlUnpadded::encode_string(&private_key.n().to_bytes_be()),
            e: Base64UrlUnpadded::encode_string(&private_key.e().to_bytes_be()),
            d: Some(Base64UrlUnpadded::encode_string(
                &private_key.d().to_bytes_be(),
            )),
            p: Some(Base64UrlUnpadded::encode_string(&p.to_bytes_be())),
            q: Some(Base64UrlUnpadded::encode_string(&q.to_bytes_be())),
        })
    }

    /// Convert this JWK to an `RsaPublicKey`.
    ///
    /// # Errors
    ///
    /// Returns an error if the base64url values cannot be decoded or the RSA
    /// key is invalid.
    pub fn to_rsa_public_key(&self) -> Result<RsaPublicKey, KeySetError> {
        let n = decode_biguint(&self.n)?;
        let e = decode_biguint(&self.e)?;
        RsaPublicKey::new(n, e).map_err(|_| KeySetError::KeyParse)
    }

    /// Convert this JWK to an `RsaPrivateKey`, if it carries private components.
    ///
    /// # Errors
    ///
    /// Returns `KeyParse` when private components are absent or inconsistent.
    pub fn to_rsa_private_key(&self) -> Result<RsaPrivateKey, KeySetError> {
        let (d, p, q) = match (&self.d, &self.p, &self.q) {
            (Some(d), Some(p), Some(q)) => (d, p, q),
            _ => return Err(KeySetError::KeyParse),
        };
        let n = decode_biguint(&self.n)?;
        let e = decode_biguint(&self.e)?;
        let d = decode_biguint(d)?;
        let primes = vec![decode_biguint(p)?, decode_biguint(q)?];
        RsaPrivateKey::from_components(n, e, d, primes).map_err(|_| KeySetError::KeyParse)
    }

    /// A copy of this key with all private components stripped.
    #[must_use]
    pub fn public_only(&self) -> Self {
        Self {
            d: None,
            p: None,
            q: None,
            ..self.clone()
        }
    }

    fn has_supported_algorithm(&self) -> bool {
        self.alg
            .as_deref()
            .is_some_and(|alg| SUPPORTED_ALGORITHMS.contains(&alg))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeySet {
    pub keys: Vec<Jwk>,
}

impl KeySet {
    /// Parse a key set from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if `s` is not valid JSON or doesn't match the
    /// expected shape.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Find a key by `kid` (Key ID).
    #[must_use]
    pub fn find_by_kid(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }

    /// A verification-only version of the set. The full set must not be
    /// handed to validators or published.
    #[must_use]
    pub fn public_only(&self) -> Self {
        Self {
            keys: self.keys.iter().map(Jwk::public_only).collect(),
        }
    }
}

/// One immutable snapshot of loaded key material.
pub struct KeySetSnapshot {
    signing_key: SigningKey<Sha256>,
    signing_kid: String,
    public: KeySet,
}

impl KeySetSnapshot {
    fn from_set(set: &KeySet) -> Result<Self, KeySetError> {
        if set.keys.is_empty() {
            return Err(KeySetError::EmptySet);
        }
        // The signing key is the first key whose declared algorithm we
        // support and that carries private components.
        let jwk = set
            .keys
            .iter()
            .find(|k| k.has_supported_algorithm() && k.d.is_some())
            .ok_or(KeySetError::NoUsableKey)?;
        let private_key = jwk.to_rsa_private_key()?;
        Ok(Self {
            signing_key: SigningKey::<Sha256>::new(private_key),
            signing_kid: jwk.kid.clone(),
            public: set.public_only(),
        })
    }

    #[must_use]
    pub fn signing_key(&self) -> &SigningKey<Sha256> {
        &self.signing_key
    }

    #[must_use]
    pub fn signing_kid(&self) -> &str {
        &self.signing_kid
    }

    /// The public-only verification set.
    #[must_use]
    pub fn public_set(&self) -> &KeySet {
        &self.public
    }
}

/// Loads and caches the portal key set.
pub struct KeySetManager {
    path: PathBuf,
    state: RwLock<Arc<KeySetSnapshot>>,
}

impl KeySetManager {
    /// Load the key set from `path` and cache it.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable or malformed, contains zero keys,
    /// or holds no key with a supported signature algorithm.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeySetError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = Self::read_snapshot(&path)?;
        Ok(Self {
            path,
            state: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Re-read the key set from disk and swap the cached snapshot atomically.
    /// On failure the previous snapshot stays in place.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`KeySetManager::load`].
    pub fn reload(&self) -> Result<(), KeySetError> {
        let snapshot = Arc::new(Self::read_snapshot(&self.path)?);
        match self.state.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
        Ok(())
    }

    /// The current snapshot. Cheap to call; holders keep the snapshot they
    /// got even if a reload happens underneath them.
    #[must_use]
    pub fn snapshot(&self) -> Arc<KeySetSnapshot> {
        match self.state.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn read_snapshot(path: &Path) -> Result<KeySetSnapshot, KeySetError> {
        let contents = fs::read_to_string(path)?;
        let set = KeySet::from_json(&contents)?;
        KeySetSnapshot::from_set(&set)
    }
}

fn decode_biguint(s: &str) -> Result<BigUint, KeySetError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| KeySetError::Base64)?;
    Ok(BigUint::from_bytes_be(&bytes))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::Jwk;
    use rsa::RsaPrivateKey;
    use std::sync::OnceLock;

    /// A 2048-bit RSA key generated once per test binary. Key generation is
    /// slow enough that sharing it keeps the suite fast.
    pub(crate) fn test_rsa_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| {
            RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
                .expect("failed to generate test RSA key")
        })
    }

    pub(crate) fn test_jwk(kid: &str) -> Jwk {
        Jwk::from_rsa_private_key(test_rsa_key(), kid).expect("failed to build test JWK")
    }
}
