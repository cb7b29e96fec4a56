//! Authenticated-encrypted session cookie codec.
//!
//! The login cookie wraps a serialized session token so the edge can resolve
//! identity without a database round trip. The value is one opaque
//! ChaCha20-Poly1305 box: `base64url(nonce || ciphertext)` over
//! `expires_at (8 bytes BE) || token`, with the cookie name as associated
//! data. The codec is keyed by a process-wide secret pair (a hash key and an
//! encryption key); the AEAD key is derived from both, so rotating either
//! secret invalidates outstanding cookies.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::AuthError;

/// Name of the login cookie.
pub const COOKIE_NAME: &str = "custodia_session";

/// Required length for each of the two cookie secrets.
pub const SECRET_KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const EXPIRY_LEN: usize = 8;

/// Encodes and decodes the login cookie value.
pub struct SessionCookieCodec {
    cipher: ChaCha20Poly1305,
    domain: String,
}

impl SessionCookieCodec {
    /// Build a codec from the secret pair and the cookie domain.
    ///
    /// # Errors
    ///
    /// Fails when either secret is not exactly [`SECRET_KEY_LEN`] bytes.
    pub fn new(hash_key: &[u8], encryption_key: &[u8], domain: String) -> anyhow::Result<Self> {
        if hash_key.len() != SECRET_KEY_LEN || encryption_key.len() != SECRET_KEY_LEN {
            anyhow::bail!("cookie secrets must be exactly {SECRET_KEY_LEN} bytes");
        }
        // Poly1305 authenticates and ChaCha20 encrypts, so the two configured
        // secrets collapse into one AEAD key.
        let mut hasher = Sha256::new();
        hasher.update(hash_key);
        hasher.update(encryption_key);
        let key_bytes = hasher.finalize();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        Ok(Self { cipher, domain })
    }

    /// Encode a serialized token into an opaque cookie value.
    ///
    /// # Errors
    ///
    /// Fails only when encryption itself fails.
    pub fn encode(&self, token: &str, expires_at_unix: i64) -> Result<String, AuthError> {
        let mut payload = Vec::with_capacity(EXPIRY_LEN + token.len());
        payload.extend_from_slice(&expires_at_unix.to_be_bytes());
        payload.extend_from_slice(token.as_bytes());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &payload,
                    aad: COOKIE_NAME.as_bytes(),
                },
            )
            .map_err(|_| AuthError::Tampered)?;

        let mut value = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        value.extend_from_slice(&nonce_bytes);
        value.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(value))
    }

    /// Decode a cookie value back into the wrapped token.
    ///
    /// # Errors
    ///
    /// `Tampered` when the value fails decoding or authenticated decryption
    /// (any single-bit mutation lands here); `Expired` when the embedded
    /// expiry has passed.
    pub fn decode(&self, value: &str) -> Result<String, AuthError> {
        let raw = URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|_| AuthError::Tampered)?;
        if raw.len() < NONCE_LEN {
            return Err(AuthError::Tampered);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);

        let payload = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: COOKIE_NAME.as_bytes(),
                },
            )
            .map_err(|_| AuthError::Tampered)?;
        if payload.len() < EXPIRY_LEN {
            return Err(AuthError::Tampered);
        }

        let (expiry_bytes, token_bytes) = payload.split_at(EXPIRY_LEN);
        let expiry_bytes: [u8; EXPIRY_LEN] =
            expiry_bytes.try_into().map_err(|_| AuthError::Tampered)?;
        let expires_at_unix = i64::from_be_bytes(expiry_bytes);
        if expires_at_unix < Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        String::from_utf8(token_bytes.to_vec()).map_err(|_| AuthError::Tampered)
    }

    /// Render the full `Set-Cookie` string for an encoded value.
    #[must_use]
    pub fn set_cookie(&self, value: &str, expires_at_unix: i64) -> String {
        let max_age = (expires_at_unix - Utc::now().timestamp()).max(0);
        format!(
            "{COOKIE_NAME}={value}; Path=/; Domain={}; HttpOnly; Secure; Max-Age={max_age}",
            self.domain
        )
    }

    /// A `Set-Cookie` string that clears the login cookie.
    #[must_use]
    pub fn clear_cookie(&self) -> String {
        format!(
            "{COOKIE_NAME}=; Path=/; Domain={}; HttpOnly; Secure; Max-Age=0",
            self.domain
        )
    }
}
