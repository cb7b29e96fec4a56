//! Public-key challenge-response login and registration.
//!
//! A client proves control of an Ed25519 key in two steps: it requests a
//! challenge for its public key, then submits the challenge response signed
//! with the matching private key. The response bytes are the purpose tag,
//! the issued nonce, and for registration the claimed email, concatenated.
//! Login resolves to the identity already owning the key; registration
//! creates a new identity bound to it.

pub mod store;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::account::store::{by_public_key, create_with_public_key, RegisterOutcome};
use crate::account::{Identity, PublicKey};

pub use store::{ChallengeStore, Lookup, Purpose, CHALLENGE_TTL_SECONDS, NONCE_LEN};

#[derive(Debug, Error)]
pub enum ChallengeError {
    /// No pending challenge, or no identity owns the key on login.
    #[error("challenge not found")]
    NotFound,
    #[error("challenge expired")]
    Expired,
    #[error("challenge already consumed")]
    AlreadyConsumed,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("public key is already registered")]
    PublicKeyAlreadyRegistered,
    #[error("email is already in use")]
    EmailAlreadyUsed,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// A challenge descriptor handed back to the client for signing.
#[derive(Debug, Clone, Copy)]
pub struct Challenge {
    pub nonce: [u8; NONCE_LEN],
    pub purpose: Purpose,
}

/// Check the response layout and its Ed25519 signature against a nonce.
///
/// The layout comparison runs in constant time; both a layout mismatch and
/// a bad signature report `SignatureInvalid`, so a prober learns nothing
/// about which part was wrong.
fn check_response(
    nonce: &[u8; NONCE_LEN],
    purpose: Purpose,
    email: Option<&str>,
    response: &[u8],
    signature: &[u8],
    public_key: &PublicKey,
) -> Result<(), ChallengeError> {
    let mut expected = Vec::with_capacity(purpose.tag().len() + NONCE_LEN);
    expected.extend_from_slice(purpose.tag());
    expected.extend_from_slice(nonce);
    if let Some(email) = email {
        expected.extend_from_slice(email.as_bytes());
    }
    if expected.len() != response.len() || expected.ct_eq(response).unwrap_u8() != 1 {
        return Err(ChallengeError::SignatureInvalid);
    }

    let verifying_key = VerifyingKey::from_bytes(public_key.as_bytes())
        .map_err(|_| ChallengeError::SignatureInvalid)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| ChallengeError::SignatureInvalid)?;
    verifying_key
        .verify(response, &signature)
        .map_err(|_| ChallengeError::SignatureInvalid)
}

/// Issues single-use challenges and turns signed responses into identities.
pub struct ChallengeAuthenticator {
    store: ChallengeStore,
    pool: PgPool,
}

impl ChallengeAuthenticator {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            store: ChallengeStore::new(),
            pool,
        }
    }

    /// Issue a challenge for `public_key`, superseding any pending one for
    /// the same purpose.
    pub async fn create_challenge(&self, public_key: PublicKey, purpose: Purpose) -> Challenge {
        let nonce = self.store.create(public_key, purpose).await;
        tracing::debug!(public_key = %public_key, ?purpose, "challenge issued");
        Challenge { nonce, purpose }
    }

    /// Verify a signed challenge response.
    ///
    /// The purpose is inferred from `email`: registration when present,
    /// login otherwise. The challenge is consumed only after the signature
    /// verifies, and consumption is a compare-and-set, so of two racing
    /// valid responses exactly one wins and the other fails
    /// `AlreadyConsumed`.
    ///
    /// # Errors
    ///
    /// `NotFound` when nothing is pending, or on login when no identity owns
    /// the key. `Expired` and `AlreadyConsumed` per challenge state.
    /// `SignatureInvalid` on any layout or signature mismatch. Registration
    /// additionally fails `PublicKeyAlreadyRegistered` or `EmailAlreadyUsed`
    /// on a uniqueness collision.
    pub async fn verify_response(
        &self,
        public_key: &PublicKey,
        response: &[u8],
        signature: &[u8],
        email: Option<&str>,
    ) -> Result<Identity, ChallengeError> {
        let purpose = match email {
            Some(_) => Purpose::Register,
            None => Purpose::Login,
        };

        let nonce = match self.store.pending(public_key, purpose).await {
            Lookup::Found(nonce) => nonce,
            Lookup::NotFound => return Err(ChallengeError::NotFound),
            Lookup::Expired => return Err(ChallengeError::Expired),
            Lookup::AlreadyConsumed => return Err(ChallengeError::AlreadyConsumed),
        };

        check_response(&nonce, purpose, email, response, signature, public_key)?;

        match self.store.consume(public_key, purpose, &nonce).await {
            Lookup::Found(_) => {}
            // Superseded between lookup and consume; the new challenge stays
            // pending for its own response.
            Lookup::NotFound => return Err(ChallengeError::NotFound),
            Lookup::Expired => return Err(ChallengeError::Expired),
            Lookup::AlreadyConsumed => return Err(ChallengeError::AlreadyConsumed),
        }

        match purpose {
            Purpose::Login => {
                let identity = by_public_key(&self.pool, public_key)
                    .await?
                    .ok_or(ChallengeError::NotFound)?;
                tracing::info!(public_key = %public_key, sub = %identity.sub, "public key login");
                Ok(identity)
            }
            Purpose::Register => {
                // Checked above: Register implies an email is present.
                let email = email.ok_or(ChallengeError::SignatureInvalid)?;
                match create_with_public_key(&self.pool, email, public_key).await? {
                    RegisterOutcome::Created(identity) => {
                        tracing::info!(
                            public_key = %public_key,
                            sub = %identity.sub,
                            "public key registration"
                        );
                        Ok(identity)
                    }
                    RegisterOutcome::EmailTaken => Err(ChallengeError::EmailAlreadyUsed),
                    RegisterOutcome::PublicKeyTaken => {
                        Err(ChallengeError::PublicKeyAlreadyRegistered)
                    }
                }
            }
        }
    }
}
