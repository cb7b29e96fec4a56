//! Error taxonomy shared by the token and cookie layers.

use thiserror::Error;

use crate::keyset::KeySetError;

/// Authentication failures for tokens and session cookies.
///
/// The core never maps these to HTTP status codes; handlers do.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The identity is missing a subject id or an email address.
    #[error("identity is missing subject or email")]
    InvalidIdentity,
    /// Malformed token structure or a signature that does not verify.
    #[error("authentication failed")]
    Unauthenticated,
    /// Signature verified but the expiry claim is in the past, or the
    /// cookie's embedded expiry has passed.
    #[error("token expired")]
    Expired,
    /// Cookie failed authenticated decryption.
    #[error("cookie failed authentication")]
    Tampered,
    /// Claims decoded but a field has the wrong shape.
    #[error("malformed token claims")]
    MalformedClaims,
    /// A required claim is absent or empty.
    #[error("required claim missing")]
    MissingField,
    /// Signing failed; the token could not be produced.
    #[error("failed to sign token")]
    Sign,
    #[error(transparent)]
    KeySet(#[from] KeySetError),
}
