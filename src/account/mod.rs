//! Identities, tiers, and registered public keys.

mod password;
pub mod store;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use password::{hash_password, verify_password};

/// Length of a registered Ed25519 public key, in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Account tiers, ordered by privilege. Stored as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Free,
    Plus,
    Pro,
}

impl Tier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Free => "free",
            Tier::Plus => "plus",
            Tier::Pro => "pro",
        }
    }

    #[must_use]
    pub fn from_i16(value: i16) -> Self {
        match value {
            1 => Tier::Free,
            2 => Tier::Plus,
            3 => Tier::Pro,
            _ => Tier::Anonymous,
        }
    }

    #[must_use]
    pub fn as_i16(self) -> i16 {
        match self {
            Tier::Anonymous => 0,
            Tier::Free => 1,
            Tier::Plus => 2,
            Tier::Pro => 3,
        }
    }
}

/// A portal identity. Owned by the account subsystem; never hard-deleted
/// mid-session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    /// Opaque stable subject id, the `sub` claim of issued tokens.
    pub sub: String,
    pub email: String,
    pub tier: Tier,
    pub quota_exceeded: bool,
    /// External billing id, set at most once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum PublicKeyError {
    #[error("public key must be {PUBLIC_KEY_LEN} bytes")]
    WrongLength,
    #[error("public key is not valid hex")]
    NotHex,
}

/// A fixed-length Ed25519 public key. Hex-encoded wherever it travels in
/// URLs or headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// Parse from raw bytes.
    ///
    /// # Errors
    ///
    /// Fails when `bytes` is not exactly [`PUBLIC_KEY_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PublicKeyError> {
        let bytes: [u8; PUBLIC_KEY_LEN] =
            bytes.try_into().map_err(|_| PublicKeyError::WrongLength)?;
        Ok(Self(bytes))
    }

    /// Parse from a hex string.
    ///
    /// # Errors
    ///
    /// Fails on non-hex input or a wrong-length key.
    pub fn from_hex(s: &str) -> Result<Self, PublicKeyError> {
        let bytes = hex::decode(s).map_err(|_| PublicKeyError::NotHex)?;
        Self::from_bytes(&bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trips_through_i16() {
        for tier in [Tier::Anonymous, Tier::Free, Tier::Plus, Tier::Pro] {
            assert_eq!(Tier::from_i16(tier.as_i16()), tier);
        }
        // Unknown values degrade to anonymous rather than failing.
        assert_eq!(Tier::from_i16(42), Tier::Anonymous);
        assert_eq!(Tier::from_i16(-1), Tier::Anonymous);
    }

    #[test]
    fn public_key_hex_round_trip() -> anyhow::Result<()> {
        let key = PublicKey::from_bytes(&[7u8; PUBLIC_KEY_LEN])?;
        let parsed = PublicKey::from_hex(&key.to_hex())?;
        assert_eq!(parsed, key);
        Ok(())
    }

    #[test]
    fn public_key_rejects_bad_input() {
        assert!(matches!(
            PublicKey::from_bytes(&[0u8; 16]),
            Err(PublicKeyError::WrongLength)
        ));
        assert!(matches!(
            PublicKey::from_hex("zz"),
            Err(PublicKeyError::NotHex)
        ));
        assert!(matches!(
            PublicKey::from_hex("abcd"),
            Err(PublicKeyError::WrongLength)
        ));
    }
}
