//! Password hashing, delegated to argon2.

use anyhow::{anyhow, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};

/// Hash a password into a PHC string for storage.
///
/// # Errors
///
/// Returns an error when hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?;
    Ok(hash.to_string())
}

/// Compare a candidate password against a stored PHC string.
#[must_use]
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() -> Result<()> {
        let hash = hash_password("hunter2")?;
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        Ok(())
    }

    #[test]
    fn verify_rejects_malformed_hash() {
        assert!(!verify_password("hunter2", "not-a-phc-string"));
    }
}
