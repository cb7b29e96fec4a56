//! # Custodia (Accounts & Credential Authority)
//!
//! `custodia` is the accounts service of a hosted content portal. It resolves
//! every inbound request to an identity and manages the credentials that make
//! that resolution possible.
//!
//! ## Authentication
//!
//! Three ways in, tried in priority order for each request:
//!
//! 1. **API keys** (`Custodia-Api-Key` header) — long-lived secrets minted by
//!    users. Full keys are equivalent to a session; scoped keys are shareable
//!    bearer capabilities restricted to an allow-list of content links.
//! 2. **Session cookie** — an authenticated-encrypted wrapper around a JWT,
//!    set on login.
//! 3. **Bearer token** — a raw JWT signed against the portal key set.
//!
//! Password logins delegate to `argon2`; public-key logins use a single-use
//! Ed25519 challenge-response protocol that also covers registration.
//!
//! ## Quotas
//!
//! Usage-mutating endpoints trigger a detached quota recompute. While an
//! identity is over quota it receives anonymous-tier limits until a later
//! recompute clears the flag; callers must tolerate the lag.

pub mod account;
pub mod api;
pub mod challenge;
pub mod cli;
pub mod cookie;
pub mod credentials;
pub mod error;
pub mod keyset;
pub mod quota;
pub mod token;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
pub(crate) mod testdb;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(GIT_COMMIT_HASH.len() >= 7);
    }
}
