//! In-memory single-pending-challenge store.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::Mutex;

use crate::account::PublicKey;

/// Length of a challenge nonce, in bytes.
pub const NONCE_LEN: usize = 32;

/// How long an issued challenge stays valid.
pub const CHALLENGE_TTL_SECONDS: i64 = 300;

/// What the signed response is meant to prove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Login,
    Register,
}

impl Purpose {
    /// The domain-separation tag prepended to the signed response bytes.
    #[must_use]
    pub fn tag(self) -> &'static [u8] {
        match self {
            Purpose::Login => b"custodia-login",
            Purpose::Register => b"custodia-register",
        }
    }
}

/// Result of a pending lookup or an atomic consume attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup {
    /// The nonce of the live challenge.
    Found([u8; NONCE_LEN]),
    NotFound,
    Expired,
    AlreadyConsumed,
}

struct Entry {
    nonce: [u8; NONCE_LEN],
    issued_at: DateTime<Utc>,
    consumed: bool,
}

impl Entry {
    fn expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.issued_at > Duration::seconds(CHALLENGE_TTL_SECONDS)
    }
}

/// Keeps at most one pending challenge per (public key, purpose) pair.
///
/// Challenges are short-lived and never survive a restart, so they live in
/// process memory rather than the database. Expired entries are evicted
/// lazily whenever the map is touched.
#[derive(Default)]
pub struct ChallengeStore {
    entries: Mutex<HashMap<(PublicKey, Purpose), Entry>>,
}

impl ChallengeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh challenge, superseding any prior pending one for the
    /// same pair. Returns the nonce the client must sign.
    pub async fn create(&self, public_key: PublicKey, purpose: Purpose) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| !entry.expired_at(now));
        entries.insert(
            (public_key, purpose),
            Entry {
                nonce,
                issued_at: now,
                consumed: false,
            },
        );
        nonce
    }

    /// Look up the pending challenge without consuming it.
    pub async fn pending(&self, public_key: &PublicKey, purpose: Purpose) -> Lookup {
        self.lookup(public_key, purpose, None).await
    }

    /// Atomically consume the pending challenge for the pair.
    ///
    /// Compare-and-set over the nonce: consumption fails `NotFound` when the
    /// stored nonce differs from `expected`, so a response verified against a
    /// since-superseded challenge can never burn the current one. Consumed
    /// entries are retained with a flag rather than removed, so a racing
    /// second caller observes `AlreadyConsumed` instead of `NotFound`.
    pub async fn consume(
        &self,
        public_key: &PublicKey,
        purpose: Purpose,
        expected: &[u8; NONCE_LEN],
    ) -> Lookup {
        self.lookup(public_key, purpose, Some(expected)).await
    }

    async fn lookup(
        &self,
        public_key: &PublicKey,
        purpose: Purpose,
        take: Option<&[u8; NONCE_LEN]>,
    ) -> Lookup {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;

        let key = (*public_key, purpose);
        let Some(entry) = entries.get_mut(&key) else {
            return Lookup::NotFound;
        };
        if entry.expired_at(now) {
            entries.remove(&key);
            return Lookup::Expired;
        }
        if entry.consumed {
            return Lookup::AlreadyConsumed;
        }
        if let Some(expected) = take {
            if entry.nonce != *expected {
                return Lookup::NotFound;
            }
            entry.consumed = true;
        }
        Lookup::Found(entry.nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_bytes(&[byte; crate::account::PUBLIC_KEY_LEN]).unwrap()
    }

    #[tokio::test]
    async fn consume_returns_issued_nonce_once() {
        let store = ChallengeStore::new();
        let pk = key(1);

        let nonce = store.create(pk, Purpose::Login).await;
        assert_eq!(
            store.consume(&pk, Purpose::Login, &nonce).await,
            Lookup::Found(nonce)
        );
        assert_eq!(
            store.consume(&pk, Purpose::Login, &nonce).await,
            Lookup::AlreadyConsumed
        );
    }

    #[tokio::test]
    async fn missing_challenge_is_not_found() {
        let store = ChallengeStore::new();
        assert_eq!(
            store.consume(&key(2), Purpose::Register, &[0u8; NONCE_LEN]).await,
            Lookup::NotFound
        );
    }

    #[tokio::test]
    async fn purposes_are_independent() {
        let store = ChallengeStore::new();
        let pk = key(3);

        let nonce = store.create(pk, Purpose::Login).await;
        assert_eq!(
            store.consume(&pk, Purpose::Register, &nonce).await,
            Lookup::NotFound
        );
        assert_eq!(
            store.consume(&pk, Purpose::Login, &nonce).await,
            Lookup::Found(nonce)
        );
    }

    #[tokio::test]
    async fn reissue_supersedes_pending() {
        let store = ChallengeStore::new();
        let pk = key(4);

        let first = store.create(pk, Purpose::Login).await;
        let second = store.create(pk, Purpose::Login).await;
        assert_ne!(first, second);
        assert_eq!(
            store.consume(&pk, Purpose::Login, &second).await,
            Lookup::Found(second)
        );
    }

    #[tokio::test]
    async fn superseded_nonce_cannot_consume_the_current_challenge() {
        let store = ChallengeStore::new();
        let pk = key(5);

        // A caller observes the first nonce, then a reissue supersedes it
        // before consumption. The stale nonce must not burn the new entry.
        let first = store.create(pk, Purpose::Login).await;
        assert_eq!(
            store.pending(&pk, Purpose::Login).await,
            Lookup::Found(first)
        );
        let second = store.create(pk, Purpose::Login).await;

        assert_eq!(
            store.consume(&pk, Purpose::Login, &first).await,
            Lookup::NotFound
        );
        assert_eq!(
            store.consume(&pk, Purpose::Login, &second).await,
            Lookup::Found(second)
        );
    }

    #[test]
    fn purpose_tags_are_distinct() {
        assert_ne!(Purpose::Login.tag(), Purpose::Register.tag());
    }
}
