//! Tier limits and the over-quota flag.
//!
//! Usage is tracked per identity; a recompute after each usage-mutating
//! operation flips the stored `quota_exceeded` flag in either direction.
//! While the flag is set (or the caller is anonymous), effective limits fall
//! back to the Anonymous tier regardless of the paid tier. The flag is
//! eventually consistent: recompute runs as detached background work, and
//! the authorization path never waits on it.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use crate::account::store::set_quota_exceeded;
use crate::account::{Identity, Tier};

const KIB: i64 = 1 << 10;
const MIB: i64 = 1 << 20;
const GIB: i64 = 1 << 30;
const TIB: i64 = 1 << 40;

/// Limits attached to an account tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierLimits {
    pub tier_name: &'static str,
    /// Bytes per second.
    pub upload_bandwidth: i64,
    /// Bytes per second.
    pub download_bandwidth: i64,
    pub max_upload_size: i64,
    pub max_uploads: i64,
    /// Total stored bytes.
    pub storage: i64,
}

const ANONYMOUS_LIMITS: TierLimits = TierLimits {
    tier_name: "anonymous",
    upload_bandwidth: 5 * MIB,
    download_bandwidth: 20 * MIB,
    max_upload_size: GIB,
    max_uploads: 0,
    storage: 0,
};

const FREE_LIMITS: TierLimits = TierLimits {
    tier_name: "free",
    upload_bandwidth: 10 * MIB,
    download_bandwidth: 40 * MIB,
    max_upload_size: GIB,
    max_uploads: 100,
    storage: 100 * GIB,
};

const PLUS_LIMITS: TierLimits = TierLimits {
    tier_name: "plus",
    upload_bandwidth: 20 * MIB,
    download_bandwidth: 80 * MIB,
    max_upload_size: 10 * GIB,
    max_uploads: 10 * KIB,
    storage: TIB,
};

const PRO_LIMITS: TierLimits = TierLimits {
    tier_name: "pro",
    upload_bandwidth: 40 * MIB,
    download_bandwidth: 160 * MIB,
    max_upload_size: 100 * GIB,
    max_uploads: 100 * KIB,
    storage: 20 * TIB,
};

/// The limits configured for a tier.
#[must_use]
pub fn limits_for(tier: Tier) -> &'static TierLimits {
    match tier {
        Tier::Anonymous => &ANONYMOUS_LIMITS,
        Tier::Free => &FREE_LIMITS,
        Tier::Plus => &PLUS_LIMITS,
        Tier::Pro => &PRO_LIMITS,
    }
}

/// The limits of every tier, from Anonymous up to Pro.
#[must_use]
pub fn all_limits() -> [&'static TierLimits; 4] {
    [
        &ANONYMOUS_LIMITS,
        &FREE_LIMITS,
        &PLUS_LIMITS,
        &PRO_LIMITS,
    ]
}

/// Limits actually in force for a caller.
///
/// Anonymous callers and over-quota identities get the Anonymous tier until
/// a later recompute clears the flag.
#[must_use]
pub fn effective_limits(identity: Option<&Identity>) -> &'static TierLimits {
    match identity {
        Some(identity) if !identity.quota_exceeded => limits_for(identity.tier),
        _ => limits_for(Tier::Anonymous),
    }
}

/// Aggregated usage for one identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserStats {
    pub upload_count: i64,
    pub total_upload_bytes: i64,
}

/// Whether usage breaks the tier's limits.
#[must_use]
pub fn is_exceeded(stats: &UserStats, limits: &TierLimits) -> bool {
    stats.upload_count > limits.max_uploads || stats.total_upload_bytes > limits.storage
}

/// Aggregate an identity's tracked uploads.
pub async fn usage_stats(pool: &PgPool, user_id: Uuid) -> Result<UserStats> {
    let query = "SELECT COUNT(*) AS upload_count, COALESCE(SUM(size), 0)::BIGINT AS total_bytes \
                 FROM uploads WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to aggregate usage")?;
    Ok(UserStats {
        upload_count: row.try_get("upload_count").context("failed to decode usage")?,
        total_upload_bytes: row.try_get("total_bytes").context("failed to decode usage")?,
    })
}

/// Track one upload against an identity.
pub async fn record_upload(pool: &PgPool, user_id: Uuid, size: i64) -> Result<()> {
    let query = "INSERT INTO uploads (user_id, size) VALUES ($1, $2)";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(size)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to record upload")?;
    Ok(())
}

/// Track one download against an identity.
pub async fn record_download(pool: &PgPool, user_id: Uuid, size: i64) -> Result<()> {
    let query = "INSERT INTO downloads (user_id, size) VALUES ($1, $2)";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(size)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to record download")?;
    Ok(())
}

/// Recompute the over-quota flag from current usage.
///
/// Writes the flag only when it changed. Returns the flag now in force.
pub async fn recompute(pool: &PgPool, identity: &Identity) -> Result<bool> {
    let stats = usage_stats(pool, identity.id).await?;
    let exceeded = is_exceeded(&stats, limits_for(identity.tier));
    if exceeded != identity.quota_exceeded {
        set_quota_exceeded(pool, identity.id, exceeded).await?;
        tracing::info!(
            sub = %identity.sub,
            exceeded,
            upload_count = stats.upload_count,
            total_upload_bytes = stats.total_upload_bytes,
            "quota flag updated"
        );
    }
    Ok(exceeded)
}

/// Recompute in the background, detached from the triggering request.
///
/// The task outlives the request but not the process. Failures are logged
/// and dropped; the next usage mutation triggers another attempt.
pub fn spawn_recompute(pool: PgPool, identity: Identity) {
    tokio::spawn(async move {
        if let Err(err) = recompute(&pool, &identity).await {
            tracing::warn!(sub = %identity.sub, "quota recompute failed: {err:#}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(tier: Tier, quota_exceeded: bool) -> Identity {
        Identity {
            id: Uuid::new_v4(),
            sub: "test-sub".to_string(),
            email: "user@example.com".to_string(),
            tier,
            quota_exceeded,
            stripe_id: None,
        }
    }

    #[test]
    fn upload_count_over_limit_is_exceeded() {
        let limits = limits_for(Tier::Free);
        let at_limit = UserStats {
            upload_count: limits.max_uploads,
            total_upload_bytes: 0,
        };
        let over = UserStats {
            upload_count: limits.max_uploads + 1,
            total_upload_bytes: 0,
        };
        assert!(!is_exceeded(&at_limit, limits));
        assert!(is_exceeded(&over, limits));
    }

    #[test]
    fn storage_over_limit_is_exceeded() {
        let limits = limits_for(Tier::Free);
        let over = UserStats {
            upload_count: 1,
            total_upload_bytes: limits.storage + 1,
        };
        assert!(is_exceeded(&over, limits));
    }

    #[test]
    fn effective_limits_fall_back_to_anonymous() {
        let paid = identity(Tier::Pro, false);
        assert_eq!(effective_limits(Some(&paid)), limits_for(Tier::Pro));

        let over_quota = identity(Tier::Pro, true);
        assert_eq!(
            effective_limits(Some(&over_quota)),
            limits_for(Tier::Anonymous)
        );

        assert_eq!(effective_limits(None), limits_for(Tier::Anonymous));
    }

    #[tokio::test]
    #[ignore = "needs CUSTODIA_TEST_DSN"]
    async fn recompute_persists_the_flag_in_both_directions() -> Result<()> {
        let pool = crate::testdb::test_pool().await;
        let identity = crate::testdb::fresh_identity(&pool).await;
        let storage = limits_for(identity.tier).storage;

        // One upload past the storage limit trips the flag.
        record_upload(&pool, identity.id, storage + 1).await?;
        assert!(recompute(&pool, &identity).await?);
        let flagged = crate::account::store::by_sub(&pool, &identity.sub)
            .await?
            .expect("identity");
        assert!(flagged.quota_exceeded);

        // Dropping the usage clears it again.
        sqlx::query("DELETE FROM uploads WHERE user_id = $1")
            .bind(identity.id)
            .execute(&pool)
            .await?;
        assert!(!recompute(&pool, &flagged).await?);
        let cleared = crate::account::store::by_sub(&pool, &identity.sub)
            .await?
            .expect("identity");
        assert!(!cleared.quota_exceeded);
        Ok(())
    }

    #[test]
    fn all_limits_lists_every_tier_in_order() {
        let names: Vec<&str> = all_limits().iter().map(|limits| limits.tier_name).collect();
        assert_eq!(names, ["anonymous", "free", "plus", "pro"]);

        let tiers = [Tier::Anonymous, Tier::Free, Tier::Plus, Tier::Pro];
        for (listed, tier) in all_limits().iter().zip(tiers) {
            assert_eq!(*listed, limits_for(tier));
        }
    }

    #[test]
    fn tiers_grow_monotonically() {
        let tiers = [Tier::Anonymous, Tier::Free, Tier::Plus, Tier::Pro];
        for pair in tiers.windows(2) {
            let (lower, upper) = (limits_for(pair[0]), limits_for(pair[1]));
            assert!(lower.storage <= upper.storage);
            assert!(lower.max_uploads <= upper.max_uploads);
            assert!(lower.upload_bandwidth <= upper.upload_bandwidth);
        }
    }
}
