//! Database helpers for identities and registered public keys.

use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{Identity, PublicKey, Tier};

const IDENTITY_COLUMNS: &str = "id, sub, email, tier, quota_exceeded, stripe_id";

/// Outcome of a registration attempt, distinguishing which uniqueness
/// constraint fired.
#[derive(Debug)]
pub enum RegisterOutcome {
    Created(Identity),
    EmailTaken,
    PublicKeyTaken,
}

fn identity_from_row(row: &PgRow) -> Result<Identity, sqlx::Error> {
    Ok(Identity {
        id: row.try_get("id")?,
        sub: row.try_get("sub")?,
        email: row.try_get("email")?,
        tier: Tier::from_i16(row.try_get("tier")?),
        quota_exceeded: row.try_get("quota_exceeded")?,
        stripe_id: row.try_get("stripe_id")?,
    })
}

fn violated_constraint(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
            db_err.constraint().map(str::to_string)
        }
        _ => None,
    }
}

/// Look up an identity by its token subject id.
pub async fn by_sub(pool: &PgPool, sub: &str) -> Result<Option<Identity>> {
    let query = format!("SELECT {IDENTITY_COLUMNS} FROM users WHERE sub = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(sub)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup identity by sub")?;
    row.map(|row| identity_from_row(&row))
        .transpose()
        .context("failed to decode identity")
}

/// Look up an identity together with its stored password hash.
pub async fn login_record(pool: &PgPool, email: &str) -> Result<Option<(Identity, Option<String>)>> {
    let query = format!("SELECT {IDENTITY_COLUMNS}, password_hash FROM users WHERE email = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(email)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup login record")?;
    row.map(|row| {
        let identity = identity_from_row(&row)?;
        let password_hash: Option<String> = row.try_get("password_hash")?;
        Ok::<_, sqlx::Error>((identity, password_hash))
    })
    .transpose()
    .context("failed to decode login record")
}

/// The identity owning a registered public key, if any.
pub async fn by_public_key(pool: &PgPool, public_key: &PublicKey) -> Result<Option<Identity>> {
    let query = format!(
        "SELECT {IDENTITY_COLUMNS} FROM users \
         JOIN public_keys ON public_keys.user_id = users.id \
         WHERE public_keys.key = $1"
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(public_key.as_bytes().as_slice())
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup identity by public key")?;
    row.map(|row| identity_from_row(&row))
        .transpose()
        .context("failed to decode identity")
}

/// Create a password identity at the free tier.
///
/// Returns `EmailTaken` when the email uniqueness constraint fires; the
/// store arbitrates concurrent registrations, not in-process locks.
pub async fn create_password_identity(
    pool: &PgPool,
    email: &str,
    password_hash: &str,
) -> Result<RegisterOutcome> {
    let sub = Uuid::new_v4().to_string();
    let query = format!(
        "INSERT INTO users (sub, email, tier, password_hash) \
         VALUES ($1, $2, $3, $4) \
         RETURNING {IDENTITY_COLUMNS}"
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(&sub)
        .bind(email)
        .bind(Tier::Free.as_i16())
        .bind(password_hash)
        .fetch_one(pool)
        .instrument(span)
        .await;
    match row {
        Ok(row) => Ok(RegisterOutcome::Created(
            identity_from_row(&row).context("failed to decode identity")?,
        )),
        Err(err) => match violated_constraint(&err).as_deref() {
            Some("users_email_key") => Ok(RegisterOutcome::EmailTaken),
            _ => Err(err).context("failed to insert user"),
        },
    }
}

/// Create a new identity bound to `public_key` and `email`.
///
/// User row and key row land in one transaction, so a failure on either
/// uniqueness constraint leaves no partial registration behind.
pub async fn create_with_public_key(
    pool: &PgPool,
    email: &str,
    public_key: &PublicKey,
) -> Result<RegisterOutcome> {
    let mut tx = pool.begin().await.context("begin register transaction")?;

    let sub = Uuid::new_v4().to_string();
    let query = format!(
        "INSERT INTO users (sub, email, tier) VALUES ($1, $2, $3) RETURNING {IDENTITY_COLUMNS}"
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(&sub)
        .bind(email)
        .bind(Tier::Free.as_i16())
        .fetch_one(&mut *tx)
        .instrument(span)
        .await;
    let identity = match row {
        Ok(row) => identity_from_row(&row).context("failed to decode identity")?,
        Err(err) => {
            let _ = tx.rollback().await;
            return match violated_constraint(&err).as_deref() {
                Some("users_email_key") => Ok(RegisterOutcome::EmailTaken),
                _ => Err(err).context("failed to insert user"),
            };
        }
    };

    let query = "INSERT INTO public_keys (key, user_id) VALUES ($1, $2)";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let inserted = sqlx::query(query)
        .bind(public_key.as_bytes().as_slice())
        .bind(identity.id)
        .execute(&mut *tx)
        .instrument(span)
        .await;
    if let Err(err) = inserted {
        let _ = tx.rollback().await;
        return match violated_constraint(&err).as_deref() {
            Some("public_keys_pkey") => Ok(RegisterOutcome::PublicKeyTaken),
            _ => Err(err).context("failed to insert public key"),
        };
    }

    tx.commit().await.context("commit register transaction")?;
    Ok(RegisterOutcome::Created(identity))
}

/// Persist the quota flag, but only when it changed.
///
/// Returns whether a row was written.
pub async fn set_quota_exceeded(pool: &PgPool, id: Uuid, exceeded: bool) -> Result<bool> {
    let query = "UPDATE users SET quota_exceeded = $2 WHERE id = $1 AND quota_exceeded <> $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(id)
        .bind(exceeded)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update quota flag")?;
    Ok(result.rows_affected() > 0)
}

/// Assign the external billing id. Refused when the identity already has one
/// or another identity claimed it.
pub async fn set_stripe_id(pool: &PgPool, id: Uuid, stripe_id: &str) -> Result<bool> {
    let query = "UPDATE users SET stripe_id = $2 WHERE id = $1 AND stripe_id IS NULL";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(id)
        .bind(stripe_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to set stripe id")?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::PUBLIC_KEY_LEN;
    use rand::rngs::OsRng;
    use rand::RngCore;

    #[test]
    fn register_outcome_debug_names() {
        assert_eq!(format!("{:?}", RegisterOutcome::EmailTaken), "EmailTaken");
        assert_eq!(
            format!("{:?}", RegisterOutcome::PublicKeyTaken),
            "PublicKeyTaken"
        );
    }

    fn random_key() -> PublicKey {
        let mut raw = [0u8; PUBLIC_KEY_LEN];
        OsRng.fill_bytes(&mut raw);
        PublicKey::from_bytes(&raw).expect("key")
    }

    fn random_email() -> String {
        format!("{}@test.invalid", Uuid::new_v4())
    }

    #[tokio::test]
    #[ignore = "needs CUSTODIA_TEST_DSN"]
    async fn duplicate_public_key_registration_reports_which_constraint_fired() {
        let pool = crate::testdb::test_pool().await;
        let key = random_key();
        let email = random_email();

        let created = create_with_public_key(&pool, &email, &key)
            .await
            .expect("register");
        assert!(matches!(created, RegisterOutcome::Created(_)));

        // Same key, fresh email.
        assert!(matches!(
            create_with_public_key(&pool, &random_email(), &key)
                .await
                .expect("register"),
            RegisterOutcome::PublicKeyTaken
        ));

        // Same email, fresh key.
        assert!(matches!(
            create_with_public_key(&pool, &email, &random_key())
                .await
                .expect("register"),
            RegisterOutcome::EmailTaken
        ));

        // The failed attempts left no partial rows behind.
        let identity = by_public_key(&pool, &key).await.expect("lookup");
        assert_eq!(identity.expect("owner").email, email);
    }
}
