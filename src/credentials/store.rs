//! Database lifecycle for API credentials.
//!
//! Every owner-facing mutation filters by owner and id together; zero rows
//! affected is reported as [`KeyError::NotFound`], so an ownership mismatch
//! is indistinguishable from a nonexistent record.

use anyhow::Context;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{
    generate_secret, secret_hash, validate_links, validate_secret, CreatedCredential, Credential,
    CredentialScope, KeyError,
};
use crate::account::store::by_sub;
use crate::account::Identity;

const KIND_FULL: &str = "full";
const KIND_SCOPED: &str = "scoped";

fn credential_from_row(row: &PgRow) -> Result<Credential, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    let scope = if kind == KIND_SCOPED {
        let links: Option<Vec<String>> = row.try_get("links")?;
        CredentialScope::ScopedTo(links.unwrap_or_default())
    } else {
        CredentialScope::Full
    };
    Ok(Credential {
        id: row.try_get("id")?,
        owner: row.try_get("owner_id")?,
        scope,
        created_at: row.try_get("created_at")?,
    })
}

async fn count_for_owner(pool: &PgPool, owner: Uuid, kind: &str) -> Result<i64, KeyError> {
    let query = "SELECT COUNT(*) AS total FROM credentials WHERE owner_id = $1 AND kind = $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(owner)
        .bind(kind)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to count credentials")?;
    let total: i64 = row.try_get("total").context("failed to decode count")?;
    Ok(total)
}

async fn insert(
    pool: &PgPool,
    owner: Uuid,
    scope: CredentialScope,
    max_per_owner: i64,
) -> Result<CreatedCredential, KeyError> {
    if count_for_owner(pool, owner, scope.kind()).await? >= max_per_owner {
        return Err(KeyError::TooManyKeys);
    }

    let secret = generate_secret();
    let links = match &scope {
        CredentialScope::Full => None,
        CredentialScope::ScopedTo(links) => Some(links.clone()),
    };
    let query = "INSERT INTO credentials (owner_id, kind, secret_hash, links) \
                 VALUES ($1, $2, $3, $4) \
                 RETURNING id, created_at";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(owner)
        .bind(scope.kind())
        .bind(secret_hash(&secret))
        .bind(&links)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to insert credential")?;

    Ok(CreatedCredential {
        credential: Credential {
            id: row.try_get("id").context("failed to decode credential")?,
            owner,
            scope,
            created_at: row
                .try_get("created_at")
                .context("failed to decode credential")?,
        },
        secret,
    })
}

/// Create a full-access key for `owner`.
///
/// # Errors
///
/// `TooManyKeys` once the owner holds `max_per_owner` keys of this kind.
pub async fn create_full(
    pool: &PgPool,
    owner: Uuid,
    max_per_owner: i64,
) -> Result<CreatedCredential, KeyError> {
    insert(pool, owner, CredentialScope::Full, max_per_owner).await
}

/// Create a scoped key for `owner`, restricted to `links`.
///
/// # Errors
///
/// `InvalidResourceId` when a link fails the content-link format;
/// `TooManyKeys` at the per-owner cap.
pub async fn create_scoped(
    pool: &PgPool,
    owner: Uuid,
    links: Vec<String>,
    max_per_owner: i64,
) -> Result<CreatedCredential, KeyError> {
    validate_links(&links)?;
    insert(pool, owner, CredentialScope::ScopedTo(links), max_per_owner).await
}

/// All credentials owned by `owner`, both kinds, newest first.
pub async fn list(pool: &PgPool, owner: Uuid) -> Result<Vec<Credential>, KeyError> {
    let query = "SELECT id, owner_id, kind, links, created_at FROM credentials \
                 WHERE owner_id = $1 ORDER BY created_at DESC";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(owner)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list credentials")?;
    rows.iter()
        .map(|row| credential_from_row(row).context("failed to decode credential"))
        .collect::<Result<_, _>>()
        .map_err(KeyError::from)
}

/// Replace a scoped key's allow-list wholesale.
pub async fn update(
    pool: &PgPool,
    owner: Uuid,
    id: Uuid,
    links: Vec<String>,
) -> Result<(), KeyError> {
    validate_links(&links)?;
    let query = "UPDATE credentials SET links = $3 \
                 WHERE owner_id = $1 AND id = $2 AND kind = 'scoped'";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(owner)
        .bind(id)
        .bind(&links)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update credential")?;
    if result.rows_affected() == 0 {
        return Err(KeyError::NotFound);
    }
    Ok(())
}

/// Incrementally edit a scoped key's allow-list.
///
/// Additions and removals land in one statement, so concurrent patches
/// serialize at the row and neither sees a half-applied list. Removal wins
/// when a link appears in both sets.
pub async fn patch(
    pool: &PgPool,
    owner: Uuid,
    id: Uuid,
    add: Vec<String>,
    remove: Vec<String>,
) -> Result<(), KeyError> {
    validate_links(&add)?;
    let query = "UPDATE credentials SET links = ( \
                     SELECT COALESCE(array_agg(DISTINCT link), '{}') \
                     FROM unnest(array_cat(links, $3::text[])) AS link \
                     WHERE link <> ALL($4::text[]) \
                 ) \
                 WHERE owner_id = $1 AND id = $2 AND kind = 'scoped'";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(owner)
        .bind(id)
        .bind(&add)
        .bind(&remove)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to patch credential")?;
    if result.rows_affected() == 0 {
        return Err(KeyError::NotFound);
    }
    Ok(())
}

/// Delete a credential of either kind.
pub async fn delete(pool: &PgPool, owner: Uuid, id: Uuid) -> Result<(), KeyError> {
    let query = "DELETE FROM credentials WHERE owner_id = $1 AND id = $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(owner)
        .bind(id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete credential")?;
    if result.rows_affected() == 0 {
        return Err(KeyError::NotFound);
    }
    Ok(())
}

/// Resolve a full-access secret to its owning identity.
///
/// A well-formed secret is necessary but not sufficient; the record must
/// exist in the store before full-identity privilege is granted.
pub async fn resolve_full(pool: &PgPool, secret: &str) -> Result<Option<Identity>, KeyError> {
    validate_secret(secret)?;
    let query = "SELECT users.sub FROM credentials \
                 JOIN users ON users.id = credentials.owner_id \
                 WHERE credentials.secret_hash = $1 AND credentials.kind = 'full'";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(secret_hash(secret))
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to resolve credential")?;
    let Some(row) = row else {
        return Ok(None);
    };
    let sub: String = row.try_get("sub").context("failed to decode owner")?;
    Ok(by_sub(pool, &sub).await?)
}

/// Resolve a scoped secret to its record, by secret alone.
///
/// No owner filter on purpose: a scoped key is a shareable bearer
/// capability, valid for whoever presents it, limited to its allow-list.
pub async fn resolve_scoped(pool: &PgPool, secret: &str) -> Result<Option<Credential>, KeyError> {
    validate_secret(secret)?;
    let query = "SELECT id, owner_id, kind, links, created_at FROM credentials \
                 WHERE secret_hash = $1 AND kind = 'scoped'";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(secret_hash(secret))
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to resolve credential")?;
    row.map(|row| credential_from_row(&row).context("failed to decode credential"))
        .transpose()
        .map_err(KeyError::from)
}
