//! Helpers for tests that need a live Postgres.
//!
//! These back the `#[ignore]`d store tests. Point `CUSTODIA_TEST_DSN` at a
//! scratch database and run `cargo test -- --ignored`; migrations are applied
//! on connect and rows are keyed by fresh UUIDs, so reruns do not collide.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::account::store::{create_password_identity, RegisterOutcome};
use crate::account::Identity;

pub async fn test_pool() -> PgPool {
    let dsn = std::env::var("CUSTODIA_TEST_DSN")
        .expect("CUSTODIA_TEST_DSN must point at a scratch database");
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&dsn)
        .await
        .expect("connect to test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    pool
}

/// Register a throwaway identity with a unique email.
pub async fn fresh_identity(pool: &PgPool) -> Identity {
    let email = format!("{}@test.invalid", Uuid::new_v4());
    match create_password_identity(pool, &email, "unused-phc-hash")
        .await
        .expect("create identity")
    {
        RegisterOutcome::Created(identity) => identity,
        other => panic!("fresh email collided: {other:?}"),
    }
}
