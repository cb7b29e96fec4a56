//! HTTP surface: router wiring, shared state, and server startup.

pub mod handlers;
pub mod principal;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method, Request};
use axum::response::Json;
use axum::routing::{get, post, put};
use axum::{Extension, Router};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::PropagateRequestIdLayer;
use tower_http::set_header::SetRequestHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, Span};
use url::Url;
use utoipa::OpenApi;
use uuid::Uuid;

use crate::challenge::ChallengeAuthenticator;
use crate::cookie::SessionCookieCodec;
use crate::keyset::KeySetManager;
use crate::token::TokenService;

/// Everything handlers need, shared behind one `Arc`.
pub struct AppState {
    pub pool: PgPool,
    pub keys: Arc<KeySetManager>,
    pub tokens: TokenService,
    pub cookies: SessionCookieCodec,
    pub challenges: ChallengeAuthenticator,
    pub max_keys_per_owner: i64,
}

/// Server configuration, resolved by the CLI.
pub struct ServerConfig {
    pub port: u16,
    pub dsn: String,
    pub jwks_path: String,
    pub portal_url: String,
    pub cookie_domain: String,
    pub cookie_hash_key: SecretString,
    pub cookie_encryption_key: SecretString,
    pub token_ttl_seconds: i64,
    pub max_keys_per_owner: i64,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::jwks::jwks,
        handlers::jwks::reload,
        handlers::auth::login,
        handlers::auth::signup,
        handlers::auth::logout,
        handlers::auth::challenge,
        handlers::auth::verify,
        handlers::user::info,
        handlers::user::limits,
        handlers::user::tiers,
        handlers::credentials::list,
        handlers::credentials::create_full,
        handlers::credentials::create_scoped,
        handlers::credentials::update,
        handlers::credentials::patch,
        handlers::credentials::delete,
        handlers::track::upload,
        handlers::track::download,
    ),
    info(title = "custodia", description = "Accounts and credential authority")
)]
struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Build the application router over shared state.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/health",
            get(handlers::health::health).options(handlers::health::health),
        )
        .route("/.well-known/jwks.json", get(handlers::jwks::jwks))
        .route("/admin/keys/reload", post(handlers::jwks::reload))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/signup", post(handlers::auth::signup))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/challenge", post(handlers::auth::challenge))
        .route("/auth/verify", post(handlers::auth::verify))
        .route("/limits", get(handlers::user::tiers))
        .route("/user", get(handlers::user::info))
        .route("/user/limits", get(handlers::user::limits))
        .route("/user/keys", get(handlers::credentials::list))
        .route("/user/keys/full", post(handlers::credentials::create_full))
        .route(
            "/user/keys/scoped",
            post(handlers::credentials::create_scoped),
        )
        .route(
            "/user/keys/:id",
            put(handlers::credentials::update)
                .patch(handlers::credentials::patch)
                .delete(handlers::credentials::delete),
        )
        .route("/track/upload", post(handlers::track::upload))
        .route("/track/download", post(handlers::track::download))
        .route("/openapi.json", get(openapi_json))
        .layer(Extension(state))
}

/// Start the server.
///
/// # Errors
///
/// Returns an error when the key set, database, or listener fail to come up.
pub async fn new(config: ServerConfig) -> Result<()> {
    let keys = Arc::new(KeySetManager::load(&config.jwks_path).with_context(|| {
        format!("Failed to load key set from {}", config.jwks_path)
    })?);

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&config.dsn)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let tokens = TokenService::new(
        Arc::clone(&keys),
        config.portal_url.clone(),
        config.token_ttl_seconds,
    );
    let cookies = SessionCookieCodec::new(
        config.cookie_hash_key.expose_secret().as_bytes(),
        config.cookie_encryption_key.expose_secret().as_bytes(),
        config.cookie_domain.clone(),
    )
    .context("Failed to build cookie codec")?;
    let challenges = ChallengeAuthenticator::new(pool.clone());

    let state = Arc::new(AppState {
        pool,
        keys,
        tokens,
        cookies,
        challenges,
        max_keys_per_owner: config.max_keys_per_owner,
    });

    let portal_origin = portal_origin(&config.portal_url)?;
    let cors = CorsLayer::new()
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static(principal::API_KEY_HEADER),
        ])
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_origin(AllowOrigin::exact(portal_origin))
        .allow_credentials(true);

    let app = router(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Uuid::new_v4().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors),
    );

    let listener = TcpListener::bind(format!("::0:{}", config.port)).await?;

    info!("Listening on [::]:{}", config.port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn portal_origin(portal_url: &str) -> Result<HeaderValue> {
    let parsed =
        Url::parse(portal_url).with_context(|| format!("Invalid portal URL: {portal_url}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("Portal URL must include a valid host: {portal_url}"))?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build portal origin header")
}
