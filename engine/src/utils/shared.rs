//! Shared objects handed to every request and worker: connection pools, the Booru
//! client, and the in-memory tier of the Tag Cache.

use axum::extract::FromRef;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::models::TagCacheEntry;
use crate::{conf::Conf, utils::ApiError};

/// Helps retry a fallible future a bounded number of times while the pool it depends on
/// is still coming up (e.g. Postgres/Redis not yet accepting connections on first boot)
macro_rules! retry {
    ($future:expr, $attempts:expr, $name:expr) => {{
        let mut attempt = 0;
        loop {
            match $future.await {
                Ok(value) => break value,
                Err(error) => {
                    attempt += 1;
                    if attempt >= $attempts {
                        panic!("{} failed after {} attempts: {:#?}", $name, $attempts, error);
                    }
                    tracing::warn!(attempt, error = %error, "{} not ready yet, retrying", $name);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }};
}

/// Everything shared across requests and, in the `worker`/`event-handler` binaries, across
/// the worker loop's jobs: the Job Store's connection pool, the Event Bus's pub/sub pool,
/// the Booru client, and the in-memory tier of the Tag Cache (spec §5 "shared-resource policy")
pub struct Shared {
    /// The engine's bootstrap configuration
    pub config: Conf,
    /// The Job Store / Tag Cache / Global Settings connection pool (Postgres)
    pub db: sqlx::PgPool,
    /// The Event Bus's pub/sub connection pool (Redis)
    pub redis: bb8_redis::bb8::Pool<bb8_redis::RedisConnectionManager>,
    /// The process-wide Booru client (spec §4.7 "a persistent connection pool is
    /// maintained process-wide")
    pub booru: crate::client::BooruClient,
    /// The in-memory tier of the Tag Cache, shared across workers (spec §4.2/§5);
    /// writes are last-writer-wins on `verified_at`, so a concurrent map is sufficient
    pub tag_cache: DashMap<String, TagCacheEntry>,
}

impl Shared {
    /// Build every shared connection pool and client from the bootstrap config
    ///
    /// # Arguments
    ///
    /// * `config` - The engine's bootstrap configuration
    pub async fn new(config: Conf) -> Self {
        tracing::info!(url = %redact(&config.database.url), "connecting to job store database");
        let db = retry!(
            sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.database.pool_size)
                .connect(&config.database.url),
            10,
            "job store database"
        );
        tracing::info!(url = %redact(&config.redis.url), "connecting to event bus redis");
        let manager = bb8_redis::RedisConnectionManager::new(config.redis.url.clone())
            .expect("invalid redis url");
        let redis = retry!(
            bb8_redis::bb8::Pool::builder()
                .max_size(config.redis.pool_size)
                .build(manager.clone()),
            10,
            "event bus redis"
        );
        let booru = crate::client::BooruClient::new(Duration::from_secs(
            config.booru.timeout_seconds,
        ))
        .expect("failed to build booru client");
        let tag_cache = DashMap::new();
        let shared = Shared {
            config,
            db,
            redis,
            booru,
            tag_cache,
        };
        if let Err(error) = crate::models::backends::setup::run(&shared).await {
            panic!("failed to set up database schema: {error:#?}");
        }
        if let Err(error) = crate::models::backends::system::ensure_seeded(&shared).await {
            tracing::warn!(%error, "failed to seed global settings");
        }
        if let Err(error) = crate::models::backends::tags::warm(&shared).await {
            tracing::warn!(%error, "failed to warm tag cache from the database");
        }
        shared
    }
}

/// Strip credentials out of a connection url before logging it
fn redact(url: &str) -> String {
    url::Url::parse(url)
        .map(|mut parsed| {
            let _ = parsed.set_password(None);
            let _ = parsed.set_username("");
            parsed.to_string()
        })
        .unwrap_or_else(|_| "<unparsable url>".to_string())
}

/// All of the global state handed to every axum handler
#[derive(Clone)]
pub struct AppState {
    /// The shared connection pools/clients, reference counted across requests
    pub shared: Arc<Shared>,
}

impl AppState {
    /// Wrap a [`Shared`] for use as axum state
    #[must_use]
    pub fn new(shared: Shared) -> Self {
        AppState {
            shared: Arc::new(shared),
        }
    }
}

impl FromRef<AppState> for Arc<Shared> {
    fn from_ref(state: &AppState) -> Self {
        state.shared.clone()
    }
}

/// Allow handlers/backends written against `ApiError` to surface a pool checkout failure
impl From<bb8_redis::bb8::RunError<bb8_redis::redis::RedisError>> for ApiError {
    fn from(error: bb8_redis::bb8::RunError<bb8_redis::redis::RedisError>) -> Self {
        crate::bad_internal!(format!("Redis pool error {error:#?}"))
    }
}
