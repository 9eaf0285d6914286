//! Identification, health, and version routes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tracing::{event, instrument, Level};
use utoipa::OpenApi;

use crate::utils::{AppState, Shared};

use super::docs::OpenApiSecurity;

/// The engine's build/runtime version information
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct Version {
    pub name: &'static str,
    pub version: &'static str,
}

impl Version {
    fn current() -> Self {
        Version {
            name: "ingest-engine",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Identify this API
#[utoipa::path(
    get,
    path = "/api/",
    responses(
        (status = 200, description = "Identify this API", body = String, example = json!("ingest-engine")),
    )
)]
#[instrument(name = "routes::basic::identify", skip_all)]
pub async fn identify() -> &'static str {
    "ingest-engine"
}

/// Whether the job store and event bus are both reachable
async fn is_healthy(shared: &Shared) -> bool {
    let db_ok = sqlx::query("SELECT 1").execute(&shared.db).await.is_ok();
    let redis_ok = shared.redis.get().await.is_ok();
    db_ok && redis_ok
}

/// Report whether the engine's dependencies (job store, event bus) are reachable
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 204, description = "The engine is healthy"),
        (status = 503, description = "The engine is unhealthy"),
    )
)]
#[instrument(name = "routes::basic::health", skip_all)]
pub async fn health(State(state): State<AppState>) -> StatusCode {
    let healthy = is_healthy(&state.shared).await;
    event!(Level::INFO, healthy);
    if healthy {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Return the engine's version
#[utoipa::path(
    get,
    path = "/api/version",
    responses(
        (status = 200, description = "The engine's current version", body = Version),
    )
)]
#[instrument(name = "routes::basic::version", skip_all)]
pub async fn version() -> Json<Version> {
    Json(Version::current())
}

/// The OpenAPI docs for these routes
#[derive(OpenApi)]
#[openapi(
    paths(identify, health, version),
    components(schemas(Version)),
    modifiers(&OpenApiSecurity),
)]
pub struct BasicApiDocs;

/// Add the identification/health/version routes to the router
pub fn mount(router: Router<AppState>) -> Router<AppState> {
    router
        .route("/api/", get(identify))
        .route("/api/version", get(version))
        .route("/api/health", get(health))
}
