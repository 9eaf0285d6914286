//! The settings API: every user-facing setting is runtime-mutable here without a
//! redeploy (spec §6).

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tracing::instrument;
use utoipa::OpenApi;

use crate::models::backends::system;
use crate::models::{GlobalSettings, GlobalSettingsUpdate};
use crate::utils::{ApiError, AppState};

use super::docs::OpenApiSecurity;

/// Read the current global settings
#[utoipa::path(
    get,
    path = "/api/system/settings",
    responses(
        (status = 200, description = "The current global settings", body = GlobalSettings),
    )
)]
#[instrument(name = "routes::system::get_settings", skip(state), err(Debug))]
pub async fn get_settings(State(state): State<AppState>) -> Result<Json<GlobalSettings>, ApiError> {
    Ok(Json(system::get(&state.shared).await?))
}

/// Apply a partial update to the global settings
#[utoipa::path(
    patch,
    path = "/api/system/settings",
    request_body = GlobalSettingsUpdate,
    responses(
        (status = 200, description = "The settings after the update was applied", body = GlobalSettings),
    )
)]
#[instrument(name = "routes::system::update_settings", skip(state, patch_body), err(Debug))]
pub async fn update_settings(
    State(state): State<AppState>,
    Json(patch_body): Json<GlobalSettingsUpdate>,
) -> Result<Json<GlobalSettings>, ApiError> {
    Ok(Json(system::update(patch_body, &state.shared).await?))
}

/// The OpenAPI docs for these routes
#[derive(OpenApi)]
#[openapi(
    paths(get_settings, update_settings),
    components(schemas(GlobalSettings, GlobalSettingsUpdate)),
    modifiers(&OpenApiSecurity),
)]
pub struct SystemApiDocs;

/// Mount the settings routes
pub fn mount(router: Router<AppState>) -> Router<AppState> {
    router.route(
        "/api/system/settings",
        get(get_settings).patch(update_settings),
    )
}
