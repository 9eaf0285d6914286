//! The Server-Sent Events stream of job updates (spec §4.3/§6). There is no replay: a
//! client only sees events published after it connects.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{Stream, StreamExt};
use tracing::instrument;
use utoipa::OpenApi;

use crate::models::backends::events as event_bus;
use crate::utils::{ApiError, AppState};

/// How often a `:heartbeat` comment is sent to idle-but-connected clients (spec §6)
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Stream every `job_update` event as it is published
#[utoipa::path(
    get,
    path = "/api/events",
    responses(
        (status = 200, description = "A Server-Sent Events stream of job updates"),
    )
)]
#[instrument(name = "routes::events::stream", skip(state), err(Debug))]
pub async fn stream(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let updates = event_bus::subscribe(&state.shared).await?.map(|event| {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().event("job_update").data(payload))
    });
    Ok(Sse::new(updates).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    ))
}

/// The OpenAPI docs for these routes
#[derive(OpenApi)]
#[openapi(paths(stream))]
pub struct EventApiDocs;

/// Mount the event stream route
pub fn mount(router: Router<AppState>) -> Router<AppState> {
    router.route("/api/events", get(stream))
}
