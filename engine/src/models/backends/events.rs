//! The Event Bus (spec §4.3): a single Redis pub/sub topic, `job_updates`, carrying
//! every [`JobEvent`] published by the worker pool. There is no replay buffer and no
//! persistence — a subscriber only sees events published while it is connected, which
//! is why the SSE route (spec §6) sends a periodic heartbeat rather than relying on
//! the bus itself to signal liveness.

use futures_util::StreamExt;
use redis::AsyncCommands;
use tracing::instrument;

use crate::models::JobEvent;
use crate::utils::{ApiError, Shared};

/// The single topic every job update is published to
pub const TOPIC: &str = "job_updates";

/// Publish a job event onto the bus. Best-effort: a publish with no subscribers
/// connected simply has no effect (spec §4.3 "no replay").
#[instrument(name = "backends::events::publish", skip(shared), err(Debug))]
pub async fn publish(event: &JobEvent, shared: &Shared) -> Result<(), ApiError> {
    let payload = serde_json::to_string(event)?;
    let mut conn = shared.redis.get().await?;
    let _: () = conn.publish(TOPIC, payload).await?;
    Ok(())
}

/// Open a dedicated subscription to the `job_updates` topic.
///
/// Pub/sub connections are long-lived and aren't fungible the way a normal query
/// connection is, so this opens its own connection outside the shared pool rather than
/// checking one out of it (a subscribed connection can't serve any other command).
#[instrument(name = "backends::events::subscribe", skip(shared), err(Debug))]
pub async fn subscribe(
    shared: &Shared,
) -> Result<impl futures_util::Stream<Item = JobEvent>, ApiError> {
    let client = redis::Client::open(shared.config.redis.url.clone())?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(TOPIC).await?;
    let stream = pubsub.into_on_message().filter_map(|msg| async move {
        let payload: String = msg.get_payload().ok()?;
        match serde_json::from_str::<JobEvent>(&payload) {
            Ok(event) => Some(event),
            Err(error) => {
                tracing::warn!(%error, "dropping malformed job event from event bus");
                None
            }
        }
    });
    Ok(stream)
}
