//! Global settings persistence (spec §3 `GlobalConfig`, §6 settings API). A single row,
//! seeded from [`crate::conf::Conf`] on first boot, that operators can then tune without
//! a redeploy.

use tracing::instrument;

use crate::models::{GlobalSettings, GlobalSettingsUpdate};
use crate::utils::{ApiError, Shared};

/// Create the singleton settings row from the bootstrap config if it doesn't exist yet
#[instrument(name = "backends::system::ensure_seeded", skip(shared), err(Debug))]
pub async fn ensure_seeded(shared: &Shared) -> Result<(), ApiError> {
    let seed = GlobalSettings::from_conf(&shared.config);
    sqlx::query(
        "INSERT INTO global_settings (
            id, tag_cache_ttl_days, ensure_batch_parallelism, wd14_enabled,
            wd14_confidence_threshold, wd14_max_tags, scene_threshold, max_frames,
            min_frame_ratio, worker_concurrency, max_retries, retry_delay_seconds,
            direct_download_cap_bytes, category_map
        ) VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (id) DO NOTHING",
    )
    .bind(seed.tag_cache_ttl_days)
    .bind(seed.ensure_batch_parallelism)
    .bind(seed.wd14_enabled)
    .bind(seed.wd14_confidence_threshold)
    .bind(seed.wd14_max_tags)
    .bind(seed.scene_threshold)
    .bind(seed.max_frames)
    .bind(seed.min_frame_ratio)
    .bind(seed.worker_concurrency)
    .bind(seed.max_retries)
    .bind(seed.retry_delay_seconds)
    .bind(seed.direct_download_cap_bytes)
    .bind(serde_json::to_value(&seed.category_map)?)
    .execute(&shared.db)
    .await?;
    Ok(())
}

/// Read the current global settings
#[instrument(name = "backends::system::get", skip(shared), err(Debug))]
pub async fn get(shared: &Shared) -> Result<GlobalSettings, ApiError> {
    let row = sqlx::query_as::<_, GlobalSettings>(
        "SELECT tag_cache_ttl_days, ensure_batch_parallelism, wd14_enabled,
            wd14_confidence_threshold, wd14_max_tags, scene_threshold, max_frames,
            min_frame_ratio, worker_concurrency, max_retries, retry_delay_seconds,
            direct_download_cap_bytes, category_map
         FROM global_settings WHERE id = 1",
    )
    .fetch_optional(&shared.db)
    .await?;
    match row {
        Some(row) => Ok(row),
        None => Ok(GlobalSettings::from_conf(&shared.config)),
    }
}

/// Apply a partial update to the global settings (spec §6 "runtime-mutable via settings API")
#[instrument(name = "backends::system::update", skip(shared), err(Debug))]
pub async fn update(
    patch: GlobalSettingsUpdate,
    shared: &Shared,
) -> Result<GlobalSettings, ApiError> {
    let mut current = get(shared).await?;
    if let Some(v) = patch.tag_cache_ttl_days {
        current.tag_cache_ttl_days = v;
    }
    if let Some(v) = patch.ensure_batch_parallelism {
        // spec §4.2 `ensure_batch`: "bounded parallelism (≤ 10)" is a hard cap on the tag
        // cache's concurrency invariant, not just a tunable default, so an operator can
        // never PATCH past it.
        current.ensure_batch_parallelism = v.min(10);
    }
    if let Some(v) = patch.wd14_enabled {
        current.wd14_enabled = v;
    }
    if let Some(v) = patch.wd14_confidence_threshold {
        current.wd14_confidence_threshold = v;
    }
    if let Some(v) = patch.wd14_max_tags {
        current.wd14_max_tags = v;
    }
    if let Some(v) = patch.scene_threshold {
        current.scene_threshold = v;
    }
    if let Some(v) = patch.max_frames {
        current.max_frames = v;
    }
    if let Some(v) = patch.min_frame_ratio {
        current.min_frame_ratio = v;
    }
    if let Some(v) = patch.worker_concurrency {
        current.worker_concurrency = v;
    }
    if let Some(v) = patch.max_retries {
        current.max_retries = v;
    }
    if let Some(v) = patch.retry_delay_seconds {
        current.retry_delay_seconds = v;
    }
    if let Some(v) = patch.direct_download_cap_bytes {
        current.direct_download_cap_bytes = v;
    }
    if let Some(v) = patch.category_map {
        current.category_map = v;
    }
    sqlx::query(
        "UPDATE global_settings SET
            tag_cache_ttl_days = $1, ensure_batch_parallelism = $2, wd14_enabled = $3,
            wd14_confidence_threshold = $4, wd14_max_tags = $5, scene_threshold = $6,
            max_frames = $7, min_frame_ratio = $8, worker_concurrency = $9, max_retries = $10,
            retry_delay_seconds = $11, direct_download_cap_bytes = $12, category_map = $13
         WHERE id = 1",
    )
    .bind(current.tag_cache_ttl_days)
    .bind(current.ensure_batch_parallelism)
    .bind(current.wd14_enabled)
    .bind(current.wd14_confidence_threshold)
    .bind(current.wd14_max_tags)
    .bind(current.scene_threshold)
    .bind(current.max_frames)
    .bind(current.min_frame_ratio)
    .bind(current.worker_concurrency)
    .bind(current.max_retries)
    .bind(current.retry_delay_seconds)
    .bind(current.direct_download_cap_bytes)
    .bind(serde_json::to_value(&current.category_map)?)
    .execute(&shared.db)
    .await?;
    Ok(current)
}
