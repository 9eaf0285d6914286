//! The Tag Cache (spec §4.2): a two-tier cache in front of the Booru's own tag
//! category data, so the pipeline doesn't round-trip to the Booru for every tag on
//! every job. The in-memory tier ([`dashmap::DashMap`] on [`crate::utils::Shared`])
//! is checked first; the Postgres tier backs it across restarts; the Booru itself is
//! the source of truth and is only hit on a cache miss or a stale entry.

use chrono::prelude::*;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::instrument;

use crate::client::BooruCreds;
use crate::models::TagCacheEntry;
use crate::utils::{ApiError, Shared};

/// Load every cached tag from Postgres into the in-memory tier at startup
/// (spec §4.2 "warmed from the database at boot")
#[instrument(name = "backends::tags::warm", skip_all, err(Debug))]
pub async fn warm(shared: &Shared) -> Result<(), ApiError> {
    let rows = sqlx::query_as::<_, TagCacheEntry>("SELECT name, category, verified_at FROM tag_cache")
        .fetch_all(&shared.db)
        .await?;
    let count = rows.len();
    for row in rows {
        shared.tag_cache.insert(row.name.clone(), row);
    }
    tracing::info!(count, "warmed tag cache from database");
    Ok(())
}

/// Resolve a single tag's category, consulting the in-memory tier, then the database,
/// then the Booru itself, creating the tag on the Booru if it doesn't exist yet
/// (spec §4.2 `ensure`).
///
/// # Arguments
///
/// * `name` - The tag name, without any `category:` prefix
/// * `fallback_category` - The category to create the tag under if it doesn't exist yet
/// * `creds` - The Booru credentials to ensure the tag under
/// * `shared` - Shared connection pools / the in-memory tier
#[instrument(name = "backends::tags::ensure", skip(creds, shared), err(Debug))]
pub async fn ensure(
    name: &str,
    desired_category: &str,
    creds: &BooruCreds,
    shared: &Shared,
) -> Result<String, ApiError> {
    let now = Utc::now();
    let ttl_days = shared.config.tag_cache.ttl_days;
    // a fresh cache hit that already agrees with the caller's desired category needs no
    // remote call at all (spec §4.2 `ensure` step 1)
    if let Some(entry) = shared.tag_cache.get(name) {
        if !entry.is_stale(ttl_days, now) && entry.category == desired_category {
            return Ok(entry.category.clone());
        }
    }
    let category = resolve_against_booru(name, desired_category, creds, shared).await?;
    persist(name, &category, now, shared).await?;
    Ok(category)
}

/// Resolve many tags concurrently, bounded by `tag_cache.ensure_batch_parallelism`
/// (spec §4.2 `ensure_batch`)
#[instrument(name = "backends::tags::ensure_batch", skip(names, creds, shared), err(Debug))]
pub async fn ensure_batch(
    names: &[(String, String)],
    creds: &BooruCreds,
    shared: &Shared,
) -> Result<Vec<(String, String)>, ApiError> {
    let parallelism = shared.config.tag_cache.ensure_batch_parallelism.max(1);
    stream::iter(names.iter().cloned())
        .map(|(name, fallback_category)| {
            let creds = creds.clone();
            async move {
                let category = ensure(&name, &fallback_category, &creds, shared).await?;
                Ok::<(String, String), ApiError>((name, category))
            }
        })
        .buffer_unordered(parallelism)
        .try_collect()
        .await
}

/// Issue a remote create under `desired_category`; if the Booru reports the tag already
/// exists, fetch its current category and heal the mismatch with an optimistic-concurrency
/// PUT (spec §4.2 `ensure` step 2, exercised by scenario S5).
async fn resolve_against_booru(
    name: &str,
    desired_category: &str,
    creds: &BooruCreds,
    shared: &Shared,
) -> Result<String, ApiError> {
    match shared.booru.ensure_tag(creds, name, desired_category).await? {
        Some(tag) => Ok(tag.category),
        // tag already existed; fetch it and heal the category if it disagrees
        None => {
            let existing = shared.booru.get_tag(creds, name).await?;
            if existing.category == desired_category {
                Ok(existing.category)
            } else {
                let healed = shared
                    .booru
                    .update_tag_category(creds, name, existing.version, desired_category)
                    .await?;
                Ok(healed.category)
            }
        }
    }
}

/// Upsert the resolved category into both cache tiers
async fn persist(
    name: &str,
    category: &str,
    verified_at: DateTime<Utc>,
    shared: &Shared,
) -> Result<(), ApiError> {
    sqlx::query(
        "INSERT INTO tag_cache (name, category, verified_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (name) DO UPDATE SET category = $2, verified_at = $3",
    )
    .bind(name)
    .bind(category)
    .bind(verified_at)
    .execute(&shared.db)
    .await?;
    shared.tag_cache.insert(
        name.to_string(),
        TagCacheEntry {
            name: name.to_string(),
            category: category.to_string(),
            verified_at,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_is_not_stale() {
        let entry = TagCacheEntry {
            name: "blue_hair".to_string(),
            category: "general".to_string(),
            verified_at: Utc::now(),
        };
        assert!(!entry.is_stale(30, Utc::now()));
    }

    #[test]
    fn entry_past_ttl_is_stale() {
        let entry = TagCacheEntry {
            name: "blue_hair".to_string(),
            category: "general".to_string(),
            verified_at: Utc::now() - chrono::Duration::days(31),
        };
        assert!(entry.is_stale(30, Utc::now()));
    }
}
