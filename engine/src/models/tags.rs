//! The Tag Cache's entries — a local record of a tag's known category on the Booru

use chrono::prelude::*;

/// One cached tag, mirroring the Booru's belief about that tag's category (spec §3/§4.2)
///
/// Entries are considered stale after `ttl_days` (default 30, see
/// [`crate::conf::TagCacheSettings`]) and re-verified against the Booru on next use.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct TagCacheEntry {
    pub name: String,
    pub category: String,
    pub verified_at: DateTime<Utc>,
}

impl TagCacheEntry {
    /// Whether this entry is older than `ttl_days` and should be re-verified
    #[must_use]
    pub fn is_stale(&self, ttl_days: i64, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.verified_at) > chrono::Duration::days(ttl_days)
    }
}
