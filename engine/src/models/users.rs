//! Per-user credentials: the downstream Booru account and site logins a job uploads/extracts as

use chrono::prelude::*;

/// The Booru account a user's jobs upload through (persisted encrypted at rest)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct BooruCredentials {
    pub owner: String,
    pub base_url: String,
    pub username: String,
    /// Encrypted with the engine's `encryption_key`; never serialized back out over the API
    #[serde(skip_serializing)]
    pub encrypted_token: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

/// A per-site credential set (cookies, login tokens) a handler may need to extract/download
/// from a gated site
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct SiteCredentials {
    pub owner: String,
    pub site: String,
    #[serde(skip_serializing)]
    pub encrypted_secret: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

/// The decrypted credential bundle loaded once at job start and threaded through that job's
/// stages as an explicit argument (never stashed in a task-local — the worker pool runs many
/// owners' jobs concurrently, so there is no single "current user" to be ambient about).
#[derive(Debug, Clone)]
pub struct UserConfig {
    pub owner: String,
    pub booru: crate::client::BooruCreds,
    /// Decrypted per-site secrets, keyed by site handler name
    pub site_secrets: std::collections::HashMap<String, String>,
}
