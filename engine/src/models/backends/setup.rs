//! Idempotent schema setup, run once at boot before anything else touches the pool.
//!
//! `CREATE TABLE IF NOT EXISTS` run inline at startup rather than a separate
//! migration-file toolchain (see `DESIGN.md` for the grounding behind this shape).

use tracing::instrument;

use crate::utils::{ApiError, Shared};

/// Create every table this crate's backends read and write, if it doesn't already exist.
/// Safe to run on every boot of every binary (`engine`, `worker`, `event-handler`) against
/// a pool pointed at the same database.
#[instrument(name = "backends::setup::run", skip_all, err(Debug))]
pub async fn run(shared: &Shared) -> Result<(), ApiError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            status TEXT NOT NULL,
            job_type TEXT NOT NULL,
            url TEXT,
            original_filename TEXT,
            source_override TEXT,
            initial_tags JSONB NOT NULL DEFAULT '[]',
            safety TEXT NOT NULL,
            skip_tagging BOOLEAN NOT NULL DEFAULT false,
            owner TEXT NOT NULL,
            target_post_id BIGINT,
            szuru_post_id BIGINT,
            related_post_ids JSONB NOT NULL DEFAULT '[]',
            was_merge BOOLEAN NOT NULL DEFAULT false,
            error_message TEXT,
            retry_count INT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            tags_applied JSONB NOT NULL DEFAULT '[]',
            tags_from_source JSONB NOT NULL DEFAULT '[]',
            tags_from_ai JSONB NOT NULL DEFAULT '[]'
        )",
    )
    .execute(&shared.db)
    .await?;
    // the claim read orders by created_at and the list endpoint filters by owner/status
    sqlx::query("CREATE INDEX IF NOT EXISTS jobs_pending_claim_idx ON jobs (created_at) WHERE status = 'pending'")
        .execute(&shared.db)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS jobs_owner_idx ON jobs (owner, status)")
        .execute(&shared.db)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tag_cache (
            name TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            verified_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(&shared.db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS global_settings (
            id INT PRIMARY KEY,
            tag_cache_ttl_days BIGINT NOT NULL,
            ensure_batch_parallelism BIGINT NOT NULL,
            wd14_enabled BOOLEAN NOT NULL,
            wd14_confidence_threshold DOUBLE PRECISION NOT NULL,
            wd14_max_tags BIGINT NOT NULL,
            scene_threshold DOUBLE PRECISION NOT NULL,
            max_frames BIGINT NOT NULL,
            min_frame_ratio DOUBLE PRECISION NOT NULL,
            worker_concurrency BIGINT NOT NULL,
            max_retries BIGINT NOT NULL,
            retry_delay_seconds BIGINT NOT NULL,
            direct_download_cap_bytes BIGINT NOT NULL,
            category_map JSONB NOT NULL DEFAULT '{}'
        )",
    )
    .execute(&shared.db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS booru_credentials (
            owner TEXT PRIMARY KEY,
            base_url TEXT NOT NULL,
            username TEXT NOT NULL,
            encrypted_token BYTEA NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(&shared.db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS site_credentials (
            owner TEXT NOT NULL,
            site TEXT NOT NULL,
            encrypted_secret BYTEA NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (owner, site)
        )",
    )
    .execute(&shared.db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(&shared.db)
    .await?;
    sqlx::query(
        "INSERT INTO schema_migrations (version) VALUES ('0001_initial')
         ON CONFLICT (version) DO NOTHING",
    )
    .execute(&shared.db)
    .await?;

    tracing::info!("schema setup complete");
    Ok(())
}
