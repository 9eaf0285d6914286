//! Global settings shared across the deployment, runtime-mutable via the settings API
//!
//! These start from the bootstrap [`crate::conf::Conf`] defaults but are then owned by the
//! database — operators may tune category mappings, tagger thresholds, or worker concurrency
//! without a redeploy (spec §6 "all else runtime-mutable via settings API").

use std::collections::HashMap;

/// Settings read fresh at the start of every job, separate from the bootstrap [`crate::conf::Conf`]
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct GlobalSettings {
    pub tag_cache_ttl_days: i64,
    pub ensure_batch_parallelism: i64,
    pub wd14_enabled: bool,
    pub wd14_confidence_threshold: f64,
    pub wd14_max_tags: i64,
    pub scene_threshold: f64,
    pub max_frames: i64,
    pub min_frame_ratio: f64,
    pub worker_concurrency: i64,
    pub max_retries: i64,
    pub retry_delay_seconds: i64,
    pub direct_download_cap_bytes: i64,
    /// Source metadata key (e.g. `artist`, `copyright`) to Booru tag category
    #[sqlx(json)]
    pub category_map: HashMap<String, String>,
}

impl GlobalSettings {
    /// Seed global settings from the bootstrap configuration, for first-run initialization
    #[must_use]
    pub fn from_conf(conf: &crate::conf::Conf) -> Self {
        GlobalSettings {
            tag_cache_ttl_days: conf.tag_cache.ttl_days,
            ensure_batch_parallelism: conf.tag_cache.ensure_batch_parallelism as i64,
            wd14_enabled: conf.tagger.wd14_enabled,
            wd14_confidence_threshold: conf.tagger.wd14_confidence_threshold as f64,
            wd14_max_tags: conf.tagger.wd14_max_tags as i64,
            scene_threshold: conf.tagger.scene_threshold as f64,
            max_frames: conf.tagger.max_frames as i64,
            min_frame_ratio: conf.tagger.min_frame_ratio as f64,
            worker_concurrency: conf.worker.concurrency as i64,
            max_retries: conf.worker.max_retries as i64,
            retry_delay_seconds: conf.worker.retry_delay_seconds as i64,
            direct_download_cap_bytes: conf.direct_download_cap_bytes as i64,
            category_map: conf.category_map.clone(),
        }
    }
}

/// A partial update to [`GlobalSettings`], applied via the settings API
#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct GlobalSettingsUpdate {
    #[serde(default)]
    pub tag_cache_ttl_days: Option<i64>,
    #[serde(default)]
    pub ensure_batch_parallelism: Option<i64>,
    #[serde(default)]
    pub wd14_enabled: Option<bool>,
    #[serde(default)]
    pub wd14_confidence_threshold: Option<f64>,
    #[serde(default)]
    pub wd14_max_tags: Option<i64>,
    #[serde(default)]
    pub scene_threshold: Option<f64>,
    #[serde(default)]
    pub max_frames: Option<i64>,
    #[serde(default)]
    pub min_frame_ratio: Option<f64>,
    #[serde(default)]
    pub worker_concurrency: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub retry_delay_seconds: Option<i64>,
    #[serde(default)]
    pub direct_download_cap_bytes: Option<i64>,
    #[serde(default)]
    pub category_map: Option<HashMap<String, String>>,
}
