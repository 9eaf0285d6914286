//! The job: the persistent, primary entity driven through the pipeline stages

use chrono::prelude::*;
use std::fmt;
use uuid::Uuid;

use crate::models::helpers::{PageOpts, Value};

/// The state machine a job moves through (spec §4.9)
///
/// ```text
/// pending -> downloading -> tagging -> uploading -> completed
///                                                 -> merged
/// any non-terminal -> paused -> pending (on resume)
/// any non-terminal -> stopped -> pending (on resume)
/// any non-terminal -> failed  (terminal unless retry-scheduled)
/// terminal states never transition
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "trace", derive(valuable::Valuable))]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub enum JobStatus {
    Pending,
    Downloading,
    Tagging,
    Uploading,
    Completed,
    Merged,
    Failed,
    Paused,
    Stopped,
}

impl JobStatus {
    /// Whether this status is terminal — a job here is never reclaimed or transitioned
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Merged | JobStatus::Failed)
    }

    /// Whether `pause` is a legal transition from this status
    #[must_use]
    pub fn can_pause(self) -> bool {
        matches!(
            self,
            JobStatus::Downloading | JobStatus::Tagging | JobStatus::Uploading
        )
    }

    /// Whether `stop` is a legal transition from this status
    #[must_use]
    pub fn can_stop(self) -> bool {
        !self.is_terminal()
    }

    /// Whether `resume` is a legal transition from this status
    #[must_use]
    pub fn can_resume(self) -> bool {
        matches!(self, JobStatus::Paused | JobStatus::Stopped)
    }

    /// Whether `retry` is a legal transition from this status
    #[must_use]
    pub fn can_retry(self) -> bool {
        matches!(self, JobStatus::Failed)
    }

    /// The progress percentage milestone published when a job enters this status (spec §4.9)
    #[must_use]
    pub fn progress(self) -> Option<u8> {
        match self {
            JobStatus::Downloading => Some(25),
            JobStatus::Tagging => Some(50),
            JobStatus::Uploading => Some(75),
            JobStatus::Completed | JobStatus::Merged => Some(100),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Tagging => "tagging",
            JobStatus::Uploading => "uploading",
            JobStatus::Completed => "completed",
            JobStatus::Merged => "merged",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
            JobStatus::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// What kind of input a job was created from
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub enum JobType {
    /// Ingest a remote URL via the site handler registry + extractor
    Url,
    /// Ingest a file the caller uploaded directly
    File,
    /// Re-tag a post that already exists on the Booru
    TagExisting,
}

/// The safety rating applied to an uploaded/merged post
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub enum Safety {
    Safe,
    Sketchy,
    Unsafe,
}

impl Default for Safety {
    fn default() -> Self {
        Safety::Unsafe
    }
}

impl fmt::Display for Safety {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Safety::Safe => "safe",
            Safety::Sketchy => "sketchy",
            Safety::Unsafe => "unsafe",
        };
        write!(f, "{name}")
    }
}

/// The persistent job row (spec §3)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub job_type: JobType,
    pub url: Option<String>,
    pub original_filename: Option<String>,
    pub source_override: Option<String>,
    /// Caller-supplied tags, possibly with `category:name` prefixes, stored as JSON
    #[sqlx(json)]
    pub initial_tags: Vec<String>,
    pub safety: Safety,
    pub skip_tagging: bool,
    /// The downstream Booru user this job uploads as (tenancy key)
    pub owner: String,
    pub target_post_id: Option<i64>,
    pub szuru_post_id: Option<i64>,
    #[sqlx(json)]
    pub related_post_ids: Vec<i64>,
    pub was_merge: bool,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(json)]
    pub tags_applied: Vec<String>,
    #[sqlx(json)]
    pub tags_from_source: Vec<String>,
    #[sqlx(json)]
    pub tags_from_ai: Vec<String>,
}

impl Job {
    /// Whether `related_post_ids` satisfies the self-relation exclusion invariant (spec §8.3)
    #[must_use]
    pub fn upholds_self_relation_exclusion(&self) -> bool {
        match self.szuru_post_id {
            Some(primary) => !self.related_post_ids.contains(&primary),
            None => true,
        }
    }
}

/// The request body to create a URL-based job
#[derive(Debug, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct JobUrlCreate {
    pub url: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub safety: Option<Safety>,
    #[serde(default)]
    pub skip_tagging: bool,
}

/// The (non-file) fields accompanying a multipart file-job upload
#[derive(Debug, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct JobFileCreate {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub safety: Option<Safety>,
    #[serde(default)]
    pub skip_tagging: bool,
}

/// What the Job Store needs to insert a new row (spec §4.1 `create`)
#[derive(Debug, Clone)]
pub struct JobDraft {
    pub job_type: JobType,
    pub url: Option<String>,
    pub original_filename: Option<String>,
    pub source_override: Option<String>,
    pub initial_tags: Vec<String>,
    pub safety: Safety,
    pub skip_tagging: bool,
    pub owner: String,
    pub target_post_id: Option<i64>,
}

/// A page of jobs plus the total matching row count, for `GET /jobs`
#[derive(Debug, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct JobList {
    pub jobs: Vec<Job>,
    pub total: i64,
}

/// Filter/pagination params for `GET /jobs`
#[derive(Debug, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::IntoParams))]
pub struct JobListOpts {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub was_merge: Option<bool>,
    #[serde(flatten)]
    pub page: PageOpts,
}

/// A single-job control action, dispatched from `POST /jobs/{id}/{action}`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub enum JobAction {
    Start,
    Pause,
    Stop,
    Resume,
    Retry,
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            JobAction::Start => "start",
            JobAction::Pause => "pause",
            JobAction::Stop => "stop",
            JobAction::Resume => "resume",
            JobAction::Retry => "retry",
        };
        write!(f, "{name}")
    }
}

/// A bulk control action, dispatched from `POST /jobs/bulk/{action}` (spec §4.10 "Bulk
/// variants"). A superset of [`JobAction`]: bulk control additionally accepts `delete`,
/// which the single-job surface exposes through its own `DELETE /jobs/{id}` route instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub enum BulkAction {
    Start,
    Pause,
    Stop,
    Resume,
    Retry,
    Delete,
}

impl BulkAction {
    /// The equivalent [`JobAction`], if this bulk action goes through the state machine
    /// rather than the separate delete path
    #[must_use]
    pub fn as_job_action(self) -> Option<JobAction> {
        match self {
            BulkAction::Start => Some(JobAction::Start),
            BulkAction::Pause => Some(JobAction::Pause),
            BulkAction::Stop => Some(JobAction::Stop),
            BulkAction::Resume => Some(JobAction::Resume),
            BulkAction::Retry => Some(JobAction::Retry),
            BulkAction::Delete => None,
        }
    }
}

impl fmt::Display for BulkAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            BulkAction::Start => "start",
            BulkAction::Pause => "pause",
            BulkAction::Stop => "stop",
            BulkAction::Resume => "resume",
            BulkAction::Retry => "retry",
            BulkAction::Delete => "delete",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for BulkAction {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "start" => Ok(BulkAction::Start),
            "pause" => Ok(BulkAction::Pause),
            "stop" => Ok(BulkAction::Stop),
            "resume" => Ok(BulkAction::Resume),
            "retry" => Ok(BulkAction::Retry),
            "delete" => Ok(BulkAction::Delete),
            _ => Err(()),
        }
    }
}

/// The body of a `POST /jobs/bulk/{action}` request
#[derive(Debug, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct BulkJobRequest {
    pub job_ids: Vec<Uuid>,
}

/// The Redis list the `event-handler` binary blocks on to pop bulk control tasks
/// (spec §4.10 "enqueue work to an in-process background task")
pub const BULK_TASK_QUEUE: &str = "bulk_control_tasks";

/// One bulk control task as pushed onto the Redis bulk-task queue (spec §4.10 "enqueue
/// work to an in-process background task"); popped and executed by the `event-handler`
/// binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkTask {
    pub action: BulkAction,
    pub job_ids: Vec<Uuid>,
    pub owner: String,
    pub is_admin: bool,
}

/// The 202-accepted response body for a bulk control request
#[derive(Debug, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct BulkJobAccepted {
    pub accepted: Vec<Uuid>,
}

/// One raw media item produced by the Extractor (spec §3 `ExtractedMedia`); ephemeral,
/// never persisted.
#[derive(Debug, Clone, Default)]
pub struct ExtractedMedia {
    pub page_url: String,
    pub direct_url: String,
    pub suggested_filename: Option<String>,
    pub metadata: Value,
}

/// The body of `POST /tag-jobs/discover`
#[derive(Debug, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct DiscoverRequest {
    pub tag: String,
    #[serde(default)]
    pub min_count: Option<u32>,
}

/// The response of `POST /tag-jobs/discover`
#[derive(Debug, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct DiscoverResponse {
    pub created_job_ids: Vec<Uuid>,
}
