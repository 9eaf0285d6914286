//! Events broadcast on the `job_updates` topic (spec §4.3/§6)

use chrono::prelude::*;
use std::fmt;
use uuid::Uuid;

use super::jobs::JobStatus;

/// The kind of job event being broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub enum JobEventKind {
    /// The job transitioned to a new status
    StatusChanged,
    /// The job made tagging/upload progress within its current status
    Progress,
    /// The job failed terminally
    Failed,
    /// A scheduled retry's delay elapsed and the job is back in `pending`
    RetryScheduled,
    /// The job (and its scratch directory) was deleted
    Deleted,
}

impl fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            JobEventKind::StatusChanged => "status_changed",
            JobEventKind::Progress => "progress",
            JobEventKind::Failed => "failed",
            JobEventKind::RetryScheduled => "retry_scheduled",
            JobEventKind::Deleted => "deleted",
        };
        write!(f, "{name}")
    }
}

/// One event published onto the `job_updates` topic; consumed by the SSE route and
/// fanned out to every connected client — there is no replay, a client that connects
/// late only sees events from that point on (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct JobEvent {
    pub job_id: Uuid,
    pub kind: JobEventKind,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries_exhausted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    /// Build a plain status-change event carrying this status's progress milestone, if any
    #[must_use]
    pub fn status_changed(job_id: Uuid, status: JobStatus, timestamp: DateTime<Utc>) -> Self {
        JobEvent {
            job_id,
            kind: JobEventKind::StatusChanged,
            status,
            progress: status.progress(),
            error: None,
            post_id: None,
            tags: Vec::new(),
            retries_exhausted: None,
            retry_count: None,
            timestamp,
        }
    }

    /// Build a terminal-failure event
    #[must_use]
    pub fn failed(job_id: Uuid, error: String, timestamp: DateTime<Utc>) -> Self {
        JobEvent {
            job_id,
            kind: JobEventKind::Failed,
            status: JobStatus::Failed,
            progress: None,
            error: Some(error),
            post_id: None,
            tags: Vec::new(),
            retries_exhausted: Some(true),
            retry_count: None,
            timestamp,
        }
    }

    /// Build a deletion event; `status` carries the job's last observed status purely for
    /// the payload's benefit, since the row no longer exists to re-query
    #[must_use]
    pub fn deleted(job_id: Uuid, last_status: JobStatus, timestamp: DateTime<Utc>) -> Self {
        JobEvent {
            job_id,
            kind: JobEventKind::Deleted,
            status: last_status,
            progress: None,
            error: None,
            post_id: None,
            tags: Vec::new(),
            retries_exhausted: None,
            retry_count: None,
            timestamp,
        }
    }
}
