//! The Job Store (spec §4.1): a Postgres-backed durable queue with atomic,
//! contention-free claim semantics via `SELECT ... FOR UPDATE SKIP LOCKED`.

use chrono::prelude::*;
use tracing::instrument;
use uuid::Uuid;

use crate::models::{Job, JobAction, JobDraft, JobList, JobListOpts, JobStatus};
use crate::utils::{ApiError, Shared};
use crate::{bad, not_found};

/// Insert a new job row in `pending` status
///
/// # Arguments
///
/// * `draft` - The fields supplied at job creation (spec §4.1 `create`)
/// * `shared` - Shared connection pools
#[instrument(name = "backends::jobs::create", skip_all, err(Debug))]
pub async fn create(draft: JobDraft, shared: &Shared) -> Result<Uuid, ApiError> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO jobs (
            id, status, job_type, url, original_filename, source_override, initial_tags,
            safety, skip_tagging, owner, target_post_id, szuru_post_id, related_post_ids,
            was_merge, error_message, retry_count, created_at, updated_at, tags_applied,
            tags_from_source, tags_from_ai
        ) VALUES (
            $1, 'pending', $2, $3, $4, $5, $6, $7, $8, $9, $10, NULL, '[]', false, NULL, 0,
            $11, $11, '[]', '[]', '[]'
        )",
    )
    .bind(id)
    .bind(draft.job_type)
    .bind(&draft.url)
    .bind(&draft.original_filename)
    .bind(&draft.source_override)
    .bind(serde_json::to_value(&draft.initial_tags)?)
    .bind(draft.safety)
    .bind(draft.skip_tagging)
    .bind(&draft.owner)
    .bind(draft.target_post_id)
    .bind(now)
    .execute(&shared.db)
    .await?;
    Ok(id)
}

/// Atomically claim the oldest pending job for this worker, skipping rows already
/// locked by a peer worker (spec §4.1 "claim + update to downloading is one transaction")
///
/// # Arguments
///
/// * `worker_id` - An identifying label for the claiming worker, used only for tracing
/// * `shared` - Shared connection pools
#[instrument(name = "backends::jobs::claim_next", skip(shared), err(Debug))]
pub async fn claim_next(worker_id: &str, shared: &Shared) -> Result<Option<Job>, ApiError> {
    let now = Utc::now();
    let claimed = sqlx::query_as::<_, Job>(
        "WITH claimed AS (
            SELECT id FROM jobs
            WHERE status = 'pending'
            ORDER BY created_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        UPDATE jobs
        SET status = 'downloading', updated_at = $1
        FROM claimed
        WHERE jobs.id = claimed.id
        RETURNING jobs.*",
    )
    .bind(now)
    .fetch_optional(&shared.db)
    .await?;
    if let Some(job) = &claimed {
        tracing::info!(worker_id, job_id = %job.id, "claimed job");
    }
    Ok(claimed)
}

/// Fetch a single job by id
#[instrument(name = "backends::jobs::get", skip(shared), err(Debug))]
pub async fn get(id: Uuid, shared: &Shared) -> Result<Job, ApiError> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(&shared.db)
        .await?;
    match job {
        Some(job) => Ok(job),
        None => not_found!(format!("job {id} not found")),
    }
}

/// A point-in-time read of a job's status, used for cooperative cancellation checks
/// between pipeline stages (spec §4.8 "Cooperative cancellation")
#[instrument(name = "backends::jobs::observe_status", skip(shared), err(Debug))]
pub async fn observe_status(id: Uuid, shared: &Shared) -> Result<JobStatus, ApiError> {
    let row: (JobStatus,) = sqlx::query_as("SELECT status FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(&shared.db)
        .await?
        .ok_or_else(|| crate::bad_internal!(format!("job {id} not found")))?;
    Ok(row.0)
}

/// Paginated, filtered job listing (spec §4.1 `list`)
#[instrument(name = "backends::jobs::list", skip(shared), err(Debug))]
pub async fn list(
    owner: &str,
    is_admin: bool,
    opts: &JobListOpts,
    shared: &Shared,
) -> Result<JobList, ApiError> {
    let owner_filter: Option<&str> = if is_admin { None } else { Some(owner) };
    let total: (i64,) = sqlx::query_as(
        "SELECT count(*) FROM jobs
         WHERE ($1::text IS NULL OR owner = $1)
           AND ($2::text IS NULL OR status = $2)
           AND ($3::bool IS NULL OR was_merge = $3)",
    )
    .bind(owner_filter)
    .bind(opts.status.map(|s| s.to_string()))
    .bind(opts.was_merge)
    .fetch_one(&shared.db)
    .await?;
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs
         WHERE ($1::text IS NULL OR owner = $1)
           AND ($2::text IS NULL OR status = $2)
           AND ($3::bool IS NULL OR was_merge = $3)
         ORDER BY created_at DESC
         LIMIT $4 OFFSET $5",
    )
    .bind(owner_filter)
    .bind(opts.status.map(|s| s.to_string()))
    .bind(opts.was_merge)
    .bind(i64::from(opts.page.limit))
    .bind(i64::from(opts.page.offset))
    .fetch_all(&shared.db)
    .await?;
    Ok(JobList {
        jobs,
        total: total.0,
    })
}

/// Delete a job row (the caller is responsible for removing its scratch directory first)
#[instrument(name = "backends::jobs::delete", skip(shared), err(Debug))]
pub async fn delete(id: Uuid, shared: &Shared) -> Result<(), ApiError> {
    sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(id)
        .execute(&shared.db)
        .await?;
    Ok(())
}

/// Advance a job into `downloading`/`tagging`/`uploading`, the non-terminal pipeline stages
/// (spec §4.9 "job state machine")
#[instrument(name = "backends::jobs::set_status", skip(shared), err(Debug))]
pub async fn set_status(id: Uuid, status: JobStatus, shared: &Shared) -> Result<(), ApiError> {
    sqlx::query("UPDATE jobs SET status = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(status)
        .bind(Utc::now())
        .execute(&shared.db)
        .await?;
    Ok(())
}

/// Record a terminal success: `completed` if uploaded fresh, `merged` if a duplicate was
/// found and updated instead (spec §4.8 step 6)
#[instrument(name = "backends::jobs::complete", skip_all, err(Debug))]
pub async fn complete(
    id: Uuid,
    was_merge: bool,
    szuru_post_id: i64,
    related_post_ids: &[i64],
    tags_applied: &[String],
    tags_from_source: &[String],
    tags_from_ai: &[String],
    shared: &Shared,
) -> Result<(), ApiError> {
    let status = if was_merge {
        JobStatus::Merged
    } else {
        JobStatus::Completed
    };
    sqlx::query(
        "UPDATE jobs SET
            status = $2, was_merge = $3, szuru_post_id = $4, related_post_ids = $5,
            tags_applied = $6, tags_from_source = $7, tags_from_ai = $8, updated_at = $9
         WHERE id = $1",
    )
    .bind(id)
    .bind(status)
    .bind(was_merge)
    .bind(szuru_post_id)
    .bind(serde_json::to_value(related_post_ids)?)
    .bind(serde_json::to_value(tags_applied)?)
    .bind(serde_json::to_value(tags_from_source)?)
    .bind(serde_json::to_value(tags_from_ai)?)
    .bind(Utc::now())
    .execute(&shared.db)
    .await?;
    Ok(())
}

/// Apply the retry policy's bookkeeping for an unexpected failure (spec §4.9 "Retry policy"):
/// bump `retry_count`, stash the truncated error message, and leave the job `failed`.
/// Returns the new `retry_count` so the caller can decide whether to schedule a requeue.
#[instrument(name = "backends::jobs::record_failure", skip(shared), err(Debug))]
pub async fn record_failure(
    id: Uuid,
    error_message: &str,
    shared: &Shared,
) -> Result<i32, ApiError> {
    let truncated = crate::utils::helpers::truncate_error_message(error_message);
    let row: (i32,) = sqlx::query_as(
        "UPDATE jobs SET
            status = 'failed', error_message = $2, retry_count = retry_count + 1, updated_at = $3
         WHERE id = $1
         RETURNING retry_count",
    )
    .bind(id)
    .bind(truncated)
    .bind(Utc::now())
    .fetch_one(&shared.db)
    .await?;
    Ok(row.0)
}

/// Requeue a failed job onto `pending` after its retry delay elapses, but only if nothing
/// else has touched it in the meantime (spec §8 invariant 7 "retry monotonicity")
///
/// # Arguments
///
/// * `id` - The job to requeue
/// * `expected_retry_count` - The `retry_count` observed when the retry was scheduled
#[instrument(name = "backends::jobs::requeue_after_delay", skip(shared), err(Debug))]
pub async fn requeue_after_delay(
    id: Uuid,
    expected_retry_count: i32,
    shared: &Shared,
) -> Result<bool, ApiError> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'pending', updated_at = $3
         WHERE id = $1 AND status = 'failed' AND retry_count = $2",
    )
    .bind(id)
    .bind(expected_retry_count)
    .bind(Utc::now())
    .execute(&shared.db)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Dispatch a single-job control action (spec §4.10), enforcing both the state machine's
/// legal transitions and the caller's ownership.
///
/// # Arguments
///
/// * `id` - The job to act on
/// * `owner` - The caller's owner key
/// * `is_admin` - Whether the caller may bypass ownership checks
/// * `action` - The requested action
#[instrument(name = "backends::jobs::apply_action", skip(shared), err(Debug))]
pub async fn apply_action(
    id: Uuid,
    owner: &str,
    is_admin: bool,
    action: JobAction,
    shared: &Shared,
) -> Result<Job, ApiError> {
    let job = get(id, shared).await?;
    if !is_admin && job.owner != owner {
        return not_found!(format!("job {id} not found"));
    }
    let now = Utc::now();
    let updated = match action {
        // start is a no-op on the row; it only wakes the worker pool via an event (§4.10)
        JobAction::Start => job,
        JobAction::Pause => {
            if !job.status.can_pause() {
                return bad!(format!("cannot pause a job in status {}", job.status));
            }
            transition(id, JobStatus::Paused, now, shared).await?
        }
        JobAction::Stop => {
            if !job.status.can_stop() {
                return bad!(format!("cannot stop a job in status {}", job.status));
            }
            transition(id, JobStatus::Stopped, now, shared).await?
        }
        JobAction::Resume => {
            if !job.status.can_resume() {
                return bad!(format!("cannot resume a job in status {}", job.status));
            }
            transition(id, JobStatus::Pending, now, shared).await?
        }
        JobAction::Retry => {
            if !job.status.can_retry() {
                return bad!(format!("cannot retry a job in status {}", job.status));
            }
            sqlx::query(
                "UPDATE jobs SET status = 'pending', retry_count = 0, error_message = NULL,
                    updated_at = $2
                 WHERE id = $1",
            )
            .bind(id)
            .bind(now)
            .execute(&shared.db)
            .await?;
            get(id, shared).await?
        }
    };
    Ok(updated)
}

/// Apply a plain status transition and return the refreshed row
async fn transition(
    id: Uuid,
    status: JobStatus,
    now: DateTime<Utc>,
    shared: &Shared,
) -> Result<Job, ApiError> {
    sqlx::query("UPDATE jobs SET status = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(status)
        .bind(now)
        .execute(&shared.db)
        .await?;
    get(id, shared).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_relation_exclusion_holds_for_fresh_job() {
        let job = Job {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            job_type: crate::models::JobType::Url,
            url: None,
            original_filename: None,
            source_override: None,
            initial_tags: Vec::new(),
            safety: crate::models::Safety::Unsafe,
            skip_tagging: false,
            owner: "alice".to_string(),
            target_post_id: None,
            szuru_post_id: Some(5),
            related_post_ids: vec![6, 7],
            was_merge: false,
            error_message: None,
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            tags_applied: Vec::new(),
            tags_from_source: Vec::new(),
            tags_from_ai: Vec::new(),
        };
        assert!(job.upholds_self_relation_exclusion());
    }
}
