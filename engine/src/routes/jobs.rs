//! The job control/query API and the single-job half of the Control Plane (spec §4.10/§6).
//! Bulk variants are accepted here and handed off to the `event-handler` binary, which
//! actually performs them and reports completion over the Event Bus.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use chrono::Utc;
use redis::AsyncCommands;
use tracing::instrument;
use utoipa::OpenApi;
use uuid::Uuid;

use crate::models::backends::{events, jobs as job_store, users};
use crate::models::{
    BulkAction, BulkJobAccepted, BulkJobRequest, BulkTask, DiscoverRequest, DiscoverResponse, Job,
    JobAction, JobDraft, JobEvent, JobFileCreate, JobList, JobListOpts, JobStatus, JobType,
    JobUrlCreate, Safety, BULK_TASK_QUEUE,
};
use crate::utils::{ApiError, AppState, Shared};
use crate::{bad, unauthorized};

use super::docs::OpenApiSecurity;

/// The caller's identity as asserted by the reverse proxy / auth layer in front of this
/// API. Full authentication is out of scope here (spec.md Non-goals): this extractor only
/// reads the two headers an upstream auth layer is expected to set, so the ownership
/// enforcement spec §4.10 requires has something concrete to check against.
pub struct CallerContext {
    pub owner: String,
    pub is_admin: bool,
}

#[async_trait]
impl<S> axum::extract::FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner = parts
            .headers
            .get("x-owner-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let Some(owner) = owner else {
            return unauthorized!("missing X-Owner-Key header".to_string());
        };
        let is_admin = parts
            .headers
            .get("x-admin")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Ok(CallerContext { owner, is_admin })
    }
}

/// Create a URL-based ingest job
#[utoipa::path(
    post,
    path = "/api/jobs",
    request_body = JobUrlCreate,
    responses(
        (status = 201, description = "The created job", body = Job),
        (status = 400, description = "The url failed site-handler validation"),
    )
)]
#[instrument(name = "routes::jobs::create_url", skip(state, req), err(Debug))]
pub async fn create_url(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(req): Json<JobUrlCreate>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    crate::utils::bounder::job_url(&req.url)?;
    for tag in &req.tags {
        crate::utils::bounder::tag_name(tag)?;
    }
    let draft = JobDraft {
        job_type: JobType::Url,
        url: Some(req.url),
        original_filename: None,
        source_override: req.source,
        initial_tags: req.tags,
        safety: req.safety.unwrap_or_default(),
        skip_tagging: req.skip_tagging,
        owner: caller.owner,
        target_post_id: None,
    };
    let id = job_store::create(draft, &state.shared).await?;
    let job = job_store::get(id, &state.shared).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Create a job from an uploaded file
#[utoipa::path(
    post,
    path = "/api/jobs/upload",
    responses(
        (status = 201, description = "The created job", body = Job),
        (status = 400, description = "No file part present in the multipart body"),
    )
)]
#[instrument(name = "routes::jobs::create_upload", skip(state, multipart), err(Debug))]
pub async fn create_upload(
    State(state): State<AppState>,
    caller: CallerContext,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let mut file_bytes: Option<bytes::Bytes> = None;
    let mut original_filename = None;
    let mut form = JobFileCreate {
        source: None,
        tags: Vec::new(),
        safety: None,
        skip_tagging: false,
    };
    while let Some(field) = multipart.next_field().await? {
        match field.name().unwrap_or_default() {
            "content" => {
                original_filename = field.file_name().map(str::to_string);
                file_bytes = Some(field.bytes().await?);
            }
            "metadata" => {
                let text = field.text().await?;
                form = serde_json::from_str(&text)?;
            }
            _ => {}
        }
    }
    let Some(bytes) = file_bytes else {
        return bad!("multipart body must include a `content` field".to_string());
    };
    for tag in &form.tags {
        crate::utils::bounder::tag_name(tag)?;
    }
    let draft = JobDraft {
        job_type: JobType::File,
        url: None,
        original_filename: original_filename.clone(),
        source_override: form.source,
        initial_tags: form.tags,
        safety: form.safety.unwrap_or_default(),
        skip_tagging: form.skip_tagging,
        owner: caller.owner,
        target_post_id: None,
    };
    let id = job_store::create(draft, &state.shared).await?;
    write_upload_scratch(&state.shared, id, original_filename.as_deref(), &bytes).await?;
    let job = job_store::get(id, &state.shared).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Persist an uploaded file's bytes under that job's scratch directory (spec §6
/// "Scratch files under `{JOB_DATA_DIR}/{job_id}/...`")
async fn write_upload_scratch(
    shared: &Shared,
    job_id: Uuid,
    original_filename: Option<&str>,
    bytes: &[u8],
) -> Result<(), ApiError> {
    let dir = std::path::Path::new(&shared.config.job_data_dir).join(job_id.to_string());
    tokio::fs::create_dir_all(&dir).await?;
    let file_name = original_filename.unwrap_or("upload.bin");
    tokio::fs::write(dir.join(file_name), bytes).await?;
    Ok(())
}

/// List jobs visible to the caller, optionally filtered by status/merge outcome
#[utoipa::path(
    get,
    path = "/api/jobs",
    params(JobListOpts),
    responses(
        (status = 200, description = "A page of jobs", body = JobList),
    )
)]
#[instrument(name = "routes::jobs::list", skip(state), err(Debug))]
pub async fn list(
    State(state): State<AppState>,
    caller: CallerContext,
    Query(opts): Query<JobListOpts>,
) -> Result<Json<JobList>, ApiError> {
    let list = job_store::list(&caller.owner, caller.is_admin, &opts, &state.shared).await?;
    Ok(Json(list))
}

/// Fetch a single job, owner-scoped
#[utoipa::path(
    get,
    path = "/api/jobs/{id}",
    responses(
        (status = 200, description = "The job", body = Job),
        (status = 404, description = "No such job, or it isn't owned by this caller"),
    )
)]
#[instrument(name = "routes::jobs::get_one", skip(state), err(Debug))]
pub async fn get_one(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = job_store::get(id, &state.shared).await?;
    if !caller.is_admin && job.owner != caller.owner {
        return crate::not_found!(format!("job {id} not found"));
    }
    Ok(Json(job))
}

/// Apply a single-job control action: `start`, `pause`, `stop`, `resume`, or `retry`
#[utoipa::path(
    post,
    path = "/api/jobs/{id}/{action}",
    responses(
        (status = 200, description = "The job after the action was applied", body = Job),
        (status = 400, description = "The action is not legal from the job's current status"),
        (status = 404, description = "No such job, or it isn't owned by this caller"),
    )
)]
#[instrument(name = "routes::jobs::act", skip(state), err(Debug))]
pub async fn act(
    State(state): State<AppState>,
    caller: CallerContext,
    Path((id, action)): Path<(Uuid, String)>,
) -> Result<Json<Job>, ApiError> {
    let action = parse_action(&action)?;
    let job =
        job_store::apply_action(id, &caller.owner, caller.is_admin, action, &state.shared).await?;
    // every legal transition is worth telling live subscribers about, not just `start`
    // (the SSE stream is the only way a client observes pause/stop/resume/retry taking
    // effect without re-polling)
    events::publish(
        &JobEvent::status_changed(id, job.status, Utc::now()),
        &state.shared,
    )
    .await?;
    Ok(Json(job))
}

fn parse_action(raw: &str) -> Result<JobAction, ApiError> {
    match raw {
        "start" => Ok(JobAction::Start),
        "pause" => Ok(JobAction::Pause),
        "stop" => Ok(JobAction::Stop),
        "resume" => Ok(JobAction::Resume),
        "retry" => Ok(JobAction::Retry),
        other => bad!(format!("unknown job action `{other}`")),
    }
}

/// Delete a job and its scratch directory
#[utoipa::path(
    delete,
    path = "/api/jobs/{id}",
    responses(
        (status = 204, description = "The job and its scratch directory were deleted"),
        (status = 404, description = "No such job, or it isn't owned by this caller"),
    )
)]
#[instrument(name = "routes::jobs::delete_one", skip(state), err(Debug))]
pub async fn delete_one(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let job = job_store::get(id, &state.shared).await?;
    if !caller.is_admin && job.owner != caller.owner {
        return crate::not_found!(format!("job {id} not found"));
    }
    let dir = std::path::Path::new(&state.shared.config.job_data_dir).join(id.to_string());
    let _ = tokio::fs::remove_dir_all(&dir).await;
    job_store::delete(id, &state.shared).await?;
    events::publish(
        &JobEvent::deleted(id, job.status, Utc::now()),
        &state.shared,
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Accept a bulk control request immediately and hand it to the `event-handler` task queue
/// (spec §4.10 "Bulk variants are accepted-immediately")
#[utoipa::path(
    post,
    path = "/api/jobs/bulk/{action}",
    request_body = BulkJobRequest,
    responses(
        (status = 202, description = "The request ids accepted for background processing", body = BulkJobAccepted),
        (status = 400, description = "Unknown action"),
    )
)]
#[instrument(name = "routes::jobs::bulk", skip(state, req), err(Debug))]
pub async fn bulk(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(action): Path<String>,
    Json(req): Json<BulkJobRequest>,
) -> Result<(StatusCode, Json<BulkJobAccepted>), ApiError> {
    let Ok(action) = action.parse::<BulkAction>() else {
        return bad!(format!("unknown bulk action `{action}`"));
    };
    let task = BulkTask {
        action,
        job_ids: req.job_ids.clone(),
        owner: caller.owner,
        is_admin: caller.is_admin,
    };
    let payload = serde_json::to_string(&task)?;
    let mut conn = state.shared.redis.get().await?;
    let _: () = conn.lpush(BULK_TASK_QUEUE, payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(BulkJobAccepted {
            accepted: req.job_ids,
        }),
    ))
}

/// Enumerate remote posts matching a tag and create one `tag_existing` job per match
#[utoipa::path(
    post,
    path = "/api/tag-jobs/discover",
    request_body = DiscoverRequest,
    responses(
        (status = 200, description = "The ids of the jobs created", body = DiscoverResponse),
    )
)]
#[instrument(name = "routes::jobs::discover", skip(state, req), err(Debug))]
pub async fn discover(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(req): Json<DiscoverRequest>,
) -> Result<Json<DiscoverResponse>, ApiError> {
    let user = users::load(&caller.owner, &state.shared).await?;
    let posts = state
        .shared
        .booru
        .search_by_tags(&user.booru, &req.tag, req.min_count)
        .await?;
    let mut created_job_ids = Vec::with_capacity(posts.len());
    for post in posts {
        let draft = JobDraft {
            job_type: JobType::TagExisting,
            url: None,
            original_filename: None,
            source_override: None,
            initial_tags: Vec::new(),
            safety: Safety::Unsafe,
            skip_tagging: false,
            owner: caller.owner.clone(),
            target_post_id: Some(i64::try_from(post.id)?),
        };
        created_job_ids.push(job_store::create(draft, &state.shared).await?);
    }
    Ok(Json(DiscoverResponse { created_job_ids }))
}

/// The OpenAPI docs for these routes
#[derive(OpenApi)]
#[openapi(
    paths(create_url, create_upload, list, get_one, act, delete_one, bulk, discover),
    components(schemas(
        Job, JobStatus, JobType, Safety, JobUrlCreate, JobFileCreate, JobList,
        BulkJobRequest, BulkJobAccepted, DiscoverRequest, DiscoverResponse,
    )),
    modifiers(&OpenApiSecurity),
)]
pub struct JobApiDocs;

/// Mount the job routes
pub fn mount(router: Router<AppState>) -> Router<AppState> {
    router
        .route("/api/jobs", post(create_url).get(list))
        .route("/api/jobs/upload", post(create_upload))
        .route("/api/jobs/bulk/{action}", post(bulk))
        .route("/api/jobs/{id}", get(get_one).delete(delete_one))
        .route("/api/jobs/{id}/{action}", post(act))
        .route("/api/tag-jobs/discover", post(discover))
}
