//! The per-worker claim loop and per-job pipeline driver (spec §4.8/§4.9).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use ingest_engine::models::backends::{events, jobs as job_store, system, users};
use ingest_engine::models::helpers::Value;
use ingest_engine::models::{ExtractedMedia, GlobalSettings, Job, JobEvent, JobStatus, JobType, UserConfig};
use ingest_engine::pipeline::error::StageError;
use ingest_engine::pipeline::extractor;
use ingest_engine::pipeline::handlers::{Registry, SiteHandler};
use ingest_engine::pipeline::stages::{self, AssembledTag, MediaResult};
use ingest_engine::pipeline::tagger::{self, ModelHandle};
use ingest_engine::utils::Shared;

const VIDEO_EXTS: &[&str] = &["mp4", "webm", "mov", "mkv", "avi", "m4v", "gif"];

/// One worker's claim-and-process loop; runs until the process is killed
pub async fn worker_loop(worker_id: String, shared: Arc<Shared>, registry: Arc<Registry>, model: Arc<ModelHandle>) {
    loop {
        let claimed = job_store::claim_next(&worker_id, &shared).await;
        match claimed {
            Ok(Some(job)) => {
                let job_id = job.id;
                run_job(job, &shared, &registry, &model).await;
                tracing::info!(worker_id, %job_id, "finished job");
            }
            Ok(None) => {
                tokio::time::sleep(poll_interval(&shared)).await;
            }
            Err(error) => {
                tracing::error!(worker_id, %error, "failed to claim next job");
                tokio::time::sleep(poll_interval(&shared)).await;
            }
        }
    }
}

fn poll_interval(shared: &Shared) -> Duration {
    Duration::from_secs(shared.config.worker.claim_poll_interval_seconds)
}

/// What one media item within a job resolved to once all per-media stages ran
struct MediaOutcome {
    result: Option<MediaResult>,
    tags_applied: Vec<String>,
    tags_from_source: Vec<String>,
    tags_from_ai: Vec<String>,
}

/// Drive one claimed job through extract/download/tag/upload/relate end to end, applying
/// the retry policy on any uncaught stage failure, and unconditionally cleaning up its
/// scratch directory (spec §4.9 steps 2-6)
async fn run_job(job: Job, shared: &Arc<Shared>, registry: &Registry, model: &ModelHandle) {
    let job_id = job.id;
    let scratch_dir = PathBuf::from(&shared.config.job_data_dir).join(job_id.to_string());
    publish_status(job_id, JobStatus::Downloading, shared).await;

    let outcome = process_job(&job, &scratch_dir, shared, registry, model).await;
    let _ = tokio::fs::remove_dir_all(&scratch_dir).await;

    match outcome {
        Ok(Some(finished)) => finish_job(job_id, finished, shared).await,
        Ok(None) => {
            tracing::info!(%job_id, "job stopped cooperatively, leaving external status as-is");
        }
        Err(error) => fail_job(job_id, &error, shared).await,
    }
}

/// The terminal, successful result of a job's pipeline run
struct Finished {
    was_merge: bool,
    primary_post_id: u64,
    related_post_ids: Vec<u64>,
    tags_applied: Vec<String>,
    tags_from_source: Vec<String>,
    tags_from_ai: Vec<String>,
}

/// Returns `Ok(None)` when the job was cooperatively cancelled (paused/stopped) rather
/// than completed or failed
async fn process_job(
    job: &Job,
    scratch_dir: &Path,
    shared: &Arc<Shared>,
    registry: &Registry,
    model: &ModelHandle,
) -> Result<Option<Finished>, StageError> {
    if cancelled(job.id, shared).await? {
        return Ok(None);
    }
    let global = system::get(shared).await?;
    let user = users::load(&job.owner, shared).await?;
    tokio::fs::create_dir_all(scratch_dir).await?;

    let outcomes = match job.job_type {
        JobType::Url => process_url_job(job, scratch_dir, shared, registry, model, &global, &user).await?,
        JobType::File => process_file_job(job, scratch_dir, shared, model, &global, &user).await?,
        JobType::TagExisting => {
            return process_tag_existing_job(job, scratch_dir, shared, model, &global, &user).await;
        }
    };
    let Some(outcomes) = outcomes else {
        return Ok(None);
    };

    if cancelled(job.id, shared).await? {
        return Ok(None);
    }
    publish_status(job.id, JobStatus::Uploading, shared).await;

    let results: Vec<Option<MediaResult>> = outcomes.iter().map(|o| o.result).collect();
    let Some((primary_post_id, primary_was_merge, related_post_ids)) = stages::assign_primary(&results) else {
        return Err(StageError::PermanentExternal(
            "no media item in this job produced a post".to_string(),
        ));
    };
    let mut all_post_ids: Vec<u64> = vec![primary_post_id];
    all_post_ids.extend(&related_post_ids);
    if all_post_ids.len() > 1 {
        stages::link_relations(&all_post_ids, &user.booru, shared).await?;
    }

    let mut tags_applied = Vec::new();
    let mut tags_from_source = Vec::new();
    let mut tags_from_ai = Vec::new();
    for outcome in outcomes {
        tags_applied.extend(outcome.tags_applied);
        tags_from_source.extend(outcome.tags_from_source);
        tags_from_ai.extend(outcome.tags_from_ai);
    }

    Ok(Some(Finished {
        was_merge: primary_was_merge,
        primary_post_id,
        related_post_ids,
        tags_applied,
        tags_from_source,
        tags_from_ai,
    }))
}

/// Process a remote-url job: enumerate media via the site handler + extractor, download
/// and run the per-media stages on each one (spec §4.8 steps 1-6)
async fn process_url_job(
    job: &Job,
    scratch_dir: &Path,
    shared: &Arc<Shared>,
    registry: &Registry,
    model: &ModelHandle,
    global: &GlobalSettings,
    user: &UserConfig,
) -> Result<Option<Vec<MediaOutcome>>, StageError> {
    let url = job
        .url
        .as_deref()
        .ok_or_else(|| StageError::Validation("url job is missing its url".to_string()))?;
    let handler = registry.dispatch(url);
    let download_timeout = Duration::from_secs(shared.config.worker.download_timeout_seconds);
    let subprocess_timeout = Duration::from_secs(shared.config.worker.video_timeout_seconds);

    if cancelled(job.id, shared).await? {
        return Ok(None);
    }
    let media_items = extractor::enumerate(url, handler, &user.site_secrets, download_timeout).await?;

    let mut outcomes = Vec::with_capacity(media_items.len());
    for media in &media_items {
        if cancelled(job.id, shared).await? {
            return Ok(None);
        }
        let outcome = match download_one(
            media,
            scratch_dir,
            handler,
            user,
            download_timeout,
            subprocess_timeout,
            global.direct_download_cap_bytes as u64,
        )
        .await
        {
            Ok(downloaded) => {
                if cancelled(job.id, shared).await? {
                    return Ok(None);
                }
                publish_status(job.id, JobStatus::Tagging, shared).await;
                process_one_media(
                    job,
                    &downloaded.files,
                    &downloaded.metadata,
                    Some(&media.direct_url),
                    &media.page_url,
                    job.source_override.as_deref(),
                    handler,
                    user,
                    shared,
                    model,
                    global,
                    subprocess_timeout,
                )
                .await?
            }
            Err(error) => {
                tracing::warn!(job_id = %job.id, %error, url = %media.page_url, "skipping media that failed to download");
                MediaOutcome {
                    result: None,
                    tags_applied: Vec::new(),
                    tags_from_source: Vec::new(),
                    tags_from_ai: Vec::new(),
                }
            }
        };
        outcomes.push(outcome);
    }
    Ok(Some(outcomes))
}

/// Process a direct file-upload job: the HTTP layer already wrote the single file into
/// this job's scratch directory before it was queued
async fn process_file_job(
    job: &Job,
    scratch_dir: &Path,
    shared: &Arc<Shared>,
    model: &ModelHandle,
    global: &GlobalSettings,
    user: &UserConfig,
) -> Result<Option<Vec<MediaOutcome>>, StageError> {
    let file_name = job.original_filename.as_deref().unwrap_or("upload.bin");
    let file_path = scratch_dir.join(file_name);
    if !tokio::fs::try_exists(&file_path).await.unwrap_or(false) {
        return Err(StageError::Validation(format!(
            "expected uploaded file at {}",
            file_path.display()
        )));
    }
    if cancelled(job.id, shared).await? {
        return Ok(None);
    }
    publish_status(job.id, JobStatus::Tagging, shared).await;
    struct NoHandler;
    impl SiteHandler for NoHandler {
        fn name(&self) -> &'static str {
            "file"
        }
        fn matches(&self, _url: &str) -> bool {
            true
        }
        fn build_extractor_args(
            &self,
            _site_secrets: &std::collections::HashMap<String, String>,
        ) -> Result<(Vec<String>, Vec<PathBuf>), StageError> {
            Ok((Vec::new(), Vec::new()))
        }
    }
    let pseudo_url = format!("file://{}/{file_name}", job.id);
    let subprocess_timeout = Duration::from_secs(shared.config.worker.video_timeout_seconds);
    let outcome = process_one_media(
        job,
        &[file_path],
        &Value::Null,
        None,
        &pseudo_url,
        job.source_override.as_deref(),
        &NoHandler,
        user,
        shared,
        model,
        global,
        subprocess_timeout,
    )
    .await?;
    Ok(Some(vec![outcome]))
}

/// Process a re-tag job: fetch the existing post's content, tag it, and union the result
/// into the post directly, with no upload/merge/relate steps (the post already exists and
/// no sibling posts are produced)
async fn process_tag_existing_job(
    job: &Job,
    scratch_dir: &Path,
    shared: &Arc<Shared>,
    model: &ModelHandle,
    global: &GlobalSettings,
    user: &UserConfig,
) -> Result<Option<Finished>, StageError> {
    let post_id = job
        .target_post_id
        .ok_or_else(|| StageError::Validation("tag_existing job is missing its target_post_id".to_string()))?;
    let post_id = u64::try_from(post_id)
        .map_err(|_| StageError::Validation(format!("invalid target_post_id {post_id}")))?;

    if cancelled(job.id, shared).await? {
        return Ok(None);
    }
    let bytes = shared.booru.download_content(&user.booru, post_id).await?;
    let file_path = scratch_dir.join("content");
    tokio::fs::write(&file_path, &bytes).await?;

    if cancelled(job.id, shared).await? {
        return Ok(None);
    }
    publish_status(job.id, JobStatus::Tagging, shared).await;

    let subprocess_timeout = Duration::from_secs(shared.config.worker.video_timeout_seconds);
    let ai_tags = if job.skip_tagging || !global.wd14_enabled {
        None
    } else {
        Some(run_tagger(&file_path, model, global, subprocess_timeout).await?)
    };
    let assembled = stages::assemble_tags(
        &job.initial_tags,
        &Value::Null,
        is_video_file(&file_path),
        ai_tags.as_ref(),
        &global.category_map,
    );
    stages::materialize_tags(&assembled, &user.booru, shared).await?;

    if cancelled(job.id, shared).await? {
        return Ok(None);
    }
    publish_status(job.id, JobStatus::Uploading, shared).await;

    let post = shared.booru.get_post(&user.booru, post_id).await?;
    let existing: Vec<String> = post.tags.iter().flat_map(|t| t.names.iter().cloned()).collect();
    let new_names: Vec<String> = assembled.iter().map(|t| t.name.clone()).collect();
    let mut seen = std::collections::HashSet::new();
    let merged_tags: Vec<String> = existing
        .iter()
        .chain(&new_names)
        .filter(|name| seen.insert(name.to_ascii_lowercase()))
        .cloned()
        .collect();
    let update = ingest_engine::client::PostUpdate {
        tags: Some(merged_tags),
        source: None,
        relations: None,
        safety: None,
    };
    let updated = shared.booru.update_post(&user.booru, post.id, post.version, update).await?;

    let (tags_applied, tags_from_ai) = split_by_origin(&assembled);
    Ok(Some(Finished {
        was_merge: true,
        primary_post_id: updated.id,
        related_post_ids: Vec::new(),
        tags_applied,
        tags_from_source: Vec::new(),
        tags_from_ai,
    }))
}

/// Download one extracted media item, yielding its files plus merged metadata
async fn download_one(
    media: &ExtractedMedia,
    scratch_dir: &Path,
    handler: &dyn SiteHandler,
    user: &UserConfig,
    download_timeout: Duration,
    subprocess_timeout: Duration,
    direct_download_cap_bytes: u64,
) -> Result<extractor::Downloaded, StageError> {
    extractor::download(
        media,
        scratch_dir,
        handler,
        &user.site_secrets,
        download_timeout,
        subprocess_timeout,
        direct_download_cap_bytes,
    )
    .await
}

/// Run tag assembly, materialization, source building and upload-or-merge for one
/// downloaded media item (spec §4.8 steps 2-6); the first file produced is the one tagged
/// and uploaded, matching one post per enumerated media item
#[allow(clippy::too_many_arguments)]
async fn process_one_media(
    job: &Job,
    files: &[PathBuf],
    metadata: &Value,
    direct_url: Option<&str>,
    page_url: &str,
    source_override: Option<&str>,
    handler: &dyn SiteHandler,
    user: &UserConfig,
    shared: &Arc<Shared>,
    model: &ModelHandle,
    global: &GlobalSettings,
    subprocess_timeout: Duration,
) -> Result<MediaOutcome, StageError> {
    let Some(file_path) = files.first() else {
        return Ok(MediaOutcome {
            result: None,
            tags_applied: Vec::new(),
            tags_from_source: Vec::new(),
            tags_from_ai: Vec::new(),
        });
    };
    let is_video = is_video_file(file_path);
    let ai_tags = if job.skip_tagging || !global.wd14_enabled {
        None
    } else {
        Some(run_tagger(file_path, model, global, subprocess_timeout).await?)
    };
    let assembled = stages::assemble_tags(&job.initial_tags, metadata, is_video, ai_tags.as_ref(), &global.category_map);
    stages::materialize_tags(&assembled, &user.booru, shared).await?;

    let source = stages::build_source(source_override, direct_url.unwrap_or(page_url), page_url, handler);
    let result = stages::upload_or_merge(file_path, &assembled, job.safety, &source, &user.booru, handler, shared).await?;

    let (mut tags_applied, tags_from_ai) = split_by_origin(&assembled);
    let tags_from_source: Vec<String> = assembled
        .iter()
        .filter(|t| t.origin == ingest_engine::pipeline::stages::TagOrigin::Source)
        .map(|t| t.name.clone())
        .collect();
    if result.is_none() {
        tags_applied.clear();
    }
    Ok(MediaOutcome {
        result,
        tags_applied,
        tags_from_source,
        tags_from_ai,
    })
}

/// Split assembled tags into `(tags_applied, tags_from_ai)` for the job's bookkeeping
/// fields (spec §3 `Job.tags_applied`/`tags_from_ai`)
fn split_by_origin(assembled: &[AssembledTag]) -> (Vec<String>, Vec<String>) {
    let tags_applied = assembled.iter().map(|t| t.name.clone()).collect();
    let tags_from_ai = assembled
        .iter()
        .filter(|t| t.origin == ingest_engine::pipeline::stages::TagOrigin::Ai)
        .map(|t| t.name.clone())
        .collect();
    (tags_applied, tags_from_ai)
}

/// Run the image or video tagger, bounded by the worker's video timeout
async fn run_tagger(
    file_path: &Path,
    model: &ModelHandle,
    global: &GlobalSettings,
    subprocess_timeout: Duration,
) -> Result<tagger::TagResult, StageError> {
    let confidence = global.wd14_confidence_threshold as f32;
    let max_tags = global.wd14_max_tags as usize;
    if is_video_file(file_path) {
        tagger::tag_video(
            file_path,
            model,
            confidence,
            max_tags,
            global.scene_threshold as f32,
            global.max_frames as usize,
            global.min_frame_ratio as f32,
            subprocess_timeout,
        )
        .await
    } else {
        tagger::tag_image(file_path, model, confidence, max_tags).await
    }
}

/// Whether a downloaded file is a video by extension, mirroring the extractor's own
/// direct-download-cap bypass rule
fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(std::ffi::OsStr::to_str)
        .is_some_and(|ext| VIDEO_EXTS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Read the job's live status and report whether cooperative cancellation has kicked in
/// (spec §4.8 "Cooperative cancellation")
async fn cancelled(job_id: Uuid, shared: &Shared) -> Result<bool, StageError> {
    let status = job_store::observe_status(job_id, shared).await?;
    Ok(matches!(status, JobStatus::Paused | JobStatus::Stopped))
}

/// Transition a job's status and publish the matching progress event, best-effort
async fn publish_status(job_id: Uuid, status: JobStatus, shared: &Shared) {
    if let Err(error) = job_store::set_status(job_id, status, shared).await {
        tracing::warn!(%job_id, %error, "failed to persist status transition");
    }
    let event = JobEvent::status_changed(job_id, status, Utc::now());
    if let Err(error) = events::publish(&event, shared).await {
        tracing::warn!(%job_id, %error, "failed to publish job event");
    }
}

/// Persist a successful terminal outcome and publish its completion event
async fn finish_job(job_id: Uuid, finished: Finished, shared: &Shared) {
    let related: Vec<i64> = finished.related_post_ids.iter().map(|id| *id as i64).collect();
    let primary = finished.primary_post_id as i64;
    if let Err(error) = job_store::complete(
        job_id,
        finished.was_merge,
        primary,
        &related,
        &finished.tags_applied,
        &finished.tags_from_source,
        &finished.tags_from_ai,
        shared,
    )
    .await
    {
        tracing::error!(%job_id, %error, "failed to persist job completion");
        return;
    }
    let status = if finished.was_merge { JobStatus::Merged } else { JobStatus::Completed };
    let mut event = JobEvent::status_changed(job_id, status, Utc::now());
    event.post_id = Some(primary);
    event.tags = finished.tags_applied;
    if let Err(error) = events::publish(&event, shared).await {
        tracing::warn!(%job_id, %error, "failed to publish completion event");
    }
}

/// Apply the retry policy to an uncaught stage failure (spec §4.9 "Retry policy on
/// unexpected failure"): validation errors are never retried, everything else gets
/// `max_retries` attempts before becoming terminal.
async fn fail_job(job_id: Uuid, error: &StageError, shared: &Arc<Shared>) {
    tracing::warn!(%job_id, %error, kind = error.kind(), "job failed");
    let retry_count = match job_store::record_failure(job_id, &error.to_string(), shared).await {
        Ok(count) => count,
        Err(store_error) => {
            tracing::error!(%job_id, %store_error, "failed to record job failure");
            return;
        }
    };
    let global = match system::get(shared).await {
        Ok(global) => global,
        Err(_) => GlobalSettings::from_conf(&shared.config),
    };
    let eligible = error.is_retryable() && i64::from(retry_count) <= global.max_retries;
    if eligible {
        schedule_retry(job_id, retry_count, global.retry_delay_seconds, shared).await;
        let mut event = JobEvent::status_changed(job_id, JobStatus::Failed, Utc::now());
        event.error = Some(error.to_string());
        event.retry_count = Some(retry_count);
        event.retries_exhausted = Some(false);
        let _ = events::publish(&event, shared).await;
    } else {
        let mut event = JobEvent::failed(job_id, error.to_string(), Utc::now());
        event.retry_count = Some(retry_count);
        let _ = events::publish(&event, shared).await;
    }
}

/// Requeue a failed job after its retry delay, refusing to do so if the row changed in the
/// meantime (spec §4.9 "must re-read the row and refuse to re-queue unless... unchanged")
async fn schedule_retry(job_id: Uuid, expected_retry_count: i32, retry_delay_seconds: i64, shared: &Arc<Shared>) {
    if retry_delay_seconds <= 0 {
        match job_store::requeue_after_delay(job_id, expected_retry_count, shared.as_ref()).await {
            Ok(true) => {}
            Ok(false) => tracing::info!(%job_id, "skipped immediate requeue, job row changed since failure"),
            Err(error) => tracing::error!(%job_id, %error, "failed to requeue job"),
        }
        return;
    }
    let shared = Arc::clone(shared);
    let delay = Duration::from_secs(retry_delay_seconds as u64);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match job_store::requeue_after_delay(job_id, expected_retry_count, &shared).await {
            Ok(true) => {
                let event = JobEvent {
                    retries_exhausted: Some(false),
                    ..JobEvent::status_changed(job_id, JobStatus::Pending, Utc::now())
                };
                let _ = events::publish(&event, &shared).await;
            }
            Ok(false) => tracing::info!(%job_id, "skipped scheduled requeue, job row changed since failure"),
            Err(error) => tracing::error!(%job_id, %error, "failed to requeue job after retry delay"),
        }
    });
}
