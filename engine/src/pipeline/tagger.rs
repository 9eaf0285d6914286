//! The Tagger (spec §4.6): ML-based image/video tagging with confidence/count thresholds
//! and video frame aggregation.
//!
//! The model itself is out of scope (spec §1 treats it as a function `tag(image) →
//! (general_tags, character_tags, safety)`); this module owns the thresholding, cleaning,
//! aggregation and scheduling around whatever [`Model`] is plugged in.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::instrument;

use crate::models::jobs::Safety;
use crate::pipeline::error::StageError;

/// The outcome of tagging one image or video
#[derive(Debug, Clone, Default)]
pub struct TagResult {
    pub general_tags: Vec<String>,
    pub character_tags: Vec<String>,
    pub safety: Safety,
}

/// One raw prediction from the model: `(label, confidence)`
pub type Prediction = (String, f32);

/// The model's raw output before thresholding/cleaning is applied
#[derive(Debug, Clone, Default)]
pub struct RawPredictions {
    /// Descending-confidence general tag predictions
    pub general: Vec<Prediction>,
    /// Character tag predictions
    pub character: Vec<Prediction>,
    /// Rating distribution, e.g. `[("general", 0.9), ("explicit", 0.02), ...]`
    pub rating: Vec<Prediction>,
}

/// A pluggable image-tagging model; CPU-bound, so callers must run it off the async
/// scheduler (see [`ModelHandle`])
pub trait Model: Send + Sync {
    fn predict(&self, image_path: &Path) -> Result<RawPredictions, StageError>;
}

/// A model that never matches anything, used when `wd14_enabled` is false or no real
/// model has been wired in; keeps the pipeline's control flow identical either way
pub struct NullModel;

impl Model for NullModel {
    fn predict(&self, _image_path: &Path) -> Result<RawPredictions, StageError> {
        Ok(RawPredictions::default())
    }
}

/// Owns model loading with a single-flight init guard and runs inference on the blocking
/// thread pool so CPU-bound predictions never starve the I/O scheduler (spec §4.6/§5)
pub struct ModelHandle {
    model: OnceCell<Arc<dyn Model>>,
    factory: Box<dyn Fn() -> Arc<dyn Model> + Send + Sync>,
}

impl ModelHandle {
    /// Build a handle around a factory that constructs the model on first use
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Model> + Send + Sync + 'static,
    {
        ModelHandle {
            model: OnceCell::new(),
            factory: Box::new(factory),
        }
    }

    /// A handle backed by [`NullModel`]
    #[must_use]
    pub fn stub() -> Self {
        ModelHandle::new(|| Arc::new(NullModel))
    }

    async fn get(&self) -> Arc<dyn Model> {
        self.model
            .get_or_init(|| async { (self.factory)() })
            .await
            .clone()
    }

    /// Run inference on `image_path` without blocking the async scheduler
    pub async fn predict(&self, image_path: PathBuf) -> Result<RawPredictions, StageError> {
        let model = self.get().await;
        tokio::task::spawn_blocking(move || model.predict(&image_path))
            .await
            .map_err(|error| StageError::Local(format!("tagger task panicked: {error}")))?
    }
}

/// Clean one raw tag string: strip a trailing parenthetical confidence, collapse internal
/// whitespace to underscores, drop the result if it is a single character (spec §4.6)
fn clean_tag(raw: &str) -> Option<String> {
    let without_confidence = match raw.rfind('(') {
        Some(idx) if raw.trim_end().ends_with(')') => raw[..idx].trim_end(),
        _ => raw,
    };
    let cleaned = without_confidence
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    if cleaned.chars().count() <= 1 {
        None
    } else {
        Some(cleaned)
    }
}

/// Derive a safety rating from a model's rating-label confidence distribution (spec §4.6)
fn safety_from_rating(rating: &[Prediction]) -> Safety {
    let top = rating
        .iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    match top {
        Some((label, _)) if label == "explicit" => Safety::Unsafe,
        Some((label, _)) if label == "questionable" || label == "sensitive" => Safety::Sketchy,
        _ => Safety::Safe,
    }
}

/// Tag a single image (spec §4.6 `tag_image`)
///
/// # Arguments
///
/// * `path` - The image file to tag
/// * `model` - The model handle to run inference through
/// * `confidence_threshold` - The minimum confidence to keep a prediction
/// * `max_tags` - The cap on general tags kept (character tags are never capped)
#[instrument(name = "pipeline::tagger::tag_image", skip(model), err(Debug))]
pub async fn tag_image(
    path: &Path,
    model: &ModelHandle,
    confidence_threshold: f32,
    max_tags: usize,
) -> Result<TagResult, StageError> {
    let predictions = model.predict(path.to_path_buf()).await?;
    Ok(result_from_predictions(&predictions, confidence_threshold, max_tags))
}

fn result_from_predictions(
    predictions: &RawPredictions,
    confidence_threshold: f32,
    max_tags: usize,
) -> TagResult {
    let mut general: Vec<&Prediction> = predictions
        .general
        .iter()
        .filter(|(_, confidence)| *confidence >= confidence_threshold)
        .collect();
    general.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let general_tags = general
        .into_iter()
        .filter_map(|(label, _)| clean_tag(label))
        .take(max_tags)
        .collect();
    let character_tags = predictions
        .character
        .iter()
        .filter(|(_, confidence)| *confidence >= confidence_threshold)
        .filter_map(|(label, _)| clean_tag(label))
        .collect();
    TagResult {
        general_tags,
        character_tags,
        safety: safety_from_rating(&predictions.rating),
    }
}

/// Tag a video by extracting key frames and aggregating per-frame tag results (spec §4.6
/// `tag_video`)
///
/// # Arguments
///
/// * `path` - The video file to tag
/// * `model` - The model handle to run inference through
/// * `confidence_threshold` - The minimum per-frame confidence to keep a prediction
/// * `max_tags` - The cap on aggregated general tags
/// * `scene_threshold` - The `ffmpeg` scene-change score a frame must exceed to be extracted
/// * `max_frames` - The max number of key frames to extract
/// * `min_frame_ratio` - The minimum fraction of frames a general tag must appear in to survive
/// * `subprocess_timeout` - The hard bound on the `ffmpeg`/`ffprobe` frame extraction (spec
///   §5 "Timeouts on subprocesses ... are hard")
#[instrument(name = "pipeline::tagger::tag_video", skip(model), err(Debug))]
#[allow(clippy::too_many_arguments)]
pub async fn tag_video(
    path: &Path,
    model: &ModelHandle,
    confidence_threshold: f32,
    max_tags: usize,
    scene_threshold: f32,
    max_frames: usize,
    min_frame_ratio: f32,
    subprocess_timeout: Duration,
) -> Result<TagResult, StageError> {
    let frame_dir = std::env::temp_dir().join(format!("tagger-frames-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&frame_dir).await?;
    let result = with_timeout(
        tag_video_inner(
            path,
            model,
            confidence_threshold,
            max_tags,
            scene_threshold,
            max_frames,
            min_frame_ratio,
            &frame_dir,
        ),
        subprocess_timeout,
        "video frame extraction/tagging",
    )
    .await;
    let _ = tokio::fs::remove_dir_all(&frame_dir).await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn tag_video_inner(
    path: &Path,
    model: &ModelHandle,
    confidence_threshold: f32,
    max_tags: usize,
    scene_threshold: f32,
    max_frames: usize,
    min_frame_ratio: f32,
    frame_dir: &Path,
) -> Result<TagResult, StageError> {
    let mut frames = extract_scene_frames(path, scene_threshold, max_frames, frame_dir).await?;
    if frames.is_empty() {
        if let Some(frame) = extract_mid_duration_frame(path, frame_dir).await? {
            frames.push(frame);
        }
    }
    if frames.is_empty() {
        return Ok(TagResult::default());
    }
    let mut per_frame = Vec::with_capacity(frames.len());
    for frame in &frames {
        let predictions = model.predict(frame.clone()).await?;
        per_frame.push(predictions);
    }
    Ok(aggregate_frames(&per_frame, confidence_threshold, max_tags, min_frame_ratio))
}

/// Aggregate per-frame predictions into one [`TagResult`] (spec §4.6 video aggregation rules)
fn aggregate_frames(
    per_frame: &[RawPredictions],
    confidence_threshold: f32,
    max_tags: usize,
    min_frame_ratio: f32,
) -> TagResult {
    let n = per_frame.len();
    let min_frames_needed = (n as f32 * min_frame_ratio).ceil() as usize;

    let mut general_counts: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    let mut character_tags = std::collections::BTreeSet::new();
    let mut worst_safety = Safety::Safe;

    for predictions in per_frame {
        let mut seen_this_frame = std::collections::HashSet::new();
        for (label, confidence) in &predictions.general {
            if *confidence < confidence_threshold {
                continue;
            }
            if let Some(tag) = clean_tag(label) {
                if seen_this_frame.insert(tag.clone()) {
                    *general_counts.entry(tag).or_insert(0) += 1;
                }
            }
        }
        for (label, confidence) in &predictions.character {
            if *confidence >= confidence_threshold {
                if let Some(tag) = clean_tag(label) {
                    character_tags.insert(tag);
                }
            }
        }
        let frame_safety = safety_from_rating(&predictions.rating);
        if safety_rank(frame_safety) > safety_rank(worst_safety) {
            worst_safety = frame_safety;
        }
    }

    let mut kept: Vec<(String, usize)> = general_counts
        .into_iter()
        .filter(|(_, count)| *count >= min_frames_needed.max(1))
        .collect();
    // highest count first, ties broken alphabetically (BTreeMap already iterated in
    // alphabetical order, so a stable sort on count preserves that as the tiebreak)
    kept.sort_by(|a, b| b.1.cmp(&a.1));
    let general_tags = kept.into_iter().map(|(tag, _)| tag).take(max_tags).collect();

    TagResult {
        general_tags,
        character_tags: character_tags.into_iter().collect(),
        safety: worst_safety,
    }
}

fn safety_rank(safety: Safety) -> u8 {
    match safety {
        Safety::Safe => 0,
        Safety::Sketchy => 1,
        Safety::Unsafe => 2,
    }
}

/// Extract scene-change key frames via `ffmpeg`, capped at `max_frames`
async fn extract_scene_frames(
    path: &Path,
    scene_threshold: f32,
    max_frames: usize,
    frame_dir: &Path,
) -> Result<Vec<PathBuf>, StageError> {
    let pattern = frame_dir.join("frame_%04d.jpg");
    let status = Command::new("ffmpeg")
        .arg("-i")
        .arg(path)
        .arg("-vf")
        .arg(format!("select='gt(scene,{scene_threshold})'"))
        .arg("-vsync")
        .arg("vfr")
        .arg("-frames:v")
        .arg(max_frames.to_string())
        .arg(&pattern)
        .status()
        .await?;
    if !status.success() {
        tracing::warn!("ffmpeg scene-detection exited non-zero, falling back to mid-duration frame");
    }
    let mut frames = Vec::new();
    let mut entries = tokio::fs::read_dir(frame_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.path().extension().and_then(std::ffi::OsStr::to_str) == Some("jpg") {
            frames.push(entry.path());
        }
    }
    frames.sort();
    frames.truncate(max_frames);
    Ok(frames)
}

/// Extract a single frame at the video's midpoint, for videos with no detected scene changes
async fn extract_mid_duration_frame(
    path: &Path,
    frame_dir: &Path,
) -> Result<Option<PathBuf>, StageError> {
    let probe = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=noprint_wrappers=1:nokey=1")
        .arg(path)
        .output()
        .await?;
    let duration: f64 = String::from_utf8_lossy(&probe.stdout).trim().parse().unwrap_or(0.0);
    let midpoint = (duration / 2.0).max(0.0);
    let dest = frame_dir.join("mid.jpg");
    let status = Command::new("ffmpeg")
        .arg("-ss")
        .arg(format!("{midpoint:.3}"))
        .arg("-i")
        .arg(path)
        .arg("-frames:v")
        .arg("1")
        .arg(&dest)
        .status()
        .await?;
    if status.success() && dest.exists() {
        Ok(Some(dest))
    } else {
        Ok(None)
    }
}

/// An async tokio timeout wrapper for a long-running ffmpeg/model operation
pub async fn with_timeout<T>(
    future: impl std::future::Future<Output = Result<T, StageError>>,
    timeout: Duration,
    what: &str,
) -> Result<T, StageError> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| StageError::TransientExternal(format!("{what} timed out")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_tag_strips_confidence_suffix() {
        assert_eq!(clean_tag("red hair (0.95)"), Some("red_hair".to_string()));
    }

    #[test]
    fn clean_tag_drops_single_character() {
        assert_eq!(clean_tag("a"), None);
    }

    #[test]
    fn clean_tag_collapses_whitespace() {
        assert_eq!(clean_tag("blue   sky"), Some("blue_sky".to_string()));
    }

    #[test]
    fn safety_picks_highest_confidence_label() {
        let rating = vec![
            ("general".to_string(), 0.1),
            ("explicit".to_string(), 0.8),
            ("sensitive".to_string(), 0.1),
        ];
        assert_eq!(safety_from_rating(&rating), Safety::Unsafe);
    }

    #[test]
    fn general_tags_ranked_and_capped() {
        let predictions = RawPredictions {
            general: vec![
                ("cat".to_string(), 0.9),
                ("dog".to_string(), 0.95),
                ("low".to_string(), 0.1),
            ],
            character: vec![],
            rating: vec![("general".to_string(), 0.9)],
        };
        let result = result_from_predictions(&predictions, 0.3, 1);
        assert_eq!(result.general_tags, vec!["dog".to_string()]);
    }

    #[test]
    fn video_aggregation_keeps_tags_meeting_ratio() {
        let frame_a = RawPredictions {
            general: vec![("cat".to_string(), 0.9)],
            character: vec![],
            rating: vec![("general".to_string(), 0.9)],
        };
        let frame_b = RawPredictions {
            general: vec![],
            character: vec![],
            rating: vec![("explicit".to_string(), 0.9)],
        };
        let result = aggregate_frames(&[frame_a, frame_b], 0.3, 10, 0.5);
        assert!(result.general_tags.is_empty());
        assert_eq!(result.safety, Safety::Unsafe);
    }
}
