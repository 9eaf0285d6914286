//! The Extractor (spec §4.5): enumerates direct media URLs from a page, then downloads each
//! one, either via a plain HTTP GET or by shelling out to `gallery-dl`/`yt-dlp` and walking
//! whatever the subprocess leaves in the scratch directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use tokio::process::Command;
use tracing::instrument;
use walkdir::WalkDir;

use crate::models::helpers::Value;
use crate::models::jobs::ExtractedMedia;
use crate::pipeline::error::StageError;
use crate::pipeline::handlers::SiteHandler;

/// The process-wide HTTP client used for direct-download handlers
static DIRECT_DOWNLOAD_CLIENT: LazyLock<reqwest::Client> =
    LazyLock::new(|| reqwest::Client::builder().build().expect("reqwest client"));

/// Files and the merged sidecar metadata produced by one [`download`] call
pub struct Downloaded {
    pub files: Vec<PathBuf>,
    pub metadata: Value,
}

/// Enumerate the direct media items a page resolves to
///
/// # Arguments
///
/// * `url` - The normalized page url
/// * `handler` - The site handler this url dispatched to
/// * `site_secrets` - The owning user's per-site credentials for this handler
/// * `timeout` - How long the resolver/metadata-dump subprocess may run
#[instrument(name = "pipeline::extractor::enumerate", skip(handler, site_secrets), err(Debug))]
pub async fn enumerate(
    url: &str,
    handler: &dyn SiteHandler,
    site_secrets: &std::collections::HashMap<String, String>,
    timeout: Duration,
) -> Result<Vec<ExtractedMedia>, StageError> {
    let (extra_args, temp_files) = handler.build_extractor_args(site_secrets)?;
    let result = if handler.uses_resolve_mode() {
        enumerate_resolve_mode(url, &extra_args, timeout).await
    } else {
        enumerate_metadata_dump(url, &extra_args, timeout).await
    };
    for temp_file in temp_files {
        let _ = tokio::fs::remove_file(&temp_file).await;
    }
    let media = result?;
    if media.is_empty() {
        return Ok(vec![fallback_media(url)]);
    }
    Ok(media)
}

/// Run `yt-dlp --get-url`-style resolution: one direct url per stdout line
async fn enumerate_resolve_mode(
    url: &str,
    extra_args: &[String],
    timeout: Duration,
) -> Result<Vec<ExtractedMedia>, StageError> {
    let output = run_subprocess("yt-dlp", extra_args, url, timeout).await?;
    let media = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|direct_url| ExtractedMedia {
            page_url: url.to_string(),
            direct_url: direct_url.to_string(),
            suggested_filename: None,
            metadata: Value::Null,
        })
        .collect();
    Ok(media)
}

/// Run a metadata-dump extractor and parse its JSON, which may be a single object, an array
/// of objects, or an array of `[type, url, dict]` triplets
async fn enumerate_metadata_dump(
    url: &str,
    extra_args: &[String],
    timeout: Duration,
) -> Result<Vec<ExtractedMedia>, StageError> {
    let mut args = vec!["--dump-json".to_string()];
    args.extend_from_slice(extra_args);
    let output = run_subprocess("gallery-dl", &args, url, timeout).await?;
    let mut dicts = Vec::new();
    for line in output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        collect_metadata_dicts(parsed, &mut dicts);
    }
    if dicts.is_empty() {
        // gallery-dl sometimes emits the entire dump as one JSON array instead of jsonlines
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(output.stdout.trim()) {
            collect_metadata_dicts(parsed, &mut dicts);
        }
    }
    let mut seen = HashSet::new();
    let mut media = Vec::new();
    for dict in dicts {
        let value: Value = dict.into();
        let Some(key) = dedup_key(&value) else {
            continue;
        };
        if !seen.insert(key) {
            continue;
        }
        if let Some(item) = media_from_dict(url, &value) {
            media.push(item);
        }
    }
    Ok(media)
}

/// Unwrap a parsed JSON value into one or more metadata dicts: a bare object, an array of
/// objects, or an array of `[type, url, dict]` triplets
fn collect_metadata_dicts(value: serde_json::Value, out: &mut Vec<serde_json::Value>) {
    match value {
        serde_json::Value::Object(_) => out.push(value),
        serde_json::Value::Array(items) => {
            for item in items {
                match item {
                    serde_json::Value::Object(_) => out.push(item),
                    serde_json::Value::Array(triplet) if triplet.len() == 3 => {
                        if let Some(dict) = triplet.into_iter().nth(2) {
                            if dict.is_object() {
                                out.push(dict);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

/// The key used to deduplicate extracted media: post id if present, else a content hash of
/// the direct url fields
fn dedup_key(value: &Value) -> Option<String> {
    if let Some(id) = value.get("id") {
        if let Some(s) = id.as_str() {
            return Some(s.to_string());
        }
        if let Value::Int(i) = id {
            return Some(i.to_string());
        }
    }
    let direct = value
        .get("file_url")
        .or_else(|| value.get("sample_url"))
        .or_else(|| value.get("url"))
        .and_then(Value::as_str);
    direct.map(str::to_string)
}

fn media_from_dict(page_url: &str, value: &Value) -> Option<ExtractedMedia> {
    let direct_url = value
        .get("file_url")
        .or_else(|| value.get("sample_url"))
        .or_else(|| value.get("url"))
        .and_then(Value::as_str)?
        .to_string();
    let suggested_filename = value
        .get("filename")
        .and_then(Value::as_str)
        .map(|name| match value.get("extension").and_then(Value::as_str) {
            Some(ext) if !name.ends_with(ext) => format!("{name}.{ext}"),
            _ => name.to_string(),
        });
    Some(ExtractedMedia {
        page_url: page_url.to_string(),
        direct_url,
        suggested_filename,
        metadata: value.clone(),
    })
}

/// A single fallback media item when extraction yields nothing usable
fn fallback_media(url: &str) -> ExtractedMedia {
    ExtractedMedia {
        page_url: url.to_string(),
        direct_url: url.to_string(),
        suggested_filename: None,
        metadata: Value::Null,
    }
}

/// Download one extracted media item into `dest_dir`
///
/// # Arguments
///
/// * `media` - The item to download
/// * `dest_dir` - A scratch directory unique to this job
/// * `handler` - The handler this job's url dispatched to
/// * `site_secrets` - The owning user's per-site credentials for this handler
/// * `download_timeout` - The HTTP/subprocess timeout for direct downloads
/// * `subprocess_timeout` - The timeout for extractor-tool downloads (typically longer)
/// * `direct_download_cap_bytes` - The max response size accepted for a direct GET
#[instrument(name = "pipeline::extractor::download", skip(handler, site_secrets), err(Debug))]
pub async fn download(
    media: &ExtractedMedia,
    dest_dir: &Path,
    handler: &dyn SiteHandler,
    site_secrets: &std::collections::HashMap<String, String>,
    download_timeout: Duration,
    subprocess_timeout: Duration,
    direct_download_cap_bytes: u64,
) -> Result<Downloaded, StageError> {
    tokio::fs::create_dir_all(dest_dir).await?;
    // videos bypass the direct-download cap entirely and always route through the
    // extractor tool instead, even for handlers that otherwise fetch directly (spec.md
    // §9 Open Question 2, resolved in SPEC_FULL.md §C)
    if handler.uses_direct_download() && media.direct_url != media.page_url && !is_video_url(&media.direct_url) {
        let file = download_direct(
            &media.direct_url,
            dest_dir,
            download_timeout,
            direct_download_cap_bytes,
        )
        .await?;
        return Ok(Downloaded {
            files: vec![file],
            metadata: media.metadata.clone(),
        });
    }
    let (extra_args, temp_files) = handler.build_extractor_args(site_secrets)?;
    let mut files = run_extractor_tool("gallery-dl", &extra_args, &media.page_url, dest_dir, subprocess_timeout)
        .await
        .map(|()| collect_dest_dir(dest_dir))
        .unwrap_or_default();
    for temp_file in &temp_files {
        let _ = tokio::fs::remove_file(temp_file).await;
    }
    if files.files.is_empty() {
        files = run_extractor_tool("yt-dlp", &[], &media.page_url, dest_dir, subprocess_timeout)
            .await
            .map(|()| collect_dest_dir(dest_dir))
            .unwrap_or_default();
    }
    if files.files.is_empty() {
        return Err(StageError::PermanentExternal(format!(
            "no media produced for {}",
            media.page_url
        )));
    }
    let mut metadata = media.metadata.clone();
    if let Value::Object(found) = files.metadata {
        if let Value::Object(existing) = &mut metadata {
            existing.extend(found);
        } else {
            metadata = Value::Object(found);
        }
    }
    Ok(Downloaded {
        files: files.files,
        metadata,
    })
}

/// Whether a url names a video file by extension, used to route videos through the
/// extractor tool rather than the capped direct-HTTP-GET path
fn is_video_url(url: &str) -> bool {
    const VIDEO_EXTS: &[&str] = &["mp4", "webm", "mov", "mkv", "avi", "m4v", "gif"];
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('.')
        .next()
        .is_some_and(|ext| VIDEO_EXTS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Fetch a direct media url over HTTP, bounded by timeout and a max body size
async fn download_direct(
    url: &str,
    dest_dir: &Path,
    timeout: Duration,
    cap_bytes: u64,
) -> Result<PathBuf, StageError> {
    let resp = tokio::time::timeout(timeout, DIRECT_DOWNLOAD_CLIENT.get(url).send())
        .await
        .map_err(|_| StageError::TransientExternal(format!("timed out downloading {url}")))?
        .map_err(StageError::from)?;
    if let Some(len) = resp.content_length() {
        if len > cap_bytes {
            return Err(StageError::PermanentExternal(format!(
                "{url} reports {len} bytes, over the {cap_bytes} byte direct-download cap"
            )));
        }
    }
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = tokio::time::timeout(timeout, resp.bytes())
        .await
        .map_err(|_| StageError::TransientExternal(format!("timed out reading body for {url}")))?
        .map_err(StageError::from)?;
    if bytes.len() as u64 > cap_bytes {
        return Err(StageError::PermanentExternal(format!(
            "{url} body is {} bytes, over the {cap_bytes} byte direct-download cap",
            bytes.len()
        )));
    }
    let ext = content_type
        .as_deref()
        .and_then(mime_guess::get_mime_extensions_str)
        .and_then(|exts| exts.first().copied())
        .or_else(|| url.rsplit('.').next().filter(|e| e.len() <= 5))
        .unwrap_or("bin");
    let filename = url
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("download.{ext}"));
    let dest = unique_dest(dest_dir, &filename);
    tokio::fs::write(&dest, &bytes).await?;
    Ok(dest)
}

/// The output of running an extractor subprocess
struct SubprocessOutput {
    stdout: String,
}

/// Spawn `program` with `args` plus the page url, waiting up to `timeout`
async fn run_subprocess(
    program: &str,
    args: &[String],
    url: &str,
    timeout: Duration,
) -> Result<SubprocessOutput, StageError> {
    let mut command = Command::new(program);
    command.args(args).arg(url);
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| StageError::TransientExternal(format!("{program} timed out on {url}")))?
        .map_err(StageError::from)?;
    // a subprocess may exit non-zero yet still have produced usable stdout/files
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    Ok(SubprocessOutput { stdout })
}

/// Run an extractor tool that writes its output into `dest_dir` rather than stdout
async fn run_extractor_tool(
    program: &str,
    extra_args: &[String],
    url: &str,
    dest_dir: &Path,
    timeout: Duration,
) -> Result<(), StageError> {
    let mut command = Command::new(program);
    command
        .arg("--no-part")
        .args(extra_args)
        .arg("-o")
        .arg(dest_dir.join("%(id)s.%(ext)s"))
        .arg(url);
    let status = tokio::time::timeout(timeout, command.status())
        .await
        .map_err(|_| StageError::TransientExternal(format!("{program} timed out on {url}")))?
        .map_err(StageError::from)?;
    if !status.success() {
        tracing::warn!(%program, %url, "extractor subprocess exited non-zero, checking dest_dir for partial output anyway");
    }
    Ok(())
}

/// Recursively collect media files out of a scratch directory, merging any `*.json` sidecars
/// and discarding `*.txt` artifacts
fn collect_dest_dir(dest_dir: &Path) -> Downloaded {
    let mut files = Vec::new();
    let mut merged = std::collections::BTreeMap::new();
    for entry in WalkDir::new(dest_dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
    {
        let path = entry.path().to_path_buf();
        match path.extension().and_then(std::ffi::OsStr::to_str) {
            Some("json") => {
                if let Ok(raw) = std::fs::read_to_string(&path) {
                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) {
                        if let serde_json::Value::Object(map) = parsed {
                            for (k, v) in map {
                                merged.insert(k, Value::from(v));
                            }
                        }
                    }
                }
            }
            Some("txt") => {}
            _ => files.push(path),
        }
    }
    Downloaded {
        files,
        metadata: Value::Object(merged),
    }
}

impl Default for Downloaded {
    fn default() -> Self {
        Downloaded {
            files: Vec::new(),
            metadata: Value::Null,
        }
    }
}

/// Resolve a filename collision inside `dest_dir` by appending `_1`, `_2`, … before the
/// extension
fn unique_dest(dest_dir: &Path, filename: &str) -> PathBuf {
    let candidate = dest_dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(filename);
    let stem = path.file_stem().and_then(std::ffi::OsStr::to_str).unwrap_or(filename);
    let ext = path.extension().and_then(std::ffi::OsStr::to_str);
    for n in 1.. {
        let name = match ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        let candidate = dest_dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_prefers_id() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("id".to_string(), Value::Int(42));
        map.insert("file_url".to_string(), Value::String("https://x/1.jpg".to_string()));
        let value = Value::Object(map);
        assert_eq!(dedup_key(&value), Some("42".to_string()));
    }

    #[test]
    fn dedup_key_falls_back_to_url() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("file_url".to_string(), Value::String("https://x/1.jpg".to_string()));
        let value = Value::Object(map);
        assert_eq!(dedup_key(&value), Some("https://x/1.jpg".to_string()));
    }

    #[test]
    fn triplet_dump_unwraps_to_dict() {
        let parsed = serde_json::json!([["photo", "https://x/1.jpg", {"id": 1, "file_url": "https://x/1.jpg"}]]);
        let mut dicts = Vec::new();
        collect_metadata_dicts(parsed, &mut dicts);
        assert_eq!(dicts.len(), 1);
    }

    #[test]
    fn unique_dest_appends_suffix_on_collision() {
        let dir = std::env::temp_dir().join(format!("extractor-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.jpg"), b"1").unwrap();
        let resolved = unique_dest(&dir, "a.jpg");
        assert_eq!(resolved, dir.join("a_1.jpg"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
