//! The per-media Pipeline Stages (spec §4.8): stateless operations that tie the
//! Extractor, Tagger, Tag Cache and Booru Client together for one media item within a
//! job — tag assembly, category resolution, tag materialization, source building,
//! upload/merge, and relation linking. The Worker Pool (the `worker` crate) drives these
//! in order for each media item, then calls [`assign_primary`] once every item in the job
//! has been processed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use tracing::instrument;

use crate::client::{BooruCreds, Post, PostUpdate};
use crate::models::helpers::Value;
use crate::models::jobs::Safety;
use crate::pipeline::error::StageError;
use crate::pipeline::handlers::SiteHandler;
use crate::pipeline::tagger::TagResult;
use crate::utils::Shared;

/// The sentinel tag substituted when a media item's assembled tag set would otherwise be
/// empty (spec §4.8 step 2)
pub const TAGME: &str = "tagme";

/// Which stage contributed one assembled tag, used to fill the job's `tags_applied` /
/// `tags_from_source` / `tags_from_ai` bookkeeping fields (spec §3 `Job`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOrigin {
    /// Supplied directly by the caller at job creation (`initial_tags`)
    ClientSupplied,
    /// Read out of extractor/site metadata (`tags`/`tags_*` keys)
    Source,
    /// Produced by the ML tagger
    Ai,
}

/// One fully assembled tag: its cleaned name, resolved category, and provenance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledTag {
    pub name: String,
    pub category: String,
    pub origin: TagOrigin,
}

/// Parse caller-supplied `initial_tags`, honoring `category:name` prefixes (spec §4.8
/// step 2). Returns `(name, category_override)` pairs.
#[must_use]
pub fn parse_initial_tags(initial_tags: &[String]) -> Vec<(String, Option<String>)> {
    initial_tags.iter().map(|raw| strip_category_prefix(raw)).collect()
}

/// Strip a leading `category:name` prefix from a tag string, if present
fn strip_category_prefix(raw: &str) -> (String, Option<String>) {
    match raw.split_once(':') {
        Some((category, name)) if !category.is_empty() && !name.is_empty() => {
            (name.to_string(), Some(category.to_string()))
        }
        _ => (raw.to_string(), None),
    }
}

/// Extract every metadata key named `tags` or `tags_*`, unioning all their values (spec
/// §4.8 step 2). Returns `(tag_name, source_key)` pairs so category resolution (step 3)
/// can later map e.g. `tags_artist` -> `artist` via the category mapping table.
#[must_use]
pub fn extract_metadata_tags(metadata: &Value) -> Vec<(String, String)> {
    let Some(object) = metadata.as_object() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (key, value) in object {
        if key == "tags" || key.starts_with("tags_") {
            for tag in value.flatten_tag_strings() {
                out.push((tag, key.clone()));
            }
        }
    }
    out
}

/// One raw tag candidate gathered from any source, before normalization/dedup
struct Candidate {
    name: String,
    category_override: Option<String>,
    source_key: Option<String>,
    origin: TagOrigin,
}

/// Assemble, normalize and deduplicate the full tag list for one media item (spec §4.8
/// steps 2-3): client overrides, source metadata, WD14 results, plus the literal `video`
/// tag for video files.
///
/// Category is resolved per tag in priority order: client override -> metadata source-key
/// mapped through `category_map` -> default `general`. WD14 character tags are force-set
/// to `character`.
///
/// # Arguments
///
/// * `initial_tags` - The job's caller-supplied tags, possibly `category:name` prefixed
/// * `metadata` - The merged extractor/site metadata for this media item
/// * `is_video` - Whether this media item is a video (appends the literal `video` tag)
/// * `ai_tags` - The tagger's result for this media item, if tagging wasn't skipped
/// * `category_map` - The source-key -> category mapping table (spec §3 `GlobalConfig`)
#[must_use]
pub fn assemble_tags(
    initial_tags: &[String],
    metadata: &Value,
    is_video: bool,
    ai_tags: Option<&TagResult>,
    category_map: &HashMap<String, String>,
) -> Vec<AssembledTag> {
    let mut candidates = Vec::new();
    for (name, category_override) in parse_initial_tags(initial_tags) {
        candidates.push(Candidate {
            name,
            category_override,
            source_key: None,
            origin: TagOrigin::ClientSupplied,
        });
    }
    for (raw_name, source_key) in extract_metadata_tags(metadata) {
        let (name, category_override) = strip_category_prefix(&raw_name);
        candidates.push(Candidate {
            name,
            category_override,
            source_key: Some(source_key),
            origin: TagOrigin::Source,
        });
    }
    if is_video {
        candidates.push(Candidate {
            name: "video".to_string(),
            category_override: None,
            source_key: None,
            origin: TagOrigin::Source,
        });
    }
    if let Some(ai) = ai_tags {
        for raw_name in &ai.general_tags {
            let (name, category_override) = strip_category_prefix(raw_name);
            candidates.push(Candidate {
                name,
                category_override,
                source_key: None,
                origin: TagOrigin::Ai,
            });
        }
        for raw_name in &ai.character_tags {
            let (name, _) = strip_category_prefix(raw_name);
            candidates.push(Candidate {
                name,
                category_override: Some("character".to_string()),
                source_key: None,
                origin: TagOrigin::Ai,
            });
        }
    }

    // dedupe case-insensitively, first occurrence wins (spec §4.8 step 2)
    let mut seen = HashSet::new();
    let mut assembled = Vec::new();
    for candidate in candidates {
        let normalized_name = candidate.name.split_whitespace().collect::<Vec<_>>().join("_");
        if normalized_name.is_empty() || !seen.insert(normalized_name.to_ascii_lowercase()) {
            continue;
        }
        let category = candidate
            .category_override
            .or_else(|| candidate.source_key.and_then(|key| category_map.get(&key).cloned()))
            .unwrap_or_else(|| "general".to_string());
        assembled.push(AssembledTag {
            name: normalized_name,
            category,
            origin: candidate.origin,
        });
    }

    if assembled.is_empty() {
        return vec![AssembledTag {
            name: TAGME.to_string(),
            category: "general".to_string(),
            origin: TagOrigin::Source,
        }];
    }
    // tagme must never coexist with real tags (spec §4.8 step 2)
    if assembled.len() > 1 {
        assembled.retain(|tag| !tag.name.eq_ignore_ascii_case(TAGME));
    }
    assembled
}

/// Materialize every assembled tag on the Booru via the Tag Cache's `ensure_batch`
/// (spec §4.8 step 4)
#[instrument(name = "pipeline::stages::materialize_tags", skip(tags, creds, shared), err(Debug))]
pub async fn materialize_tags(
    tags: &[AssembledTag],
    creds: &BooruCreds,
    shared: &Shared,
) -> Result<(), StageError> {
    let pairs: Vec<(String, String)> =
        tags.iter().map(|tag| (tag.name.clone(), tag.category.clone())).collect();
    crate::models::backends::tags::ensure_batch(&pairs, creds, shared).await?;
    Ok(())
}

/// Build the newline-separated source string from `(override, direct_url, page_url)`,
/// suppressing duplicates under the handler's comparison normalization (spec §4.8 step 5)
#[must_use]
pub fn build_source(
    source_override: Option<&str>,
    direct_url: &str,
    page_url: &str,
    handler: &dyn SiteHandler,
) -> String {
    let mut candidates = Vec::new();
    if let Some(over) = source_override {
        candidates.extend(over.lines().map(str::to_string));
    }
    candidates.push(direct_url.to_string());
    candidates.push(page_url.to_string());
    dedup_source_lines(candidates, handler).join("\n")
}

/// Merge a pre-existing post's source string with a freshly built one, for the merge
/// branch of step 6 ("append any new source URLs, deduped by the same normalization")
#[must_use]
pub fn merge_source(existing_source: Option<&str>, new_source: &str, handler: &dyn SiteHandler) -> String {
    let mut candidates = Vec::new();
    if let Some(existing) = existing_source {
        candidates.extend(existing.lines().map(str::to_string));
    }
    candidates.extend(new_source.lines().map(str::to_string));
    dedup_source_lines(candidates, handler).join("\n")
}

/// Dedup a list of candidate source lines under the handler's comparison normalization,
/// falling back to lowercased host+path when the handler declines to provide one (spec
/// §4.8 step 5 "falling back to host+path lowercased")
fn dedup_source_lines(candidates: Vec<String>, handler: &dyn SiteHandler) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for candidate in candidates {
        let trimmed = candidate.trim();
        if trimmed.is_empty() {
            continue;
        }
        let key = handler
            .normalize_for_comparison(trimmed)
            .unwrap_or_else(|| fallback_comparison_key(trimmed));
        if seen.insert(key) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// The default `normalize_for_comparison` fallback: lowercased host+path
fn fallback_comparison_key(url: &str) -> String {
    url::Url::parse(url)
        .map(|parsed| format!("{}{}", parsed.host_str().unwrap_or_default(), parsed.path()).to_ascii_lowercase())
        .unwrap_or_else(|_| url.to_ascii_lowercase())
}

/// The outcome of uploading or merging one media item
#[derive(Debug, Clone, Copy)]
pub struct MediaResult {
    pub post_id: u64,
    pub was_merge: bool,
}

/// Every tag name attached to an existing post, flattened across its synonym groups
fn existing_tag_names(post: &Post) -> Vec<String> {
    post.tags.iter().flat_map(|tag| tag.names.iter().cloned()).collect()
}

/// Union two tag name lists case-insensitively, existing names kept first (spec §4.8
/// step 6 "union its current tags with the new tags")
fn union_case_insensitive(existing: &[String], new: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for name in existing.iter().chain(new) {
        if seen.insert(name.to_ascii_lowercase()) {
            out.push(name.clone());
        }
    }
    out
}

/// Whether two tag lists are the same set, ignoring case and order
fn same_set_case_insensitive(a: &[String], b: &[String]) -> bool {
    let norm = |v: &[String]| -> BTreeSet<String> { v.iter().map(|s| s.to_ascii_lowercase()).collect() };
    norm(a) == norm(b)
}

/// Reverse-search, then either merge into an existing post or upload a new one (spec
/// §4.8 step 6).
///
/// Returns `Ok(None)` when the server reports the upload as a duplicate the caller has no
/// pre-existing post to merge into (the owner may lack permission to see/merge it) — a
/// non-fatal skip per spec §4.8 step 6, not an error.
///
/// # Arguments
///
/// * `file_path` - The downloaded media file
/// * `tags` - This media item's final assembled tags (already materialized)
/// * `safety` - The job's safety rating
/// * `source` - The freshly built source string for this media item
/// * `creds` - The owning user's Booru credentials
/// * `handler` - The site handler this job's url dispatched to, for source dedup
#[instrument(name = "pipeline::stages::upload_or_merge", skip(tags, creds, handler, shared), err(Debug))]
pub async fn upload_or_merge(
    file_path: &Path,
    tags: &[AssembledTag],
    safety: Safety,
    source: &str,
    creds: &BooruCreds,
    handler: &dyn SiteHandler,
    shared: &Shared,
) -> Result<Option<MediaResult>, StageError> {
    let tag_names: Vec<String> = tags.iter().map(|tag| tag.name.clone()).collect();
    let reverse = shared.booru.reverse_search(creds, file_path).await?;
    if let Some(exact) = reverse.exact_post {
        let post = shared.booru.get_post(creds, exact.id).await?;
        let existing_names = existing_tag_names(&post);
        let merged_tags = union_case_insensitive(&existing_names, &tag_names);
        let merged_source = merge_source(post.source.as_deref(), source, handler);
        let tags_changed = !same_set_case_insensitive(&existing_names, &merged_tags);
        let source_changed = post.source.as_deref() != Some(merged_source.as_str());
        if !tags_changed && !source_changed {
            // nothing to change; still a merge outcome, just a no-op update (spec §4.8
            // step 6 "If the post has no changes, skip the update")
            return Ok(Some(MediaResult { post_id: post.id, was_merge: true }));
        }
        let update = PostUpdate {
            tags: Some(merged_tags),
            source: Some(merged_source),
            relations: None,
            safety: None,
        };
        let updated = shared.booru.update_post(creds, post.id, post.version, update).await?;
        return Ok(Some(MediaResult { post_id: updated.id, was_merge: true }));
    }
    match shared.booru.upload(creds, file_path, &tag_names, safety, Some(source)).await {
        Ok(post) => Ok(Some(MediaResult { post_id: post.id, was_merge: false })),
        Err(error) if error.is_duplicate() => {
            tracing::info!("upload reported a duplicate with no visible pre-existing post, skipping media");
            Ok(None)
        }
        Err(error) => Err(error.into()),
    }
}

/// Reassign the job's primary post among this job's per-media results (spec.md §9 Open
/// Question 1, resolved in SPEC_FULL.md §C): the first media item that actually produced
/// a post becomes primary, even if an earlier index failed or was skipped; every other
/// produced post becomes a `related_post_ids` entry.
///
/// Returns `(primary_post_id, primary_was_merge, related_post_ids)`, or `None` if no
/// media item in the job produced a post.
#[must_use]
pub fn assign_primary(results: &[Option<MediaResult>]) -> Option<(u64, bool, Vec<u64>)> {
    let produced: Vec<&MediaResult> = results.iter().filter_map(Option::as_ref).collect();
    let (primary, rest) = produced.split_first()?;
    Some((primary.post_id, primary.was_merge, rest.iter().map(|r| r.post_id).collect()))
}

/// Link every post produced by a multi-media job to its siblings (spec §4.8 step 7):
/// after all media are processed, every produced post's `relations` is set to every
/// *other* produced post, excluding itself (spec §8 invariant 3 self-relation exclusion).
#[instrument(name = "pipeline::stages::link_relations", skip(creds, shared), err(Debug))]
pub async fn link_relations(all_post_ids: &[u64], creds: &BooruCreds, shared: &Shared) -> Result<(), StageError> {
    if all_post_ids.len() < 2 {
        return Ok(());
    }
    for &id in all_post_ids {
        let others: Vec<u64> = all_post_ids.iter().copied().filter(|&other| other != id).collect();
        let post = shared.booru.get_post(creds, id).await?;
        let update = PostUpdate {
            tags: None,
            source: None,
            relations: Some(others),
            safety: None,
        };
        shared.booru.update_post(creds, id, post.version, update).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembled(name: &str, category: &str) -> AssembledTag {
        AssembledTag {
            name: name.to_string(),
            category: category.to_string(),
            origin: TagOrigin::ClientSupplied,
        }
    }

    #[test]
    fn parse_initial_tags_splits_category_prefix() {
        let parsed = parse_initial_tags(&["artist:alice".to_string(), "red".to_string()]);
        assert_eq!(parsed[0], ("alice".to_string(), Some("artist".to_string())));
        assert_eq!(parsed[1], ("red".to_string(), None));
    }

    #[test]
    fn assemble_tags_dedupes_case_insensitively_first_wins() {
        let map = HashMap::new();
        let tags = assemble_tags(
            &["Red".to_string(), "red".to_string()],
            &Value::Null,
            false,
            None,
            &map,
        );
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "Red");
    }

    #[test]
    fn assemble_tags_substitutes_tagme_when_empty() {
        let map = HashMap::new();
        let tags = assemble_tags(&[], &Value::Null, false, None, &map);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, TAGME);
    }

    #[test]
    fn assemble_tags_drops_tagme_when_real_tags_present() {
        let map = HashMap::new();
        let tags = assemble_tags(
            &["tagme".to_string(), "red".to_string()],
            &Value::Null,
            false,
            None,
            &map,
        );
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "red");
    }

    #[test]
    fn assemble_tags_maps_metadata_source_key_to_category() {
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert(
            "tags_artist".to_string(),
            Value::Array(vec![Value::String("alice".to_string())]),
        );
        let mut map = HashMap::new();
        map.insert("tags_artist".to_string(), "artist".to_string());
        let tags = assemble_tags(&[], &Value::Object(metadata), false, None, &map);
        assert_eq!(tags[0].name, "alice");
        assert_eq!(tags[0].category, "artist");
    }

    #[test]
    fn assemble_tags_forces_ai_character_category() {
        let map = HashMap::new();
        let ai = TagResult {
            general_tags: vec!["outdoors".to_string()],
            character_tags: vec!["alice".to_string()],
            safety: Safety::Safe,
        };
        let tags = assemble_tags(&[], &Value::Null, false, Some(&ai), &map);
        let alice = tags.iter().find(|t| t.name == "alice").unwrap();
        assert_eq!(alice.category, "character");
    }

    #[test]
    fn assign_primary_skips_failed_index_zero() {
        let results = vec![
            None,
            Some(MediaResult { post_id: 102, was_merge: false }),
            Some(MediaResult { post_id: 103, was_merge: false }),
        ];
        let (primary, was_merge, related) = assign_primary(&results).unwrap();
        assert_eq!(primary, 102);
        assert!(!was_merge);
        assert_eq!(related, vec![103]);
    }

    #[test]
    fn assign_primary_none_when_nothing_produced() {
        assert!(assign_primary(&[None, None]).is_none());
    }

    #[test]
    fn union_case_insensitive_prefers_existing_case() {
        let existing = vec!["Blue".to_string()];
        let new = vec!["blue".to_string(), "red".to_string()];
        let merged = union_case_insensitive(&existing, &new);
        assert_eq!(merged, vec!["Blue".to_string(), "red".to_string()]);
    }

    #[test]
    fn build_source_dedups_under_fallback_comparison_key() {
        struct NoOpHandler;
        impl SiteHandler for NoOpHandler {
            fn name(&self) -> &'static str {
                "noop"
            }
            fn matches(&self, _url: &str) -> bool {
                true
            }
            fn build_extractor_args(
                &self,
                _site_secrets: &std::collections::HashMap<String, String>,
            ) -> Result<(Vec<String>, Vec<std::path::PathBuf>), StageError> {
                Ok((Vec::new(), Vec::new()))
            }
        }
        let source = build_source(
            Some("https://example.com/post/1"),
            "https://example.com/post/1",
            "https://EXAMPLE.com/post/1",
            &NoOpHandler,
        );
        assert_eq!(source, "https://example.com/post/1");
    }

    #[test]
    fn assembled_tag_equality_ignores_origin_by_value() {
        let a = assembled("red", "general");
        let b = assembled("red", "general");
        assert_eq!(a, b);
    }
}
