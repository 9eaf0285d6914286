//! Property tests for the testable invariants in spec §8 that hold on pure domain logic
//! (no database/Redis/Booru required — those invariants are exercised against the state
//! machine and pipeline-stage helpers directly, mirroring the `proptest`-based style the
//! `zakkums-Debian-Download-Manager` example uses for its own segment invariants).

use std::collections::HashMap;

use ingest_engine::models::JobStatus;
use ingest_engine::pipeline::handlers::SiteHandler;
use ingest_engine::pipeline::stages::{assemble_tags, assign_primary, build_source, MediaResult};
use proptest::prelude::*;

const ALL_STATUSES: [JobStatus; 9] = [
    JobStatus::Pending,
    JobStatus::Downloading,
    JobStatus::Tagging,
    JobStatus::Uploading,
    JobStatus::Completed,
    JobStatus::Merged,
    JobStatus::Failed,
    JobStatus::Paused,
    JobStatus::Stopped,
];

fn any_status() -> impl Strategy<Value = JobStatus> {
    prop::sample::select(ALL_STATUSES.to_vec())
}

fn any_tag() -> impl Strategy<Value = String> {
    "[A-Za-z]{1,8}"
}

/// A handler with no per-site comparison key, exercising the host+path fallback
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
        _site_secrets: &HashMap<String, String>,
    ) -> Result<(Vec<String>, Vec<std::path::PathBuf>), ingest_engine::pipeline::error::StageError> {
        Ok((Vec::new(), Vec::new()))
    }
}

proptest! {
    /// Invariant 2: terminal stickiness. No terminal status legally transitions anywhere:
    /// `can_pause`/`can_stop`/`can_resume`/`can_retry` are all false once a status is terminal.
    #[test]
    fn terminal_statuses_accept_no_transition(status in any_status()) {
        if status.is_terminal() {
            prop_assert!(!status.can_pause());
            prop_assert!(!status.can_stop());
            prop_assert!(!status.can_resume());
            // `failed` is the one terminal status `retry` is legal from, by design (it is
            // the only way out of `failed`); every other terminal status rejects retry too
            if status != JobStatus::Failed {
                prop_assert!(!status.can_retry());
            }
        }
    }

    /// Every non-terminal status accepts `stop` (spec §4.9 "`stop` is valid from any
    /// non-terminal state").
    #[test]
    fn every_non_terminal_status_accepts_stop(status in any_status()) {
        if !status.is_terminal() {
            prop_assert!(status.can_stop());
        }
    }

    /// Invariant 4: the tag set `assemble_tags` produces is case-insensitively unique, and
    /// `tagme` appears iff the result would otherwise have been empty.
    #[test]
    fn assembled_tags_are_case_insensitively_unique(tags in prop::collection::vec(any_tag(), 0..12)) {
        let map = HashMap::new();
        let assembled = assemble_tags(&tags, &ingest_engine::models::Value::Null, false, None, &map);
        let mut seen = std::collections::HashSet::new();
        for tag in &assembled {
            prop_assert!(seen.insert(tag.name.to_ascii_lowercase()));
        }
        if tags.is_empty() {
            prop_assert_eq!(assembled.len(), 1);
            prop_assert_eq!(&assembled[0].name, "tagme");
        } else {
            prop_assert!(!assembled.iter().any(|t| t.name.eq_ignore_ascii_case("tagme")));
        }
    }

    /// Invariant 3: self-relation exclusion. Whatever `assign_primary` designates as
    /// primary never reappears in its own `related_post_ids`.
    #[test]
    fn primary_post_excluded_from_its_own_relations(
        ids in prop::collection::hash_set(1u64..1000, 1..8),
    ) {
        let results: Vec<Option<MediaResult>> = ids
            .iter()
            .map(|&id| Some(MediaResult { post_id: id, was_merge: false }))
            .collect();
        if let Some((primary, _, related)) = assign_primary(&results) {
            prop_assert!(!related.contains(&primary));
        }
    }

    /// Invariant 5: the source string has no two URLs that compare equal under the
    /// registry's normalization (here, the host+path fallback key, case-insensitively).
    #[test]
    fn source_lines_are_deduplicated(
        path in "[a-z]{1,6}",
        case_variant in any::<bool>(),
    ) {
        let lower = format!("https://example.com/{path}");
        let other = if case_variant { lower.to_ascii_uppercase() } else { lower.clone() };
        let source = build_source(None, &lower, &other, &NoOpHandler);
        let lines: Vec<&str> = source.lines().collect();
        prop_assert_eq!(lines.len(), 1);
    }
}

#[test]
fn assign_primary_none_when_every_media_item_failed() {
    let results: Vec<Option<MediaResult>> = vec![None, None, None];
    assert!(assign_primary(&results).is_none());
}

#[test]
fn pending_is_the_only_status_neither_pause_nor_retry_eligible_but_stoppable() {
    assert!(!JobStatus::Pending.can_pause());
    assert!(!JobStatus::Pending.can_retry());
    assert!(JobStatus::Pending.can_stop());
}
