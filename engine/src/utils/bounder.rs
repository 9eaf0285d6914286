//! Bounds/shape checking utilities for user input to the ingest engine

use url::Url;

use super::ApiError;
use crate::{bad, bad_internal};

/// Bounds check a string
///
/// # Arguments
///
/// * `input` - The string to bounds check
/// * `name` - The variable name to be bounds checked (for logging/errors)
/// * `min` - The minimum length of this string
/// * `max` - The maximum length of this string
pub fn string(input: &str, name: &'static str, min: usize, max: usize) -> Result<(), ApiError> {
    let input_len = input.len();
    if input_len < min || input_len > max {
        return bad!(format!(
            "{name} must be between {min} and {max} chars"
        ));
    }
    Ok(())
}

/// Bounds check a tag name
///
/// # Arguments
///
/// * `input` - The tag name to bounds check
pub fn tag_name(input: &str) -> Result<(), ApiError> {
    if input.is_empty() || input.len() > 255 {
        return bad!(format!("tag '{input}' must be between 1 and 255 chars"));
    }
    Ok(())
}

/// Path segments that indicate a URL points at a feed/listing/profile page rather than a
/// single post (spec §4.10 "reject feed/home pages, bare domains, subreddit-only paths, etc —
/// must resolve to a specific post").
const LISTING_ONLY_SEGMENTS: &[&str] = &[
    "", "home", "explore", "search", "tags", "popular", "following", "media", "likes",
];

/// Validate that a job creation URL resolves to a single specific post rather than a feed,
/// profile, or bare domain.
///
/// This is a coarse, host-agnostic shape check performed at job creation time; the site
/// handler registry's own `matches`/`normalize` still runs per-handler validation at
/// extraction time.
pub fn job_url(raw: &str) -> Result<Url, ApiError> {
    let url = Url::parse(raw)
        .map_err(|error| bad_internal!(format!("'{raw}' is not a valid url: {error}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return bad!(format!("'{raw}' must use http or https"));
    }
    if url.host_str().is_none() {
        return bad!(format!("'{raw}' must have a host"));
    }
    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    if segments.is_empty() {
        return bad!(format!("'{raw}' is a bare domain, not a post"));
    }
    if segments.len() == 1 && LISTING_ONLY_SEGMENTS.contains(&segments[0].to_lowercase().as_str())
    {
        return bad!(format!("'{raw}' looks like a feed/listing page, not a post"));
    }
    // a lone subreddit path (`/r/<name>` with nothing after it) is a listing, not a post
    if segments.len() == 2 && segments[0].eq_ignore_ascii_case("r") {
        return bad!(format!("'{raw}' is a subreddit listing, not a post"));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bare_domain() {
        assert!(job_url("https://example.com/").is_err());
        assert!(job_url("https://example.com").is_err());
    }

    #[test]
    fn rejects_home_page() {
        assert!(job_url("https://example.com/home").is_err());
    }

    #[test]
    fn rejects_bare_subreddit() {
        assert!(job_url("https://reddit.com/r/aww").is_err());
    }

    #[test]
    fn accepts_specific_post() {
        assert!(job_url("https://reddit.com/r/aww/comments/abc123/title").is_ok());
    }

    #[test]
    fn accepts_specific_booru_post() {
        assert!(job_url("https://booru.example.com/post/42").is_ok());
    }

    #[test]
    fn tag_name_rejects_empty_and_oversized() {
        assert!(tag_name("").is_err());
        assert!(tag_name(&"a".repeat(256)).is_err());
        assert!(tag_name("red").is_ok());
    }
}
