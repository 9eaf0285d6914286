//! The Site Handler Registry (spec §4.4): dispatches an ingest URL to the handler that
//! knows how to extract from it, falling back to a generic `yt-dlp`-driven handler for
//! anything unrecognized.

use std::path::PathBuf;

use crate::pipeline::error::StageError;

/// One credential key a handler may request from a user's per-site secrets
/// (spec §4.4 "a declarative list of credential keys")
pub type CredentialKey = &'static str;

/// A site-specific extraction strategy
pub trait SiteHandler: Send + Sync {
    /// A short, stable name for this handler, used as the `UserConfig::site_secrets` key
    fn name(&self) -> &'static str;

    /// Whether this handler recognizes the given url
    fn matches(&self, url: &str) -> bool;

    /// The canonical form of this url, used for storage and dedup
    fn normalize(&self, url: &str) -> String {
        url.to_string()
    }

    /// A stricter comparison key that collapses variant hosts/paths onto one canonical
    /// identity (spec §9 Open Question 3); `None` falls back to host+path lowercased
    fn normalize_for_comparison(&self, _url: &str) -> Option<String> {
        None
    }

    /// True when direct-media enumeration must be used instead of a JSON metadata dump
    fn uses_resolve_mode(&self) -> bool {
        false
    }

    /// True when individual media should be fetched by a plain HTTP GET instead of via
    /// the extractor subprocess
    fn uses_direct_download(&self) -> bool {
        false
    }

    /// Out of scope: browsing/discovery UI is not implemented, but the flag is part of
    /// the handler contract
    fn supports_browse(&self) -> bool {
        false
    }

    /// The per-site credential keys this handler may need
    fn credentials(&self) -> &'static [CredentialKey] {
        &[]
    }

    /// Build the extractor subprocess's CLI argument fragment plus any temp files (e.g. a
    /// cookie jar) that must be deleted after the subprocess returns on every exit path
    fn build_extractor_args(
        &self,
        site_secrets: &std::collections::HashMap<String, String>,
    ) -> Result<(Vec<String>, Vec<PathBuf>), StageError>;
}

/// The generic fallback handler: hands every url straight to `yt-dlp` with no special
/// cookie/auth handling
pub struct GenericYtDlpHandler;

impl SiteHandler for GenericYtDlpHandler {
    fn name(&self) -> &'static str {
        "generic"
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

/// A booru-style site direct-download capable, no resolve mode needed since each post is
/// already exactly one media item.
///
/// Some boorus are reachable under several historical domains that must collapse onto one
/// canonical host for dedup (spec §9 Open Question 3's "legacy hash-id subdomain vs.
/// numeric-id host" scenario); `normalize_for_comparison` folds any alias host onto
/// `canonical_host` while leaving the path untouched, the same scheme Sankaku's own
/// extractor uses to fold `sankaku.app`/`chan.sankakucomplex.com` onto `sankakucomplex.com`.
pub struct BooruDirectIdHandler {
    canonical_host: &'static str,
    aliases: &'static [&'static str],
}

impl BooruDirectIdHandler {
    #[must_use]
    pub fn new(canonical_host: &'static str, aliases: &'static [&'static str]) -> Self {
        BooruDirectIdHandler { canonical_host, aliases }
    }
}

impl SiteHandler for BooruDirectIdHandler {
    fn name(&self) -> &'static str {
        self.canonical_host
    }

    fn matches(&self, url: &str) -> bool {
        url.contains(self.canonical_host) || self.aliases.iter().any(|alias| url.contains(alias))
    }

    fn normalize_for_comparison(&self, url: &str) -> Option<String> {
        let parsed = url::Url::parse(url).ok()?;
        let host = parsed.host_str()?.to_ascii_lowercase();
        if host != self.canonical_host && !self.aliases.contains(&host.as_str()) {
            return None;
        }
        let path = parsed.path().trim_end_matches('/');
        Some(format!("{}{path}", self.canonical_host))
    }

    fn uses_direct_download(&self) -> bool {
        true
    }

    fn credentials(&self) -> &'static [CredentialKey] {
        &["api-key"]
    }

    fn build_extractor_args(
        &self,
        site_secrets: &std::collections::HashMap<String, String>,
    ) -> Result<(Vec<String>, Vec<PathBuf>), StageError> {
        let mut args = Vec::new();
        if let Some(key) = site_secrets.get("api-key") {
            args.push("--http-header".to_string());
            args.push(format!("Authorization: Token {key}"));
        }
        Ok((args, Vec::new()))
    }
}

/// A site whose metadata is best read via `gallery-dl`'s JSON metadata-dump mode rather
/// than `yt-dlp`
pub struct GalleryDlHandler {
    host: &'static str,
}

impl GalleryDlHandler {
    #[must_use]
    pub fn new(host: &'static str) -> Self {
        GalleryDlHandler { host }
    }
}

impl SiteHandler for GalleryDlHandler {
    fn name(&self) -> &'static str {
        self.host
    }

    fn matches(&self, url: &str) -> bool {
        url.contains(self.host)
    }

    fn credentials(&self) -> &'static [CredentialKey] {
        &["cookies"]
    }

    fn build_extractor_args(
        &self,
        site_secrets: &std::collections::HashMap<String, String>,
    ) -> Result<(Vec<String>, Vec<PathBuf>), StageError> {
        let mut args = Vec::new();
        let mut temp_files = Vec::new();
        if let Some(cookies) = site_secrets.get("cookies") {
            let jar = std::env::temp_dir().join(format!("{}-{}.txt", self.host, uuid::Uuid::new_v4()));
            std::fs::write(&jar, cookies).map_err(StageError::from)?;
            args.push("--cookies".to_string());
            args.push(jar.to_string_lossy().into_owned());
            temp_files.push(jar);
        }
        Ok((args, temp_files))
    }
}

/// A link-aggregator site whose posts fan out into many direct media urls, requiring
/// resolve mode (one direct url per extractor output line) rather than a metadata dump
pub struct ResolveModeHandler {
    host: &'static str,
}

impl ResolveModeHandler {
    #[must_use]
    pub fn new(host: &'static str) -> Self {
        ResolveModeHandler { host }
    }
}

impl SiteHandler for ResolveModeHandler {
    fn name(&self) -> &'static str {
        self.host
    }

    fn matches(&self, url: &str) -> bool {
        url.contains(self.host)
    }

    fn uses_resolve_mode(&self) -> bool {
        true
    }

    fn build_extractor_args(
        &self,
        _site_secrets: &std::collections::HashMap<String, String>,
    ) -> Result<(Vec<String>, Vec<PathBuf>), StageError> {
        Ok((vec!["--get-url".to_string()], Vec::new()))
    }
}

/// Dispatches urls to the handler that should extract from them
pub struct Registry {
    handlers: Vec<Box<dyn SiteHandler>>,
    fallback: GenericYtDlpHandler,
}

impl Registry {
    /// Build the registry with the set of concrete handlers this deployment knows about
    #[must_use]
    pub fn new() -> Self {
        Registry {
            handlers: vec![
                Box::new(BooruDirectIdHandler::new(
                    "booru.example.com",
                    &["booru.app", "chan.booru-cdn.example.com"],
                )),
                Box::new(GalleryDlHandler::new("gallery.example.com")),
                Box::new(ResolveModeHandler::new("links.example.com")),
            ],
            fallback: GenericYtDlpHandler,
        }
    }

    /// Dispatch a url to the first matching handler, or the generic fallback
    #[must_use]
    pub fn dispatch(&self, url: &str) -> &dyn SiteHandler {
        self.handlers
            .iter()
            .find(|handler| handler.matches(url))
            .map(|handler| handler.as_ref())
            .unwrap_or(&self.fallback)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_falls_back_to_generic() {
        let registry = Registry::new();
        assert_eq!(registry.dispatch("https://unknown-site.test/post/1").name(), "generic");
    }

    #[test]
    fn registry_dispatches_booru_host() {
        let registry = Registry::new();
        let handler = registry.dispatch("https://booru.example.com/post/42");
        assert!(handler.uses_direct_download());
    }

    #[test]
    fn booru_handler_collapses_alias_domains() {
        let registry = Registry::new();
        let canonical = registry.dispatch("https://booru.example.com/post/42");
        let alias = registry.dispatch("https://booru.app/post/42");
        assert_eq!(
            canonical.normalize_for_comparison("https://booru.example.com/post/42"),
            alias.normalize_for_comparison("https://booru.app/post/42"),
        );
    }

    #[test]
    fn booru_handler_ignores_unrelated_host() {
        let handler = BooruDirectIdHandler::new("booru.example.com", &["booru.app"]);
        assert_eq!(handler.normalize_for_comparison("https://other-site.test/post/42"), None);
    }
}
