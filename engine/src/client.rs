//! A typed async client for the downstream Booru (a szurubooru-compatible image board).
//!
//! Every call is authenticated per-request from an explicit [`BooruCreds`] argument rather
//! than an ambient session — different jobs may upload as different owning users, and the
//! worker pool runs many jobs concurrently, so there is no single "current user" to hang off
//! a task-local (see spec design note on contextual per-call credentials).

use base64::Engine as _;
use std::path::Path;
use std::time::Duration;

mod error;
pub use error::Error;

use crate::models::jobs::Safety;

/// Per-call credentials for one Booru user
#[derive(Debug, Clone)]
pub struct BooruCreds {
    /// The base url of the Booru API, e.g. `https://booru.example.com`
    pub base_url: String,
    /// The Booru username to authenticate as
    pub username: String,
    /// The Booru API token for this user
    pub token: String,
}

impl BooruCreds {
    /// Build the `Authorization: Token ...` header value for this user
    fn auth_header(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.token));
        format!("Token {encoded}")
    }
}

/// A post as returned by the Booru
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Post {
    pub id: u64,
    pub version: u64,
    #[serde(default)]
    pub tags: Vec<PostTag>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub safety: Option<String>,
    #[serde(rename = "contentChecksum", default)]
    pub content_checksum: Option<String>,
    #[serde(default)]
    pub relations: Vec<PostRelation>,
}

/// A tag reference embedded in a [`Post`]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostTag {
    pub names: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
}

/// A related-post reference embedded in a [`Post`]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostRelation {
    pub id: u64,
}

/// A tag as returned by the Booru
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tag {
    pub names: Vec<String>,
    pub category: String,
    pub version: u64,
}

/// The result of a reverse image search
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ReverseSearchResult {
    #[serde(rename = "exactPost")]
    pub exact_post: Option<Post>,
    #[serde(rename = "similarPosts", default)]
    pub similar_posts: Vec<SimilarPost>,
}

/// One entry in a reverse search's similarity list
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimilarPost {
    pub distance: f64,
    pub post: Post,
}

/// Fields that may be PUT onto an existing post under optimistic concurrency
#[derive(Debug, Clone, Default, Serialize)]
pub struct PostUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relations: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety: Option<Safety>,
}

/// A paginated page of search results
#[derive(Debug, Clone, Deserialize)]
struct SearchPage<T> {
    results: Vec<T>,
}

/// The Booru client: one `reqwest::Client` shared process-wide across all jobs/owners
#[derive(Clone)]
pub struct BooruClient {
    http: reqwest::Client,
}

impl BooruClient {
    /// Build a new client with the given per-call timeout
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(BooruClient { http })
    }

    /// Upload a new post
    ///
    /// # Arguments
    ///
    /// * `creds` - The owning user's Booru credentials
    /// * `file_path` - The media file to upload
    /// * `tags` - The tag names to attach
    /// * `safety` - The post's safety rating
    /// * `source` - An optional newline-separated source string
    pub async fn upload(
        &self,
        creds: &BooruCreds,
        file_path: &Path,
        tags: &[String],
        safety: Safety,
        source: Option<&str>,
    ) -> Result<Post, Error> {
        let bytes = tokio::fs::read(file_path).await?;
        let file_name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime = mime_guess::from_path(file_path)
            .first_or_octet_stream()
            .to_string();
        let metadata = serde_json::json!({
            "tags": tags,
            "safety": safety,
            "source": source,
        });
        let file_part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(&mime)?;
        let form = reqwest::multipart::Form::new()
            .text("metadata", metadata.to_string())
            .part("content", file_part);
        let url = format!("{}/api/posts", creds.base_url);
        let resp = self
            .http
            .post(url)
            .header("Authorization", creds.auth_header())
            .multipart(form)
            .send()
            .await?;
        Self::into_json(resp).await
    }

    /// Run a reverse image search against the Booru's existing content
    pub async fn reverse_search(
        &self,
        creds: &BooruCreds,
        file_path: &Path,
    ) -> Result<ReverseSearchResult, Error> {
        let bytes = tokio::fs::read(file_path).await?;
        let file_name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "content".to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("content", part);
        let url = format!("{}/api/posts/reverse-search", creds.base_url);
        let resp = self
            .http
            .post(url)
            .header("Authorization", creds.auth_header())
            .multipart(form)
            .send()
            .await?;
        Self::into_json(resp).await
    }

    /// Look up posts by their content checksum (sha1 of file bytes)
    pub async fn search_by_checksum(
        &self,
        creds: &BooruCreds,
        sha1: &str,
    ) -> Result<Vec<Post>, Error> {
        let url = format!("{}/api/posts/", creds.base_url);
        let query = format!("content-checksum:{sha1}");
        let resp = self
            .http
            .get(url)
            .header("Authorization", creds.auth_header())
            .query(&[("query", query.as_str())])
            .send()
            .await?;
        let page: SearchPage<Post> = Self::into_json(resp).await?;
        Ok(page.results)
    }

    /// Search for posts matching a tag, for the discover-and-retag control plane endpoint
    pub async fn search_by_tags(
        &self,
        creds: &BooruCreds,
        tag: &str,
        min_count: Option<u32>,
    ) -> Result<Vec<Post>, Error> {
        let url = format!("{}/api/posts/", creds.base_url);
        let mut query = format!("tag:{tag}");
        if let Some(min_count) = min_count {
            query.push_str(&format!(" tag-count:{min_count}.."));
        }
        let resp = self
            .http
            .get(url)
            .header("Authorization", creds.auth_header())
            .query(&[("query", query.as_str())])
            .send()
            .await?;
        let page: SearchPage<Post> = Self::into_json(resp).await?;
        Ok(page.results)
    }

    /// Download a post's content bytes, for re-tagging an existing post (`tag_existing` jobs)
    pub async fn download_content(&self, creds: &BooruCreds, id: u64) -> Result<bytes::Bytes, Error> {
        let url = format!("{}/api/post/{id}/content", creds.base_url);
        let resp = self
            .http
            .get(url)
            .header("Authorization", creds.auth_header())
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(resp.bytes().await?)
        } else {
            Err(Error::from_response(resp).await)
        }
    }

    /// Fetch a single post by id
    pub async fn get_post(&self, creds: &BooruCreds, id: u64) -> Result<Post, Error> {
        let url = format!("{}/api/post/{id}", creds.base_url);
        let resp = self
            .http
            .get(url)
            .header("Authorization", creds.auth_header())
            .send()
            .await?;
        Self::into_json(resp).await
    }

    /// Update a post under optimistic concurrency; `version` must be the post's current version
    ///
    /// Fields are REPLACE semantics, not merge: callers that want to merge tags/sources with
    /// what already exists on the post must compute the union themselves beforehand.
    pub async fn update_post(
        &self,
        creds: &BooruCreds,
        id: u64,
        version: u64,
        update: PostUpdate,
    ) -> Result<Post, Error> {
        let mut body = serde_json::to_value(&update)?;
        body["version"] = serde_json::json!(version);
        let url = format!("{}/api/post/{id}", creds.base_url);
        let resp = self
            .http
            .put(url)
            .header("Authorization", creds.auth_header())
            .json(&body)
            .send()
            .await?;
        Self::into_json(resp).await
    }

    /// Fetch a tag's current category/version
    pub async fn get_tag(&self, creds: &BooruCreds, name: &str) -> Result<Tag, Error> {
        let url = format!("{}/api/tag/{name}", creds.base_url);
        let resp = self
            .http
            .get(url)
            .header("Authorization", creds.auth_header())
            .send()
            .await?;
        Self::into_json(resp).await
    }

    /// Create a tag with the given category; treats an "already exists" response as success
    /// by returning `Ok(None)` for the caller to follow up with `get_tag`/healing if needed
    pub async fn ensure_tag(
        &self,
        creds: &BooruCreds,
        name: &str,
        category: &str,
    ) -> Result<Option<Tag>, Error> {
        let url = format!("{}/api/tags", creds.base_url);
        let body = serde_json::json!({"names": [name], "category": category});
        let resp = self
            .http
            .post(url)
            .header("Authorization", creds.auth_header())
            .json(&body)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Ok(None);
        }
        Self::into_json(resp).await.map(Some)
    }

    /// Update an existing tag's category under optimistic concurrency
    pub async fn update_tag_category(
        &self,
        creds: &BooruCreds,
        name: &str,
        version: u64,
        category: &str,
    ) -> Result<Tag, Error> {
        let url = format!("{}/api/tag/{name}", creds.base_url);
        let body = serde_json::json!({"version": version, "category": category});
        let resp = self
            .http
            .put(url)
            .header("Authorization", creds.auth_header())
            .json(&body)
            .send()
            .await?;
        Self::into_json(resp).await
    }

    /// Consume a response into `T`, converting non-2xx responses into [`Error`]
    async fn into_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
        if resp.status().is_success() {
            Ok(resp.json::<T>().await?)
        } else {
            Err(Error::from_response(resp).await)
        }
    }
}
