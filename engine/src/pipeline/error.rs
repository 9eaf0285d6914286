//! The tri-state error taxonomy a pipeline stage raises.
//!
//! Every stage function (extract, download, tag, upload, relate) returns
//! `Result<T, StageError>` instead of [`crate::utils::ApiError`] so the worker
//! can decide whether a failure is retryable without inspecting strings.

/// An error raised by a single pipeline stage
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The job itself is malformed (bad url, missing credentials, rejected url);
    /// retrying will not help
    #[error("validation error: {0}")]
    Validation(String),
    /// An external dependency (site, Booru, network) failed in a way that may clear up
    #[error("transient external error: {0}")]
    TransientExternal(String),
    /// An external dependency rejected the request in a way that will not clear up on retry
    #[error("permanent external error: {0}")]
    PermanentExternal(String),
    /// The media has already been ingested; the job should be marked complete, not failed
    #[error("duplicate media: {0}")]
    Duplicate(String),
    /// A local filesystem or subprocess error occurred
    #[error("local error: {0}")]
    Local(String),
}

impl StageError {
    /// Whether a job that failed with this error is eligible for an automatic retry
    /// (spec §7: validation errors are entry-time rejections and never retried; transient,
    /// permanent-external, and local errors all flow through the same retry-count-then-fail
    /// policy in §4.9; `Duplicate` is not a failure at all and never reaches the retry path)
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageError::TransientExternal(_) | StageError::PermanentExternal(_) | StageError::Local(_)
        )
    }

    /// A short machine-stable tag for this variant, stored alongside the job's error message
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Validation(_) => "validation",
            StageError::TransientExternal(_) => "transient_external",
            StageError::PermanentExternal(_) => "permanent_external",
            StageError::Duplicate(_) => "duplicate",
            StageError::Local(_) => "local",
        }
    }
}

impl From<std::io::Error> for StageError {
    fn from(error: std::io::Error) -> Self {
        StageError::Local(error.to_string())
    }
}

#[cfg(feature = "client")]
impl From<reqwest::Error> for StageError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            StageError::TransientExternal(error.to_string())
        } else {
            StageError::PermanentExternal(error.to_string())
        }
    }
}

impl From<serde_json::Error> for StageError {
    fn from(error: serde_json::Error) -> Self {
        StageError::Local(error.to_string())
    }
}

#[cfg(feature = "api")]
impl From<sqlx::Error> for StageError {
    fn from(error: sqlx::Error) -> Self {
        StageError::TransientExternal(error.to_string())
    }
}

#[cfg(feature = "api")]
impl From<crate::utils::ApiError> for StageError {
    fn from(error: crate::utils::ApiError) -> Self {
        if error.code.is_client_error() {
            StageError::PermanentExternal(error.to_string())
        } else {
            StageError::TransientExternal(error.to_string())
        }
    }
}
