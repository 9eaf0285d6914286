//! An error from the Booru client

use reqwest::StatusCode;

/// An error from the Booru client
#[derive(Debug)]
pub enum Error {
    /// The Booru responded with a non-success status and an optional body
    Booru {
        code: StatusCode,
        msg: Option<String>,
    },
    /// The Booru reported that the content we tried to upload already exists
    Duplicate { msg: Option<String> },
    /// A generic error with a message
    Generic(String),
    /// An error from sending or receiving a request
    Reqwest(reqwest::Error),
    /// An IO error
    IO(std::io::Error),
    /// An error from converting a value with serde
    Serde(serde_json::Error),
    /// An error from parsing a URL
    UrlParse(url::ParseError),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Get the status code from this error if one exists
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Booru { code, .. } => Some(*code),
            Error::Duplicate { .. } => Some(StatusCode::CONFLICT),
            Error::Reqwest(err) => err.status(),
            _ => None,
        }
    }

    /// Get the error message for this error if one exists
    pub fn msg(&self) -> Option<String> {
        match self {
            Error::Booru { msg, .. } | Error::Duplicate { msg } => msg.clone(),
            Error::Generic(msg) => Some(msg.clone()),
            Error::Reqwest(err) => Some(err.to_string()),
            Error::IO(err) => Some(err.to_string()),
            Error::Serde(err) => Some(err.to_string()),
            Error::UrlParse(err) => Some(err.to_string()),
        }
    }

    /// Whether this error represents a server-detected content duplicate
    ///
    /// Per spec §4.7, `upload` must surface duplicate-content rejections distinctly
    /// so the pipeline can treat them as a merge opportunity instead of a failure.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::Duplicate { .. })
    }

    /// get the kind of error as a str
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Booru { .. } => "Booru",
            Error::Duplicate { .. } => "Duplicate",
            Error::Generic(_) => "Generic",
            Error::Reqwest(_) => "Reqwest",
            Error::IO(_) => "IO",
            Error::Serde(_) => "Serde",
            Error::UrlParse(_) => "UrlParse",
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match (self.status(), self.msg()) {
            (Some(code), Some(msg)) => write!(f, "Code: {code} Error: {msg}"),
            (None, Some(msg)) => write!(f, "Error: {msg}"),
            (Some(code), None) => write!(f, "Code: {code}"),
            (None, None) => write!(f, "Kind: {}", self.kind()),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Build an [`Error`] from a non-success response, reading its body asynchronously so
    /// this never blocks the tokio worker thread it runs on (unlike a synchronous `From`
    /// impl, which would have to block on the body future)
    pub async fn from_response(resp: reqwest::Response) -> Self {
        let code = resp.status();
        let msg = resp.text().await.ok().filter(|s| !s.is_empty());
        // szurubooru signals an existing-content duplicate via 409/content-hash errors;
        // the pipeline downstream decides what to do with the duplicate, this layer just
        // tags it so callers don't have to string-match the body
        if code == StatusCode::CONFLICT {
            Error::Duplicate { msg }
        } else {
            Error::Booru { code, msg }
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Reqwest(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serde(error)
    }
}

impl From<url::ParseError> for Error {
    fn from(error: url::ParseError) -> Self {
        Error::UrlParse(error)
    }
}

impl From<Error> for crate::pipeline::error::StageError {
    fn from(error: Error) -> Self {
        match error {
            Error::Duplicate { msg } => {
                crate::pipeline::error::StageError::Duplicate(msg.unwrap_or_default())
            }
            Error::Booru { code, msg } if code.is_client_error() => {
                crate::pipeline::error::StageError::PermanentExternal(
                    msg.unwrap_or_else(|| code.to_string()),
                )
            }
            other => crate::pipeline::error::StageError::TransientExternal(other.to_string()),
        }
    }
}
