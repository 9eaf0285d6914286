//! The error classes used by the ingest engine: `ApiError` for HTTP responses
//! and `StageError` for pipeline stage failures.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::fmt;
use tracing::{event, span, Level};
use utoipa::ToSchema;

use crate::utils::trace;

/// Builds an error http response
#[derive(Debug, ToSchema, Serialize)]
pub struct ApiError {
    /// The status code to return
    #[serde(skip)]
    pub code: StatusCode,
    /// The error message to return
    pub msg: Option<String>,
}

impl ApiError {
    /// creates a new error object
    ///
    /// # Arguments
    ///
    /// * `code` - status of error response
    /// * `msg` - message to put in the response
    #[must_use]
    pub fn new(code: StatusCode, msg: Option<String>) -> ApiError {
        ApiError { code, msg }
    }
}

impl IntoResponse for ApiError {
    /// Allow Axum to build a response from error messages
    fn into_response(self) -> Response {
        // get our trace id
        let trace = trace::get_trace();
        // check if we have an error message or not
        match self.msg {
            // we have a message so build our error response
            Some(msg) => {
                // log this error msg
                let span = span!(Level::ERROR, "Error Message");
                event!(parent: &span, Level::ERROR, msg = &msg,);
                // wrap our message in a json object with a trace id if we have one
                let err_json = match trace {
                    Some(trace) => Json(serde_json::json!({ "error": msg, "trace": &trace })),
                    None => Json(serde_json::json!({ "error": msg })),
                };
                (self.code, err_json).into_response()
            }
            // we do not have an error message so just return the trace
            None => match trace {
                // we have a trace so return that trace id
                Some(trace) => {
                    let body = Json(serde_json::json!({ "trace": &trace }));
                    (self.code, body).into_response()
                }
                // we do not have a trace so just return an empty body
                None => self.code.into_response(),
            },
        }
    }
}

/// 400 bad request
#[macro_export]
macro_rules! bad {
    ($($msg:tt)+) => {Err($crate::utils::ApiError::new(axum::http::status::StatusCode::BAD_REQUEST, Some($($msg)+)))}
}

/// 409 conflict
#[macro_export]
macro_rules! conflict {
    ($($msg:tt)+) => {Err($crate::utils::ApiError::new(axum::http::status::StatusCode::CONFLICT, Some($($msg)+)))}
}

/// 404 not found
#[macro_export]
macro_rules! not_found {
    ($($msg:tt)+) => {Err($crate::utils::ApiError::new(axum::http::status::StatusCode::NOT_FOUND, Some($($msg)+)))}
}

/// 204 no content
#[macro_export]
macro_rules! no_content {
    () => {
        Err($crate::utils::ApiError::new(
            axum::http::status::StatusCode::NO_CONTENT,
            None,
        ))
    };
}

/// 304 not modified
#[macro_export]
macro_rules! not_modified {
    ($($msg:tt)+) => {Err($crate::utils::ApiError::new(axum::http::status::StatusCode::NOT_MODIFIED, Some($($msg)+)))}
}

/// 500 internal server error
#[macro_export]
macro_rules! internal_err {
    () => {Err($crate::utils::ApiError::new(axum::http::status::StatusCode::INTERNAL_SERVER_ERROR, None))};
    ($($msg:tt)+) => {Err($crate::utils::ApiError::new(axum::http::status::StatusCode::INTERNAL_SERVER_ERROR, Some($($msg)+)))}
}

/// 503 service unavailable
#[macro_export]
macro_rules! unavailable {
    ($($msg:tt)+) => {Err($crate::utils::ApiError::new(axum::http::status::StatusCode::SERVICE_UNAVAILABLE, Some($($msg)+)))}
}

/// 401 unauthorized
#[macro_export]
macro_rules! unauthorized {
    () => {
        Err($crate::utils::ApiError::new(
            axum::http::status::StatusCode::UNAUTHORIZED,
            None,
        ))
    };
    ($msg:expr) => {
        Err($crate::utils::ApiError::new(
            axum::http::status::StatusCode::UNAUTHORIZED,
            Some($msg),
        ))
    };
}

/// 400 bad request without the Err wrap
#[macro_export]
macro_rules! bad_internal {
    ($($msg:tt)+) => {$crate::utils::ApiError::new(axum::http::status::StatusCode::BAD_REQUEST, Some($($msg)+))}
}

impl fmt::Display for ApiError {
    /// Cast this error to either a string based on the message or the code
    ///
    /// # Arguments
    ///
    /// * `f` - The formatter that is being used
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.msg {
            Some(msg) => write!(f, "{msg}"),
            // if we have a status code then return that and the reason if one exists
            None => write!(f, "code {} - {}", self.code.as_u16(), self.code),
        }
    }
}

impl From<uuid::Error> for ApiError {
    fn from(error: uuid::Error) -> Self {
        bad_internal!(format!("Failed cast to Uuid {:#?}", error))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        bad_internal!(format!("Failed cast JsonValue to String {:#?}", error))
    }
}

impl From<std::num::ParseIntError> for ApiError {
    fn from(error: std::num::ParseIntError) -> Self {
        bad_internal!(format!("Failed cast to int {:#?}", error))
    }
}

impl From<std::num::ParseFloatError> for ApiError {
    fn from(error: std::num::ParseFloatError) -> Self {
        bad_internal!(format!("Failed cast to float {:#?}", error))
    }
}

impl From<std::str::ParseBoolError> for ApiError {
    fn from(error: std::str::ParseBoolError) -> Self {
        bad_internal!(format!("Failed cast to bool {:#?}", error))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(error: std::io::Error) -> Self {
        bad_internal!(format!("IO Error {:#?}", error))
    }
}

impl From<chrono::format::ParseError> for ApiError {
    fn from(error: chrono::format::ParseError) -> Self {
        bad_internal!(format!("Failed to parse timestamp {:#?}", error))
    }
}

impl From<base64::DecodeError> for ApiError {
    fn from(error: base64::DecodeError) -> Self {
        bad_internal!(format!("Failed to base64 decode string {:#?}", error))
    }
}

impl From<std::str::Utf8Error> for ApiError {
    fn from(error: std::str::Utf8Error) -> Self {
        bad_internal!(format!("Failed to cast str to Utf8 {:#?}", error))
    }
}

impl From<url::ParseError> for ApiError {
    fn from(error: url::ParseError) -> Self {
        bad_internal!(format!("URL parse error {:#?}", error))
    }
}

impl From<std::num::TryFromIntError> for ApiError {
    fn from(error: std::num::TryFromIntError) -> Self {
        bad_internal!(format!("Int casting error {:#?}", error))
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(error: axum::extract::multipart::MultipartError) -> Self {
        bad_internal!(format!("Failed to extract multipart form {:#?}", error))
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(error: tokio::task::JoinError) -> Self {
        bad_internal!(format!("Tokio task failed to join: {:#?}", error))
    }
}

impl From<std::net::AddrParseError> for ApiError {
    fn from(error: std::net::AddrParseError) -> Self {
        bad_internal!(format!("Error parsing IP address: {error}"))
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        bad_internal!(format!("Database error {:#?}", error))
    }
}

impl From<redis::RedisError> for ApiError {
    fn from(error: redis::RedisError) -> Self {
        bad_internal!(format!("Redis error {:#?}", error))
    }
}

#[cfg(feature = "client")]
impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        bad_internal!(format!("HTTP client error {:#?}", error))
    }
}

impl From<crate::pipeline::error::StageError> for ApiError {
    fn from(error: crate::pipeline::error::StageError) -> Self {
        bad_internal!(error.to_string())
    }
}

#[cfg(feature = "client")]
impl From<crate::client::Error> for ApiError {
    fn from(error: crate::client::Error) -> Self {
        bad_internal!(format!("Booru client error {error}"))
    }
}
