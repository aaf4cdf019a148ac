//! Error types for the fetch path.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Message returned to the client for a rejected target URL.
pub const INVALID_URL_MESSAGE: &str =
    "Invalid URL. Please provide a valid URL with http:// or https:// protocol.";

/// Failures of a buffered fetch.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The target answered, but with a server error.
    #[error("Request failed with status code {status}: {message}")]
    UpstreamHttp { status: u16, message: String },

    /// Timeout or connection failure; nothing came back.
    #[error("No response received: {0}")]
    NoResponse(String),

    #[error("Error fetching URL: {0}")]
    Unknown(String),
}

impl FetchError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::InvalidUrl(_) => "invalid_url",
            FetchError::UpstreamHttp { .. } => "upstream_http",
            FetchError::NoResponse(_) => "no_response",
            FetchError::Unknown(_) => "unknown",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            FetchError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FetchError {
    fn into_response(self) -> Response {
        let message = match &self {
            FetchError::InvalidUrl(_) => INVALID_URL_MESSAGE.to_string(),
            other => other.to_string(),
        };
        (
            self.status_code(),
            Json(serde_json::json!({ "message": message })),
        )
            .into_response()
    }
}

/// Result type alias for fetch operations.
pub type Result<T> = std::result::Result<T, FetchError>;
