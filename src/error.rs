use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Upper bound on tool diagnostics carried in errors and response bodies.
pub const MAX_DIAGNOSTIC_CHARS: usize = 2_000;

/// Failures of the download pipeline, independent of HTTP.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("file is {size} bytes, the limit is {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },
    #[error("transcode failed: {0}")]
    TranscodeFailed(String),
    #[error("transcoder is not available: {0}")]
    TranscoderUnavailable(String),
    #[error("timed out waiting for a free download slot")]
    QueueTimeout,
    #[error("{0}")]
    Internal(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Keeps the tail of a tool's output, where yt-dlp and ffmpeg put the error.
pub fn truncate_diagnostic(text: &str) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= MAX_DIAGNOSTIC_CHARS {
        return trimmed.to_string();
    }

    let tail: String = trimmed.chars().skip(count - MAX_DIAGNOSTIC_CHARS).collect();
    format!("...{tail}")
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub detail: String,
    pub limit: Option<usize>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
            limit: None,
            retry_after_seconds: None,
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", detail)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "missing_or_invalid_api_key",
            "Provide the API key in the X-API-KEY header or the api_key query parameter.",
        )
    }

    pub fn rate_limited(limit: usize, retry_after_seconds: u64) -> Self {
        Self {
            limit: Some(limit),
            retry_after_seconds: Some(retry_after_seconds),
            ..Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_exceeded",
                format!("At most {limit} requests are allowed per window."),
            )
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", detail)
    }

    /// Maps a pipeline failure, using `extraction_status` for backend failures
    /// since format listing reports them as client errors.
    pub fn from_job(error: JobError, extraction_status: StatusCode) -> Self {
        match error {
            JobError::ExtractionFailed(detail) => {
                Self::new(extraction_status, "extract_failed", detail)
            }
            error @ JobError::PayloadTooLarge { .. } => Self::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                error.to_string(),
            ),
            JobError::TranscodeFailed(detail) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "transcode_failed",
                detail,
            ),
            JobError::TranscoderUnavailable(detail) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "transcoder_unavailable",
                detail,
            ),
            error @ JobError::QueueTimeout => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "queue_timeout",
                error.to_string(),
            ),
            JobError::Internal(detail) => Self::internal(detail),
            JobError::Io(error) => Self::internal(error.to_string()),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(error: JobError) -> Self {
        Self::from_job(error, StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(code = self.code, "request failed: {}", self.detail);
        }

        let body = Json(ErrorBody {
            error: self.code,
            detail: truncate_diagnostic(&self.detail),
            limit: self.limit,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}
