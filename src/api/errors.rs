//! Errors surfaced by the repository-provider HTTP integration.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("rate limited, retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    #[error("request timed out")]
    Timeout,

    #[error("all retry attempts exhausted: {0}")]
    RetryExhausted(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Request(e) => e.is_connect() || e.is_timeout(),
            ApiError::Server { status, .. } => *status >= 500,
            ApiError::RateLimited { .. } => true,
            ApiError::Timeout => true,
            _ => false,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Server { status, .. } => Some(*status),
            ApiError::Request(e) => e.status().map(|s| s.as_u16()),
            ApiError::NotFound(_) => Some(404),
            ApiError::Authentication(_) => Some(401),
            ApiError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
