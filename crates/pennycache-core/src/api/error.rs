use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not signed in")]
    Unauthenticated,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid {collection} document {id}: {reason}")]
    InvalidDocument {
        collection: String,
        id: String,
        reason: String,
    },
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthenticated,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            408 => ApiError::Timeout,
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Whether retrying the same request may succeed.
    ///
    /// Connectivity problems, timeouts, throttling and server faults are
    /// transient. Auth failures, missing resources and malformed data are
    /// permanent and must not be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::RateLimited | ApiError::ServerError(_) | ApiError::Timeout => true,
            ApiError::NetworkError(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    return true;
                }
                match e.status() {
                    Some(status) => status.is_server_error() || status.as_u16() == 429,
                    None => !e.is_decode() && !e.is_builder(),
                }
            }
            ApiError::Unauthenticated
            | ApiError::AccessDenied(_)
            | ApiError::NotFound(_)
            | ApiError::InvalidResponse(_)
            | ApiError::InvalidDocument { .. } => false,
        }
    }
}
