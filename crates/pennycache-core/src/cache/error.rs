use std::sync::Arc;

use thiserror::Error;

use crate::api::ApiError;

/// Error attached to a query.
///
/// Cloneable so one failure can be handed to every caller sharing an
/// in-flight fetch and kept in the entry's state.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Fetch failed: {0}")]
    Fetch(Arc<ApiError>),

    #[error("Fetch was cancelled")]
    Cancelled,

    #[error("Query is disabled")]
    Disabled,

    #[error("Cached data has an unexpected shape for this query")]
    UnexpectedData,
}

impl CacheError {
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            CacheError::Fetch(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ApiError> for CacheError {
    fn from(e: ApiError) -> Self {
        CacheError::Fetch(Arc::new(e))
    }
}

/// Failure reading or writing the persisted cache blob. Never shown to the
/// user; logged and the cache carries on in memory.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Cache storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
