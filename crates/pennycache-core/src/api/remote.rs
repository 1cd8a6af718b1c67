use async_trait::async_trait;

use crate::models::{Collection, Record};

use super::ApiError;

/// Optional parameters for a list query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    /// Return at most this many records (newest first for transactions).
    pub limit: Option<usize>,
    /// Restrict to records for this `YYYY-MM` month.
    pub month: Option<String>,
}

impl ListParams {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            month: None,
        }
    }

    pub fn month(month: impl Into<String>) -> Self {
        Self {
            limit: None,
            month: Some(month.into()),
        }
    }
}

/// The remote document store the cache layer reads from and writes to.
///
/// Latency and failure are opaque to callers; failures carry an `ApiError`
/// whose `is_transient` decides whether the cache layer retries.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// List records of `collection` owned by `user_id`.
    async fn fetch_list(
        &self,
        collection: Collection,
        user_id: &str,
        params: &ListParams,
    ) -> Result<Vec<Record>, ApiError>;

    /// Create a record and return its store-assigned id.
    async fn create(
        &self,
        collection: Collection,
        user_id: &str,
        record: &Record,
    ) -> Result<String, ApiError>;

    /// Create or replace the record stored under `id`.
    async fn put(
        &self,
        collection: Collection,
        user_id: &str,
        id: &str,
        record: &Record,
    ) -> Result<(), ApiError>;

    /// Delete the record stored under `id`.
    async fn delete(&self, collection: Collection, user_id: &str, id: &str)
        -> Result<(), ApiError>;
}
