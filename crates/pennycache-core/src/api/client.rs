//! REST client for the PennyPilot document store.
//!
//! This module provides the `ApiClient` struct, the `RemoteStore`
//! implementation used by the app. Documents are plain JSON objects carrying
//! their own `id`; they are mapped to typed `Record`s before leaving here.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Response, Url};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::models::{Collection, Record, SETTINGS_DOC_ID};

use super::{ApiError, ListParams, RemoteStore};

// ============================================================================
// Constants
// ============================================================================

/// Default HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct Document {
    id: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
}

/// API client for the document store.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client rooted at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid API base URL: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("API base URL cannot be a base: {}", base_url);
        }

        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let token = self.token.as_deref().ok_or(ApiError::Unauthenticated)?;
        let mut headers = header::HeaderMap::new();
        let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ApiError::Unauthenticated)?;
        headers.insert(header::AUTHORIZATION, value);
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// `{base}/users/{uid}/{collection}[/{id}]` with each segment escaped.
    fn document_url(&self, user_id: &str, collection: Collection, id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["users", user_id, collection.as_str()]);
            if let Some(id) = id {
                segments.push(id);
            }
        }
        url
    }

    fn map_send_error(e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::NetworkError(e)
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    fn to_document(record: &Record) -> Result<Value, ApiError> {
        record
            .to_document()
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode record: {}", e)))
    }

    fn map_documents(collection: Collection, docs: Vec<Document>) -> Result<Vec<Record>, ApiError> {
        docs.into_iter()
            .map(|doc| {
                Record::from_document(collection, &doc.id, Value::Object(doc.fields)).map_err(|e| {
                    ApiError::InvalidDocument {
                        collection: collection.to_string(),
                        id: doc.id.clone(),
                        reason: e.to_string(),
                    }
                })
            })
            .collect()
    }

    /// Newest first, then cut to the requested limit.
    fn order_transactions(records: &mut Vec<Record>, limit: Option<usize>) {
        records.sort_by_key(|record| match record {
            Record::Transaction(tx) => std::cmp::Reverse(tx.timestamp.unwrap_or(i64::MIN)),
            _ => std::cmp::Reverse(i64::MIN),
        });
        if let Some(limit) = limit {
            records.truncate(limit);
        }
    }

    async fn fetch_settings(&self, user_id: &str) -> Result<Vec<Record>, ApiError> {
        let url = self.document_url(user_id, Collection::Settings, Some(SETTINGS_DOC_ID));
        let response = self
            .client
            .get(url)
            .headers(self.auth_headers()?)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(user_id, "No settings document yet");
            return Ok(Vec::new());
        }

        let response = Self::check_response(response).await?;
        let doc: Value = response.json().await?;
        let record = Record::from_document(Collection::Settings, SETTINGS_DOC_ID, doc).map_err(|e| {
            ApiError::InvalidDocument {
                collection: Collection::Settings.to_string(),
                id: SETTINGS_DOC_ID.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(vec![record])
    }
}

#[async_trait]
impl RemoteStore for ApiClient {
    async fn fetch_list(
        &self,
        collection: Collection,
        user_id: &str,
        params: &ListParams,
    ) -> Result<Vec<Record>, ApiError> {
        if collection == Collection::Settings {
            return self.fetch_settings(user_id).await;
        }

        let mut url = self.document_url(user_id, collection, None);
        {
            let mut query = url.query_pairs_mut();
            if let Some(limit) = params.limit {
                query.append_pair("limit", &limit.to_string());
            }
            if let Some(ref month) = params.month {
                query.append_pair("month", month);
            }
            if collection == Collection::Transactions {
                query.append_pair("orderBy", "createdAt").append_pair("direction", "desc");
            }
        }

        let response = self
            .client
            .get(url)
            .headers(self.auth_headers()?)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let response = Self::check_response(response).await?;

        let docs: Vec<Document> = response.json().await?;
        debug!(%collection, user_id, count = docs.len(), "Fetched documents");

        let mut records = Self::map_documents(collection, docs)?;
        if collection == Collection::Transactions {
            Self::order_transactions(&mut records, params.limit);
        }
        Ok(records)
    }

    async fn create(
        &self,
        collection: Collection,
        user_id: &str,
        record: &Record,
    ) -> Result<String, ApiError> {
        let url = self.document_url(user_id, collection, None);
        let response = self
            .client
            .post(url)
            .headers(self.auth_headers()?)
            .json(&Self::to_document(record)?)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let response = Self::check_response(response).await?;

        let created: CreateResponse = response.json().await?;
        debug!(%collection, user_id, id = %created.id, "Created document");
        Ok(created.id)
    }

    async fn put(
        &self,
        collection: Collection,
        user_id: &str,
        id: &str,
        record: &Record,
    ) -> Result<(), ApiError> {
        let url = self.document_url(user_id, collection, Some(id));
        let response = self
            .client
            .put(url)
            .headers(self.auth_headers()?)
            .json(&Self::to_document(record)?)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::check_response(response).await?;
        Ok(())
    }

    async fn delete(
        &self,
        collection: Collection,
        user_id: &str,
        id: &str,
    ) -> Result<(), ApiError> {
        let url = self.document_url(user_id, collection, Some(id));
        let response = self
            .client
            .delete(url)
            .headers(self.auth_headers()?)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!(%collection, user_id, id, "Delete target already gone");
            return Ok(());
        }
        Self::check_response(response).await?;
        Ok(())
    }
}
