//! HTTP implementation of the indexing adapter

use super::{IndexDocument, Indexer};
use crate::config::Config;
use crate::error::{Result, SyncError, SyncResult};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
struct CreateResponse {
    id: String,
}

/// Indexing backend reached over HTTP
pub struct HttpIndexer {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpIndexer {
    pub fn new(base_url: &str, timeout_secs: u64, api_key: Option<String>) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.indexer.url,
            config.indexer.timeout_secs,
            config.indexer_api_key(),
        )
    }

    fn endpoint(&self, path: &str) -> SyncResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::permanent(format!("Invalid indexer URL: {}", e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Sort a failure into the retryable and non-retryable buckets.
    /// Timeouts, rate limits and 5xx-class responses are worth another
    /// attempt; the remaining 4xx-class responses mean the backend
    /// rejected the document itself.
    fn classify(status: StatusCode, body: String) -> SyncError {
        let message = format!("indexer returned {}: {}", status, body);
        if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            SyncError::transient(message)
        } else {
            SyncError::permanent(message)
        }
    }

    async fn check(response: reqwest::Response) -> SyncResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(status, body))
    }
}

#[async_trait]
impl Indexer for HttpIndexer {
    async fn create_document(&self, doc: &IndexDocument) -> SyncResult<String> {
        let url = self.endpoint("/v1/documents")?;
        debug!("Indexing document {} via {}", doc.document_id, url);

        let request = self.authorize(self.client.post(url)).json(doc);
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::transient(e.to_string()))?;

        let parsed: CreateResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::transient(format!("Malformed indexer response: {}", e)))?;
        Ok(parsed.id)
    }

    async fn update_document(&self, external_id: &str, doc: &IndexDocument) -> SyncResult<()> {
        let url = self.endpoint(&format!("/v1/documents/{}", external_id))?;
        debug!("Re-indexing document {} via {}", doc.document_id, url);

        let request = self.authorize(self.client.put(url)).json(doc);
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::transient(e.to_string()))?;

        Self::check(response).await?;
        Ok(())
    }

    async fn delete_document(&self, external_id: &str) -> SyncResult<()> {
        let url = self.endpoint(&format!("/v1/documents/{}", external_id))?;
        debug!("Removing external document {} via {}", external_id, url);

        let request = self.authorize(self.client.delete(url));
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::transient(e.to_string()))?;

        // A document the backend no longer knows is already the state
        // a delete asks for
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }

        Self::check(response).await?;
        Ok(())
    }
}
