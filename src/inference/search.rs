//! Search index client.
//!
//! A single ranked lookup per call. Relevance filtering and answer synthesis
//! happen in the knowledge retriever.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::client::CONNECT_TIMEOUT;
use super::config::SearchConfig;
use super::errors::UpstreamError;
use super::types::{SearchDocument, SearchRequest, SearchResponse};

/// The external search index.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Return up to `top_k` documents, best first.
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchDocument>, UpstreamError>;
}

/// Search over HTTP: `POST {base_url}/indexes/{index}/search`.
pub struct HttpSearchIndex {
    http: HttpClient,
    config: SearchConfig,
}

impl HttpSearchIndex {
    pub fn from_config(config: SearchConfig) -> Result<Self, UpstreamError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| UpstreamError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchDocument>, UpstreamError> {
        let url = format!(
            "{}/indexes/{}/search",
            self.config.base_url.trim_end_matches('/'),
            self.config.index
        );
        let body = SearchRequest {
            query: query.to_string(),
            top: top_k,
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("api-key", key);
        }

        let timeout_ms = self.config.timeout_secs * 1000;
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest("search", &url, timeout_ms, e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(&url, status.as_u16(), body_text));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::from_reqwest("search", &url, timeout_ms, e))?;

        let mut docs = parsed.documents;
        docs.sort_by(|a, b| b.score.total_cmp(&a.score));
        docs.truncate(top_k);

        tracing::debug!(url = %url, returned = docs.len(), "search response");
        Ok(docs)
    }
}
