//! Automation execution service.
//!
//! Runs a catalog entry (runbook) after an auto-execute decision. Without a
//! configured endpoint the request is logged and reported as accepted.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::client::CONNECT_TIMEOUT;
use super::config::AutomationConfig;
use super::errors::UpstreamError;
use super::types::{AutomationOutcome, AutomationRequest};

/// The external automation execution service.
#[async_trait]
pub trait AutomationService: Send + Sync {
    async fn execute(
        &self,
        catalog_entry_id: &str,
        session_id: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<AutomationOutcome, UpstreamError>;
}

/// Build the automation service the config asks for.
pub fn from_config(config: &AutomationConfig) -> Result<Box<dyn AutomationService>, UpstreamError> {
    match &config.base_url {
        Some(url) if !url.is_empty() => Ok(Box::new(HttpAutomationService::new(url, config)?)),
        _ => Ok(Box::new(LoggingAutomationService)),
    }
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

/// `POST {base_url}/runbooks/{id}/execute`.
pub struct HttpAutomationService {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
    timeout_ms: u64,
}

impl HttpAutomationService {
    pub fn new(base_url: &str, config: &AutomationConfig) -> Result<Self, UpstreamError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| UpstreamError::ConnectionFailed {
                endpoint: base_url.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout_ms: config.timeout_secs * 1000,
        })
    }
}

#[async_trait]
impl AutomationService for HttpAutomationService {
    async fn execute(
        &self,
        catalog_entry_id: &str,
        session_id: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<AutomationOutcome, UpstreamError> {
        let url = format!("{}/runbooks/{catalog_entry_id}/execute", self.base_url);
        let body = AutomationRequest {
            catalog_entry_id,
            session_id,
            context: context.clone(),
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest("automation", &url, self.timeout_ms, e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(&url, status.as_u16(), body_text));
        }

        response
            .json()
            .await
            .map_err(|e| UpstreamError::from_reqwest("automation", &url, self.timeout_ms, e))
    }
}

// ─── Logging fallback ────────────────────────────────────────────────────────

/// Accepts every request and only records it in the log.
pub struct LoggingAutomationService;

#[async_trait]
impl AutomationService for LoggingAutomationService {
    async fn execute(
        &self,
        catalog_entry_id: &str,
        session_id: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<AutomationOutcome, UpstreamError> {
        tracing::info!(
            catalog_entry_id,
            session_id,
            fields = ?context.keys().collect::<Vec<_>>(),
            "runbook triggered (no automation endpoint configured)"
        );
        Ok(AutomationOutcome {
            success: true,
            detail: format!("runbook '{catalog_entry_id}' queued"),
            reference: None,
        })
    }
}
