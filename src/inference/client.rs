//! OpenAI-compatible text classification client.
//!
//! Sends a single non-streaming chat completion per call and asks the model
//! for a JSON object (`response_format: json_object`). Retry and timeout
//! policy live in the intent classifier, not here: one call is one attempt.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::config::ClassificationConfig;
use super::errors::UpstreamError;
use super::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, RawClassification, ResponseFormat,
};
use crate::agent_core::types::ConversationContext;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Instructions sent with every classification request.
const CLASSIFIER_PROMPT: &str = "\
You classify support requests from farm operators. Reply with a single JSON object:
{\"intent\": one of field_diagnosis | equipment_alert | stock_check | knowledge_query | compliance | general,
 \"urgency\": one of low | medium | high | critical,
 \"confidence\": number between 0 and 1,
 \"extracted_fields\": object with any of plot_id, crop, equipment, item, quantity, document_type, symptom}
Only include extracted fields that the message states explicitly.";

// ─── Trait ───────────────────────────────────────────────────────────────────

/// The external text-classification service.
#[async_trait]
pub trait ClassificationService: Send + Sync {
    /// Label one message. A single attempt; callers own retry and deadline.
    async fn classify(
        &self,
        text: &str,
        context: &ConversationContext,
    ) -> Result<RawClassification, UpstreamError>;
}

// ─── HttpClassificationService ───────────────────────────────────────────────

/// Classification over an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpClassificationService {
    http: HttpClient,
    config: ClassificationConfig,
}

impl HttpClassificationService {
    pub fn from_config(config: ClassificationConfig) -> Result<Self, UpstreamError> {
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

    fn build_request(&self, text: &str, context: &ConversationContext) -> ChatCompletionRequest {
        let mut user = String::new();
        if let Some(intent) = context.intent {
            user.push_str(&format!("Current case intent: {}\n", intent.as_str()));
        }
        if !context.fields.is_empty() {
            user.push_str("Known facts:\n");
            for (name, field) in &context.fields {
                user.push_str(&format!("- {name}: {}\n", field.value));
            }
        }
        user.push_str("Message: ");
        user.push_str(text);

        ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage::system(CLASSIFIER_PROMPT), ChatMessage::user(user)],
            temperature: self.config.temperature,
            stream: false,
            response_format: Some(ResponseFormat {
                r#type: "json_object".to_string(),
            }),
        }
    }
}

#[async_trait]
impl ClassificationService for HttpClassificationService {
    async fn classify(
        &self,
        text: &str,
        context: &ConversationContext,
    ) -> Result<RawClassification, UpstreamError> {
        if text.trim().is_empty() {
            return Err(UpstreamError::InvalidInput {
                reason: "empty text".into(),
            });
        }

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = self.build_request(text, context);

        tracing::debug!(url = %url, model = %body.model, "classification request");

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let timeout_ms = self.config.timeout_secs * 1000;
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest("classification", &url, timeout_ms, e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(&url, status.as_u16(), body_text));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::from_reqwest("classification", &url, timeout_ms, e))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| UpstreamError::MalformedResponse {
                reason: "no choices in completion".into(),
            })?;

        parse_classification(&content)
    }
}

/// Parse the model's JSON reply, tolerating a fenced code block around it.
pub(crate) fn parse_classification(content: &str) -> Result<RawClassification, UpstreamError> {
    let trimmed = content.trim();
    let json = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(json).map_err(|e| UpstreamError::MalformedResponse {
        reason: format!("classification is not valid JSON: {e}"),
    })
}
