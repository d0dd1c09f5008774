//! Wire types for the upstream services.
//!
//! The classification service speaks the OpenAI Chat Completions API and is
//! asked for a JSON object. The search index and automation service use small
//! JSON request/response bodies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ─── Chat Completions ───────────────────────────────────────────────────────

/// A single message in an OpenAI-compatible chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// `response_format` field — `{"type": "json_object"}` forces JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    pub r#type: String,
}

/// Request body for `POST {base_url}/chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

/// Non-streaming chat completion response (only the fields we read).
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ChatChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// The JSON object the classification model is instructed to return.
///
/// Labels are kept as strings here; the intent classifier normalizes them
/// into domain enums so unknown labels degrade instead of failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawClassification {
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub extracted_fields: BTreeMap<String, serde_json::Value>,
}

// ─── Search ─────────────────────────────────────────────────────────────────

/// Request body for `POST {base_url}/indexes/{index}/search`.
#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest {
    pub query: String,
    pub top: usize,
}

/// Search response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    #[serde(default, alias = "value", alias = "results")]
    pub documents: Vec<SearchDocument>,
}

/// A ranked document returned by the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "@search.score")]
    pub score: f32,
}

// ─── Automation ─────────────────────────────────────────────────────────────

/// Request body for `POST {base_url}/runbooks/{id}/execute`.
#[derive(Debug, Clone, Serialize)]
pub struct AutomationRequest<'a> {
    pub catalog_entry_id: &'a str,
    pub session_id: &'a str,
    pub context: BTreeMap<String, String>,
}

/// Result of running a catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationOutcome {
    pub success: bool,
    #[serde(default)]
    pub detail: String,
    /// External reference (ticket id, report id) when the service returns one.
    #[serde(default)]
    pub reference: Option<String>,
}
