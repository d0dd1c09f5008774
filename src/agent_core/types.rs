//! Shared types for the agent core.
//!
//! Sessions and messages, the structured conversation context, per-step audit
//! records, decisions, catalog entries and the transparency report.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Identifiers ────────────────────────────────────────────────────────────

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

// ─── Sessions & Messages ────────────────────────────────────────────────────

/// Session-level stage of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    #[default]
    Active,
    CollectingInfo,
    Completed,
    Escalated,
}

impl FlowState {
    /// Completed and escalated sessions have reached a decision.
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Completed | FlowState::Escalated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

/// A message in a session's history. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Structured payload, e.g. the classification or the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, text, None)
    }

    pub fn agent(text: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self::new(MessageRole::Agent, text, payload)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, text, None)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    fn new(role: MessageRole, text: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Full session record. Owned by the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub flow_state: FlowState,
    pub messages: Vec<Message>,
    pub context: ConversationContext,
    /// Number of turns that have run against this session.
    pub turns: u32,
    /// Set by an explicit close; further messages are rejected.
    pub closed: bool,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_activity: now,
            flow_state: FlowState::Active,
            messages: Vec::new(),
            context: ConversationContext::default(),
            turns: 0,
            closed: false,
        }
    }
}

// ─── Intents ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    FieldDiagnosis,
    EquipmentAlert,
    #[serde(alias = "inventory")]
    StockCheck,
    KnowledgeQuery,
    Compliance,
    General,
    Unknown,
}

impl Intent {
    pub const ALL: [Intent; 7] = [
        Intent::FieldDiagnosis,
        Intent::EquipmentAlert,
        Intent::StockCheck,
        Intent::KnowledgeQuery,
        Intent::Compliance,
        Intent::General,
        Intent::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::FieldDiagnosis => "field_diagnosis",
            Intent::EquipmentAlert => "equipment_alert",
            Intent::StockCheck => "stock_check",
            Intent::KnowledgeQuery => "knowledge_query",
            Intent::Compliance => "compliance",
            Intent::General => "general",
            Intent::Unknown => "unknown",
        }
    }

    /// Normalize a classifier label. Unrecognized labels become `Unknown`.
    pub fn from_label(label: &str) -> Intent {
        match label.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "field_diagnosis" | "diagnosis" => Intent::FieldDiagnosis,
            "equipment_alert" | "equipment" => Intent::EquipmentAlert,
            "stock_check" | "inventory" | "stock" => Intent::StockCheck,
            "knowledge_query" | "knowledge" | "question" => Intent::KnowledgeQuery,
            "compliance" => Intent::Compliance,
            "general" | "greeting" => Intent::General,
            _ => Intent::Unknown,
        }
    }

    /// General and unknown carry no case of their own.
    pub fn is_vague(self) -> bool {
        matches!(self, Intent::General | Intent::Unknown)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn from_label(label: &str) -> Urgency {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => Urgency::Low,
            "high" => Urgency::High,
            "critical" | "urgent" => Urgency::Critical,
            _ => Urgency::Medium,
        }
    }
}

// ─── Pipeline steps ─────────────────────────────────────────────────────────

/// The typed steps of a turn, in pipeline order. The transparency report is
/// built after the pipeline and is not a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Classify,
    Collect,
    Retrieve,
    Decide,
    Automate,
}

impl StepKind {
    /// Agent name shown in audit records and reports.
    pub fn agent_name(self) -> &'static str {
        match self {
            StepKind::Classify => "intent_classifier",
            StepKind::Collect => "info_collector",
            StepKind::Retrieve => "knowledge_retriever",
            StepKind::Decide => "decision_engine",
            StepKind::Automate => "automation_executor",
        }
    }
}

// ─── Conversation context ───────────────────────────────────────────────────

/// An extracted value: free text, an enumerated choice, a number or a range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Choice(String),
    Number(f64),
    Range { min: f64, max: f64 },
}

impl FieldValue {
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Text(s) | FieldValue::Choice(s) => s.trim().is_empty(),
            FieldValue::Number(n) => n.is_nan(),
            FieldValue::Range { min, max } => min.is_nan() || max.is_nan(),
        }
    }

    /// Convert a classifier-supplied JSON value.
    pub fn from_json(value: &serde_json::Value) -> Option<FieldValue> {
        match value {
            serde_json::Value::String(s) => Some(FieldValue::Text(s.trim().to_string())),
            serde_json::Value::Number(n) => n.as_f64().map(FieldValue::Number),
            serde_json::Value::Bool(b) => Some(FieldValue::Choice(b.to_string())),
            serde_json::Value::Object(map) => {
                let min = map.get("min").and_then(|v| v.as_f64())?;
                let max = map.get("max").and_then(|v| v.as_f64())?;
                Some(FieldValue::Range { min, max })
            }
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) | FieldValue::Choice(s) => f.write_str(s),
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Range { min, max } => write!(f, "{min}-{max}"),
        }
    }
}

/// A field stored in the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextField {
    pub value: FieldValue,
    pub confidence: f32,
    pub source: StepKind,
    /// Turn number that last wrote this field.
    pub turn: u32,
}

/// A field proposed by a step, not yet merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub name: String,
    pub value: FieldValue,
    pub confidence: f32,
    pub source: StepKind,
}

/// Structured facts gathered across the turns of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub fields: BTreeMap<String, ContextField>,
    /// Intent of the case currently being handled.
    pub intent: Option<Intent>,
    pub intent_confidence: f32,
    pub urgency: Option<Urgency>,
    /// Every required field for `intent` is present.
    pub complete: bool,
}

impl ConversationContext {
    pub fn populated(&self) -> usize {
        self.fields.len()
    }

    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).map(|f| &f.value)
    }

    /// Field values rendered as strings, for prompts and automation payloads.
    pub fn as_string_map(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|(k, f)| (k.clone(), f.value.to_string()))
            .collect()
    }
}

/// Normalized classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub urgency: Urgency,
    pub confidence: f32,
    pub extracted_fields: Vec<ExtractedField>,
}

impl Classification {
    /// The fallback used when the classification service is unavailable.
    pub fn degraded() -> Self {
        Self {
            intent: Intent::Unknown,
            urgency: Urgency::Medium,
            confidence: 0.0,
            extracted_fields: Vec::new(),
        }
    }
}

/// Result of the completeness check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoCheck {
    pub complete: bool,
    pub missing_fields: Vec<String>,
    pub clarifying_question: Option<String>,
}

/// A document cited by a synthesized answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSource {
    pub document_id: String,
    pub title: String,
    pub excerpt: String,
    pub score: f32,
}

/// Knowledge retriever output. `found == false` is the explicit no-knowledge result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub answer: String,
    pub sources: Vec<KnowledgeSource>,
    pub confidence: f32,
    pub found: bool,
}

// ─── Audit ──────────────────────────────────────────────────────────────────

/// One step execution within a turn. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInvocationRecord {
    pub step: StepKind,
    pub agent: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Confidence reported by the step, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

// ─── Decisions & Catalog ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    AutoExecute,
    RequestApproval,
    Escalate,
    /// Not a catalog action: the case is missing required fields.
    RequestInformation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Safe,
    Critical,
}

/// One decision per turn that reaches the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: ActionKind,
    pub catalog_entry_id: Option<String>,
    pub risk: RiskLevel,
    pub reason: String,
    pub confidence: f32,
}

/// A predefined automatable action ("runbook").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub safety: RiskLevel,
    #[serde(default)]
    pub auto_executable: bool,
    pub intents: Vec<Intent>,
    /// Higher wins when several entries match an intent.
    #[serde(default)]
    pub specificity: u32,
}

// ─── Transparency report ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationLevel {
    Full,
    Partial,
    HumanRequired,
}

impl AutomationLevel {
    pub fn label(self) -> &'static str {
        match self {
            AutomationLevel::Full => "Fully automated",
            AutomationLevel::Partial => "Semi-automated (approval required)",
            AutomationLevel::HumanRequired => "Manual (human required)",
        }
    }
}

/// Structured audit of one turn. Built once, immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransparencyReport {
    pub report_id: String,
    pub session_id: SessionId,
    pub turn: u32,
    pub created_at: DateTime<Utc>,
    pub original_request: String,
    pub agents_involved: Vec<String>,
    pub invocations: Vec<AgentInvocationRecord>,
    pub total_processing_ms: u64,
    pub decision: Option<Decision>,
    pub automation_level: AutomationLevel,
    pub confidence_scores: BTreeMap<String, f32>,
    pub failed_steps: Vec<String>,
    pub summary: String,
    /// SHA-256 over the decision-relevant content (timings excluded).
    pub digest: String,
}

/// Returned with clarifying turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub missing_fields: Vec<String>,
    pub question: String,
    pub current_understanding: BTreeMap<String, String>,
}
