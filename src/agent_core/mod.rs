//! Agent Core — orchestration layer for AgroDesk.
//!
//! Submodules:
//! - `orchestrator`: Per-turn state machine over the typed step pipeline
//! - `intent_classifier`: Classification with deadlines, retries and degradation
//! - `info_collector`: Required-field check and deterministic field extraction
//! - `knowledge_retriever`: Ranked lookup with a cited, templated answer
//! - `decision_engine`: Table-driven choice of auto-execute / approval / escalate
//! - `explanation`: Transparency report aggregation and digest
//! - `context_builder`: Pure merge of extracted fields into the context
//! - `schema`: Intent → required-field table and clarifying questions
//! - `catalog`: Runbook catalog
//! - `session_store`: Session ownership, turn locks, eviction, in-memory backend
//! - `database`: SQLite session backend
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod catalog;
pub mod context_builder;
pub mod database;
pub mod decision_engine;
pub mod errors;
pub mod explanation;
pub mod info_collector;
pub mod intent_classifier;
pub mod knowledge_retriever;
pub mod orchestrator;
pub mod schema;
pub mod session_store;
pub mod types;

#[cfg(test)]
pub mod testing;

// Re-exports for convenience
pub use catalog::Catalog;
pub use database::SqliteSessionBackend;
pub use decision_engine::{DecisionEngine, DecisionPolicy};
pub use errors::DeskError;
pub use intent_classifier::IntentClassifier;
pub use knowledge_retriever::{KnowledgeRetriever, RetrievalSettings};
pub use orchestrator::{Orchestrator, OrchestratorPolicy, TurnResponse};
pub use session_store::{InMemoryBackend, SessionBackend, SessionStore, StoreSettings};
pub use types::{
    ActionKind, ClarificationRequest, Decision, FlowState, Intent, Message, Session, SessionId,
    TransparencyReport,
};
