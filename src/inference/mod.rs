//! Upstream service adapters.
//!
//! Everything that leaves the process lives here:
//! - `client`: text classification over an OpenAI-compatible chat endpoint
//! - `search`: ranked lookup against the knowledge index
//! - `automation`: runbook execution after an auto-execute decision
//! - `config`: `config/agrodesk.yaml` loading with env interpolation
//! - `errors`: `UpstreamError` and its transient/terminal classification
//!
//! Each adapter performs exactly one attempt per call. Deadlines and retries
//! belong to the agent steps that call them.

pub mod automation;
pub mod client;
pub mod config;
pub mod errors;
pub mod search;
pub mod types;

// Re-exports for convenience
pub use automation::{AutomationService, HttpAutomationService, LoggingAutomationService};
pub use client::{ClassificationService, HttpClassificationService};
pub use config::{DeskConfig, RetryPolicy};
pub use errors::UpstreamError;
pub use search::{HttpSearchIndex, SearchIndex};
pub use types::{AutomationOutcome, RawClassification, SearchDocument};
