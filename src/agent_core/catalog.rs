//! Runbook catalog.
//!
//! Static reference data, loaded once at startup (built-in defaults or the
//! `catalog` section of the config) and read-only afterwards.

use super::errors::DeskError;
use super::types::{CatalogEntry, Intent, RiskLevel};

#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Build a catalog, rejecting duplicate or empty ids.
    pub fn new(entries: Vec<CatalogEntry>) -> Result<Self, DeskError> {
        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            if entry.id.trim().is_empty() {
                return Err(DeskError::Config {
                    reason: "catalog entry with empty id".into(),
                });
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(DeskError::Config {
                    reason: format!("duplicate catalog entry '{}'", entry.id),
                });
            }
            if entry.safety == RiskLevel::Critical && entry.auto_executable {
                tracing::warn!(
                    id = %entry.id,
                    "critical catalog entry marked auto-executable; it will never be auto-executed"
                );
            }
        }
        Ok(Self { entries })
    }

    /// The built-in agricultural runbooks.
    pub fn builtin() -> Self {
        Self {
            entries: vec![
                entry(
                    "pest-report",
                    "Generate Pest Report",
                    "Compile a pest/disease report for the plot and notify the agronomist.",
                    RiskLevel::Safe,
                    true,
                    &[Intent::FieldDiagnosis],
                    2,
                ),
                entry(
                    "urgent-work-order",
                    "Open Urgent Work Order",
                    "Open a high-priority maintenance work order for the affected equipment.",
                    RiskLevel::Critical,
                    false,
                    &[Intent::EquipmentAlert],
                    2,
                ),
                entry(
                    "stock-inquiry",
                    "Stock Inquiry",
                    "Query current inventory levels for the requested input.",
                    RiskLevel::Safe,
                    true,
                    &[Intent::StockCheck],
                    2,
                ),
                entry(
                    "prefill-art",
                    "Pre-fill ART",
                    "Pre-fill a technical responsibility record (ART) for agronomist signature.",
                    RiskLevel::Critical,
                    false,
                    &[Intent::Compliance],
                    2,
                ),
                entry(
                    "knowledge-answer",
                    "Send Knowledge Answer",
                    "Reply with the cited answer from the knowledge base.",
                    RiskLevel::Safe,
                    true,
                    &[Intent::KnowledgeQuery],
                    1,
                ),
            ],
        }
    }

    /// Best entry for `intent`: highest specificity, ties broken by id.
    pub fn select(&self, intent: Intent) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .filter(|e| e.intents.contains(&intent))
            .max_by(|a, b| a.specificity.cmp(&b.specificity).then_with(|| b.id.cmp(&a.id)))
    }

    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }
}

fn entry(
    id: &str,
    name: &str,
    description: &str,
    safety: RiskLevel,
    auto_executable: bool,
    intents: &[Intent],
    specificity: u32,
) -> CatalogEntry {
    CatalogEntry {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        safety,
        auto_executable,
        intents: intents.to_vec(),
        specificity,
    }
}
