//! Explanation Generator — aggregates a turn's audit records into a
//! transparency report.
//!
//! Pure and deterministic: no upstream calls, so a report can always be built
//! even when every external service is down. The summary is filled from a
//! fixed template per step kind.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::types::{
    ActionKind, AgentInvocationRecord, AutomationLevel, Decision, SessionId, StepKind,
    TransparencyReport,
};

/// Turn identity carried into the report.
#[derive(Debug, Clone)]
pub struct TurnMeta<'a> {
    pub session_id: SessionId,
    pub turn: u32,
    pub request: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Build the report for one turn.
pub fn explain(
    meta: &TurnMeta<'_>,
    records: &[AgentInvocationRecord],
    decision: Option<&Decision>,
) -> TransparencyReport {
    let mut agents_involved: Vec<String> = Vec::new();
    for r in records {
        if !agents_involved.contains(&r.agent) {
            agents_involved.push(r.agent.clone());
        }
    }

    let total_processing_ms = records.iter().map(|r| r.duration_ms).sum();

    let confidence_scores: BTreeMap<String, f32> = records
        .iter()
        .filter_map(|r| r.confidence.map(|c| (r.agent.clone(), c)))
        .collect();

    let failed_steps: Vec<String> = records
        .iter()
        .filter(|r| !r.success)
        .map(|r| r.agent.clone())
        .collect();

    let automation_level = automation_level(decision);

    let mut lines: Vec<String> = records.iter().map(describe).collect();
    lines.push(format!("Automation level: {}.", automation_level.label()));
    let summary = lines.join("\n");

    let digest = digest(&DigestInput {
        session_id: meta.session_id,
        turn: meta.turn,
        original_request: meta.request,
        agents_involved: &agents_involved,
        invocations: records.iter().map(StableRecord::from).collect(),
        decision,
        automation_level,
        confidence_scores: &confidence_scores,
        failed_steps: &failed_steps,
        summary: &summary,
    });

    TransparencyReport {
        report_id: format!("TR-{}", &digest[..12]),
        session_id: meta.session_id,
        turn: meta.turn,
        created_at: meta.created_at,
        original_request: meta.request.to_string(),
        agents_involved,
        invocations: records.to_vec(),
        total_processing_ms,
        decision: decision.cloned(),
        automation_level,
        confidence_scores,
        failed_steps,
        summary,
        digest,
    }
}

/// auto-execute → full, request-approval → partial, anything else → human.
pub fn automation_level(decision: Option<&Decision>) -> AutomationLevel {
    match decision.map(|d| d.action) {
        Some(ActionKind::AutoExecute) => AutomationLevel::Full,
        Some(ActionKind::RequestApproval) => AutomationLevel::Partial,
        Some(ActionKind::Escalate) | Some(ActionKind::RequestInformation) | None => {
            AutomationLevel::HumanRequired
        }
    }
}

// ─── Templates ──────────────────────────────────────────────────────────────

fn describe(r: &AgentInvocationRecord) -> String {
    let out = &r.output;
    if !r.success {
        return format!(
            "{} failed: {}.",
            display_name(r.step),
            r.error.as_deref().unwrap_or("unknown error")
        );
    }
    match r.step {
        StepKind::Classify => {
            let c = &out["classification"];
            let intent = c["intent"].as_str().unwrap_or("unknown");
            let pct = c["confidence"].as_f64().unwrap_or(0.0) * 100.0;
            let urgency = c["urgency"].as_str().unwrap_or("medium");
            format!(
                "Intent classifier labeled the request as {} with {pct:.0}% confidence ({urgency} urgency).",
                intent.replace('_', " ")
            )
        }
        StepKind::Collect => {
            let missing = string_list(&out["missing_fields"]);
            if missing.is_empty() {
                "Info collector confirmed all required information is present.".to_string()
            } else {
                format!("Info collector is still missing: {}.", missing.join(", "))
            }
        }
        StepKind::Retrieve => {
            let n = out["sources"].as_array().map_or(0, Vec::len);
            if out["found"].as_bool().unwrap_or(false) {
                format!("Knowledge retriever found {n} relevant source(s).")
            } else {
                "Knowledge retriever found no relevant documentation.".to_string()
            }
        }
        StepKind::Decide => format!(
            "Decision engine chose {}: {}.",
            out["action"].as_str().unwrap_or("escalate").replace('_', " "),
            out["reason"].as_str().unwrap_or("")
        ),
        StepKind::Automate => {
            let entry = r.input["catalog_entry_id"].as_str().unwrap_or("runbook");
            if out["success"].as_bool().unwrap_or(false) {
                format!("Automation executed '{entry}'.")
            } else {
                format!(
                    "Automation for '{entry}' reported failure: {}.",
                    out["detail"].as_str().unwrap_or("no detail")
                )
            }
        }
    }
}

fn display_name(step: StepKind) -> &'static str {
    match step {
        StepKind::Classify => "Intent classifier",
        StepKind::Collect => "Info collector",
        StepKind::Retrieve => "Knowledge retriever",
        StepKind::Decide => "Decision engine",
        StepKind::Automate => "Automation",
    }
}

fn string_list(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

// ─── Digest ─────────────────────────────────────────────────────────────────

/// Record without wall-clock data.
#[derive(Serialize)]
struct StableRecord<'a> {
    agent: &'a str,
    input: &'a Value,
    output: &'a Value,
    success: bool,
    error: Option<&'a str>,
    confidence: Option<f32>,
}

impl<'a> From<&'a AgentInvocationRecord> for StableRecord<'a> {
    fn from(r: &'a AgentInvocationRecord) -> Self {
        Self {
            agent: &r.agent,
            input: &r.input,
            output: &r.output,
            success: r.success,
            error: r.error.as_deref(),
            confidence: r.confidence,
        }
    }
}

#[derive(Serialize)]
struct DigestInput<'a> {
    session_id: SessionId,
    turn: u32,
    original_request: &'a str,
    agents_involved: &'a [String],
    invocations: Vec<StableRecord<'a>>,
    decision: Option<&'a Decision>,
    automation_level: AutomationLevel,
    confidence_scores: &'a BTreeMap<String, f32>,
    failed_steps: &'a [String],
    summary: &'a str,
}

fn digest(input: &DigestInput<'_>) -> String {
    // Serializing plain structs and BTreeMaps cannot fail.
    let canonical = serde_json::to_vec(input).unwrap_or_default();
    let hash = Sha256::digest(&canonical);
    format!("{hash:x}")
}
