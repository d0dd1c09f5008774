//! Orchestrator: drives one turn through the step pipeline.
//!
//! Flow per inbound message:
//! 1. **Lock**: wait for the session's turn lock (FIFO) and take a snapshot.
//! 2. **Classify**: label the message; keep the active intent while collecting.
//! 3. **Collect**: merge extracted fields, ask for the first missing one.
//! 4. **Retrieve**: cited lookup in the knowledge index.
//! 5. **Decide**: decision table over completeness, runbook, knowledge, confidence.
//! 6. **Automate**: run the runbook, only for `auto_execute`.
//! 7. **Report**: build the transparency report, commit the snapshot.
//!
//! Steps are a fixed ordered list dispatched by [`StepKind`]. Any step may end
//! the turn early with a reply. Errors and panics inside a step are contained
//! here: the turn still commits the context captured so far, an apology reply
//! and a report marking the step as failed. A turn that overruns its deadline
//! commits nothing.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;

use super::context_builder::{self, MergePolicy};
use super::decision_engine::DecisionEngine;
use super::errors::DeskError;
use super::explanation::{self, TurnMeta};
use super::info_collector;
use super::intent_classifier::IntentClassifier;
use super::knowledge_retriever::KnowledgeRetriever;
use super::session_store::SessionStore;
use super::types::{
    ActionKind, AgentInvocationRecord, ClarificationRequest, ConversationContext, Decision,
    FlowState, Intent, Message, RetrievalResult, SessionId, StepKind, TransparencyReport,
};
use crate::inference::config::PolicyConfig;
use crate::inference::AutomationService;

/// Every step, in pipeline order. The report is built after the loop.
pub const PIPELINE: [StepKind; 5] = [
    StepKind::Classify,
    StepKind::Collect,
    StepKind::Retrieve,
    StepKind::Decide,
    StepKind::Automate,
];

pub const REPHRASE_REPLY: &str = "Sorry, I couldn't understand that request. Could you rephrase it, \
     mentioning what happened and where (for example: \"the irrigation pump in plot A3 stopped\")?";

pub const APOLOGY_REPLY: &str = "Sorry, something went wrong while handling your request. \
     Everything you told me so far is saved; please try again in a moment.";

pub const GREETING_REPLY: &str = "Hello! I can help with field problems, equipment alerts, \
     stock checks, compliance documents and agronomy questions. What do you need?";

const GREETINGS: &[&str] = &["hi", "hello", "good morning", "oi", "olá", "ola", "bom dia"];

/// Characters of user text shown in logs.
const LOG_PREVIEW_CHARS: usize = 80;

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorPolicy {
    pub merge: MergePolicy,
    pub turn_timeout: Duration,
    pub max_message_chars: usize,
}

impl From<&PolicyConfig> for OrchestratorPolicy {
    fn from(c: &PolicyConfig) -> Self {
        Self {
            merge: MergePolicy {
                margin: c.merge_confidence_margin,
            },
            turn_timeout: Duration::from_secs(c.turn_timeout_secs),
            max_message_chars: c.max_message_chars,
        }
    }
}

/// Everything a caller gets back from one turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub session_id: SessionId,
    pub reply: String,
    pub flow_state: FlowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarificationRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    pub transparency_report: TransparencyReport,
}

/// How a turn ends.
struct Finish {
    reply: String,
    flow_state: FlowState,
    clarification: Option<ClarificationRequest>,
}

enum Control {
    Continue,
    Stop(Finish),
}

/// Wall-clock start plus a monotonic timer for one step.
#[derive(Clone, Copy)]
struct StepTimer {
    at: DateTime<Utc>,
    started: Instant,
}

impl StepTimer {
    fn start() -> Self {
        Self {
            at: Utc::now(),
            started: Instant::now(),
        }
    }
}

/// Mutable working state of one turn. Committed to the session only at the end.
struct TurnRun<'a> {
    session_id: SessionId,
    text: &'a str,
    turn: u32,
    flow_state: FlowState,
    context: ConversationContext,
    current: Option<StepKind>,
    timer: StepTimer,
    retrieval: Option<RetrievalResult>,
    decision: Option<Decision>,
    automation_failure: Option<String>,
    records: Vec<AgentInvocationRecord>,
}

impl TurnRun<'_> {
    /// Append the audit record for `step`, timed from the step's start.
    fn record(
        &mut self,
        step: StepKind,
        input: serde_json::Value,
        output: serde_json::Value,
        error: Option<String>,
        confidence: Option<f32>,
    ) {
        self.records.push(AgentInvocationRecord {
            step,
            agent: step.agent_name().to_string(),
            input,
            output,
            started_at: self.timer.at,
            duration_ms: self.timer.started.elapsed().as_millis() as u64,
            success: error.is_none(),
            error,
            confidence,
        });
    }

    fn stop(&self, reply: impl Into<String>) -> Control {
        Control::Stop(Finish {
            reply: reply.into(),
            flow_state: self.flow_state,
            clarification: None,
        })
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

pub struct Orchestrator {
    store: Arc<SessionStore>,
    classifier: IntentClassifier,
    retriever: KnowledgeRetriever,
    engine: DecisionEngine,
    automation: Arc<dyn AutomationService>,
    policy: OrchestratorPolicy,
}

impl Orchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        classifier: IntentClassifier,
        retriever: KnowledgeRetriever,
        engine: DecisionEngine,
        automation: Arc<dyn AutomationService>,
        policy: OrchestratorPolicy,
    ) -> Self {
        Self {
            store,
            classifier,
            retriever,
            engine,
            automation,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Handle one inbound message.
    ///
    /// Without a `session_id` a new session is created; an unknown id creates
    /// a session under that id. Creation happens under the turn lock.
    pub async fn handle_message(
        &self,
        session_id: Option<SessionId>,
        text: &str,
        user_id: &str,
    ) -> Result<TurnResponse, DeskError> {
        let text = self.validate(text)?;

        let id = session_id.unwrap_or_default();

        match tokio::time::timeout(self.policy.turn_timeout, self.run_turn(id, text, user_id)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    session_id = %id,
                    timeout_ms = self.policy.turn_timeout.as_millis() as u64,
                    "turn deadline exceeded, nothing committed"
                );
                Err(DeskError::Cancelled {
                    reason: format!(
                        "turn exceeded {}s deadline",
                        self.policy.turn_timeout.as_secs()
                    ),
                })
            }
        }
    }

    fn validate<'t>(&self, text: &'t str) -> Result<&'t str, DeskError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DeskError::Validation {
                reason: "message text is empty".into(),
            });
        }
        let chars = text.chars().count();
        if chars > self.policy.max_message_chars {
            return Err(DeskError::Validation {
                reason: format!(
                    "message is {chars} characters, limit is {}",
                    self.policy.max_message_chars
                ),
            });
        }
        Ok(text)
    }

    async fn run_turn(&self, id: SessionId, text: &str, user_id: &str) -> Result<TurnResponse, DeskError> {
        let (guard, mut session) = self.store.open_turn(id).await?;
        if session.closed {
            return Err(DeskError::SessionClosed {
                session_id: id.to_string(),
            });
        }

        session.turns += 1;
        let turn = session.turns;
        tracing::info!(
            session_id = %id,
            turn,
            user_id,
            flow_state = ?session.flow_state,
            text = %preview(text),
            "turn started"
        );

        // A decided case is over; a new message opens the next one.
        if session.flow_state.is_terminal() {
            session.flow_state = FlowState::Active;
            session.context = context_builder::with_intent(&session.context, None, 0.0);
            session.context.urgency = None;
        }

        session
            .messages
            .push(Message::user(text).with_payload(json!({ "user_id": user_id })));

        let mut run = TurnRun {
            session_id: id,
            text,
            turn,
            flow_state: session.flow_state,
            context: session.context.clone(),
            current: None,
            timer: StepTimer::start(),
            retrieval: None,
            decision: None,
            automation_failure: None,
            records: Vec::new(),
        };

        let finish = if session.flow_state != FlowState::CollectingInfo && is_greeting(text) {
            Finish {
                reply: GREETING_REPLY.to_string(),
                flow_state: session.flow_state,
                clarification: None,
            }
        } else {
            let outcome = AssertUnwindSafe(self.run_pipeline(&mut run)).catch_unwind().await;
            match outcome {
                Ok(Ok(finish)) => finish,
                Ok(Err(e)) => self.contain_failure(&mut run, e.to_string()),
                Err(panic) => self.contain_failure(&mut run, panic_message(panic.as_ref())),
            }
        };

        let meta = TurnMeta {
            session_id: id,
            turn,
            request: text,
            created_at: Utc::now(),
        };
        let report = explanation::explain(&meta, &run.records, run.decision.as_ref());

        session.context = run.context;
        session.flow_state = finish.flow_state;
        session.messages.push(Message::agent(
            finish.reply.clone(),
            Some(json!({
                "report_id": report.report_id,
                "decision": run.decision,
                "clarification": finish.clarification,
            })),
        ));
        self.store.commit(&guard, &mut session)?;
        self.store.save_report(&report)?;
        drop(guard);

        tracing::info!(
            session_id = %id,
            turn,
            flow_state = ?finish.flow_state,
            action = ?run.decision.as_ref().map(|d| d.action),
            report_id = %report.report_id,
            duration_ms = report.total_processing_ms,
            "turn finished"
        );

        Ok(TurnResponse {
            session_id: id,
            reply: finish.reply,
            flow_state: finish.flow_state,
            clarification: finish.clarification,
            decision: run.decision,
            transparency_report: report,
        })
    }

    async fn run_pipeline(&self, run: &mut TurnRun<'_>) -> Result<Finish, DeskError> {
        for step in PIPELINE {
            run.current = Some(step);
            run.timer = StepTimer::start();
            let control = match step {
                StepKind::Classify => self.classify(run).await?,
                StepKind::Collect => self.collect(run),
                StepKind::Retrieve => self.retrieve(run).await,
                StepKind::Decide => self.decide(run),
                StepKind::Automate => self.automate(run).await,
            };
            if let Control::Stop(finish) = control {
                run.current = None;
                return Ok(finish);
            }
        }
        run.current = None;
        Ok(self.conclude(run))
    }

    /// Record the failed step and end the turn with the apology reply. The
    /// flow state and the context merged so far are kept.
    fn contain_failure(&self, run: &mut TurnRun<'_>, error: String) -> Finish {
        let step = run.current.take().unwrap_or(StepKind::Classify);
        tracing::error!(
            session_id = %run.session_id,
            step = step.agent_name(),
            error = %error,
            "step failed, turn aborted"
        );
        run.record(
            step,
            json!({ "text": run.text }),
            serde_json::Value::Null,
            Some(error),
            None,
        );
        Finish {
            reply: APOLOGY_REPLY.to_string(),
            flow_state: run.flow_state,
            clarification: None,
        }
    }

    // ─── Steps ──────────────────────────────────────────────────────────

    async fn classify(&self, run: &mut TurnRun<'_>) -> Result<Control, DeskError> {
        let outcome = self.classifier.classify(run.text, &run.context).await?;
        let c = &outcome.classification;

        run.record(
            StepKind::Classify,
            json!({ "text": run.text, "active_intent": run.context.intent }),
            serde_json::to_value(&outcome)?,
            outcome.error.clone().filter(|_| outcome.degraded),
            Some(c.confidence),
        );

        if outcome.degraded {
            return Ok(run.stop(REPHRASE_REPLY));
        }

        let keep_active = run.flow_state == FlowState::CollectingInfo
            && run.context.intent.is_some()
            && (c.intent.is_vague() || c.confidence < run.context.intent_confidence);
        if !keep_active {
            run.context = context_builder::with_intent(&run.context, Some(c.intent), c.confidence);
            run.context.urgency = Some(c.urgency);
        } else if c.urgency > run.context.urgency.unwrap_or_default() {
            run.context.urgency = Some(c.urgency);
        }

        run.context = context_builder::merge(&run.context, &c.extracted_fields, run.turn, self.policy.merge);

        if run.context.intent == Some(Intent::Unknown) {
            return Ok(run.stop(REPHRASE_REPLY));
        }
        Ok(Control::Continue)
    }

    fn collect(&self, run: &mut TurnRun<'_>) -> Control {
        let Some(intent) = run.context.intent else {
            return run.stop(REPHRASE_REPLY);
        };

        let extracted = info_collector::extract(run.text);
        run.context = context_builder::merge(&run.context, &extracted, run.turn, self.policy.merge);
        let check = info_collector::check(intent, &run.context);

        let extracted_names: Vec<&str> = extracted.iter().map(|f| f.name.as_str()).collect();
        run.record(
            StepKind::Collect,
            json!({ "intent": intent, "known_fields": run.context.as_string_map() }),
            json!({
                "complete": check.complete,
                "missing_fields": check.missing_fields,
                "clarifying_question": check.clarifying_question,
                "extracted_fields": extracted_names,
            }),
            None,
            None,
        );

        match check.clarifying_question {
            Some(question) if !check.complete => Control::Stop(Finish {
                reply: question.clone(),
                flow_state: FlowState::CollectingInfo,
                clarification: Some(ClarificationRequest {
                    missing_fields: check.missing_fields,
                    question,
                    current_understanding: run.context.as_string_map(),
                }),
            }),
            _ => Control::Continue,
        }
    }

    async fn retrieve(&self, run: &mut TurnRun<'_>) -> Control {
        let outcome = self.retriever.retrieve(run.text, &run.context).await;

        run.record(
            StepKind::Retrieve,
            json!({ "query": outcome.query }),
            serde_json::to_value(&outcome.result).unwrap_or_default(),
            outcome.error,
            Some(outcome.result.confidence),
        );
        run.retrieval = Some(outcome.result);
        Control::Continue
    }

    fn decide(&self, run: &mut TurnRun<'_>) -> Control {
        let Some(intent) = run.context.intent else {
            return run.stop(REPHRASE_REPLY);
        };
        let retrieval = run.retrieval.clone().unwrap_or_else(super::knowledge_retriever::no_knowledge);

        let decision = self
            .engine
            .decide(intent, &run.context, &retrieval, run.context.intent_confidence);

        run.record(
            StepKind::Decide,
            json!({
                "intent": intent,
                "complete": run.context.complete,
                "knowledge_found": retrieval.found,
                "confidence": run.context.intent_confidence,
            }),
            serde_json::to_value(&decision).unwrap_or_default(),
            None,
            Some(decision.confidence),
        );
        run.decision = Some(decision);
        Control::Continue
    }

    async fn automate(&self, run: &mut TurnRun<'_>) -> Control {
        let Some(decision) = run.decision.as_ref() else {
            return Control::Continue;
        };
        let (ActionKind::AutoExecute, Some(entry_id)) = (decision.action, decision.catalog_entry_id.clone())
        else {
            return Control::Continue;
        };

        let context = run.context.as_string_map();
        let result = self
            .automation
            .execute(&entry_id, &run.session_id.to_string(), &context)
            .await;

        let input = json!({ "catalog_entry_id": entry_id, "context": context });
        match result {
            Ok(outcome) => {
                let error = (!outcome.success).then(|| outcome.detail.clone());
                run.automation_failure = error.clone();
                run.record(
                    StepKind::Automate,
                    input,
                    serde_json::to_value(&outcome).unwrap_or_default(),
                    error,
                    None,
                );
            }
            Err(e) => {
                tracing::warn!(session_id = %run.session_id, entry = %entry_id, error = %e, "automation failed");
                run.automation_failure = Some(e.to_string());
                run.record(
                    StepKind::Automate,
                    input,
                    json!({ "success": false, "detail": e.to_string() }),
                    Some(e.to_string()),
                    None,
                );
            }
        }
        Control::Continue
    }

    /// Reply and flow state for a turn that reached a decision.
    fn conclude(&self, run: &TurnRun<'_>) -> Finish {
        let Some(decision) = run.decision.as_ref() else {
            return Finish {
                reply: APOLOGY_REPLY.to_string(),
                flow_state: run.flow_state,
                clarification: None,
            };
        };
        let entry_name = decision
            .catalog_entry_id
            .as_deref()
            .and_then(|id| self.engine.catalog().get(id))
            .map(|e| e.name.clone())
            .unwrap_or_else(|| "the requested action".to_string());

        let (mut reply, flow_state) = match decision.action {
            ActionKind::AutoExecute => match &run.automation_failure {
                None => (format!("Done: {entry_name} was carried out automatically."), FlowState::Completed),
                Some(err) => (
                    format!(
                        "I tried to run {entry_name} automatically but it failed ({err}). \
                         A team member will follow up."
                    ),
                    FlowState::Completed,
                ),
            },
            ActionKind::RequestApproval => (
                format!(
                    "I've prepared {entry_name}. It needs approval before it runs: {}.",
                    decision.reason
                ),
                FlowState::Completed,
            ),
            ActionKind::Escalate => (
                format!("I'm forwarding this to a specialist: {}.", decision.reason),
                FlowState::Escalated,
            ),
            ActionKind::RequestInformation => (decision.reason.clone(), FlowState::CollectingInfo),
        };

        if let Some(retrieval) = run.retrieval.as_ref().filter(|r| r.found) {
            reply.push_str("\n\n");
            reply.push_str(&retrieval.answer);
        }

        Finish {
            reply,
            flow_state,
            clarification: None,
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn is_greeting(text: &str) -> bool {
    let normalized = text
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_lowercase();
    GREETINGS.contains(&normalized.as_str())
}

fn preview(text: &str) -> String {
    if text.chars().count() <= LOG_PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(LOG_PREVIEW_CHARS).collect();
    format!("{cut}…")
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("step panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("step panicked: {s}")
    } else {
        "step panicked".to_string()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::catalog::Catalog;
    use crate::agent_core::decision_engine::DecisionPolicy;
    use crate::agent_core::knowledge_retriever::RetrievalSettings;
    use crate::agent_core::session_store::StoreSettings;
    use crate::agent_core::testing::{doc, raw, Reply, ScriptedAutomation, ScriptedClassifier, ScriptedSearch};
    use crate::agent_core::types::AutomationLevel;
    use crate::inference::{RetryPolicy, UpstreamError};

    struct Harness {
        orchestrator: Orchestrator,
        classifier: Arc<ScriptedClassifier>,
        automation: Arc<ScriptedAutomation>,
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(50),
            max_retries: 1,
            base_delay: Duration::from_millis(1),
        }
    }

    fn harness_with(
        classifier: ScriptedClassifier,
        search: ScriptedSearch,
        automation: ScriptedAutomation,
        store: StoreSettings,
        turn_timeout: Duration,
    ) -> Harness {
        let classifier = Arc::new(classifier);
        let automation = Arc::new(automation);
        let orchestrator = Orchestrator::new(
            Arc::new(SessionStore::in_memory(store)),
            IntentClassifier::new(classifier.clone(), retry()),
            KnowledgeRetriever::new(
                Arc::new(search),
                retry(),
                RetrievalSettings {
                    top_k: 3,
                    candidates: 5,
                    min_relevance_score: 0.3,
                },
            ),
            DecisionEngine::new(Arc::new(Catalog::builtin()), DecisionPolicy::default()),
            automation.clone(),
            OrchestratorPolicy {
                merge: MergePolicy::default(),
                turn_timeout,
                max_message_chars: 200,
            },
        );
        Harness {
            orchestrator,
            classifier,
            automation,
        }
    }

    fn store_settings() -> StoreSettings {
        StoreSettings {
            ttl: Duration::from_secs(600),
            capacity: 100,
            max_queued_turns: 4,
        }
    }

    fn harness(classifier: ScriptedClassifier, search: ScriptedSearch) -> Harness {
        harness_with(
            classifier,
            search,
            ScriptedAutomation::accepting(),
            store_settings(),
            Duration::from_secs(5),
        )
    }

    fn two_sources() -> ScriptedSearch {
        ScriptedSearch::returning(vec![
            doc("kb-12", "Irrigation pump troubleshooting", "Check the breaker and the pressure switch.", 0.82),
            doc("kb-40", "Work order priorities", "Pump failures during heat waves are urgent.", 0.64),
        ])
    }

    #[tokio::test]
    async fn test_scenario_clarify_then_request_approval() {
        let h = harness(
            ScriptedClassifier::new(vec![Reply::Ok(raw("equipment_alert", 0.9, &[]))]),
            two_sources(),
        );

        // Turn 1: plot is missing.
        let first = h
            .orchestrator
            .handle_message(None, "my irrigation pump stopped", "farmer-1")
            .await
            .unwrap();
        assert_eq!(first.flow_state, FlowState::CollectingInfo);
        assert!(first.decision.is_none());
        let clarification = first.clarification.clone().unwrap();
        assert_eq!(clarification.missing_fields, vec!["plot_id"]);
        assert_eq!(first.reply, clarification.question);
        assert_eq!(clarification.current_understanding["equipment"], "irrigation pump");
        assert_eq!(first.transparency_report.automation_level, AutomationLevel::HumanRequired);

        // Turn 2: the follow-up completes the case; the classifier fallback
        // (general, 0.3) must not replace the intent being collected.
        let second = h
            .orchestrator
            .handle_message(Some(first.session_id), "plot A3", "farmer-1")
            .await
            .unwrap();
        let decision = second.decision.clone().unwrap();
        assert_eq!(decision.action, ActionKind::RequestApproval);
        assert_eq!(decision.catalog_entry_id.as_deref(), Some("urgent-work-order"));
        assert_eq!(second.flow_state, FlowState::Completed);
        assert!(second.reply.contains("[2]"));

        let report = &second.transparency_report;
        assert_eq!(
            report.agents_involved,
            vec!["intent_classifier", "info_collector", "knowledge_retriever", "decision_engine"]
        );
        assert_eq!(report.automation_level, AutomationLevel::Partial);
        assert_eq!(report.turn, 2);

        let session = h.orchestrator.store().get(first.session_id).unwrap();
        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.context.intent, Some(Intent::EquipmentAlert));
        assert_eq!(session.context.value("plot_id").unwrap().to_string(), "A3");
        assert_eq!(h.orchestrator.store().list_reports(first.session_id).unwrap().len(), 2);
        assert_eq!(h.automation.calls(), 0);
    }

    #[tokio::test]
    async fn test_scenario_safe_stock_check_auto_executes() {
        let h = harness(
            ScriptedClassifier::always(raw("stock_check", 0.95, &[("item", "urea")])),
            ScriptedSearch::returning(vec![doc("kb-3", "Urea storage", "Keep dry.", 0.7)]),
        );
        let resp = h
            .orchestrator
            .handle_message(None, "how much urea is left?", "farmer-2")
            .await
            .unwrap();
        let decision = resp.decision.unwrap();
        assert_eq!(decision.action, ActionKind::AutoExecute);
        assert_eq!(decision.catalog_entry_id.as_deref(), Some("stock-inquiry"));
        assert_eq!(resp.flow_state, FlowState::Completed);
        assert_eq!(h.automation.calls(), 1);
        assert_eq!(resp.transparency_report.automation_level, AutomationLevel::Full);
        assert!(resp
            .transparency_report
            .agents_involved
            .contains(&"automation_executor".to_string()));
    }

    #[tokio::test]
    async fn test_scenario_classifier_timeouts_degrade() {
        let h = harness(
            ScriptedClassifier::new(vec![Reply::Hang, Reply::Hang]),
            two_sources(),
        );
        let resp = h
            .orchestrator
            .handle_message(None, "the thing with the stuff", "farmer-3")
            .await
            .unwrap();
        assert_eq!(resp.reply, REPHRASE_REPLY);
        assert_eq!(resp.flow_state, FlowState::Active);
        assert!(resp.decision.is_none());
        assert_eq!(resp.transparency_report.failed_steps, vec!["intent_classifier"]);
        assert_eq!(h.classifier.calls(), 2);

        let session = h.orchestrator.store().get(resp.session_id).unwrap();
        assert_eq!(session.flow_state, FlowState::Active);
        assert_eq!(session.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_failure_keeps_captured_context() {
        let h = harness(
            ScriptedClassifier::new(vec![
                Reply::Ok(raw("equipment_alert", 0.9, &[])),
                Reply::Err(UpstreamError::Unauthorized {
                    endpoint: "classify".into(),
                    status: 401,
                }),
            ]),
            two_sources(),
        );
        let first = h
            .orchestrator
            .handle_message(None, "my irrigation pump stopped", "u")
            .await
            .unwrap();
        let second = h
            .orchestrator
            .handle_message(Some(first.session_id), "plot A3", "u")
            .await
            .unwrap();
        assert_eq!(second.reply, APOLOGY_REPLY);
        assert_eq!(second.flow_state, FlowState::CollectingInfo);
        assert_eq!(second.transparency_report.failed_steps, vec!["intent_classifier"]);

        let session = h.orchestrator.store().get(first.session_id).unwrap();
        assert_eq!(session.context.value("equipment").unwrap().to_string(), "irrigation pump");
        assert_eq!(session.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_panicking_step_is_contained() {
        let h = harness(ScriptedClassifier::new(vec![Reply::Panic]), two_sources());
        let resp = h
            .orchestrator
            .handle_message(None, "pump broke on plot 4", "u")
            .await
            .unwrap();
        assert_eq!(resp.reply, APOLOGY_REPLY);
        assert_eq!(resp.transparency_report.failed_steps, vec!["intent_classifier"]);
        let err = resp.transparency_report.invocations[0].error.clone().unwrap();
        assert!(err.contains("panicked"));

        // The session is still usable.
        let next = h
            .orchestrator
            .handle_message(Some(resp.session_id), "hello", "u")
            .await
            .unwrap();
        assert_eq!(next.reply, GREETING_REPLY);
    }

    #[tokio::test]
    async fn test_automation_failure_is_reported_not_reopened() {
        let h = harness_with(
            ScriptedClassifier::always(raw("stock_check", 0.95, &[("item", "diesel")])),
            ScriptedSearch::empty(),
            ScriptedAutomation::failing(|| UpstreamError::HttpError {
                status: 500,
                body: "runbook crashed".into(),
            }),
            store_settings(),
            Duration::from_secs(5),
        );
        let resp = h
            .orchestrator
            .handle_message(None, "diesel level?", "u")
            .await
            .unwrap();
        assert_eq!(resp.decision.unwrap().action, ActionKind::AutoExecute);
        assert_eq!(resp.flow_state, FlowState::Completed);
        assert!(resp.reply.contains("failed"));
        assert_eq!(resp.transparency_report.failed_steps, vec!["automation_executor"]);
    }

    #[tokio::test]
    async fn test_unknown_intent_asks_to_rephrase() {
        let h = harness(
            ScriptedClassifier::always(raw("weather_forecast", 0.8, &[])),
            two_sources(),
        );
        let resp = h.orchestrator.handle_message(None, "will it rain?", "u").await.unwrap();
        assert_eq!(resp.reply, REPHRASE_REPLY);
        assert_eq!(resp.flow_state, FlowState::Active);
        assert!(resp.transparency_report.failed_steps.is_empty());
    }

    #[tokio::test]
    async fn test_general_request_escalates() {
        let h = harness(
            ScriptedClassifier::always(raw("general", 0.9, &[])),
            ScriptedSearch::empty(),
        );
        let resp = h
            .orchestrator
            .handle_message(None, "I want to talk to someone about my contract", "u")
            .await
            .unwrap();
        assert_eq!(resp.decision.unwrap().action, ActionKind::Escalate);
        assert_eq!(resp.flow_state, FlowState::Escalated);
    }

    #[tokio::test]
    async fn test_greeting_skips_pipeline() {
        let h = harness(ScriptedClassifier::new(vec![]), two_sources());
        let resp = h.orchestrator.handle_message(None, "Bom dia!", "u").await.unwrap();
        assert_eq!(resp.reply, GREETING_REPLY);
        assert_eq!(resp.flow_state, FlowState::Active);
        assert!(resp.decision.is_none());
        assert!(resp.transparency_report.invocations.is_empty());
        assert_eq!(h.classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_message_recreates_evicted_session() {
        let h = harness(ScriptedClassifier::new(vec![]), two_sources());
        let store = h.orchestrator.store();
        let id = SessionId::new();
        h.orchestrator.handle_message(Some(id), "Bom dia!", "u").await.unwrap();
        assert_eq!(store.get(id).unwrap().messages.len(), 2);

        let later = chrono::Utc::now() + chrono::Duration::seconds(3600);
        assert_eq!(store.evict(later).unwrap(), vec![id]);

        let resp = h.orchestrator.handle_message(Some(id), "Bom dia!", "u").await.unwrap();
        assert_eq!(resp.session_id, id);
        assert_eq!(store.get(id).unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_flow_starts_new_case() {
        let h = harness(
            ScriptedClassifier::new(vec![
                Reply::Ok(raw("stock_check", 0.95, &[("item", "urea")])),
                Reply::Ok(raw("field_diagnosis", 0.9, &[("crop", "soybean")])),
            ]),
            ScriptedSearch::empty(),
        );
        let first = h.orchestrator.handle_message(None, "urea stock?", "u").await.unwrap();
        assert_eq!(first.flow_state, FlowState::Completed);

        let second = h
            .orchestrator
            .handle_message(Some(first.session_id), "rust spots on the soybean leaves", "u")
            .await
            .unwrap();
        assert_eq!(second.flow_state, FlowState::CollectingInfo);
        assert_eq!(second.clarification.unwrap().missing_fields, vec!["plot_id"]);

        let session = h.orchestrator.store().get(first.session_id).unwrap();
        assert_eq!(session.context.intent, Some(Intent::FieldDiagnosis));
        // Facts from the earlier case are retained.
        assert_eq!(session.context.value("item").unwrap().to_string(), "urea");
    }

    #[tokio::test]
    async fn test_validation_rejects_without_mutation() {
        let h = harness(ScriptedClassifier::new(vec![]), two_sources());
        let id = h.orchestrator.store().create_session().unwrap();

        let err = h.orchestrator.handle_message(Some(id), "   ", "u").await.unwrap_err();
        assert!(matches!(err, DeskError::Validation { .. }));
        let err = h
            .orchestrator
            .handle_message(Some(id), &"x".repeat(201), "u")
            .await
            .unwrap_err();
        assert!(matches!(err, DeskError::Validation { .. }));

        assert!(h.orchestrator.store().get(id).unwrap().messages.is_empty());
        assert_eq!(h.classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_messages() {
        let h = harness(ScriptedClassifier::new(vec![]), two_sources());
        let id = h.orchestrator.store().create_session().unwrap();
        h.orchestrator.store().close(id).await.unwrap();
        let err = h.orchestrator.handle_message(Some(id), "plot A3", "u").await.unwrap_err();
        assert!(matches!(err, DeskError::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn test_deadline_commits_nothing() {
        let h = harness_with(
            ScriptedClassifier::new(vec![]).with_delay(Duration::from_millis(200)),
            two_sources(),
            ScriptedAutomation::accepting(),
            store_settings(),
            Duration::from_millis(30),
        );
        let id = h.orchestrator.store().create_session().unwrap();
        let err = h
            .orchestrator
            .handle_message(Some(id), "pump stopped on plot 2", "u")
            .await
            .unwrap_err();
        assert!(matches!(err, DeskError::Cancelled { .. }));

        let session = h.orchestrator.store().get(id).unwrap();
        assert!(session.messages.is_empty());
        assert_eq!(session.turns, 0);
        assert!(h.orchestrator.store().list_reports(id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_produces_identical_report() {
        let id = SessionId::new();
        let mut digests = Vec::new();
        let mut decisions = Vec::new();
        for _ in 0..2 {
            let h = harness(
                ScriptedClassifier::always(raw("equipment_alert", 0.9, &[("plot_id", "A3")])),
                two_sources(),
            );
            let resp = h
                .orchestrator
                .handle_message(Some(id), "irrigation pump stopped on plot A3", "u")
                .await
                .unwrap();
            digests.push(resp.transparency_report.digest.clone());
            decisions.push(resp.decision.unwrap());
        }
        assert_eq!(digests[0], digests[1]);
        assert_eq!(decisions[0], decisions[1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_messages_do_not_overlap() {
        let h = Arc::new(harness(
            ScriptedClassifier::always(raw("knowledge_query", 0.9, &[])).with_delay(Duration::from_millis(20)),
            two_sources(),
        ));
        let id = h.orchestrator.store().create_session().unwrap();

        let mut handles = Vec::new();
        for n in 0..4 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.orchestrator
                    .handle_message(Some(id), &format!("how should I calibrate the sprayer, take {n}"), "u")
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.classifier.max_in_flight(), 1);
        let session = h.orchestrator.store().get(id).unwrap();
        assert_eq!(session.turns, 4);
        assert_eq!(session.messages.len(), 8);
        assert_eq!(h.orchestrator.store().list_reports(id).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_queue_overflow_is_busy() {
        let h = Arc::new(harness_with(
            ScriptedClassifier::always(raw("knowledge_query", 0.9, &[])).with_delay(Duration::from_millis(100)),
            two_sources(),
            ScriptedAutomation::accepting(),
            StoreSettings {
                max_queued_turns: 0,
                ..store_settings()
            },
            Duration::from_secs(5),
        ));
        let id = h.orchestrator.store().create_session().unwrap();

        let first = {
            let h = h.clone();
            tokio::spawn(async move { h.orchestrator.handle_message(Some(id), "how to calibrate?", "u").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = h
            .orchestrator
            .handle_message(Some(id), "and the nozzles?", "u")
            .await
            .unwrap_err();
        assert!(matches!(err, DeskError::SessionBusy { .. }));
        assert!(err.is_retryable());
        first.await.unwrap().unwrap();
    }

    #[test]
    fn test_pipeline_order_has_no_duplicates() {
        let names: Vec<&str> = PIPELINE.iter().map(|s| s.agent_name()).collect();
        assert_eq!(
            names,
            vec![
                "intent_classifier",
                "info_collector",
                "knowledge_retriever",
                "decision_engine",
                "automation_executor",
            ]
        );
        let unique: std::collections::HashSet<_> = PIPELINE.iter().collect();
        assert_eq!(unique.len(), PIPELINE.len());
    }

    #[test]
    fn test_is_greeting() {
        assert!(is_greeting("Hello!"));
        assert!(is_greeting("  olá "));
        assert!(is_greeting("good morning."));
        assert!(!is_greeting("hello, my pump stopped"));
    }
}
