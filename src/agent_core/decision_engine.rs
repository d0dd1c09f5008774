//! Decision Engine — fixed decision table over bucketed inputs.
//!
//! Inputs are reduced to four facts (context complete, catalog entry class,
//! knowledge found, confidence bucket) and matched against `RULES` in order.
//! The first matching row decides. No per-intent branching.

use std::sync::Arc;

use super::catalog::Catalog;
use super::schema;
use super::types::{
    ActionKind, CatalogEntry, ConversationContext, Decision, Intent, RetrievalResult, RiskLevel,
};

// ─── Facts ──────────────────────────────────────────────────────────────────

/// Catalog entry selected for the intent, reduced to what the table reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryClass {
    NoEntry,
    SafeAuto,
    SafeManual,
    Critical,
}

impl EntryClass {
    pub const ALL: [EntryClass; 4] = [
        EntryClass::NoEntry,
        EntryClass::SafeAuto,
        EntryClass::SafeManual,
        EntryClass::Critical,
    ];

    fn of(entry: Option<&CatalogEntry>) -> Self {
        match entry {
            None => EntryClass::NoEntry,
            Some(e) if e.safety == RiskLevel::Critical => EntryClass::Critical,
            Some(e) if e.auto_executable => EntryClass::SafeAuto,
            Some(_) => EntryClass::SafeManual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfidenceBucket {
    Low,
    High,
}

impl ConfidenceBucket {
    pub const ALL: [ConfidenceBucket; 2] = [ConfidenceBucket::Low, ConfidenceBucket::High];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Facts {
    pub complete: bool,
    pub entry: EntryClass,
    pub knowledge: bool,
    pub bucket: ConfidenceBucket,
}

// ─── Table ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Pat<T> {
    Any,
    Is(T),
}

impl<T: PartialEq> Pat<T> {
    fn matches(&self, v: &T) -> bool {
        match self {
            Pat::Any => true,
            Pat::Is(x) => x == v,
        }
    }
}

struct Rule {
    complete: Pat<bool>,
    entry: Pat<EntryClass>,
    knowledge: Pat<bool>,
    bucket: Pat<ConfidenceBucket>,
    action: ActionKind,
    /// Placeholders: `{missing}`, `{entry}`, `{confidence}`, `{threshold}`.
    reason: &'static str,
}

const RULES: &[Rule] = &[
    Rule {
        complete: Pat::Is(false),
        entry: Pat::Any,
        knowledge: Pat::Any,
        bucket: Pat::Any,
        action: ActionKind::RequestInformation,
        reason: "Required information is missing: {missing}",
    },
    Rule {
        complete: Pat::Is(true),
        entry: Pat::Is(EntryClass::NoEntry),
        knowledge: Pat::Any,
        bucket: Pat::Any,
        action: ActionKind::Escalate,
        reason: "No runbook covers this request; routing to a specialist",
    },
    Rule {
        complete: Pat::Is(true),
        entry: Pat::Is(EntryClass::Critical),
        knowledge: Pat::Is(true),
        bucket: Pat::Any,
        action: ActionKind::RequestApproval,
        reason: "'{entry}' is a critical action and needs human approval",
    },
    Rule {
        complete: Pat::Is(true),
        entry: Pat::Is(EntryClass::Critical),
        knowledge: Pat::Is(false),
        bucket: Pat::Any,
        action: ActionKind::Escalate,
        reason: "'{entry}' is a critical action and no supporting documentation was found; escalating",
    },
    Rule {
        complete: Pat::Is(true),
        entry: Pat::Is(EntryClass::SafeAuto),
        knowledge: Pat::Any,
        bucket: Pat::Is(ConfidenceBucket::High),
        action: ActionKind::AutoExecute,
        reason: "'{entry}' is safe and confidence {confidence} meets the {threshold} threshold",
    },
    Rule {
        complete: Pat::Is(true),
        entry: Pat::Is(EntryClass::SafeAuto),
        knowledge: Pat::Any,
        bucket: Pat::Is(ConfidenceBucket::Low),
        action: ActionKind::RequestApproval,
        reason: "'{entry}' is safe but confidence {confidence} is below the {threshold} threshold",
    },
    Rule {
        complete: Pat::Is(true),
        entry: Pat::Is(EntryClass::SafeManual),
        knowledge: Pat::Any,
        bucket: Pat::Any,
        action: ActionKind::RequestApproval,
        reason: "'{entry}' is not enabled for automatic execution",
    },
];

/// First matching row. `None` only if the table has a gap.
fn lookup(facts: &Facts) -> Option<&'static Rule> {
    RULES.iter().find(|r| {
        r.complete.matches(&facts.complete)
            && r.entry.matches(&facts.entry)
            && r.knowledge.matches(&facts.knowledge)
            && r.bucket.matches(&facts.bucket)
    })
}

// ─── Engine ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct DecisionPolicy {
    pub auto_execute_threshold: f32,
    /// Subtracted from confidence when retrieval found nothing.
    pub no_knowledge_penalty: f32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            auto_execute_threshold: 0.8,
            no_knowledge_penalty: 0.1,
        }
    }
}

pub struct DecisionEngine {
    catalog: Arc<Catalog>,
    policy: DecisionPolicy,
}

impl DecisionEngine {
    pub fn new(catalog: Arc<Catalog>, policy: DecisionPolicy) -> Self {
        Self { catalog, policy }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Map intent + context + retrieval + classifier confidence to a decision.
    pub fn decide(
        &self,
        intent: Intent,
        context: &ConversationContext,
        retrieval: &RetrievalResult,
        confidence: f32,
    ) -> Decision {
        let entry = self.catalog.select(intent);
        let effective = if retrieval.found {
            confidence
        } else {
            (confidence - self.policy.no_knowledge_penalty).max(0.0)
        };

        let facts = Facts {
            complete: context.complete,
            entry: EntryClass::of(entry),
            knowledge: retrieval.found,
            bucket: if effective >= self.policy.auto_execute_threshold {
                ConfidenceBucket::High
            } else {
                ConfidenceBucket::Low
            },
        };

        let (action, template) = match lookup(&facts) {
            Some(rule) => (rule.action, rule.reason),
            None => (ActionKind::Escalate, "No decision rule matched; escalating"),
        };

        let missing = schema::missing_fields(intent, context).join(", ");
        let reason = template
            .replace("{missing}", &missing)
            .replace("{entry}", entry.map_or("", |e| e.name.as_str()))
            .replace("{confidence}", &format!("{effective:.2}"))
            .replace("{threshold}", &format!("{:.2}", self.policy.auto_execute_threshold));

        let risk = match (entry, action) {
            (Some(e), _) => e.safety,
            (None, ActionKind::Escalate) => RiskLevel::Critical,
            (None, _) => RiskLevel::Safe,
        };

        let catalog_entry_id = match action {
            ActionKind::RequestInformation => None,
            _ => entry.map(|e| e.id.clone()),
        };

        tracing::info!(
            intent = %intent,
            action = ?action,
            entry = ?catalog_entry_id,
            confidence = effective,
            "decision made"
        );

        Decision {
            action,
            catalog_entry_id,
            risk,
            reason,
            confidence: effective,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::context_builder::with_intent;
    use crate::agent_core::knowledge_retriever::no_knowledge;
    use crate::agent_core::types::{ContextField, FieldValue, KnowledgeSource, StepKind};

    fn engine() -> DecisionEngine {
        DecisionEngine::new(Arc::new(Catalog::builtin()), DecisionPolicy::default())
    }

    fn found(n: usize) -> RetrievalResult {
        RetrievalResult {
            answer: "a".into(),
            sources: (0..n)
                .map(|i| KnowledgeSource {
                    document_id: format!("d{i}"),
                    title: "t".into(),
                    excerpt: "e".into(),
                    score: 0.9,
                })
                .collect(),
            confidence: 0.8,
            found: true,
        }
    }

    /// Context for `intent` with every required field present.
    fn complete_ctx(intent: Intent) -> ConversationContext {
        let mut ctx = ConversationContext::default();
        for f in schema::required_fields(intent) {
            ctx.fields.insert(
                f.to_string(),
                ContextField {
                    value: FieldValue::Text("x".into()),
                    confidence: 0.9,
                    source: StepKind::Classify,
                    turn: 1,
                },
            );
        }
        with_intent(&ctx, Some(intent), 0.9)
    }

    #[test]
    fn test_every_fact_combination_has_exactly_one_first_rule_and_is_safe() {
        for complete in [false, true] {
            for entry in EntryClass::ALL {
                for knowledge in [false, true] {
                    for bucket in ConfidenceBucket::ALL {
                        let facts = Facts {
                            complete,
                            entry,
                            knowledge,
                            bucket,
                        };
                        let rule = lookup(&facts)
                            .unwrap_or_else(|| panic!("decision table gap for {facts:?}"));
                        if rule.action == ActionKind::AutoExecute {
                            assert!(complete, "auto-execute on incomplete context: {facts:?}");
                            assert_eq!(entry, EntryClass::SafeAuto, "{facts:?}");
                            assert_eq!(bucket, ConfidenceBucket::High, "{facts:?}");
                        }
                        if !complete {
                            assert_eq!(rule.action, ActionKind::RequestInformation);
                        }
                        if entry == EntryClass::Critical {
                            assert_ne!(rule.action, ActionKind::AutoExecute);
                        }
                        assert!(!rule.reason.is_empty());
                    }
                }
            }
        }
    }

    #[test]
    fn test_every_intent_safety_bucket_combination() {
        let engine = engine();
        for intent in Intent::ALL {
            for complete in [false, true] {
                for knowledge in [false, true] {
                    for confidence in [0.0_f32, 0.5, 0.79, 0.8, 0.95, 1.0] {
                        let ctx = if complete {
                            complete_ctx(intent)
                        } else {
                            // Incomplete regardless of schema.
                            let mut c = with_intent(&ConversationContext::default(), Some(intent), confidence);
                            c.complete = false;
                            c
                        };
                        let retrieval = if knowledge { found(2) } else { no_knowledge() };
                        let d = engine.decide(intent, &ctx, &retrieval, confidence);

                        assert!(!d.reason.is_empty(), "{intent} produced empty reason");
                        if d.action == ActionKind::AutoExecute {
                            assert!(ctx.complete);
                            let entry = engine
                                .catalog()
                                .get(d.catalog_entry_id.as_deref().unwrap())
                                .unwrap();
                            assert_eq!(entry.safety, RiskLevel::Safe);
                        }
                        if !ctx.complete {
                            assert_eq!(d.action, ActionKind::RequestInformation);
                            assert!(d.catalog_entry_id.is_none());
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_critical_with_knowledge_requests_approval() {
        let d = engine().decide(
            Intent::EquipmentAlert,
            &complete_ctx(Intent::EquipmentAlert),
            &found(2),
            0.9,
        );
        assert_eq!(d.action, ActionKind::RequestApproval);
        assert_eq!(d.catalog_entry_id.as_deref(), Some("urgent-work-order"));
        assert_eq!(d.risk, RiskLevel::Critical);
        assert!(d.reason.contains("Open Urgent Work Order"));
    }

    #[test]
    fn test_critical_without_knowledge_escalates() {
        let d = engine().decide(
            Intent::Compliance,
            &complete_ctx(Intent::Compliance),
            &no_knowledge(),
            0.99,
        );
        assert_eq!(d.action, ActionKind::Escalate);
        assert_eq!(d.catalog_entry_id.as_deref(), Some("prefill-art"));
    }

    #[test]
    fn test_safe_high_confidence_auto_executes() {
        let d = engine().decide(Intent::StockCheck, &complete_ctx(Intent::StockCheck), &found(1), 0.95);
        assert_eq!(d.action, ActionKind::AutoExecute);
        assert_eq!(d.catalog_entry_id.as_deref(), Some("stock-inquiry"));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let d = engine().decide(Intent::StockCheck, &complete_ctx(Intent::StockCheck), &found(1), 0.8);
        assert_eq!(d.action, ActionKind::AutoExecute);
        let d = engine().decide(Intent::StockCheck, &complete_ctx(Intent::StockCheck), &found(1), 0.79);
        assert_eq!(d.action, ActionKind::RequestApproval);
        assert!(d.reason.contains("below"));
    }

    #[test]
    fn test_no_knowledge_penalty_drops_bucket() {
        let d = engine().decide(
            Intent::StockCheck,
            &complete_ctx(Intent::StockCheck),
            &no_knowledge(),
            0.85,
        );
        assert_eq!(d.action, ActionKind::RequestApproval);
        assert!((d.confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_general_intent_escalates() {
        let d = engine().decide(Intent::General, &complete_ctx(Intent::General), &found(1), 0.99);
        assert_eq!(d.action, ActionKind::Escalate);
        assert!(d.catalog_entry_id.is_none());
    }

    #[test]
    fn test_incomplete_reason_names_missing() {
        let ctx = with_intent(&ConversationContext::default(), Some(Intent::EquipmentAlert), 0.9);
        let d = engine().decide(Intent::EquipmentAlert, &ctx, &found(1), 0.9);
        assert_eq!(d.action, ActionKind::RequestInformation);
        assert!(d.reason.contains("plot_id"));
    }
}
