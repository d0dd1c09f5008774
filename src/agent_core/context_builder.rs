//! Context Builder — pure merge of extracted fields into the conversation context.
//!
//! Rules:
//! - Blank values are ignored.
//! - A stored field is replaced only when the new confidence exceeds the
//!   stored confidence by more than the configured margin. Ties keep the
//!   stored value.
//! - Fields are never removed, so the populated count never decreases.
//! - `complete` is recomputed against the active intent's schema.

use super::schema;
use super::types::{ContextField, ConversationContext, ExtractedField, Intent};

/// Merge policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct MergePolicy {
    /// Required confidence advantage for an overwrite.
    pub margin: f32,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self { margin: 0.1 }
    }
}

/// Merge `extracted` into a copy of `context` for turn `turn`.
pub fn merge(
    context: &ConversationContext,
    extracted: &[ExtractedField],
    turn: u32,
    policy: MergePolicy,
) -> ConversationContext {
    let mut next = context.clone();

    for field in extracted {
        if field.name.trim().is_empty() || field.value.is_blank() {
            continue;
        }
        let confidence = field.confidence.clamp(0.0, 1.0);

        let replace = match next.fields.get(&field.name) {
            None => true,
            Some(existing) if existing.value.is_blank() => true,
            Some(existing) => confidence > existing.confidence + policy.margin,
        };

        if replace {
            next.fields.insert(
                field.name.clone(),
                ContextField {
                    value: field.value.clone(),
                    confidence,
                    source: field.source,
                    turn,
                },
            );
        }
    }

    next.complete = schema::is_complete(next.intent, &next);
    next
}

/// Switch the active intent, keeping the fields, and recompute `complete`.
pub fn with_intent(
    context: &ConversationContext,
    intent: Option<Intent>,
    confidence: f32,
) -> ConversationContext {
    let mut next = context.clone();
    next.intent = intent;
    next.intent_confidence = confidence;
    next.complete = schema::is_complete(intent, &next);
    next
}
