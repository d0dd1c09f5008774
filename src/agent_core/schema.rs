//! Required-field schema per intent.
//!
//! Static table, read-only after startup. Field order is question precedence:
//! the first missing field is the one the info collector asks about.

use super::types::{ConversationContext, Intent};

/// Required fields for `intent`, most important first.
pub fn required_fields(intent: Intent) -> &'static [&'static str] {
    match intent {
        Intent::FieldDiagnosis => &["plot_id", "crop"],
        Intent::EquipmentAlert => &["plot_id", "equipment"],
        Intent::StockCheck => &["item"],
        Intent::Compliance => &["document_type"],
        Intent::KnowledgeQuery | Intent::General | Intent::Unknown => &[],
    }
}

/// Clarifying question for a single missing field.
pub fn question_for(field: &str) -> String {
    match field {
        "plot_id" => "Which plot is this happening in? (for example: plot A3)".to_string(),
        "crop" => "Which crop is planted there? (for example: soybean, corn, coffee)".to_string(),
        "equipment" => "Which machine or piece of equipment is affected?".to_string(),
        "item" => "Which input or product do you want to check? (for example: glyphosate, urea, seed)"
            .to_string(),
        "document_type" => {
            "Which document do you need? (for example: ART, CAR, pesticide prescription)".to_string()
        }
        other => format!("Could you tell me the {}?", other.replace('_', " ")),
    }
}

/// Required fields for `intent` that `context` does not hold yet, in precedence order.
pub fn missing_fields(intent: Intent, context: &ConversationContext) -> Vec<String> {
    required_fields(intent)
        .iter()
        .filter(|name| {
            context
                .fields
                .get(**name)
                .map_or(true, |f| f.value.is_blank())
        })
        .map(|name| name.to_string())
        .collect()
}

/// `complete` for the given intent. No active intent means nothing is complete.
pub fn is_complete(intent: Option<Intent>, context: &ConversationContext) -> bool {
    match intent {
        Some(i) => missing_fields(i, context).is_empty(),
        None => false,
    }
}
