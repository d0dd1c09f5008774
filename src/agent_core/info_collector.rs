//! Info Collector — completeness check and deterministic field extraction.
//!
//! `check` is a table lookup against the required-field schema. `extract`
//! picks obvious facts (plot ids, crops, machines, inputs, documents) out of
//! the raw text with fixed patterns so a short follow-up like "plot A3" fills
//! the gap without another classifier round-trip.

use std::sync::LazyLock;

use regex::Regex;

use super::schema;
use super::types::{ConversationContext, ExtractedField, FieldValue, InfoCheck, Intent, StepKind};

/// Confidence assigned to pattern matches.
pub const PATTERN_CONFIDENCE: f32 = 0.7;

// ─── Patterns ───────────────────────────────────────────────────────────────

static PLOT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:plot|field|talh[aã]o|lote|block)(?:\s*#\s*|\s+n[oº°]\.?\s*|\s+)([a-z]{0,2}\d{1,4}[a-z]?)\b")
        .unwrap()
});

static CROP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(soybeans?|soy|soja|corn|maize|milho|coffee|caf[eé]|cotton|algod[aã]o|sugarcane|cana|wheat|trigo|rice|arroz|beans?|feij[aã]o)\b",
    )
    .unwrap()
});

static EQUIPMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(irrigation pump|center pivot|pump|pivot|tractor|harvester|combine|sprayer|drone|planter|seeder|bomba|piv[oô]|trator|colheitadeira|pulverizador|plantadeira)\b",
    )
    .unwrap()
});

static ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(urea|ureia|glyphosate|glifosato|npk|potassium chloride|fertili[sz]er|fertilizante|seeds?|sementes?|herbicide|herbicida|fungicide|fungicida|insecticide|inseticida|diesel|lime|calc[aá]rio)\b",
    )
    .unwrap()
});

static DOC_ACRONYM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(ART|CAR|CCIR|ITR)\b").unwrap());

static DOC_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(prescription|receitu[aá]rio|license|licen[cç]a|permit|invoice|nota fiscal)\b")
        .unwrap()
});

// ─── Extraction ─────────────────────────────────────────────────────────────

/// Pull recognizable fields out of `text`. First match per field wins.
pub fn extract(text: &str) -> Vec<ExtractedField> {
    let mut out = Vec::new();

    if let Some(m) = PLOT_RE.captures(text).and_then(|c| c.get(1)) {
        out.push(pattern_field("plot_id", m.as_str().to_ascii_uppercase()));
    }
    if let Some(m) = CROP_RE.find(text) {
        out.push(pattern_field("crop", canonical_crop(m.as_str())));
    }
    if let Some(m) = EQUIPMENT_RE.find(text) {
        out.push(pattern_field("equipment", canonical_equipment(m.as_str())));
    }
    if let Some(m) = ITEM_RE.find(text) {
        out.push(pattern_field("item", m.as_str().to_lowercase()));
    }
    if let Some(m) = DOC_ACRONYM_RE.find(text) {
        out.push(pattern_field("document_type", m.as_str().to_string()));
    } else if let Some(m) = DOC_WORD_RE.find(text) {
        out.push(pattern_field("document_type", m.as_str().to_lowercase()));
    }

    out
}

fn pattern_field(name: &str, value: String) -> ExtractedField {
    ExtractedField {
        name: name.to_string(),
        value: FieldValue::Text(value),
        confidence: PATTERN_CONFIDENCE,
        source: StepKind::Collect,
    }
}

fn canonical_crop(word: &str) -> String {
    let canonical = match word.to_lowercase().as_str() {
        "soy" | "soybean" | "soybeans" | "soja" => "soybean",
        "corn" | "maize" | "milho" => "corn",
        "coffee" | "cafe" | "café" => "coffee",
        "cotton" | "algodao" | "algodão" => "cotton",
        "sugarcane" | "cana" => "sugarcane",
        "wheat" | "trigo" => "wheat",
        "rice" | "arroz" => "rice",
        "bean" | "beans" | "feijao" | "feijão" => "bean",
        other => return other.to_string(),
    };
    canonical.to_string()
}

fn canonical_equipment(word: &str) -> String {
    let canonical = match word.to_lowercase().as_str() {
        "bomba" => "pump",
        "pivo" | "pivô" | "pivot" => "center pivot",
        "trator" => "tractor",
        "colheitadeira" | "combine" => "harvester",
        "pulverizador" => "sprayer",
        "plantadeira" | "seeder" => "planter",
        other => return other.to_string(),
    };
    canonical.to_string()
}

// ─── Completeness ───────────────────────────────────────────────────────────

/// Check `context` against the schema for `intent`.
///
/// When fields are missing, the question names only the first one in the
/// intent's precedence order.
pub fn check(intent: Intent, context: &ConversationContext) -> InfoCheck {
    let missing = schema::missing_fields(intent, context);
    let clarifying_question = missing.first().map(|f| schema::question_for(f));
    InfoCheck {
        complete: missing.is_empty(),
        missing_fields: missing,
        clarifying_question,
    }
}
