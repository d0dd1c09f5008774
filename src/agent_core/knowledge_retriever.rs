//! Knowledge Retriever — ranked lookup plus a cited, templated answer.
//!
//! Never fails the turn: index errors (after retries) and empty results both
//! produce the explicit no-knowledge result, which the decision engine reads
//! as reduced confidence.

use std::sync::Arc;

use super::types::{ConversationContext, KnowledgeSource, RetrievalResult};
use crate::inference::{RetryPolicy, SearchDocument, SearchIndex, UpstreamError};

/// Characters of document content kept in a source excerpt.
const EXCERPT_CHARS: usize = 240;

pub const NO_KNOWLEDGE_ANSWER: &str =
    "No relevant documentation was found in the knowledge base for this request.";

/// Retrieval knobs.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub candidates: usize,
    pub min_relevance_score: f32,
}

/// Retrieval step output plus diagnostics for the audit record.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub result: RetrievalResult,
    pub query: String,
    pub attempts: u32,
    /// Set when the index failed; `result` is then the no-knowledge result.
    pub error: Option<String>,
}

pub struct KnowledgeRetriever {
    index: Arc<dyn SearchIndex>,
    policy: RetryPolicy,
    settings: RetrievalSettings,
}

impl KnowledgeRetriever {
    pub fn new(index: Arc<dyn SearchIndex>, policy: RetryPolicy, settings: RetrievalSettings) -> Self {
        Self {
            index,
            policy,
            settings,
        }
    }

    /// Look up `message` enriched with the known context.
    pub async fn retrieve(&self, message: &str, context: &ConversationContext) -> RetrievalOutcome {
        let query = build_query(message, context);
        let (docs, attempts, error) = self.search_with_retry(&query).await;

        let mut sources: Vec<KnowledgeSource> = docs
            .into_iter()
            .filter(|d| d.score.is_finite() && d.score >= self.settings.min_relevance_score)
            .map(to_source)
            .collect();
        sources.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.document_id.cmp(&b.document_id)));
        sources.truncate(self.settings.top_k);

        let result = if sources.is_empty() {
            no_knowledge()
        } else {
            RetrievalResult {
                answer: synthesize(context, &sources),
                confidence: confidence_for(sources.len()),
                found: true,
                sources,
            }
        };

        tracing::info!(
            found = result.found,
            sources = result.sources.len(),
            attempts,
            failed = error.is_some(),
            "knowledge retrieval finished"
        );

        RetrievalOutcome {
            result,
            query,
            attempts,
            error,
        }
    }

    async fn search_with_retry(&self, query: &str) -> (Vec<SearchDocument>, u32, Option<String>) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.policy.timeout,
                self.index.search(query, self.settings.candidates),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(UpstreamError::Timeout {
                    service: "search".into(),
                    duration_ms: self.policy.timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(docs) => return (docs, attempt, None),
                Err(e) if e.is_transient() && attempt <= self.policy.max_retries => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(attempt, error = %e, "transient search failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "search unavailable, answering without knowledge");
                    return (Vec::new(), attempt, Some(e.to_string()));
                }
            }
        }
    }
}

/// Message text plus intent and known field values.
pub fn build_query(message: &str, context: &ConversationContext) -> String {
    let mut parts = vec![message.trim().to_string()];
    if let Some(intent) = context.intent {
        if !intent.is_vague() {
            parts.push(intent.as_str().replace('_', " "));
        }
    }
    for field in context.fields.values() {
        let v = field.value.to_string();
        if !v.is_empty() && !parts[0].contains(&v) {
            parts.push(v);
        }
    }
    parts.join(" ")
}

/// min(0.5 + 0.15·k, 0.95); zero without sources.
pub fn confidence_for(sources: usize) -> f32 {
    if sources == 0 {
        0.0
    } else {
        (0.5 + 0.15 * sources as f32).min(0.95)
    }
}

pub fn no_knowledge() -> RetrievalResult {
    RetrievalResult {
        answer: NO_KNOWLEDGE_ANSWER.to_string(),
        sources: Vec::new(),
        confidence: 0.0,
        found: false,
    }
}

fn to_source(doc: SearchDocument) -> KnowledgeSource {
    KnowledgeSource {
        document_id: doc.id,
        title: doc.title,
        excerpt: excerpt(&doc.content),
        score: doc.score,
    }
}

fn excerpt(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(EXCERPT_CHARS).collect();
    format!("{}…", cut.trim_end())
}

/// Deterministic answer that cites each source as `[n]`.
fn synthesize(context: &ConversationContext, sources: &[KnowledgeSource]) -> String {
    let mut answer = String::new();
    match context.intent {
        Some(intent) if !intent.is_vague() => answer.push_str(&format!(
            "Relevant guidance for this {} case:\n",
            intent.as_str().replace('_', " ")
        )),
        _ => answer.push_str("Relevant guidance:\n"),
    }
    for (i, source) in sources.iter().enumerate() {
        answer.push_str(&format!("[{}] {}: {}\n", i + 1, source.title, source.excerpt));
    }
    answer.trim_end().to_string()
}
