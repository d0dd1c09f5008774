//! Intent Classifier — labels a message through the external classification
//! service with a per-attempt deadline and bounded retries.
//!
//! Transient failures (timeout, connection, 429, 5xx) are retried with
//! exponential backoff. When retries run out the step returns a degraded
//! result (`unknown`, confidence 0) instead of failing the turn. Terminal
//! failures are returned immediately.

use std::sync::Arc;

use serde::Serialize;

use super::errors::DeskError;
use super::types::{Classification, ConversationContext, ExtractedField, FieldValue, Intent, StepKind, Urgency};
use crate::inference::{ClassificationService, RawClassification, RetryPolicy, UpstreamError};

/// What the classifier step produced, including how it got there.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationOutcome {
    pub classification: Classification,
    pub attempts: u32,
    /// Retries were exhausted and `classification` is the fallback.
    pub degraded: bool,
    /// Last transient error when degraded.
    pub error: Option<String>,
}

pub struct IntentClassifier {
    service: Arc<dyn ClassificationService>,
    policy: RetryPolicy,
}

impl IntentClassifier {
    pub fn new(service: Arc<dyn ClassificationService>, policy: RetryPolicy) -> Self {
        Self { service, policy }
    }

    /// Classify `text` given what the session already knows.
    pub async fn classify(
        &self,
        text: &str,
        context: &ConversationContext,
    ) -> Result<ClassificationOutcome, DeskError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let result = match tokio::time::timeout(
                self.policy.timeout,
                self.service.classify(text, context),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(UpstreamError::Timeout {
                    service: "classification".into(),
                    duration_ms: self.policy.timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(raw) => {
                    let classification = normalize(raw);
                    tracing::info!(
                        intent = %classification.intent,
                        confidence = classification.confidence,
                        fields = classification.extracted_fields.len(),
                        attempt,
                        "message classified"
                    );
                    return Ok(ClassificationOutcome {
                        classification,
                        attempts: attempt,
                        degraded: false,
                        error: None,
                    });
                }
                Err(e) if e.is_transient() => {
                    if attempt > self.policy.max_retries {
                        tracing::warn!(
                            attempts = attempt,
                            error = %e,
                            "classification retries exhausted, using degraded result"
                        );
                        return Ok(ClassificationOutcome {
                            classification: Classification::degraded(),
                            attempts: attempt,
                            degraded: true,
                            error: Some(e.to_string()),
                        });
                    }
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient classification failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "classification failed permanently");
                    return Err(DeskError::upstream("classification", e));
                }
            }
        }
    }
}

/// Turn the wire result into domain types. Confidence is clamped to [0, 1].
fn normalize(raw: RawClassification) -> Classification {
    let confidence = if raw.confidence.is_finite() {
        raw.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let extracted_fields = raw
        .extracted_fields
        .iter()
        .filter_map(|(name, value)| {
            let value = FieldValue::from_json(value)?;
            Some(ExtractedField {
                name: name.trim().to_ascii_lowercase(),
                value,
                confidence,
                source: StepKind::Classify,
            })
        })
        .collect();

    Classification {
        intent: Intent::from_label(&raw.intent),
        urgency: raw
            .urgency
            .as_deref()
            .map(Urgency::from_label)
            .unwrap_or_default(),
        confidence,
        extracted_fields,
    }
}
