//! Scripted upstream doubles for tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::types::ConversationContext;
use crate::inference::{
    AutomationOutcome, AutomationService, ClassificationService, RawClassification, SearchDocument,
    SearchIndex, UpstreamError,
};

/// One scripted reply.
pub enum Reply<T> {
    Ok(T),
    Err(UpstreamError),
    /// Never answers; the caller's deadline must fire.
    Hang,
    Panic,
}

type Fallback<T> = Box<dyn Fn() -> Reply<T> + Send + Sync>;

/// Replays a queue of replies, then the fallback forever.
pub struct Script<T> {
    replies: Mutex<VecDeque<Reply<T>>>,
    fallback: Fallback<T>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    inputs: Mutex<Vec<String>>,
}

impl<T> Script<T> {
    fn construct(replies: Vec<Reply<T>>, fallback: Fallback<T>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    async fn next(&self, input: &str) -> Result<T, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(input.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| (self.fallback)());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Reply::Ok(v) => Ok(v),
            Reply::Err(e) => Err(e),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(UpstreamError::Timeout {
                    service: "scripted".into(),
                    duration_ms: 3_600_000,
                })
            }
            Reply::Panic => panic!("scripted upstream panic"),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

// ─── Classification ─────────────────────────────────────────────────────────

pub type ScriptedClassifier = Script<RawClassification>;

impl Script<RawClassification> {
    /// Replays `replies`; afterwards every call returns a low-confidence `general`.
    pub fn new(replies: Vec<Reply<RawClassification>>) -> Self {
        Script::new_with(replies, || Reply::Ok(raw("general", 0.3, &[])))
    }

    /// Every call fails with `make()`.
    pub fn failing(make: fn() -> UpstreamError) -> Self {
        Script::new_with(Vec::new(), move || Reply::Err(make()))
    }

    /// Every call returns `r`.
    pub fn always(r: RawClassification) -> Self {
        Script::new_with(Vec::new(), move || Reply::Ok(r.clone()))
    }

    fn new_with(
        replies: Vec<Reply<RawClassification>>,
        fallback: impl Fn() -> Reply<RawClassification> + Send + Sync + 'static,
    ) -> Self {
        Self::construct(replies, Box::new(fallback))
    }
}

#[async_trait]
impl ClassificationService for Script<RawClassification> {
    async fn classify(
        &self,
        text: &str,
        _context: &ConversationContext,
    ) -> Result<RawClassification, UpstreamError> {
        self.next(text).await
    }
}

// ─── Search ─────────────────────────────────────────────────────────────────

pub type ScriptedSearch = Script<Vec<SearchDocument>>;

impl Script<Vec<SearchDocument>> {
    /// Every call returns `docs`.
    pub fn returning(docs: Vec<SearchDocument>) -> Self {
        Script::construct(Vec::new(), Box::new(move || Reply::Ok(docs.clone())))
    }

    pub fn empty() -> Self {
        Self::returning(Vec::new())
    }

    /// Replays `replies`; afterwards every call returns no documents.
    pub fn scripted(replies: Vec<Reply<Vec<SearchDocument>>>) -> Self {
        Script::construct(replies, Box::new(|| Reply::Ok(Vec::new())))
    }

    pub fn failing(make: fn() -> UpstreamError) -> Self {
        Script::construct(Vec::new(), Box::new(move || Reply::Err(make())))
    }
}

#[async_trait]
impl SearchIndex for Script<Vec<SearchDocument>> {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchDocument>, UpstreamError> {
        let mut docs = self.next(query).await?;
        docs.truncate(top_k);
        Ok(docs)
    }
}

// ─── Automation ─────────────────────────────────────────────────────────────

pub type ScriptedAutomation = Script<AutomationOutcome>;

impl Script<AutomationOutcome> {
    pub fn accepting() -> Self {
        Script::construct(
            Vec::new(),
            Box::new(|| {
                Reply::Ok(AutomationOutcome {
                    success: true,
                    detail: "done".into(),
                    reference: Some("RUN-1".into()),
                })
            }),
        )
    }

    pub fn failing(make: fn() -> UpstreamError) -> Self {
        Script::construct(Vec::new(), Box::new(move || Reply::Err(make())))
    }
}

#[async_trait]
impl AutomationService for Script<AutomationOutcome> {
    async fn execute(
        &self,
        catalog_entry_id: &str,
        _session_id: &str,
        _context: &BTreeMap<String, String>,
    ) -> Result<AutomationOutcome, UpstreamError> {
        self.next(catalog_entry_id).await
    }
}

// ─── Builders ───────────────────────────────────────────────────────────────

/// Classifier reply with string fields.
pub fn raw(intent: &str, confidence: f32, fields: &[(&str, &str)]) -> RawClassification {
    RawClassification {
        intent: intent.to_string(),
        urgency: None,
        confidence,
        extracted_fields: fields
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect(),
    }
}

/// Search hit.
pub fn doc(id: &str, title: &str, content: &str, score: f32) -> SearchDocument {
    SearchDocument {
        id: id.to_string(),
        title: title.to_string(),
        content: content.to_string(),
        score,
    }
}
