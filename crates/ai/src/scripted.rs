//! Deterministic in-process provider for tests and local development.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Value as JsonValue, json};

use crate::provider::ContentProvider;
use crate::request::{GenerationKind, GenerationRequest};
use crate::result::{GenerationResponse, ProviderError};

type Scripted = Result<GenerationResponse, ProviderError>;

/// Provider that replays scripted answers per kind and falls back to a
/// canned, schema-valid answer when the script runs dry.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<GenerationKind, VecDeque<Scripted>>>,
    calls: Mutex<Vec<GenerationRequest>>,
    latency: Mutex<Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next call of `kind`.
    pub fn push(&self, kind: GenerationKind, response: Scripted) -> &Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(kind).or_default().push_back(response);
        }
        self
    }

    /// Queue `n` identical failures for `kind`.
    pub fn fail_times(&self, kind: GenerationKind, n: usize, err: ProviderError) -> &Self {
        for _ in 0..n {
            self.push(kind, Err(err.clone()));
        }
        self
    }

    /// Delay every later call by `latency`, like a slow upstream model.
    pub fn set_latency(&self, latency: Duration) -> &Self {
        if let Ok(mut current) = self.latency.lock() {
            *current = latency;
        }
        self
    }

    /// Requests seen so far.
    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, kind: GenerationKind) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|r| r.kind == kind).count())
            .unwrap_or(0)
    }

    fn canned(request: &GenerationRequest) -> GenerationResponse {
        let output = match request.kind {
            GenerationKind::KnowledgeExtraction => json!({
                "chunks": [
                    { "text": format!("Key point: {}", request.instructions), "keywords": ["key"] },
                    { "text": "Supporting detail", "keywords": ["detail"] }
                ]
            }),
            GenerationKind::Outline => json!({
                "title": request.instructions,
                "lessons": [
                    { "title": "Introduction", "summary": "Why this matters" },
                    { "title": "Core concepts", "summary": "The essentials" },
                    { "title": "Practice", "summary": "Apply it" }
                ]
            }),
            GenerationKind::LessonContent => json!({
                "title": request.instructions,
                "sections": [
                    { "heading": "Overview", "body": request.context.join("\n") },
                    { "heading": "Summary", "body": "Recap" }
                ]
            }),
            GenerationKind::Component => json!({
                "component": request
                    .metadata
                    .get("component")
                    .cloned()
                    .unwrap_or(JsonValue::Null),
                "content": { "text": request.instructions }
            }),
        };

        let tokens = 50 + (request.instructions.len() + request.context.len() * 10) as u64;
        GenerationResponse::new(output, tokens).with_model("scripted")
    }
}

#[async_trait::async_trait]
impl ContentProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }

        let latency = self.latency.lock().map(|l| *l).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let next = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(&request.kind).and_then(|q| q.pop_front()));

        match next {
            Some(scripted) => scripted,
            None => Ok(Self::canned(&request)),
        }
    }
}
