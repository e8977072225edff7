use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use coursegen_core::TenantId;

/// What the provider is asked to produce.
///
/// Each kind has a fixed output schema that the orchestrator validates:
///
/// | Kind | Output |
/// |------|--------|
/// | `KnowledgeExtraction` | `{"chunks": [{"text": str, "keywords": [str]}]}` |
/// | `Outline` | `{"title": str, "lessons": [{"title": str, "summary": str}]}` |
/// | `LessonContent` | `{"title": str, "sections": [{"heading": str, "body": str}]}` |
/// | `Component` | `{"component": str, "content": any}` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    KnowledgeExtraction,
    Outline,
    LessonContent,
    Component,
}

/// A tenant-scoped generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub tenant_id: TenantId,
    pub kind: GenerationKind,
    /// Primary instruction (course brief, lesson title, regeneration notes).
    pub instructions: String,
    /// Ranked upstream context (knowledge chunks, outline excerpts).
    pub context: Vec<String>,
    /// Free-form metadata (course/lesson ids, component name).
    pub metadata: JsonValue,
}

impl GenerationRequest {
    pub fn new(tenant_id: TenantId, kind: GenerationKind, instructions: impl Into<String>) -> Self {
        Self {
            tenant_id,
            kind,
            instructions: instructions.into(),
            context: Vec::new(),
            metadata: JsonValue::Null,
        }
    }

    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}
