//! Domain collaborators the handlers read from and write to.
//!
//! Both are traits so the worker can run against object storage and a
//! vector index in production and against maps in tests.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use coursegen_core::{CourseId, LessonId, SmeTaskId, SubmissionId, TenantId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("content storage error: {0}")]
    Storage(String),
}

/// A piece of extracted subject-matter knowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub text: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub source: SubmissionId,
}

impl KnowledgeChunk {
    /// Number of query terms found in the chunk's keywords or text.
    pub fn score(&self, query: &str) -> usize {
        let text = self.text.to_lowercase();
        query_terms(query)
            .filter(|term| {
                text.contains(term.as_str())
                    || self.keywords.iter().any(|k| k.eq_ignore_ascii_case(term))
            })
            .count()
    }
}

fn query_terms(query: &str) -> impl Iterator<Item = String> + '_ {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineLesson {
    pub id: LessonId,
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseOutline {
    pub title: String,
    pub lessons: Vec<OutlineLesson>,
}

impl CourseOutline {
    pub fn lesson(&self, id: LessonId) -> Option<&OutlineLesson> {
        self.lessons.iter().find(|l| l.id == id)
    }

    pub fn lesson_ids(&self) -> Vec<LessonId> {
        self.lessons.iter().map(|l| l.id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonSection {
    pub heading: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonBody {
    pub title: String,
    pub sections: Vec<LessonSection>,
}

/// SME knowledge: raw submissions in, ranked chunks out.
#[async_trait::async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn submission_text(
        &self,
        tenant_id: TenantId,
        submission_id: SubmissionId,
    ) -> Result<String, ContentError>;

    /// Replace the chunks extracted from one submission. Returns the result path.
    async fn store_chunks(
        &self,
        tenant_id: TenantId,
        sme_task_id: SmeTaskId,
        submission_id: SubmissionId,
        chunks: Vec<KnowledgeChunk>,
    ) -> Result<String, ContentError>;

    /// Best matches for `query` first.
    async fn ranked_chunks(
        &self,
        tenant_id: TenantId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeChunk>, ContentError>;
}

/// Generated course material. Writes return the stored document's path.
#[async_trait::async_trait]
pub trait ContentRepository: Send + Sync {
    async fn save_outline(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
        outline: &CourseOutline,
    ) -> Result<String, ContentError>;

    async fn outline(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
    ) -> Result<Option<CourseOutline>, ContentError>;

    async fn save_lesson(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
        lesson_id: LessonId,
        lesson: &LessonBody,
    ) -> Result<String, ContentError>;

    async fn lesson(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
        lesson_id: LessonId,
    ) -> Result<Option<LessonBody>, ContentError>;

    async fn save_component(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
        lesson_id: LessonId,
        component: &str,
        content: &JsonValue,
    ) -> Result<String, ContentError>;
}

pub fn outline_path(tenant_id: TenantId, course_id: CourseId) -> String {
    format!("tenants/{tenant_id}/courses/{course_id}/outline.json")
}

pub fn lesson_path(tenant_id: TenantId, course_id: CourseId, lesson_id: LessonId) -> String {
    format!("tenants/{tenant_id}/courses/{course_id}/lessons/{lesson_id}.json")
}

pub fn component_path(
    tenant_id: TenantId,
    course_id: CourseId,
    lesson_id: LessonId,
    component: &str,
) -> String {
    format!("tenants/{tenant_id}/courses/{course_id}/lessons/{lesson_id}/components/{component}.json")
}

pub fn chunks_path(tenant_id: TenantId, sme_task_id: SmeTaskId, submission_id: SubmissionId) -> String {
    format!("tenants/{tenant_id}/sme/{sme_task_id}/submissions/{submission_id}/chunks.json")
}

fn storage<E: std::fmt::Display>(e: E) -> ContentError {
    ContentError::Storage(e.to_string())
}

/// In-memory knowledge base for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryKnowledgeBase {
    submissions: RwLock<HashMap<(TenantId, SubmissionId), String>>,
    // Insertion order is kept per tenant so ties rank oldest first.
    chunks: RwLock<HashMap<TenantId, Vec<(SmeTaskId, KnowledgeChunk)>>>,
}

impl InMemoryKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an uploaded submission's extracted text.
    pub fn add_submission(&self, tenant_id: TenantId, submission_id: SubmissionId, text: impl Into<String>) {
        if let Ok(mut submissions) = self.submissions.write() {
            submissions.insert((tenant_id, submission_id), text.into());
        }
    }

    pub fn chunk_count(&self, tenant_id: TenantId) -> usize {
        self.chunks
            .read()
            .map(|c| c.get(&tenant_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl KnowledgeBase for InMemoryKnowledgeBase {
    async fn submission_text(
        &self,
        tenant_id: TenantId,
        submission_id: SubmissionId,
    ) -> Result<String, ContentError> {
        let submissions = self.submissions.read().map_err(storage)?;
        submissions
            .get(&(tenant_id, submission_id))
            .cloned()
            .ok_or_else(|| ContentError::NotFound(format!("submission {submission_id}")))
    }

    async fn store_chunks(
        &self,
        tenant_id: TenantId,
        sme_task_id: SmeTaskId,
        submission_id: SubmissionId,
        chunks: Vec<KnowledgeChunk>,
    ) -> Result<String, ContentError> {
        let mut all = self.chunks.write().map_err(storage)?;
        let tenant_chunks = all.entry(tenant_id).or_default();
        tenant_chunks.retain(|(_, c)| c.source != submission_id);
        tenant_chunks.extend(chunks.into_iter().map(|c| (sme_task_id, c)));
        Ok(chunks_path(tenant_id, sme_task_id, submission_id))
    }

    async fn ranked_chunks(
        &self,
        tenant_id: TenantId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeChunk>, ContentError> {
        let all = self.chunks.read().map_err(storage)?;
        let Some(tenant_chunks) = all.get(&tenant_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(usize, &KnowledgeChunk)> = tenant_chunks
            .iter()
            .map(|(_, c)| (c.score(query), c))
            .collect();
        // Stable sort keeps insertion order among equal scores.
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored.into_iter().take(limit).map(|(_, c)| c.clone()).collect())
    }
}

/// In-memory document store keyed by result path.
#[derive(Debug, Default)]
pub struct InMemoryContentRepository {
    documents: RwLock<HashMap<String, JsonValue>>,
}

impl InMemoryContentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw document at `path` (test visibility).
    pub fn document(&self, path: &str) -> Option<JsonValue> {
        self.documents.read().ok().and_then(|d| d.get(path).cloned())
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn put<T: Serialize>(&self, path: String, value: &T) -> Result<String, ContentError> {
        let json = serde_json::to_value(value).map_err(storage)?;
        self.documents.write().map_err(storage)?.insert(path.clone(), json);
        Ok(path)
    }

    fn load<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ContentError> {
        let documents = self.documents.read().map_err(storage)?;
        documents
            .get(path)
            .map(|v| serde_json::from_value(v.clone()).map_err(storage))
            .transpose()
    }
}

#[async_trait::async_trait]
impl ContentRepository for InMemoryContentRepository {
    async fn save_outline(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
        outline: &CourseOutline,
    ) -> Result<String, ContentError> {
        self.put(outline_path(tenant_id, course_id), outline)
    }

    async fn outline(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
    ) -> Result<Option<CourseOutline>, ContentError> {
        self.load(&outline_path(tenant_id, course_id))
    }

    async fn save_lesson(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
        lesson_id: LessonId,
        lesson: &LessonBody,
    ) -> Result<String, ContentError> {
        self.put(lesson_path(tenant_id, course_id, lesson_id), lesson)
    }

    async fn lesson(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
        lesson_id: LessonId,
    ) -> Result<Option<LessonBody>, ContentError> {
        self.load(&lesson_path(tenant_id, course_id, lesson_id))
    }

    async fn save_component(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
        lesson_id: LessonId,
        component: &str,
        content: &JsonValue,
    ) -> Result<String, ContentError> {
        self.put(component_path(tenant_id, course_id, lesson_id, component), content)
    }
}
