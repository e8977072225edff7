//! One handler per job type.
//!
//! Every handler walks the same checkpoint sequence: validate inputs, gather
//! upstream context, call the provider, parse its output, persist. Progress
//! and cancellation are handled by [`JobContext::advance`] between steps.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};
use tracing::debug;

use coursegen_ai::{ContentProvider, GenerationKind, GenerationRequest, GenerationResponse, ProviderError};
use coursegen_core::TenantId;

use super::content::{
    ContentRepository, CourseOutline, KnowledgeBase, KnowledgeChunk, LessonBody, LessonSection,
    OutlineLesson,
};
use super::context::{Checkpoint, JobContext};
use super::error::JobError;
use crate::batch::BatchCoordinator;
use crate::cache::TenantCache;
use crate::jobs::{JobPayload, JobType};

/// Chunks handed to the provider as context.
pub const CONTEXT_CHUNKS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Completed {
        result_path: Option<String>,
        tokens_used: u64,
    },
    /// The job became a batch parent; children finish it.
    AwaitingChildren { children: usize },
}

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn run(&self, ctx: &mut JobContext) -> Result<HandlerOutcome, JobError>;
}

/// Shared collaborators for the content handlers.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn ContentProvider>,
    pub knowledge: Arc<dyn KnowledgeBase>,
    pub content: Arc<dyn ContentRepository>,
    pub cache: TenantCache,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

impl Collaborators {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, JobError> {
        let kind = request.kind;
        let response = self.provider.generate(request).await?;
        debug!(provider = self.provider.name(), ?kind, tokens = response.tokens_used, "provider answered");
        Ok(response)
    }

    /// Ranked knowledge for `query`, read through the tenant cache.
    async fn ranked_context(&self, tenant_id: TenantId, query: &str) -> Result<Vec<String>, JobError> {
        let key = ranked_chunks_key(query);
        if let Some(hit) = self.cache.get_json::<Vec<KnowledgeChunk>>(tenant_id, &key).await {
            return Ok(hit.into_iter().map(|c| c.text).collect());
        }

        let chunks = self
            .knowledge
            .ranked_chunks(tenant_id, query, CONTEXT_CHUNKS)
            .await?;
        self.cache.set_json(tenant_id, &key, &chunks).await;
        Ok(chunks.into_iter().map(|c| c.text).collect())
    }
}

fn ranked_chunks_key(query: &str) -> String {
    let digest = Sha256::digest(query.trim().to_lowercase().as_bytes());
    format!("knowledge:ranked:{}", hex::encode(&digest[..8]))
}

/// Provider output that does not match the kind's schema.
fn malformed(kind: &str, detail: impl std::fmt::Display) -> JobError {
    ProviderError::MalformedOutput(format!("{kind}: {detail}")).into()
}

fn parse<T: serde::de::DeserializeOwned>(kind: &str, output: JsonValue) -> Result<T, JobError> {
    serde_json::from_value(output).map_err(|e| malformed(kind, e))
}

fn mismatch(ctx: &JobContext, expected: JobType) -> JobError {
    JobError::Validation(format!(
        "job {} carries a {} payload, expected {expected}",
        ctx.job().id,
        ctx.job().payload.job_type()
    ))
}

#[derive(Debug)]
pub struct SmeIngestionHandler {
    collab: Collaborators,
}

impl SmeIngestionHandler {
    pub fn new(collab: Collaborators) -> Self {
        Self { collab }
    }
}

#[derive(Deserialize)]
struct ExtractedChunks {
    chunks: Vec<ExtractedChunk>,
}

#[derive(Deserialize)]
struct ExtractedChunk {
    text: String,
    #[serde(default)]
    keywords: Vec<String>,
}

#[async_trait::async_trait]
impl JobHandler for SmeIngestionHandler {
    fn job_type(&self) -> JobType {
        JobType::SmeIngestion
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<HandlerOutcome, JobError> {
        let JobPayload::SmeIngestion {
            sme_task_id,
            submission_id,
        } = ctx.job().payload
        else {
            return Err(mismatch(ctx, JobType::SmeIngestion));
        };
        let tenant_id = ctx.job().tenant_id;

        let text = self.collab.knowledge.submission_text(tenant_id, submission_id).await?;
        if text.trim().is_empty() {
            return Err(JobError::Validation(format!("submission {submission_id} is empty")));
        }
        ctx.advance(Checkpoint::Validated, "submission loaded").await?;

        let request = GenerationRequest::new(tenant_id, GenerationKind::KnowledgeExtraction, text)
            .with_metadata(json!({ "smeTaskId": sme_task_id, "submissionId": submission_id }));
        ctx.advance(Checkpoint::ContextGathered, "extracting knowledge").await?;

        let response = self.collab.generate(request).await?;
        ctx.advance(Checkpoint::Generated, "knowledge extracted").await?;

        let extracted: ExtractedChunks = parse("knowledge extraction", response.output)?;
        let chunks: Vec<KnowledgeChunk> = extracted
            .chunks
            .into_iter()
            .filter(|c| !c.text.trim().is_empty())
            .map(|c| KnowledgeChunk {
                text: c.text,
                keywords: c.keywords,
                source: submission_id,
            })
            .collect();
        if chunks.is_empty() {
            return Err(malformed("knowledge extraction", "no chunks"));
        }
        let count = chunks.len();
        ctx.advance(Checkpoint::OutputParsed, &format!("{count} chunks extracted")).await?;

        let path = self
            .collab
            .knowledge
            .store_chunks(tenant_id, sme_task_id, submission_id, chunks)
            .await?;
        ctx.advance(Checkpoint::Persisted, "knowledge stored").await?;

        Ok(HandlerOutcome::Completed {
            result_path: Some(path),
            tokens_used: response.tokens_used,
        })
    }
}

#[derive(Debug)]
pub struct CourseOutlineHandler {
    collab: Collaborators,
}

impl CourseOutlineHandler {
    pub fn new(collab: Collaborators) -> Self {
        Self { collab }
    }
}

#[derive(Deserialize)]
struct GeneratedOutline {
    title: String,
    lessons: Vec<GeneratedLesson>,
}

#[derive(Deserialize)]
struct GeneratedLesson {
    title: String,
    #[serde(default)]
    summary: String,
}

#[async_trait::async_trait]
impl JobHandler for CourseOutlineHandler {
    fn job_type(&self) -> JobType {
        JobType::CourseOutline
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<HandlerOutcome, JobError> {
        let JobPayload::CourseOutline { course_id, brief } = ctx.job().payload.clone() else {
            return Err(mismatch(ctx, JobType::CourseOutline));
        };
        let tenant_id = ctx.job().tenant_id;
        ctx.advance(Checkpoint::Validated, "brief accepted").await?;

        let context = self.collab.ranked_context(tenant_id, &brief).await?;
        ctx.advance(
            Checkpoint::ContextGathered,
            &format!("{} knowledge chunks ranked", context.len()),
        )
        .await?;

        let request = GenerationRequest::new(tenant_id, GenerationKind::Outline, brief)
            .with_context(context)
            .with_metadata(json!({ "courseId": course_id }));
        let response = self.collab.generate(request).await?;
        ctx.advance(Checkpoint::Generated, "outline drafted").await?;

        let generated: GeneratedOutline = parse("outline", response.output)?;
        if generated.lessons.is_empty() || generated.title.trim().is_empty() {
            return Err(malformed("outline", "missing title or lessons"));
        }
        let outline = CourseOutline {
            title: generated.title,
            lessons: generated
                .lessons
                .into_iter()
                .map(|l| OutlineLesson {
                    id: coursegen_core::LessonId::new(),
                    title: l.title,
                    summary: l.summary,
                })
                .collect(),
        };
        ctx.advance(
            Checkpoint::OutputParsed,
            &format!("{} lessons planned", outline.lessons.len()),
        )
        .await?;

        let path = self.collab.content.save_outline(tenant_id, course_id, &outline).await?;
        ctx.advance(Checkpoint::Persisted, "outline saved").await?;

        Ok(HandlerOutcome::Completed {
            result_path: Some(path),
            tokens_used: response.tokens_used,
        })
    }
}

#[derive(Debug)]
pub struct LessonContentHandler {
    collab: Collaborators,
}

impl LessonContentHandler {
    pub fn new(collab: Collaborators) -> Self {
        Self { collab }
    }
}

#[derive(Deserialize)]
struct GeneratedLessonBody {
    title: String,
    sections: Vec<LessonSection>,
}

#[async_trait::async_trait]
impl JobHandler for LessonContentHandler {
    fn job_type(&self) -> JobType {
        JobType::LessonContent
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<HandlerOutcome, JobError> {
        let JobPayload::LessonContent {
            course_id,
            lesson_id,
        } = ctx.job().payload
        else {
            return Err(mismatch(ctx, JobType::LessonContent));
        };
        let tenant_id = ctx.job().tenant_id;

        let outline = self
            .collab
            .content
            .outline(tenant_id, course_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("outline for course {course_id}")))?;
        let lesson = outline
            .lesson(lesson_id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(format!("lesson {lesson_id} in course outline")))?;
        ctx.advance(Checkpoint::Validated, "lesson found in outline").await?;

        let query = format!("{} {}", lesson.title, lesson.summary);
        let mut context = vec![format!("Course: {}", outline.title)];
        context.extend(self.collab.ranked_context(tenant_id, &query).await?);
        ctx.advance(Checkpoint::ContextGathered, "context ranked").await?;

        let request = GenerationRequest::new(tenant_id, GenerationKind::LessonContent, lesson.title.clone())
            .with_context(context)
            .with_metadata(json!({
                "courseId": course_id,
                "lessonId": lesson_id,
                "summary": lesson.summary,
            }));
        let response = self.collab.generate(request).await?;
        ctx.advance(Checkpoint::Generated, "lesson drafted").await?;

        let generated: GeneratedLessonBody = parse("lesson", response.output)?;
        if generated.sections.is_empty() {
            return Err(malformed("lesson", "no sections"));
        }
        let body = LessonBody {
            title: generated.title,
            sections: generated.sections,
        };
        ctx.advance(
            Checkpoint::OutputParsed,
            &format!("{} sections written", body.sections.len()),
        )
        .await?;

        let path = self
            .collab
            .content
            .save_lesson(tenant_id, course_id, lesson_id, &body)
            .await?;
        ctx.advance(Checkpoint::Persisted, "lesson saved").await?;

        Ok(HandlerOutcome::Completed {
            result_path: Some(path),
            tokens_used: response.tokens_used,
        })
    }
}

#[derive(Debug)]
pub struct ComponentRegenHandler {
    collab: Collaborators,
}

impl ComponentRegenHandler {
    pub fn new(collab: Collaborators) -> Self {
        Self { collab }
    }
}

#[derive(Deserialize)]
struct GeneratedComponent {
    component: String,
    content: JsonValue,
}

#[async_trait::async_trait]
impl JobHandler for ComponentRegenHandler {
    fn job_type(&self) -> JobType {
        JobType::ComponentRegen
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<HandlerOutcome, JobError> {
        let JobPayload::ComponentRegen {
            course_id,
            lesson_id,
            component,
            instructions,
        } = ctx.job().payload.clone()
        else {
            return Err(mismatch(ctx, JobType::ComponentRegen));
        };
        let tenant_id = ctx.job().tenant_id;

        let lesson = self
            .collab
            .content
            .lesson(tenant_id, course_id, lesson_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("content for lesson {lesson_id}")))?;
        ctx.advance(Checkpoint::Validated, "lesson content loaded").await?;

        let context: Vec<String> = lesson
            .sections
            .iter()
            .map(|s| format!("{}: {}", s.heading, s.body))
            .collect();
        ctx.advance(Checkpoint::ContextGathered, "lesson context prepared").await?;

        let instructions = instructions.unwrap_or_else(|| format!("Regenerate the {component}"));
        let request = GenerationRequest::new(tenant_id, GenerationKind::Component, instructions)
            .with_context(context)
            .with_metadata(json!({
                "courseId": course_id,
                "lessonId": lesson_id,
                "lessonTitle": lesson.title,
                "component": component,
            }));
        let response = self.collab.generate(request).await?;
        ctx.advance(Checkpoint::Generated, "component drafted").await?;

        let generated: GeneratedComponent = parse("component", response.output)?;
        if generated.component != component {
            return Err(malformed(
                "component",
                format!("asked for {component}, got {}", generated.component),
            ));
        }
        if generated.content.is_null() {
            return Err(malformed("component", "empty content"));
        }
        ctx.advance(Checkpoint::OutputParsed, "component parsed").await?;

        let path = self
            .collab
            .content
            .save_component(tenant_id, course_id, lesson_id, &component, &generated.content)
            .await?;
        ctx.advance(Checkpoint::Persisted, "component saved").await?;

        Ok(HandlerOutcome::Completed {
            result_path: Some(path),
            tokens_used: response.tokens_used,
        })
    }
}

/// "Generate all lessons": turns the job into a batch parent.
pub struct FullCourseHandler {
    content: Arc<dyn ContentRepository>,
    batch: Arc<BatchCoordinator>,
}

impl std::fmt::Debug for FullCourseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullCourseHandler")
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

impl FullCourseHandler {
    pub fn new(content: Arc<dyn ContentRepository>, batch: Arc<BatchCoordinator>) -> Self {
        Self { content, batch }
    }
}

#[async_trait::async_trait]
impl JobHandler for FullCourseHandler {
    fn job_type(&self) -> JobType {
        JobType::FullCourse
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<HandlerOutcome, JobError> {
        let JobPayload::FullCourse { course_id } = ctx.job().payload else {
            return Err(mismatch(ctx, JobType::FullCourse));
        };
        let tenant_id = ctx.job().tenant_id;

        let outline = self
            .content
            .outline(tenant_id, course_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("outline for course {course_id}")))?;
        let lesson_ids = outline.lesson_ids();
        if lesson_ids.is_empty() {
            return Err(JobError::Validation(format!("outline for course {course_id} has no lessons")));
        }
        ctx.advance(Checkpoint::Validated, "outline loaded").await?;

        // From here on the children drive this job's progress.
        let children = self.batch.fan_out(ctx.job(), lesson_ids).await?;

        Ok(HandlerOutcome::AwaitingChildren {
            children: children.len(),
        })
    }
}
