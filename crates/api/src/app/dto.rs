use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use coursegen_core::CourseId;
use coursegen_infra::jobs::{GenerationJob, JobFilter, JobStatus, JobType};

use crate::app::errors;

/// Default and maximum page size for list endpoints.
pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 200;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateOutlineRequest {
    pub brief: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RegenerateComponentRequest {
    pub instructions: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub status: Option<String>,
    pub course_id: Option<String>,
    pub parent_job_id: Option<String>,
    pub limit: Option<usize>,
}

impl ListJobsQuery {
    pub fn to_filter(&self) -> Result<JobFilter, axum::response::Response> {
        let job_type = self
            .job_type
            .as_deref()
            .map(|s| s.parse::<JobType>())
            .transpose()
            .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_type", e.to_string()))?;
        let status = self
            .status
            .as_deref()
            .map(|s| s.parse::<JobStatus>())
            .transpose()
            .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string()))?;
        let course_id = self
            .course_id
            .as_deref()
            .map(|s| errors::parse_id::<CourseId>(s, "course"))
            .transpose()?;
        let parent_job_id = self
            .parent_job_id
            .as_deref()
            .map(|s| errors::parse_id(s, "job"))
            .transpose()?;

        Ok(JobFilter {
            job_type,
            status,
            course_id,
            parent_job_id,
        })
    }

    pub fn limit(&self) -> usize {
        clamp_limit(self.limit)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListNotificationsQuery {
    #[serde(default)]
    pub unread_only: bool,
    pub limit: Option<usize>,
}

impl ListNotificationsQuery {
    pub fn limit(&self) -> usize {
        clamp_limit(self.limit)
    }
}

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<GenerationJob>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub parent: GenerationJob,
    pub children: Vec<GenerationJob>,
}
