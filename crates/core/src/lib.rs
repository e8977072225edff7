//! `coursegen-core`: shared domain primitives.
//!
//! This crate contains **pure domain** types (identifiers, error taxonomy).
//! No IO, no async, no infrastructure concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{CourseId, LessonId, NotificationId, SmeTaskId, SubmissionId, TenantId, UserId};
