//! `coursegen-ai`
//!
//! **Responsibility:** boundary to the external AI content collaborator.
//!
//! This crate is intentionally **not** part of the job pipeline:
//! - It knows nothing about jobs, queues or retries.
//! - It classifies provider failures so callers can decide retry vs terminal.
//! - Prompt construction and model selection live behind `ContentProvider`.

pub mod provider;
pub mod request;
pub mod result;
pub mod scripted;

pub use provider::ContentProvider;
pub use request::{GenerationKind, GenerationRequest};
pub use result::{GenerationResponse, ProviderError};
pub use scripted::ScriptedProvider;
