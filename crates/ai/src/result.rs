use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Raw provider output.
///
/// `output` is unvalidated structured JSON; parsing against the kind's schema
/// is the caller's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub output: JsonValue,
    pub tokens_used: u64,
    pub model: Option<String>,
}

impl GenerationResponse {
    pub fn new(output: JsonValue, tokens_used: u64) -> Self {
        Self {
            output,
            tokens_used,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Timeout, rate limit, 5xx. Worth retrying later.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Invalid credentials, exhausted quota, rejected content.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// The provider answered but the output could not be used.
    #[error("malformed provider output: {0}")]
    MalformedOutput(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}
