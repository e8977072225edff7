use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coursegen_core::DomainError;

/// Lifecycle of a checkout-backed registration.
///
/// ```text
/// pending ──webhook (CAS)──▶ paid ──worker (CAS)──▶ provisioning ──▶ (row removed)
///                                                        └──permanent error──▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Pending,
    Paid,
    Provisioning,
    Failed,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Pending => "pending",
            RegistrationStatus::Paid => "paid",
            RegistrationStatus::Provisioning => "provisioning",
            RegistrationStatus::Failed => "failed",
        }
    }
}

impl FromStr for RegistrationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RegistrationStatus::Pending),
            "paid" => Ok(RegistrationStatus::Paid),
            "provisioning" => Ok(RegistrationStatus::Provisioning),
            "failed" => Ok(RegistrationStatus::Failed),
            other => Err(DomainError::validation(format!("unknown registration status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRegistration {
    pub checkout_session_id: String,
    pub email: String,
    pub company_name: String,
    pub plan: String,
    pub status: RegistrationStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingRegistration {
    /// Only an unpaid registration can expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == RegistrationStatus::Pending && self.expires_at <= now
    }
}

/// Signup data captured when the checkout session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRegistration {
    pub checkout_session_id: String,
    pub email: String,
    pub company_name: String,
    pub plan: String,
}

impl NewRegistration {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.checkout_session_id.trim().is_empty() {
            return Err(DomainError::validation("checkout_session_id is required"));
        }
        if !self.email.contains('@') {
            return Err(DomainError::validation("email is invalid"));
        }
        if self.company_name.trim().is_empty() {
            return Err(DomainError::validation("company_name is required"));
        }
        Ok(())
    }

    pub fn into_pending(self, now: DateTime<Utc>, ttl: chrono::Duration) -> PendingRegistration {
        PendingRegistration {
            checkout_session_id: self.checkout_session_id,
            email: self.email,
            company_name: self.company_name,
            plan: self.plan,
            status: RegistrationStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("registration not found: {0}")]
    NotFound(String),

    #[error("registration already exists: {0}")]
    Duplicate(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("registration storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for RegistrationError {
    fn from(err: DomainError) -> Self {
        RegistrationError::Validation(err.to_string())
    }
}
