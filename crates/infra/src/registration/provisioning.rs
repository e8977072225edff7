//! Consumes provisioning tasks: creates the tenant for a paid registration.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{error, info, warn};

use coursegen_core::{TenantId, UserId};

use super::store::RegistrationStore;
use super::types::{PendingRegistration, RegistrationError, RegistrationStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedAccount {
    pub tenant_id: TenantId,
    pub admin_user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    #[error("transient provisioning error: {0}")]
    Transient(String),

    #[error("permanent provisioning error: {0}")]
    Permanent(String),
}

/// Creates company, team and admin user for a paid registration.
#[async_trait::async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, registration: &PendingRegistration) -> Result<ProvisionedAccount, ProvisionError>;
}

/// Records provisioned accounts in memory; failures can be scripted.
#[derive(Debug, Default)]
pub struct InMemoryProvisioner {
    provisioned: Mutex<Vec<(String, ProvisionedAccount)>>,
    failures: Mutex<VecDeque<ProvisionError>>,
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: ProvisionError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(error);
        }
    }

    pub fn provisioned(&self) -> Vec<(String, ProvisionedAccount)> {
        self.provisioned.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Provisioner for InMemoryProvisioner {
    async fn provision(&self, registration: &PendingRegistration) -> Result<ProvisionedAccount, ProvisionError> {
        let scripted = self
            .failures
            .lock()
            .map_err(|_| ProvisionError::Transient("provisioner lock poisoned".into()))?
            .pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        let account = ProvisionedAccount {
            tenant_id: TenantId::new(),
            admin_user_id: UserId::new(),
        };
        self.provisioned
            .lock()
            .map_err(|_| ProvisionError::Transient("provisioner lock poisoned".into()))?
            .push((registration.checkout_session_id.clone(), account.clone()));
        Ok(account)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    Provisioned(ProvisionedAccount),
    /// Another worker owns it, it is already done, or it is not paid.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Transient failure; the registration is back in `paid` and the task should be redelivered.
    #[error("provisioning should be retried: {0}")]
    Retry(String),
}

#[derive(Clone)]
pub struct ProvisioningService {
    registrations: Arc<dyn RegistrationStore>,
    provisioner: Arc<dyn Provisioner>,
}

impl std::fmt::Debug for ProvisioningService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningService").finish_non_exhaustive()
    }
}

impl ProvisioningService {
    pub fn new(registrations: Arc<dyn RegistrationStore>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            registrations,
            provisioner,
        }
    }

    pub fn registrations(&self) -> &Arc<dyn RegistrationStore> {
        &self.registrations
    }

    pub async fn run(&self, checkout_session_id: &str) -> Result<ProvisioningOutcome, ProvisioningError> {
        if !self.registrations.begin_provisioning(checkout_session_id).await? {
            let status = self
                .registrations
                .get(checkout_session_id)
                .await?
                .map(|r| r.status);
            info!(checkout_session_id, ?status, "provisioning skipped");
            return Ok(ProvisioningOutcome::Skipped);
        }

        let registration = self
            .registrations
            .get(checkout_session_id)
            .await?
            .ok_or_else(|| RegistrationError::NotFound(checkout_session_id.to_string()))?;

        match self.provisioner.provision(&registration).await {
            Ok(account) => {
                self.registrations.finish(checkout_session_id).await?;
                info!(checkout_session_id, tenant_id = %account.tenant_id, "tenant provisioned");
                Ok(ProvisioningOutcome::Provisioned(account))
            }
            Err(ProvisionError::Transient(msg)) => {
                warn!(checkout_session_id, error = %msg, "provisioning failed; releasing for retry");
                self.registrations
                    .compare_and_set(
                        checkout_session_id,
                        RegistrationStatus::Provisioning,
                        RegistrationStatus::Paid,
                        Some(&msg),
                    )
                    .await?;
                Err(ProvisioningError::Retry(msg))
            }
            Err(ProvisionError::Permanent(msg)) => {
                error!(checkout_session_id, error = %msg, "provisioning failed permanently");
                self.registrations.mark_failed(checkout_session_id, &msg).await?;
                Ok(ProvisioningOutcome::Failed(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::registration::{InMemoryRegistrationStore, NewRegistration};

    async fn paid_store() -> Arc<InMemoryRegistrationStore> {
        let store = Arc::new(InMemoryRegistrationStore::new());
        let pending = NewRegistration {
            checkout_session_id: "cs_1".into(),
            email: "owner@example.com".into(),
            company_name: "Acme".into(),
            plan: "team".into(),
        }
        .into_pending(Utc::now(), chrono::Duration::hours(24));
        store.create_pending(pending).await.unwrap();
        store.mark_paid("cs_1", Utc::now()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn provisions_once_and_removes_the_row() {
        let store = paid_store().await;
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let service = ProvisioningService::new(store.clone(), provisioner.clone());

        assert!(matches!(
            service.run("cs_1").await.unwrap(),
            ProvisioningOutcome::Provisioned(_)
        ));
        assert_eq!(service.run("cs_1").await.unwrap(), ProvisioningOutcome::Skipped);
        assert_eq!(provisioner.provisioned().len(), 1);
        assert!(store.get("cs_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_failure_releases_back_to_paid() {
        let store = paid_store().await;
        let provisioner = Arc::new(InMemoryProvisioner::new());
        provisioner.fail_next(ProvisionError::Transient("directory timeout".into()));
        let service = ProvisioningService::new(store.clone(), provisioner.clone());

        assert!(matches!(
            service.run("cs_1").await,
            Err(ProvisioningError::Retry(_))
        ));
        assert_eq!(
            store.get("cs_1").await.unwrap().unwrap().status,
            RegistrationStatus::Paid
        );

        assert!(matches!(
            service.run("cs_1").await.unwrap(),
            ProvisioningOutcome::Provisioned(_)
        ));
    }

    #[tokio::test]
    async fn permanent_failure_marks_failed() {
        let store = paid_store().await;
        let provisioner = Arc::new(InMemoryProvisioner::new());
        provisioner.fail_next(ProvisionError::Permanent("plan does not exist".into()));
        let service = ProvisioningService::new(store.clone(), provisioner);

        assert_eq!(
            service.run("cs_1").await.unwrap(),
            ProvisioningOutcome::Failed("plan does not exist".into())
        );
        assert_eq!(
            store.get("cs_1").await.unwrap().unwrap().status,
            RegistrationStatus::Failed
        );
    }
}
