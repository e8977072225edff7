use coursegen_core::{TenantId, UserId};

/// Header carrying the caller's tenant, set by the upstream gateway.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Header carrying the caller's user id, set by the upstream gateway.
pub const USER_HEADER: &str = "x-user-id";

/// Caller identity for a request.
///
/// This is immutable and must be present for all tenant-scoped routes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RequestContext {
    tenant_id: TenantId,
    user_id: UserId,
}

impl RequestContext {
    pub fn new(tenant_id: TenantId, user_id: UserId) -> Self {
        Self { tenant_id, user_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("missing {0} header")]
    Missing(&'static str),

    #[error("invalid {0} header")]
    Invalid(&'static str),
}
