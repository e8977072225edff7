//! Tenant-scoped cache.
//!
//! Every key is physically prefixed with `tenant:{tenantId}:` so there is
//! no read path from one tenant into another. The cache is an optimization
//! only: backend failures are logged and reported as a miss (or a no-op
//! write), never as an error.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use coursegen_core::TenantId;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryCache;
#[cfg(feature = "redis")]
pub use redis::RedisCache;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Raw string key/value cache.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[async_trait::async_trait]
impl<B> CacheBackend for Arc<B>
where
    B: CacheBackend + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        (**self).delete(key).await
    }
}

/// Tenant-isolating wrapper over a [`CacheBackend`].
#[derive(Clone)]
pub struct TenantCache {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
}

impl std::fmt::Debug for TenantCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantCache")
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl TenantCache {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
        }
    }

    /// In-memory backend, handy for tests and local dev.
    pub fn in_memory(default_ttl: Duration) -> Self {
        Self::new(Arc::new(InMemoryCache::new()), default_ttl)
    }

    pub fn physical_key(tenant_id: TenantId, key: &str) -> String {
        format!("tenant:{tenant_id}:{key}")
    }

    pub async fn get(&self, tenant_id: TenantId, key: &str) -> Option<String> {
        let physical = Self::physical_key(tenant_id, key);
        match self.backend.get(&physical).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(%tenant_id, key, error = %e, "cache get failed; treating as miss");
                None
            }
        }
    }

    pub async fn set(&self, tenant_id: TenantId, key: &str, value: String) {
        self.set_with_ttl(tenant_id, key, value, self.default_ttl).await
    }

    pub async fn set_with_ttl(&self, tenant_id: TenantId, key: &str, value: String, ttl: Duration) {
        let physical = Self::physical_key(tenant_id, key);
        if let Err(e) = self.backend.set(&physical, value, ttl).await {
            warn!(%tenant_id, key, error = %e, "cache set failed; skipping");
        }
    }

    pub async fn delete(&self, tenant_id: TenantId, key: &str) {
        let physical = Self::physical_key(tenant_id, key);
        if let Err(e) = self.backend.delete(&physical).await {
            warn!(%tenant_id, key, error = %e, "cache delete failed; skipping");
        }
    }

    /// A value that no longer decodes is treated as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, tenant_id: TenantId, key: &str) -> Option<T> {
        let raw = self.get(tenant_id, key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(%tenant_id, key, error = %e, "cached value did not decode");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, tenant_id: TenantId, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(tenant_id, key, raw).await,
            Err(e) => warn!(%tenant_id, key, error = %e, "cache value did not encode"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn keys_are_isolated_per_tenant() {
        let cache = TenantCache::in_memory(TTL);
        let (a, b) = (TenantId::new(), TenantId::new());

        cache.set(a, "k", "v".into()).await;

        assert_eq!(cache.get(a, "k").await.as_deref(), Some("v"));
        assert_eq!(cache.get(b, "k").await, None);
    }

    #[tokio::test]
    async fn delete_is_by_exact_key_and_tenant() {
        let cache = TenantCache::in_memory(TTL);
        let (a, b) = (TenantId::new(), TenantId::new());
        cache.set(a, "k", "a".into()).await;
        cache.set(b, "k", "b".into()).await;

        cache.delete(a, "k").await;

        assert_eq!(cache.get(a, "k").await, None);
        assert_eq!(cache.get(b, "k").await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn backend_outage_degrades_to_miss() {
        let backend = Arc::new(InMemoryCache::new());
        let cache = TenantCache::new(backend.clone(), TTL);
        let tenant = TenantId::new();
        cache.set(tenant, "k", "v".into()).await;

        backend.set_available(false);
        assert_eq!(cache.get(tenant, "k").await, None);
        cache.set(tenant, "other", "x".into()).await;
        cache.delete(tenant, "k").await;

        backend.set_available(true);
        assert_eq!(cache.get(tenant, "k").await.as_deref(), Some("v"));
        assert_eq!(cache.get(tenant, "other").await, None);
    }

    #[tokio::test]
    async fn json_helpers_round_trip_and_tolerate_garbage() {
        let cache = TenantCache::in_memory(TTL);
        let tenant = TenantId::new();

        cache.set_json(tenant, "chunks", &vec!["a".to_string(), "b".to_string()]).await;
        let chunks: Option<Vec<String>> = cache.get_json(tenant, "chunks").await;
        assert_eq!(chunks, Some(vec!["a".to_string(), "b".to_string()]));

        cache.set(tenant, "broken", "{not json".into()).await;
        let broken: Option<Vec<String>> = cache.get_json(tenant, "broken").await;
        assert_eq!(broken, None);
    }

    #[test]
    fn physical_key_shape() {
        let tenant = TenantId::new();
        assert_eq!(
            TenantCache::physical_key(tenant, "course:1"),
            format!("tenant:{tenant}:course:1")
        );
    }
}
