//! Redis cache backend (`SET ... PX`, `GET`, `DEL`).

use std::time::Duration;

use tracing::instrument;

use super::{CacheBackend, CacheError};
use crate::redis_conn::RedisConnector;

#[derive(Debug)]
pub struct RedisCache {
    redis: RedisConnector,
}

impl RedisCache {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let redis = RedisConnector::open(redis_url).map_err(unavailable)?;
        Ok(Self { redis })
    }

    async fn run<T>(&self, cmd: &redis::Cmd) -> Result<T, CacheError>
    where
        T: redis::FromRedisValue,
    {
        let mut conn = self.redis.get().await.map_err(unavailable)?;
        match cmd.query_async(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.redis.reset().await;
                Err(unavailable(e))
            }
        }
    }
}

fn unavailable(err: redis::RedisError) -> CacheError {
    CacheError::Unavailable(err.to_string())
}

#[async_trait::async_trait]
impl CacheBackend for RedisCache {
    #[instrument(skip(self), level = "debug", err)]
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.run(redis::cmd("GET").arg(key)).await
    }

    #[instrument(skip(self, value), level = "debug", err)]
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let millis = ttl.as_millis().clamp(1, u64::MAX as u128) as u64;
        self.run(redis::cmd("SET").arg(key).arg(value).arg("PX").arg(millis))
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let _: i64 = self.run(redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }
}
