//! Shared lazily-opened async Redis connection.

use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::debug;

/// Opens a multiplexed connection on first use and hands out clones.
///
/// A command error should be followed by [`RedisConnector::reset`] so the
/// next call reconnects on a fresh socket.
#[derive(Debug)]
pub struct RedisConnector {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisConnector {
    pub fn open(redis_url: impl AsRef<str>) -> redis::RedisResult<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url.as_ref())?,
            connection: Mutex::new(None),
        })
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    pub async fn get(&self) -> redis::RedisResult<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!("redis connection established");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    pub async fn reset(&self) {
        *self.connection.lock().await = None;
    }
}
