//! Redis-backed task queue (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Task bodies**: hash `{prefix}:tasks` (task id → JSON)
//! - **Ready sets**: one sorted set per kind, `{prefix}:ready:{kind}`, scored by
//!   the epoch-millis at which the task becomes available
//! - **In-flight set**: `{prefix}:inflight`, scored by the visibility deadline
//! - **Dead letters**: list `{prefix}:dead` (JSON, oldest first)
//!
//! Every state move (dequeue, nack, visibility reaping) runs as one Lua
//! script so a task is never in two places at once. Scripts receive every
//! key they touch through `KEYS`, and the default prefix carries a hash tag,
//! so they also run against Redis Cluster.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::Script;
use tracing::{instrument, warn};

use super::TaskQueue;
use super::types::{
    DeadLetter, EnqueueOptions, NackOutcome, QueueDepth, QueueError, Task, TaskId, TaskKind,
    TaskPayload,
};
use crate::redis_conn::RedisConnector;

/// The braces are a cluster hash tag: every key of one queue lands in the
/// same slot, which multi-key scripts require.
const DEFAULT_PREFIX: &str = "{coursegen:queue}";

/// KEYS: inflight, tasks, dead, one ready set per kind
/// ARGV: now_ms, deadline_ms, kind name of each ready KEY in order, then the
/// kinds to poll in priority order
const DEQUEUE_LUA: &str = r#"
local now = tonumber(ARGV[1])
local ready = {}
for i = 4, #KEYS do
  ready[ARGV[i - 1]] = KEYS[i]
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[1], id)
  local raw = redis.call('HGET', KEYS[2], id)
  if raw then
    local task = cjson.decode(raw)
    if task.attempts >= task.max_deliveries or not ready[task.payload.kind] then
      redis.call('HDEL', KEYS[2], id)
      redis.call('RPUSH', KEYS[3], cjson.encode({task = task, reason = 'visibility timeout', dead_lettered_at = now}))
    else
      redis.call('ZADD', ready[task.payload.kind], now, id)
    end
  end
end
for i = #KEYS, #ARGV do
  local key = ready[ARGV[i]]
  local ids = key and redis.call('ZRANGEBYSCORE', key, '-inf', now, 'LIMIT', 0, 1) or {}
  if #ids > 0 then
    local id = ids[1]
    redis.call('ZREM', key, id)
    local raw = redis.call('HGET', KEYS[2], id)
    if raw then
      local task = cjson.decode(raw)
      task.attempts = task.attempts + 1
      local encoded = cjson.encode(task)
      redis.call('HSET', KEYS[2], id, encoded)
      redis.call('ZADD', KEYS[1], tonumber(ARGV[2]), id)
      return encoded
    end
  end
end
return false
"#;

/// KEYS: inflight, tasks, dead, one ready set per kind
/// ARGV: id, now_ms, available_ms, reason, kind name of each ready KEY in order
const NACK_LUA: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
local raw = redis.call('HGET', KEYS[2], ARGV[1])
if not raw then
  return 'missing'
end
local task = cjson.decode(raw)
task.last_error = ARGV[4]
local ready = nil
for i = 4, #KEYS do
  if ARGV[i + 1] == task.payload.kind then
    ready = KEYS[i]
  end
end
if task.attempts >= task.max_deliveries or not ready then
  redis.call('HDEL', KEYS[2], ARGV[1])
  redis.call('RPUSH', KEYS[3], cjson.encode({task = task, reason = ARGV[4], dead_lettered_at = tonumber(ARGV[2])}))
  return 'dead'
end
redis.call('HSET', KEYS[2], ARGV[1], cjson.encode(task))
redis.call('ZADD', ready, tonumber(ARGV[3]), ARGV[1])
return 'requeued'
"#;

#[derive(Debug, Clone)]
pub struct RedisTaskQueue {
    redis: Arc<RedisConnector>,
    prefix: String,
    dequeue_script: Arc<Script>,
    nack_script: Arc<Script>,
}

impl RedisTaskQueue {
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, QueueError> {
        let redis = RedisConnector::open(redis_url).map_err(backend)?;
        Ok(Self {
            redis: Arc::new(redis),
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            dequeue_script: Arc::new(Script::new(DEQUEUE_LUA)),
            nack_script: Arc::new(Script::new(NACK_LUA)),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn ready_key(&self, kind: TaskKind) -> String {
        self.key(&format!("ready:{}", kind.as_str()))
    }

    /// Every key a script touches, in the order the scripts index `KEYS`.
    fn script_keys(&self) -> Vec<String> {
        let mut keys = vec![self.key("inflight"), self.key("tasks"), self.key("dead")];
        keys.extend(TaskKind::ALL.iter().map(|kind| self.ready_key(*kind)));
        keys
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.redis.get().await.map_err(backend)
    }

    async fn on_error(&self, err: redis::RedisError) -> QueueError {
        if err.is_io_error() || err.is_connection_dropped() {
            self.redis.reset().await;
        }
        backend(err)
    }
}

fn backend(err: redis::RedisError) -> QueueError {
    QueueError::Backend(err.to_string())
}

fn serialization(err: serde_json::Error) -> QueueError {
    QueueError::Serialization(err.to_string())
}

#[async_trait::async_trait]
impl TaskQueue for RedisTaskQueue {
    #[instrument(skip(self, payload), fields(kind = payload.kind().as_str()), err)]
    async fn enqueue(&self, payload: TaskPayload, opts: EnqueueOptions) -> Result<Task, QueueError> {
        let task = Task::new(payload, &opts, Utc::now());
        let body = serde_json::to_string(&task).map_err(serialization)?;
        let mut conn = self.conn().await?;

        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .hset(self.key("tasks"), task.id.to_string(), body)
            .ignore()
            .zadd(
                self.ready_key(task.payload.kind()),
                task.id.to_string(),
                task.available_at.timestamp_millis(),
            )
            .ignore()
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(task),
            Err(e) => Err(self.on_error(e).await),
        }
    }

    async fn dequeue(&self, kinds: &[TaskKind], visibility_timeout: Duration) -> Result<Option<Task>, QueueError> {
        let now = Utc::now();
        let deadline = now + crate::jobs::types::to_chrono(visibility_timeout);
        let mut conn = self.conn().await?;

        let mut invocation = self.dequeue_script.prepare_invoke();
        invocation
            .key(self.script_keys())
            .arg(now.timestamp_millis())
            .arg(deadline.timestamp_millis());
        for kind in TaskKind::ALL {
            invocation.arg(kind.as_str());
        }
        for kind in kinds {
            invocation.arg(kind.as_str());
        }

        let raw: Option<String> = match invocation.invoke_async(&mut conn).await {
            Ok(raw) => raw,
            Err(e) => return Err(self.on_error(e).await),
        };

        raw.map(|body| serde_json::from_str(&body).map_err(serialization))
            .transpose()
    }

    async fn ack(&self, id: TaskId) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .zrem(self.key("inflight"), id.to_string())
            .ignore()
            .hdel(self.key("tasks"), id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await;

        result.map_err(backend)
    }

    #[instrument(skip(self, reason), fields(task_id = %id), err)]
    async fn nack(&self, id: TaskId, reason: &str, delay: Duration) -> Result<NackOutcome, QueueError> {
        let now = Utc::now();
        let available_at = now + crate::jobs::types::to_chrono(delay);
        let mut conn = self.conn().await?;

        let mut invocation = self.nack_script.prepare_invoke();
        invocation
            .key(self.script_keys())
            .arg(id.to_string())
            .arg(now.timestamp_millis())
            .arg(available_at.timestamp_millis())
            .arg(reason);
        for kind in TaskKind::ALL {
            invocation.arg(kind.as_str());
        }

        let outcome: String = match invocation.invoke_async(&mut conn).await {
            Ok(o) => o,
            Err(e) => return Err(self.on_error(e).await),
        };

        match outcome.as_str() {
            "requeued" => Ok(NackOutcome::Requeued { available_at }),
            "dead" => {
                warn!(task_id = %id, reason, "task dead-lettered");
                Ok(NackOutcome::DeadLettered)
            }
            _ => Err(QueueError::NotFound(id)),
        }
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key("dead"))
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        raw.iter()
            .map(|body| serde_json::from_str(body).map_err(serialization))
            .collect()
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for kind in TaskKind::ALL {
            pipe.zcard(self.ready_key(kind));
        }
        pipe.zcard(self.key("inflight")).llen(self.key("dead"));

        let counts: Vec<usize> = pipe.query_async(&mut conn).await.map_err(backend)?;
        let ready_sets = TaskKind::ALL.len();
        Ok(QueueDepth {
            ready: counts.iter().take(ready_sets).sum(),
            in_flight: counts.get(ready_sets).copied().unwrap_or(0),
            dead_lettered: counts.get(ready_sets + 1).copied().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_tag(key: &str) -> Option<&str> {
        let open = key.find('{')?;
        let close = key[open + 1..].find('}')?;
        Some(&key[open + 1..open + 1 + close])
    }

    #[test]
    fn script_keys_share_one_cluster_slot() {
        let queue = RedisTaskQueue::new("redis://127.0.0.1:6379", None).unwrap();
        let keys = queue.script_keys();

        assert_eq!(keys.len(), 3 + TaskKind::ALL.len());
        assert!(keys.iter().all(|k| hash_tag(k) == Some("coursegen:queue")));
        for kind in TaskKind::ALL {
            assert!(keys.contains(&queue.ready_key(kind)));
        }
    }

    #[test]
    fn scripts_never_build_key_names() {
        for script in [DEQUEUE_LUA, NACK_LUA] {
            assert!(!script.contains(".."), "script concatenates a key name");
            assert!(!script.contains(":ready:"));
        }
    }
}
