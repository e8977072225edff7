//! Process configuration loaded from the environment.
//!
//! Every variable has a dev-friendly default; unset `DATABASE_URL` /
//! `REDIS_URL` select the in-memory adapters.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::batch::AggregationPolicy;
use crate::jobs::{DEFAULT_MAX_RETRIES, RetryPolicy};
use crate::queue::DEFAULT_MAX_DELIVERIES;

const DEV_WEBHOOK_SECRET: &str = "whsec_dev";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub bind_addr: String,

    pub worker_count: usize,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub queue_max_deliveries: u32,
    pub stale_job_timeout: Duration,
    pub watchdog_interval: Duration,
    pub shutdown_deadline: Duration,

    pub job_max_retries: u32,
    pub retry: RetryPolicy,
    pub aggregation_policy: AggregationPolicy,
    pub cache_ttl: Duration,

    pub webhook_secret: String,
    pub webhook_tolerance: Duration,
    pub registration_ttl: Duration,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "[REDACTED]"))
            .field("redis_url", &self.redis_url)
            .field("bind_addr", &self.bind_addr)
            .field("worker_count", &self.worker_count)
            .field("poll_interval", &self.poll_interval)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("queue_max_deliveries", &self.queue_max_deliveries)
            .field("stale_job_timeout", &self.stale_job_timeout)
            .field("watchdog_interval", &self.watchdog_interval)
            .field("shutdown_deadline", &self.shutdown_deadline)
            .field("job_max_retries", &self.job_max_retries)
            .field("retry", &self.retry)
            .field("aggregation_policy", &self.aggregation_policy)
            .field("cache_ttl", &self.cache_ttl)
            .field("webhook_secret", &"[REDACTED]")
            .field("webhook_tolerance", &self.webhook_tolerance)
            .field("registration_ttl", &self.registration_ttl)
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            worker_count: 4,
            poll_interval: Duration::from_millis(250),
            visibility_timeout: Duration::from_secs(300),
            queue_max_deliveries: DEFAULT_MAX_DELIVERIES,
            stale_job_timeout: Duration::from_secs(15 * 60),
            watchdog_interval: Duration::from_secs(60),
            shutdown_deadline: Duration::from_secs(30),
            job_max_retries: DEFAULT_MAX_RETRIES,
            retry: RetryPolicy::default(),
            aggregation_policy: AggregationPolicy::default(),
            cache_ttl: Duration::from_secs(600),
            webhook_secret: DEV_WEBHOOK_SECRET.to_string(),
            webhook_tolerance: Duration::from_secs(300),
            registration_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map here).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut config = Self::default();

        config.database_url = env.string("DATABASE_URL");
        config.redis_url = env.string("REDIS_URL");
        if let Some(addr) = env.string("BIND_ADDR") {
            config.bind_addr = addr;
        }

        if let Some(n) = env.parse::<usize>("WORKER_COUNT")? {
            if n == 0 {
                return Err(invalid("WORKER_COUNT", "0"));
            }
            config.worker_count = n;
        }
        if let Some(ms) = env.parse::<u64>("WORKER_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env.parse::<u64>("QUEUE_VISIBILITY_TIMEOUT_SECS")? {
            config.visibility_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env.parse::<u32>("QUEUE_MAX_DELIVERIES")? {
            config.queue_max_deliveries = n;
        }
        if let Some(secs) = env.parse::<u64>("STALE_JOB_TIMEOUT_SECS")? {
            config.stale_job_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("WATCHDOG_INTERVAL_SECS")? {
            config.watchdog_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env.parse::<u64>("SHUTDOWN_DEADLINE_SECS")? {
            config.shutdown_deadline = Duration::from_secs(secs);
        }
        if let Some(n) = env.parse::<u32>("JOB_MAX_RETRIES")? {
            config.job_max_retries = n;
        }

        let base = env.parse::<u64>("RETRY_BASE_DELAY_MS")?;
        let max = env.parse::<u64>("RETRY_MAX_DELAY_MS")?;
        if base.is_some() || max.is_some() {
            config.retry = RetryPolicy::exponential(
                base.map(Duration::from_millis).unwrap_or(config.retry.base_delay),
                max.map(Duration::from_millis).unwrap_or(config.retry.max_delay),
            );
        }

        if let Some(policy) = env.parse::<AggregationPolicy>("BATCH_AGGREGATION_POLICY")? {
            config.aggregation_policy = policy;
        }
        if let Some(secs) = env.parse::<u64>("CACHE_TTL_SECS")? {
            config.cache_ttl = Duration::from_secs(secs);
        }

        match env.string("WEBHOOK_SECRET") {
            Some(secret) => config.webhook_secret = secret,
            None => warn!("WEBHOOK_SECRET not set; using insecure dev default"),
        }
        if let Some(secs) = env.parse::<u64>("WEBHOOK_TOLERANCE_SECS")? {
            config.webhook_tolerance = Duration::from_secs(secs);
        }
        if let Some(hours) = env.parse::<u64>("REGISTRATION_TTL_HOURS")? {
            config.registration_ttl = Duration::from_secs(hours * 3600);
        }

        Ok(config)
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        raw.parse::<T>().map(Some).map_err(|_| invalid(key, &raw))
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}
