use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::{CacheBackend, CacheError};

/// In-memory cache with per-entry TTL.
#[derive(Debug)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    available: AtomicBool,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (tests).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>, CacheError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("in-memory cache switched off".into()));
        }
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".into()))
    }
}

#[async_trait::async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries()?;
        let now = Instant::now();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Instant::now() + ttl;
        self.entries()?.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries()?.remove(key);
        Ok(())
    }
}
