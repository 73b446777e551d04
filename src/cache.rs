//! TTL-tiered response cache with in-flight request deduplication.
//!
//! Every component that talks to an external service goes through this
//! cache. External calls are rate-limited and billed, so `dedupe` is the
//! load-bearing piece: at most one outstanding unit of work per key, with
//! the result broadcast to every concurrent waiter.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use log::debug;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::error::CacheError;

type PendingFuture = Shared<BoxFuture<'static, Result<Value, String>>>;

struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

/// Process-wide cache, explicitly constructed by the composition root and
/// passed into every client that needs it. Values expire lazily on read;
/// there is no background sweep.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    pending: Mutex<HashMap<String, PendingFuture>>,
    ttl: HashMap<String, Duration>,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            ttl: config.ttl.clone(),
            default_ttl: config.default_ttl,
        }
    }

    fn cache_key(category: &str, params: &Value) -> String {
        // serde_json maps serialize with sorted keys, so this is stable
        // across call sites.
        format!("{}:{}", category, params)
    }

    fn ttl_for(&self, category: &str) -> Duration {
        self.ttl.get(category).copied().unwrap_or(self.default_ttl)
    }

    /// Returns the cached value, or `None` if absent or expired. An expired
    /// entry is evicted on the spot and never returned.
    pub fn get(&self, category: &str, params: &Value) -> Option<Value> {
        let key = Self::cache_key(category, params);
        let ttl = self.ttl_for(category);
        let mut entries = self.entries.lock();

        match entries.get(&key) {
            Some(entry) if entry.stored_at.elapsed() < ttl => {
                debug!("Cache hit: {}", key);
                Some(entry.value.clone())
            }
            Some(_) => {
                debug!("Cache expired: {}", key);
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, category: &str, params: &Value, value: Value) {
        let key = Self::cache_key(category, params);
        self.entries.lock().insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, category: &str, params: &Value) {
        let key = Self::cache_key(category, params);
        self.entries.lock().remove(&key);
    }

    pub fn invalidate_all(&self, category: &str) {
        let prefix = format!("{}:", category);
        self.entries.lock().retain(|key, _| !key.starts_with(&prefix));
    }

    /// Coalesce concurrent requests for the same key into a single unit of
    /// work. If a request for `key` is already in flight, the new caller
    /// awaits its shared future instead of running `factory`; otherwise
    /// `factory` runs and its settlement (success, failure, or cancellation
    /// of the owning caller) removes the pending entry exactly once.
    pub async fn dedupe<F>(&self, key: &str, factory: F) -> Result<Value, CacheError>
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let (future, guard) = {
            let mut pending = self.pending.lock();
            if let Some(existing) = pending.get(key) {
                debug!("Dedup hit, joining in-flight request: {}", key);
                (existing.clone(), None)
            } else {
                let future = factory
                    .map(|result| result.map_err(|e| e.to_string()))
                    .boxed()
                    .shared();
                pending.insert(key.to_string(), future.clone());
                (future, Some(PendingGuard { cache: self, key }))
            }
        };

        let result = future.await;
        drop(guard);

        result.map_err(CacheError::Upstream)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.pending.lock().clear();
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Removes the pending entry when the owning `dedupe` call settles. Drop
/// also fires if the owner is cancelled (e.g. by a timeout), so a stuck key
/// can never block later callers permanently.
struct PendingGuard<'a> {
    cache: &'a ResponseCache,
    key: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.cache.pending.lock().remove(self.key);
    }
}
