//! Read-through access: check the cache, else fetch remotely and cache.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use offsync_common::{Error, Result};

use crate::cache::CacheStore;
use crate::config::SyncConfig;
use crate::executor::RemoteReader;

/// Orchestrates cache lookups and remote fetches for one value type.
///
/// The cache itself never calls out; this wrapper does.
pub struct ReadThrough<V> {
    cache: Arc<CacheStore<V>>,
    reader: Arc<dyn RemoteReader<V>>,
    ttl_secs: u64,
    timeout: Duration,
}

impl<V: Clone + Send + Sync + 'static> ReadThrough<V> {
    pub fn new(cache: Arc<CacheStore<V>>, reader: Arc<dyn RemoteReader<V>>, config: &SyncConfig) -> Self {
        Self {
            cache,
            reader,
            ttl_secs: config.cache_ttl_secs,
            timeout: config.request_timeout(),
        }
    }

    /// Return the cached value, fetching and caching it on a miss.
    ///
    /// # Errors
    /// - Whatever the reader returns
    /// - `RetryableExecution` if the fetch overruns its deadline
    pub async fn get(&self, key: &str) -> Result<V> {
        if let Some(value) = self.cache.get(key) {
            return Ok(value);
        }

        debug!("Cache miss for {}, fetching", key);
        let deadline = Instant::now() + self.timeout;
        let value = timeout_at(deadline, self.reader.fetch(key, deadline))
            .await
            .map_err(|_| Error::RetryableExecution(format!("Fetch of {} timed out", key)))??;

        self.cache.put(key, value.clone(), self.ttl_secs);
        Ok(value)
    }

    /// Drop a cached value so the next read goes remote.
    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.remove(key)
    }

    pub fn cache(&self) -> &Arc<CacheStore<V>> {
        &self.cache
    }
}
