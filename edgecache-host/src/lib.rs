//! An in-memory cache host.
//!
//! [`MemoryCache`] implements the host interface from `edgecache-sys` inside the current
//! process: concurrent transactional lookups for the same key collapse onto a single producer,
//! bodies stream to every reader while they are being written, and surrogate-key purges apply
//! across all keys. It is the host used by the `edgecache` test suite, and works as a local
//! stand-in wherever no platform cache is available.
//!
//! All coordination happens through one [`tokio::sync::watch`] channel per cache key, so the
//! host must be used from within a tokio runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use edgecache_shared::{CacheStatus, MAX_CACHE_KEY_LEN};
use edgecache_sys::body::BodyWriter;
use edgecache_sys::cache::{
    CacheEntry, CacheKey, CacheLookupOptions, CacheStore, CacheWriteOptions,
};
use edgecache_sys::purge::{PurgeOptionsMask, PurgeService};
use serde::Deserialize;

mod collecting_body;
mod entry;
mod store;
mod variance;

use collecting_body::CollectingBody;
use entry::MemoryEntry;
use store::CacheKeyObjects;

/// Configuration for a [`MemoryCache`].
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// How long a variant stays uncacheable when the producer did not supply a TTL.
    pub uncacheable_record_ttl_secs: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        MemoryCacheConfig {
            uncacheable_record_ttl_secs: 120,
        }
    }
}

/// A cache host that keeps every object in process memory.
#[derive(Debug, Default)]
pub struct MemoryCache {
    keys: Mutex<HashMap<CacheKey, Arc<CacheKeyObjects>>>,
    config: MemoryCacheConfig,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MemoryCacheConfig) -> Self {
        MemoryCache {
            keys: Mutex::default(),
            config,
        }
    }

    fn objects(&self, key: &CacheKey) -> Result<Arc<CacheKeyObjects>, CacheStatus> {
        if key.len() > MAX_CACHE_KEY_LEN {
            return Err(CacheStatus::LIMITEXCEEDED);
        }
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(keys.entry(key.clone()).or_default()))
    }

    fn uncacheable_ttl(&self) -> Duration {
        Duration::from_secs(self.config.uncacheable_record_ttl_secs)
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn lookup(
        &self,
        key: CacheKey,
        options: CacheLookupOptions,
    ) -> Result<Box<dyn CacheEntry>, CacheStatus> {
        let objects = self.objects(&key)?;
        let data = objects.get(&options.request_headers.unwrap_or_default());
        tracing::debug!(key_len = key.len(), found = data.is_some(), "lookup");
        Ok(Box::new(MemoryEntry::new(data, None, self.uncacheable_ttl())))
    }

    fn insert(
        &self,
        key: CacheKey,
        options: CacheWriteOptions,
    ) -> Result<Box<dyn BodyWriter>, CacheStatus> {
        let objects = self.objects(&key)?;
        let body = CollectingBody::new();
        let request_headers = options.request_headers.clone().unwrap_or_default();
        objects.insert(request_headers, &options, Arc::clone(&body), None);
        tracing::debug!(key_len = key.len(), "insert");
        Ok(Box::new(body.writer(options.length)))
    }

    async fn transaction_lookup(
        &self,
        key: CacheKey,
        options: CacheLookupOptions,
    ) -> Result<Box<dyn CacheEntry>, CacheStatus> {
        let objects = self.objects(&key)?;
        let request_headers = options.request_headers.unwrap_or_default();
        let entry = match objects.transaction_get(&request_headers).await {
            Ok((data, obligation)) => {
                tracing::debug!(
                    key_len = key.len(),
                    found = data.is_some(),
                    obligated = obligation.is_some(),
                    "transaction lookup"
                );
                MemoryEntry::new(data, obligation, self.uncacheable_ttl())
            }
            Err(reason) => MemoryEntry::failed(reason),
        };
        Ok(Box::new(entry))
    }
}

impl PurgeService for MemoryCache {
    fn purge_surrogate_key(
        &self,
        surrogate_key: &str,
        options: PurgeOptionsMask,
    ) -> Result<(), CacheStatus> {
        let soft = options.contains(PurgeOptionsMask::SOFT_PURGE);
        let all: Vec<Arc<CacheKeyObjects>> = self
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let purged: usize = all
            .iter()
            .map(|objects| objects.purge(surrogate_key, soft))
            .sum();
        tracing::debug!(surrogate_key, soft, purged, "surrogate key purge");
        Ok(())
    }
}
