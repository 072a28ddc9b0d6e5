use bytes::Bytes;
use edgecache_shared::CacheStatus;
pub use edgecache_sys::cache::{CacheDurationNs, CacheLookupState, CacheObjectLength};
use edgecache_sys::cache::{
    CacheEntry, CacheGetBodyOptions, CacheHitCount, CacheLookupOptions, CacheWriteOptions,
};
use std::sync::Arc;

use crate::host::Host;
use crate::http::body::{Body, StreamingBody};
use crate::limits::CacheLimits;

/// A cache key consists of up to 4KiB of arbitrary bytes.
pub type CacheKey = Bytes;

pub type LookupOptions = CacheLookupOptions;
pub type WriteOptions = CacheWriteOptions;
pub type GetBodyOptions = CacheGetBodyOptions;

fn check_key(key: &CacheKey) -> Result<(), CacheStatus> {
    if CacheLimits::current().allows_key(key.len()) {
        Ok(())
    } else {
        Err(CacheStatus::LIMITEXCEEDED)
    }
}

pub async fn lookup(
    host: &Host,
    key: CacheKey,
    options: LookupOptions,
) -> Result<CacheHandle, CacheStatus> {
    check_key(&key)?;
    let entry = host.store().lookup(key, options).await?;
    Ok(CacheHandle::new(entry))
}

pub fn insert(host: &Host, key: CacheKey, options: WriteOptions) -> Result<StreamingBody, CacheStatus> {
    check_key(&key)?;
    let writer = host.store().insert(key, options)?;
    Ok(StreamingBody::new(writer))
}

pub async fn transaction_lookup(
    host: &Host,
    key: CacheKey,
    options: LookupOptions,
) -> Result<CacheHandle, CacheStatus> {
    check_key(&key)?;
    let entry = host.store().transaction_lookup(key, options).await?;
    Ok(CacheHandle::new(entry))
}

/// An open lookup or transaction against the cache host.
///
/// Dropping the handle closes it.
pub struct CacheHandle {
    entry: Box<dyn CacheEntry>,
}

impl CacheHandle {
    fn new(entry: Box<dyn CacheEntry>) -> Self {
        CacheHandle { entry }
    }

    /// The lookup state, or an empty state once the handle is closed.
    pub fn get_state(&self) -> CacheLookupState {
        self.entry
            .get_state()
            .unwrap_or_else(|_| CacheLookupState::empty())
    }

    pub fn producer_failure(&self) -> Option<Arc<str>> {
        self.entry.get_producer_failure()
    }

    pub fn get_user_metadata(&self) -> Result<Option<Bytes>, CacheStatus> {
        self.entry.get_user_metadata()
    }

    pub fn get_body(&self, options: GetBodyOptions) -> Result<Option<Body>, CacheStatus> {
        Ok(self.entry.get_body(options)?.map(Body::from_reader))
    }

    pub fn get_length(&self) -> Option<CacheObjectLength> {
        self.entry.get_length().ok().flatten()
    }

    pub fn get_max_age_ns(&self) -> Result<Option<CacheDurationNs>, CacheStatus> {
        self.entry.get_max_age_ns()
    }

    pub fn get_stale_while_revalidate_ns(&self) -> Result<Option<CacheDurationNs>, CacheStatus> {
        self.entry.get_stale_while_revalidate_ns()
    }

    pub fn get_age_ns(&self) -> Result<Option<CacheDurationNs>, CacheStatus> {
        self.entry.get_age_ns()
    }

    pub fn get_hits(&self) -> Result<Option<CacheHitCount>, CacheStatus> {
        self.entry.get_hits()
    }

    pub fn get_vary_rule(&self) -> Result<Option<String>, CacheStatus> {
        self.entry.get_vary_rule()
    }

    pub fn get_surrogate_keys(&self) -> Result<Option<String>, CacheStatus> {
        self.entry.get_surrogate_keys()
    }

    pub fn get_sensitive_data(&self) -> Result<Option<bool>, CacheStatus> {
        self.entry.get_sensitive_data()
    }

    pub fn transaction_insert(&self, options: WriteOptions) -> Result<StreamingBody, CacheStatus> {
        Ok(StreamingBody::new(self.entry.transaction_insert(options)?))
    }

    pub fn transaction_insert_and_stream_back(
        &self,
        options: WriteOptions,
    ) -> Result<(StreamingBody, CacheHandle), CacheStatus> {
        let (writer, entry) = self.entry.transaction_insert_and_stream_back(options)?;
        Ok((StreamingBody::new(writer), CacheHandle::new(entry)))
    }

    pub fn transaction_update(&self, options: WriteOptions) -> Result<(), CacheStatus> {
        self.entry.transaction_update(options)
    }

    pub fn transaction_cancel(&self) -> Result<(), CacheStatus> {
        self.entry.transaction_cancel()
    }

    pub fn transaction_fail(&self, reason: &str) -> Result<(), CacheStatus> {
        self.entry.transaction_fail(reason)
    }

    pub fn transaction_record_uncacheable(&self, options: WriteOptions) -> Result<(), CacheStatus> {
        self.entry.transaction_record_uncacheable(options)
    }

    pub fn close(&self) -> Result<(), CacheStatus> {
        self.entry.close()
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        // Closing is idempotent, so an earlier explicit close makes this a no-op.
        let _ = self.entry.close();
    }
}
