use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;

use crate::body::{BodyReader, BodyWriter};
use crate::CacheStatus;

pub type CacheKey = Bytes;

pub type CacheObjectLength = u64;
pub type CacheDurationNs = u64;
pub type CacheHitCount = u64;

#[derive(Clone, Debug, Default)]
pub struct CacheLookupOptions {
    /// Request headers used to select among variants of the object.
    pub request_headers: Option<HeaderMap>,
}

#[derive(Clone, Debug, Default)]
pub struct CacheWriteOptions {
    pub max_age_ns: CacheDurationNs,
    pub request_headers: Option<HeaderMap>,
    /// Space-separated list of request header names.
    pub vary_rule: Option<String>,
    pub initial_age_ns: Option<CacheDurationNs>,
    pub stale_while_revalidate_ns: Option<CacheDurationNs>,
    /// Space-separated list of surrogate keys.
    pub surrogate_keys: Option<String>,
    pub length: Option<CacheObjectLength>,
    pub user_metadata: Option<Bytes>,
    pub sensitive_data: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheGetBodyOptions {
    pub from: Option<u64>,
    /// Inclusive end of the range.
    pub to: Option<u64>,
}

bitflags::bitflags! {
    #[repr(transparent)]
    pub struct CacheLookupState: u32 {
        const FOUND = 1 << 0;
        const USABLE = 1 << 1;
        const STALE = 1 << 2;
        const MUST_INSERT_OR_UPDATE = 1 << 3;
    }
}

/// A cache storage backend.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up an object without coordinating with other callers.
    async fn lookup(
        &self,
        key: CacheKey,
        options: CacheLookupOptions,
    ) -> Result<Box<dyn CacheEntry>, CacheStatus>;

    /// Insert an object without coordinating with other callers.
    fn insert(
        &self,
        key: CacheKey,
        options: CacheWriteOptions,
    ) -> Result<Box<dyn BodyWriter>, CacheStatus>;

    /// Look up an object, joining the collapse group for its key.
    ///
    /// If no usable object exists and another caller already holds the obligation to provide
    /// one, this waits until that obligation is resolved. Dropping the returned future removes
    /// the caller from the wait set.
    async fn transaction_lookup(
        &self,
        key: CacheKey,
        options: CacheLookupOptions,
    ) -> Result<Box<dyn CacheEntry>, CacheStatus>;
}

/// A handle onto the result of a lookup.
///
/// Getters return `Ok(None)` when the handle did not find an object. Dropping a handle behaves
/// like [`close`](CacheEntry::close).
pub trait CacheEntry: Send + Sync {
    fn get_state(&self) -> Result<CacheLookupState, CacheStatus>;

    /// The reason the producer this lookup waited on failed, if it did.
    fn get_producer_failure(&self) -> Option<Arc<str>>;

    fn get_user_metadata(&self) -> Result<Option<Bytes>, CacheStatus>;

    /// Open a reader onto the object's body.
    ///
    /// Only one reader may be open per handle; opening another before the first is drained or
    /// dropped fails with `BADF`.
    fn get_body(
        &self,
        options: CacheGetBodyOptions,
    ) -> Result<Option<Box<dyn BodyReader>>, CacheStatus>;

    fn get_length(&self) -> Result<Option<CacheObjectLength>, CacheStatus>;

    fn get_max_age_ns(&self) -> Result<Option<CacheDurationNs>, CacheStatus>;

    fn get_stale_while_revalidate_ns(&self) -> Result<Option<CacheDurationNs>, CacheStatus>;

    fn get_age_ns(&self) -> Result<Option<CacheDurationNs>, CacheStatus>;

    fn get_hits(&self) -> Result<Option<CacheHitCount>, CacheStatus>;

    fn get_vary_rule(&self) -> Result<Option<String>, CacheStatus>;

    fn get_surrogate_keys(&self) -> Result<Option<String>, CacheStatus>;

    fn get_sensitive_data(&self) -> Result<Option<bool>, CacheStatus>;

    fn transaction_insert(
        &self,
        options: CacheWriteOptions,
    ) -> Result<Box<dyn BodyWriter>, CacheStatus>;

    fn transaction_insert_and_stream_back(
        &self,
        options: CacheWriteOptions,
    ) -> Result<(Box<dyn BodyWriter>, Box<dyn CacheEntry>), CacheStatus>;

    /// Replace the metadata of the found object. Requires both a found object and the
    /// obligation.
    fn transaction_update(&self, options: CacheWriteOptions) -> Result<(), CacheStatus>;

    /// Give up the obligation; one waiter, if any, takes it over.
    fn transaction_cancel(&self) -> Result<(), CacheStatus>;

    /// Give up the obligation and fail every waiter with `reason`.
    fn transaction_fail(&self, reason: &str) -> Result<(), CacheStatus>;

    /// Give up the obligation and stop collapsing lookups for this variant for `max_age_ns`.
    fn transaction_record_uncacheable(&self, options: CacheWriteOptions)
        -> Result<(), CacheStatus>;

    /// Release the handle. Unresolved obligations are cancelled. Idempotent.
    fn close(&self) -> Result<(), CacheStatus>;
}
