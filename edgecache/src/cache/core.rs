//! The Core Cache API.
//!
//! This API exposes the primitive operations required to implement high-performance cache
//! applications with advanced features such as request collapsing, streaming miss,
//! revalidation, and surrogate key purging.
//!
//! While this API contains affordances for some HTTP caching concepts such as `Vary` headers and
//! `stale-while-revalidate`, it does not interpret HTTP semantics on its own. Read-through HTTP
//! caching built on top of it lives in [`http::cache`][crate::http::cache].
//!
//! Cached items in this API consist of:
//!
//! * **A cache key**: up to 4KiB of arbitrary bytes that identify a cached item. The cache key may
//!   not uniquely identify an item; **headers** can be used to augment the key when multiple items
//!   are associated with the same key. See [`LookupBuilder::header()`] for more details.
//!
//! * **General metadata**, such as expiry data (item age, when to expire, and surrogate keys for
//!   purging).
//!
//! * **User-controlled metadata**: arbitrary bytes stored alongside the cached item contents that
//!   can be updated when revalidating the cached item.
//!
//! * **The object itself**: arbitrary bytes read via [`Body`] and written via [`StreamingBody`].
//!
//! In the simplest cases, the top-level [`insert()`] and [`lookup()`] functions are used for
//! one-off operations on a cached item, and are appropriate when request collapsing and
//! revalidation capabilities are not required.
//!
//! The API also supports more complex uses via [`Transaction`], which can collapse concurrent
//! lookups to the same item, including coordinating revalidation. See the [`Transaction`]
//! documentation for more details.

use self::handle::{
    CacheHandle, GetBodyOptions, LookupOptions as HandleLookupOptions,
    WriteOptions as HandleWriteOptions,
};
use crate::{
    convert::{ToHeaderName, ToHeaderValue},
    host::Host,
    http::{
        body::{Body, StreamingBody},
        HeaderMap, HeaderName, HeaderValue,
    },
    limits::CacheLimits,
};
use bytes::Bytes;
use edgecache_shared::CacheStatus;
use std::{fmt, sync::Arc, time::Duration};

mod handle;
pub use handle::CacheKey;
use handle::CacheLookupState;

/// Errors arising from cache operations.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CacheError {
    /// No cached item was available.
    #[error("no cached item found")]
    NotFound,
    /// An argument violated a documented constraint, such as an invalid body range.
    #[error("invalid argument to cache operation")]
    InvalidArgument,
    /// Operation failed due to a limit.
    #[error("cache operation failed due to a limit")]
    LimitExceeded,
    /// Operation was not valid to be performed given the state of the cached item.
    #[error("invalid cache operation")]
    InvalidOperation,
    /// Cache operation is not supported.
    #[error("unsupported cache operation")]
    Unsupported,
    /// A transactional lookup did not complete within its [timeout][TransactionLookupBuilder::timeout].
    #[error("timed out waiting for a transactional cache lookup")]
    TimedOut,
    /// The caller that was obligated to provide the item failed, and shared its reason with every
    /// lookup collapsed onto it.
    #[error("cache item producer failed: {0}")]
    ProducerFailed(Arc<str>),
    /// An unknown error occurred.
    #[error("unknown cache operation error; please report this as a bug: {0:?}")]
    Other(CacheStatus),
}

impl From<CacheStatus> for CacheError {
    fn from(status: CacheStatus) -> Self {
        match status {
            CacheStatus::NONE => CacheError::NotFound,
            CacheStatus::INVAL => CacheError::InvalidArgument,
            CacheStatus::UNSUPPORTED => CacheError::Unsupported,
            CacheStatus::LIMITEXCEEDED => CacheError::LimitExceeded,
            // A closed handle, a missing obligation, or a body stream that is already open.
            CacheStatus::BADF => CacheError::InvalidOperation,
            other => CacheError::Other(other),
        }
    }
}

fn set_header_values<'a>(
    headers: &mut Option<HeaderMap>,
    name: HeaderName,
    values: impl IntoIterator<Item = &'a HeaderValue>,
) {
    let headers = headers.get_or_insert_with(HeaderMap::new);
    headers.remove(&name);
    for value in values {
        headers.append(name.clone(), value.clone());
    }
}

/// An owned variant of `HandleLookupOptions`.
#[derive(Default)]
struct LookupOptions {
    request_headers: Option<HeaderMap>,
}

impl LookupOptions {
    fn as_handle_options(&self) -> HandleLookupOptions {
        HandleLookupOptions {
            request_headers: self.request_headers.clone(),
        }
    }
}

/// A builder-style API for configuring a non-transactional lookup.
pub struct LookupBuilder {
    host: Host,
    key: CacheKey,
    options: LookupOptions,
}

/// Returns a [`LookupBuilder`] that will perform a non-transactional cache lookup.
///
/// ```no_run
/// # use edgecache::Host;
/// # use edgecache::cache::core::*;
/// # async fn f(host: Host) -> Result<(), Box<dyn std::error::Error>> {
/// if let Some(entry) = lookup(&host, CacheKey::from_static(b"my_key")).execute().await? {
///     let cached_string = entry.to_stream()?.into_string().await?;
///     println!("the cached string was: {cached_string}");
/// }
/// # Ok(())
/// # }
/// ```
///
/// # Relationship with [`Transaction::lookup()`]
///
/// In contrast to [`Transaction::lookup()`], a non-transactional `lookup` will not attempt to
/// coordinate with any concurrent cache lookups. If two callers perform a `lookup` at the same
/// time for the same cache key, and the item is not yet cached, they will both get `Ok(None)`
/// from the eventual lookup execution. Without further coordination, they may both end up
/// performing the work needed to [`insert()`] the item (which usually involves origin requests
/// and/or computation) and racing with each other to insert.
///
/// To resolve such races between concurrent lookups, use [`Transaction::lookup()`] instead.
pub fn lookup(host: &Host, key: CacheKey) -> LookupBuilder {
    LookupBuilder {
        host: host.clone(),
        key,
        options: LookupOptions::default(),
    }
}

impl LookupBuilder {
    /// Sets a multi-value header for this lookup, discarding any previous values associated
    /// with the header `name`.
    ///
    /// Headers are matched against the headers an item was inserted with, restricted to the
    /// headers named by the item's [vary rule][InsertBuilder::vary_by()].
    pub fn header_values<'a>(
        mut self,
        name: impl ToHeaderName,
        values: impl IntoIterator<Item = &'a HeaderValue>,
    ) -> Self {
        set_header_values(&mut self.options.request_headers, name.into_owned(), values);
        self
    }

    /// Sets a single-value header for this lookup, discarding any previous values associated
    /// with the header `name`.
    pub fn header(self, name: impl ToHeaderName, value: impl ToHeaderValue) -> Self {
        self.header_values(&name.into_owned(), Some(&value.into_owned()))
    }

    /// Perform the lookup, returning a [`Found`] object if a cached item was found.
    ///
    /// The found item may be stale or even unusable; check [`Found::is_usable()`] before serving
    /// it.
    pub async fn execute(self) -> Result<Option<Found>, CacheError> {
        let handle =
            handle::lookup(&self.host, self.key.clone(), self.options.as_handle_options()).await?;
        if handle.get_state().contains(CacheLookupState::FOUND) {
            Ok(Some(Found::snapshot(self.key, Arc::new(handle))?))
        } else {
            Ok(None)
        }
    }
}

fn required<T>(value: Result<Option<T>, CacheStatus>) -> Result<T, CacheError> {
    value?.ok_or(CacheError::NotFound)
}

fn duration(ns: Result<Option<u64>, CacheStatus>) -> Result<Duration, CacheError> {
    required(ns).map(Duration::from_nanos)
}

/// A cached item returned by a lookup.
///
/// The metadata of a `Found` is a snapshot taken when the lookup completed. Its body can be read
/// with [`to_stream()`][Found::to_stream()], one stream at a time.
#[derive(Clone)]
pub struct Found {
    // Shared with the `Transaction` in the transactional case.
    handle: Arc<CacheHandle>,
    key: CacheKey,
    state: CacheLookupState,
    ttl: Duration,
    age: Duration,
    stale_while_revalidate: Duration,
    hits: u64,
    user_metadata: Bytes,
    vary_rule: String,
    surrogate_keys: String,
    sensitive_data: bool,
}

impl fmt::Debug for Found {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Found")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("age", &self.age)
            .field("stale_while_revalidate", &self.stale_while_revalidate)
            .field("hits", &self.hits)
            .field("stale", &self.is_stale())
            .finish_non_exhaustive()
    }
}

impl Found {
    fn snapshot(key: CacheKey, handle: Arc<CacheHandle>) -> Result<Self, CacheError> {
        Ok(Found {
            state: handle.get_state(),
            ttl: duration(handle.get_max_age_ns())?,
            age: duration(handle.get_age_ns())?,
            stale_while_revalidate: duration(handle.get_stale_while_revalidate_ns())?,
            hits: required(handle.get_hits())?,
            user_metadata: required(handle.get_user_metadata())?,
            vary_rule: required(handle.get_vary_rule())?,
            surrogate_keys: required(handle.get_surrogate_keys())?,
            sensitive_data: required(handle.get_sensitive_data())?,
            handle,
            key,
        })
    }

    /// The key the item was found under.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The time for which the cached item is considered fresh.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The age of the cached item when it was looked up.
    pub fn age(&self) -> Duration {
        self.age
    }

    /// The time for which a cached item can safely be used despite being considered stale.
    pub fn stale_while_revalidate(&self) -> Duration {
        self.stale_while_revalidate
    }

    /// The size in bytes of the cached item, if known.
    ///
    /// The length of the cached item may be unknown if the item is currently being streamed into
    /// the cache without a fixed length. Unlike the rest of the metadata, this is read live, so it
    /// becomes known once such an insertion finishes.
    pub fn known_length(&self) -> Option<u64> {
        self.handle.get_length()
    }

    /// The user-controlled metadata associated with the cached item.
    pub fn user_metadata(&self) -> Bytes {
        self.user_metadata.clone()
    }

    /// Determines whether the cached item is usable.
    ///
    /// A cached item is usable if its age is less than the sum of the TTL and stale-while-revalidate
    /// periods. An item that is not stale is always usable.
    pub fn is_usable(&self) -> bool {
        self.state.contains(CacheLookupState::USABLE) || !self.is_stale()
    }

    /// Determines whether the cached item is stale.
    ///
    /// A cached item is stale if its age is greater than its TTL period, or if it was soft-purged.
    pub fn is_stale(&self) -> bool {
        self.state.contains(CacheLookupState::STALE)
    }

    /// Determines the number of cache hits to this cached item.
    ///
    /// **Note**: this hit count only reflects the view of the host that supplied the cached item.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// The space-separated list of request headers the item varies on.
    pub fn vary_rule(&self) -> &str {
        &self.vary_rule
    }

    /// The surrogate keys the item was inserted with.
    pub fn surrogate_keys(&self) -> impl Iterator<Item = &str> {
        self.surrogate_keys.split(' ').filter(|key| !key.is_empty())
    }

    /// Whether the item was inserted as sensitive data.
    pub fn is_sensitive_data(&self) -> bool {
        self.sensitive_data
    }

    /// Retrieves the entire cached item as a [`Body`] that can be read in a streaming fashion.
    ///
    /// Only one stream can be open for a `Found` at a time: the previous stream must be read to
    /// the end or dropped first, otherwise this returns [`CacheError::InvalidOperation`].
    pub fn to_stream(&self) -> Result<Body, CacheError> {
        self.to_stream_from_range(None, None)
    }

    /// Retrieves a range of bytes from the cached item as a [`Body`] that can be read in a
    /// streaming fashion.
    ///
    /// `from` is the first byte to read and `to` is the last, inclusive. If `from` is `None`, the
    /// stream starts from the beginning of the item. If `to` is `None` or `Some(0)`, the stream
    /// ends at the end of the item.
    ///
    /// A range with `to` before `from` fails with [`CacheError::InvalidArgument`]. A range that
    /// starts past the end of an item of known length yields the entire item; it is the caller's
    /// responsibility to check that the returned stream contains the number of bytes expected.
    ///
    /// Only one stream can be open for a `Found` at a time: the previous stream must be read to
    /// the end or dropped first, otherwise this returns [`CacheError::InvalidOperation`].
    pub fn to_stream_from_range(
        &self,
        from: Option<u64>,
        to: Option<u64>,
    ) -> Result<Body, CacheError> {
        let to = to.filter(|&to| to != 0);
        self.handle
            .get_body(GetBodyOptions { from, to })?
            .ok_or(CacheError::NotFound)
    }
}

/// An owned variant of `HandleWriteOptions`.
#[derive(Default)]
struct WriteOptions {
    max_age: Duration,
    request_headers: Option<HeaderMap>,
    /// A space-delimited list of headers to vary on
    vary_rule: Option<String>,
    initial_age: Option<Duration>,
    stale_while_revalidate: Option<Duration>,
    /// A space-delimited list of keys
    surrogate_keys: Option<String>,
    length: Option<u64>,
    user_metadata: Option<Bytes>,
    sensitive_data: bool,
}

impl WriteOptions {
    fn with_ttl(ttl: Duration) -> Self {
        WriteOptions {
            max_age: ttl,
            ..WriteOptions::default()
        }
    }

    fn as_handle_options(&self) -> Result<HandleWriteOptions, CacheError> {
        let limits = CacheLimits::current();
        if let Some(user_metadata) = &self.user_metadata {
            if !limits.allows_user_metadata(user_metadata.len()) {
                return Err(CacheError::LimitExceeded);
            }
        }
        if let Some(surrogate_keys) = &self.surrogate_keys {
            if !limits.allows_surrogate_keys(surrogate_keys.len()) {
                return Err(CacheError::LimitExceeded);
            }
        }

        // An initial age beyond u64::MAX nanoseconds is a caller error.
        let initial_age_ns = self
            .initial_age
            .map(|age| age.as_nanos().try_into())
            .transpose()
            .map_err(|_| CacheError::InvalidArgument)?;

        // `Duration::MAX` is a plausible way to say "unlimited" for these, so saturate; the
        // difference is not observable at > 500 years.
        let max_age_ns = self.max_age.as_nanos().try_into().unwrap_or(u64::MAX);
        let stale_while_revalidate_ns = self
            .stale_while_revalidate
            .map(|swr| swr.as_nanos().try_into().unwrap_or(u64::MAX));

        Ok(HandleWriteOptions {
            max_age_ns,
            request_headers: self.request_headers.clone(),
            vary_rule: self.vary_rule.clone(),
            initial_age_ns,
            stale_while_revalidate_ns,
            surrogate_keys: self.surrogate_keys.clone(),
            length: self.length,
            user_metadata: self.user_metadata.clone(),
            sensitive_data: self.sensitive_data,
        })
    }

    fn vary_by<'a>(&mut self, headers: impl IntoIterator<Item = &'a HeaderName>) {
        let vary_rule: Vec<&str> = headers.into_iter().map(HeaderName::as_str).collect();
        self.vary_rule = Some(vary_rule.join(" "));
    }

    fn surrogate_keys<'a>(&mut self, surrogate_keys: impl IntoIterator<Item = &'a str>) {
        let keys: Vec<&str> = surrogate_keys.into_iter().collect();
        self.surrogate_keys = Some(keys.join(" "));
    }
}

/// A builder-style API for configuring a non-transactional insertion.
pub struct InsertBuilder {
    host: Host,
    key: CacheKey,
    options: WriteOptions,
}

/// Returns an [`InsertBuilder`] that will perform a non-transactional cache insertion.
///
/// The required `ttl` argument is the "time to live" for the cache item: the time for which the
/// item will be considered fresh. All other insertion arguments are optional, and may be set using
/// the returned builder.
///
/// ```no_run
/// # use edgecache::Host;
/// # use edgecache::cache::core::*;
/// # use std::io::Write;
/// # use std::time::Duration;
/// # fn f(host: Host) -> Result<(), Box<dyn std::error::Error>> {
/// let contents = b"my cached object";
/// let mut writer = insert(&host, CacheKey::from_static(b"my_key"), Duration::from_secs(3600))
///     .surrogate_keys(["my_key"])
///     .known_length(contents.len() as u64)
///     .execute()?;
/// writer.write_all(contents)?;
/// writer.finish()?;
/// # Ok(())
/// # }
/// ```
///
/// # Relationship with [`Transaction::lookup()`]
///
/// Like [`lookup()`], [`insert()`] may race with concurrent lookups or insertions, and will
/// unconditionally overwrite existing cached items rather than allowing for revalidation of an
/// existing object.
///
/// The transactional equivalent of this function is [`Transaction::insert()`], which may only be
/// called following a transactional lookup when [`Transaction::must_insert_or_update()`] returns
/// `true`.
pub fn insert(host: &Host, key: CacheKey, ttl: Duration) -> InsertBuilder {
    InsertBuilder {
        host: host.clone(),
        key,
        options: WriteOptions::with_ttl(ttl),
    }
}

impl InsertBuilder {
    /// Sets a multi-value header for this insertion, discarding any previous values associated
    /// with the header `name`.
    ///
    /// Only headers named by the [vary rule][Self::vary_by()] take part in matching lookups.
    pub fn header_values<'a>(
        mut self,
        name: impl ToHeaderName,
        values: impl IntoIterator<Item = &'a HeaderValue>,
    ) -> Self {
        set_header_values(&mut self.options.request_headers, name.into_owned(), values);
        self
    }

    /// Sets a single-value header for this insertion, discarding any previous values associated
    /// with the header `name`.
    pub fn header(self, name: impl ToHeaderName, value: impl ToHeaderValue) -> Self {
        self.header_values(&name.into_owned(), Some(&value.into_owned()))
    }

    /// Sets the list of headers that must match when looking up this cached item.
    pub fn vary_by<'a>(mut self, headers: impl IntoIterator<Item = &'a HeaderName>) -> Self {
        self.options.vary_by(headers);
        self
    }

    /// Sets the initial age of the cached item, to be used in freshness calculations.
    ///
    /// The initial age is `Duration::ZERO` by default.
    pub fn initial_age(mut self, age: Duration) -> Self {
        self.options.initial_age = Some(age);
        self
    }

    /// Sets the stale-while-revalidate period of the cached item.
    ///
    /// Once the item is stale, it stays usable for this period while one transaction client
    /// freshens it.
    pub fn stale_while_revalidate(mut self, duration: Duration) -> Self {
        self.options.stale_while_revalidate = Some(duration);
        self
    }

    /// Sets the surrogate keys that can be used for purging this cached item.
    ///
    /// Surrogate keys must be printable ASCII without spaces; other keys are silently dropped.
    pub fn surrogate_keys<'a>(mut self, keys: impl IntoIterator<Item = &'a str>) -> Self {
        self.options.surrogate_keys(keys);
        self
    }

    /// Sets the size of the cached item, in bytes, when known prior to actually providing the
    /// bytes.
    ///
    /// Finishing the insertion after writing a different number of bytes is an error.
    pub fn known_length(mut self, length: u64) -> Self {
        self.options.length = Some(length);
        self
    }

    /// Sets the user-defined metadata to associate with the cached item.
    pub fn user_metadata(mut self, user_metadata: Bytes) -> Self {
        self.options.user_metadata = Some(user_metadata);
        self
    }

    /// Marks the cached item as sensitive, restricting it to compliant storage.
    pub fn sensitive_data(mut self, is_sensitive_data: bool) -> Self {
        self.options.sensitive_data = is_sensitive_data;
        self
    }

    /// Begin the insertion, returning a [`StreamingBody`] for providing the cached object itself.
    ///
    /// The item becomes visible to lookups immediately, and its body streams to readers as it is
    /// written.
    pub fn execute(self) -> Result<StreamingBody, CacheError> {
        let options = self.options.as_handle_options()?;
        Ok(handle::insert(&self.host, self.key, options)?)
    }
}

/// A cache transaction initiated by [`Transaction::lookup()`].
///
/// Transactions coordinate between concurrent actions on the same cache key, incorporating concepts
/// of request collapsing and revalidation, though at a lower level that does not automatically
/// interpret HTTP semantics.
///
/// # Request collapsing
///
/// If there are multiple concurrent calls to [`Transaction::lookup()`] for the same item and that
/// item is not present, just one of the callers will be instructed to insert the item into the
/// cache as part of the transaction. The other callers will wait until the metadata for the item
/// has been inserted, and can then begin streaming its contents out of the cache at the same time
/// that the inserting caller streams them into the cache.
///
/// If the inserting caller gives up with [`Transaction::cancel_insert_or_update()`], or closes the
/// transaction without resolving it, one of the waiting callers is chosen to take over. Which one
/// is unspecified.
///
/// # Revalidation
///
/// Similarly, if an item is usable but stale, and multiple callers attempt a
/// [`Transaction::lookup()`] concurrently, they will all be given access to the stale item, but
/// only one will be designated to perform an asynchronous update (or insertion) to freshen the item
/// in the cache.
///
/// # Closing
///
/// A transaction is closed by [`Transaction::close()`] or by dropping it. Closing a transaction
/// that is still obligated to insert or update cancels the obligation, handing it to a waiter.
///
/// # Example
///
/// Users of the transactional API should at minimum anticipate lookups that are obligated to insert
/// an item into the cache, and lookups which are not. If the `stale-while-revalidate` parameter is
/// set for cached items, the user should also distinguish between the insertion and revalidation
/// cases.
///
/// ```no_run
/// # use edgecache::Host;
/// # use edgecache::cache::core::*;
/// # use std::io::Write;
/// # use std::time::Duration;
/// # fn build_contents() -> &'static [u8] { todo!() }
/// # fn use_found_item(_: &Found) {}
/// # fn should_replace(_: &Found, _: &'static [u8]) -> bool { todo!() }
/// # async fn f(host: Host) -> Result<(), Box<dyn std::error::Error>> {
/// const TTL: Duration = Duration::from_secs(3600);
/// // perform the lookup
/// let lookup_tx = Transaction::lookup(&host, CacheKey::from_static(b"my_key"))
///     .execute()
///     .await?;
/// if let Some(found) = lookup_tx.found() {
///     // a cached item was found; we use it now even though it might be stale,
///     // and we'll revalidate it below
///     use_found_item(&found);
/// }
/// // now we need to handle the "must insert" and "must update" cases
/// if lookup_tx.must_insert() {
///     // a cached item was not found, and we've been chosen to insert it
///     let contents = build_contents();
///     let (mut writer, found) = lookup_tx
///         .insert(TTL)
///         .surrogate_keys(["my_key"])
///         .known_length(contents.len() as u64)
///         // stream back the object so we can use it after inserting
///         .execute_and_stream_back()?;
///     writer.write_all(contents)?;
///     writer.finish()?;
///     // now we can use the item we just inserted
///     use_found_item(&found);
/// } else if lookup_tx.must_insert_or_update() {
///     // a cached item was found and used above, and now we need to perform
///     // revalidation
///     let revalidation_contents = build_contents();
///     if let Some(stale_found) = lookup_tx.found() {
///         if should_replace(&stale_found, &revalidation_contents) {
///             // use `insert` to replace the previous object
///             let mut writer = lookup_tx
///                 .insert(TTL)
///                 .surrogate_keys(["my_key"])
///                 .known_length(revalidation_contents.len() as u64)
///                 .execute()?;
///             writer.write_all(revalidation_contents)?;
///             writer.finish()?;
///         } else {
///             // otherwise update the stale object's metadata
///             lookup_tx.update(TTL).surrogate_keys(["my_key"]).execute()?;
///         }
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Transaction {
    handle: Arc<CacheHandle>,
    key: CacheKey,
    found: Option<Found>,
}

impl Transaction {
    /// Returns a [`TransactionLookupBuilder`] that will perform a transactional cache lookup.
    ///
    /// See [`Transaction`] for details and an example.
    pub fn lookup(host: &Host, key: CacheKey) -> TransactionLookupBuilder {
        TransactionLookupBuilder {
            host: host.clone(),
            key,
            options: LookupOptions::default(),
            timeout: None,
        }
    }

    /// Returns a `Found` object for this cache item, if one is available.
    ///
    /// Even if an object is found, the cache item might be stale and require updating. Use
    /// [`Transaction::must_insert_or_update()`] to determine whether this transaction client is
    /// expected to update the cached item.
    pub fn found(&self) -> Option<Found> {
        self.found.clone()
    }

    /// Returns `true` if a usable cached item was not found, and this transaction client is
    /// expected to insert one.
    ///
    /// Use [`Transaction::insert()`] to insert the cache item, or
    /// [`Transaction::cancel_insert_or_update()`] to exit the transaction without providing an
    /// item.
    pub fn must_insert(&self) -> bool {
        let state = self.handle.get_state();
        !state.contains(CacheLookupState::FOUND)
            && state.contains(CacheLookupState::MUST_INSERT_OR_UPDATE)
    }

    /// Returns `true` if a fresh cache item was not found, and this transaction client is expected
    /// to insert a new item or update a stale item.
    ///
    /// Use:
    ///
    /// * [`Transaction::update()`] to freshen a found item by updating its metadata;
    /// * [`Transaction::insert()`] to insert a new item (including object data);
    /// * [`Transaction::cancel_insert_or_update()`] to exit the transaction without providing an item.
    pub fn must_insert_or_update(&self) -> bool {
        self.handle
            .get_state()
            .contains(CacheLookupState::MUST_INSERT_OR_UPDATE)
    }

    /// Cancels the obligation for this transaction client to insert or update a cache item.
    ///
    /// If there are concurrent transactional lookups that were blocked waiting on this client
    /// to provide the item, one of them will be chosen to be unblocked and given the
    /// [`Transaction::must_insert_or_update()`] obligation.
    ///
    /// This method should only be called when [`Transaction::must_insert_or_update()`] is true;
    /// otherwise, a [`CacheError::InvalidOperation`] will be returned.
    pub fn cancel_insert_or_update(&self) -> Result<(), CacheError> {
        tracing::debug!(key_len = self.key.len(), "cancelling cache obligation");
        Ok(self.handle.transaction_cancel()?)
    }

    /// Gives up the obligation to insert or update a cache item because producing it failed.
    ///
    /// Unlike [`Transaction::cancel_insert_or_update()`], no waiter takes over: every
    /// transactional lookup blocked on this client fails with [`CacheError::ProducerFailed`]
    /// carrying `reason`.
    ///
    /// This method should only be called when [`Transaction::must_insert_or_update()`] is true;
    /// otherwise, a [`CacheError::InvalidOperation`] will be returned.
    pub fn fail_insert_or_update(&self, reason: &str) -> Result<(), CacheError> {
        tracing::warn!(key_len = self.key.len(), reason, "cache item producer failed");
        Ok(self.handle.transaction_fail(reason)?)
    }

    /// Gives up the obligation and disables collapsing for this item for `ttl`, so that
    /// subsequent lookups each receive their own obligation.
    pub(crate) fn record_uncacheable(&self, ttl: Duration) -> Result<(), CacheError> {
        let options = WriteOptions::with_ttl(ttl).as_handle_options()?;
        Ok(self.handle.transaction_record_uncacheable(options)?)
    }

    /// Returns a [`TransactionInsertBuilder`] that will perform a transactional cache insertion.
    ///
    /// This method should only be called when [`Transaction::must_insert_or_update()`] is true;
    /// otherwise, a [`CacheError::InvalidOperation`] will be returned when attempting to execute
    /// the insertion.
    pub fn insert(self, ttl: Duration) -> TransactionInsertBuilder {
        TransactionInsertBuilder {
            tx: self,
            options: WriteOptions::with_ttl(ttl),
        }
    }

    /// Returns a [`TransactionUpdateBuilder`] that will perform a transactional cache update.
    ///
    /// Updating an item freshens it by updating its metadata, e.g. its age, without changing the
    /// object itself.
    ///
    /// This method should only be called when [`Transaction::must_insert_or_update()`] is true
    /// _and_ the item is found (i.e. [`Transaction::found()`] is non-empty). Otherwise, a
    /// [`CacheError::InvalidOperation`] will be returned when attempting to execute the update.
    ///
    /// The method consumes the transaction. Call [`Transaction::found()`] before this method if
    /// subsequent access to the stale cached item is needed.
    ///
    /// **Important note**: the [`TransactionUpdateBuilder`] will replace _all_ of the configuration
    /// in the underlying cache item; if any configuration is not set on the builder, it will revert
    /// to the default value. So, for example, if a cached item previously had some surrogate keys
    /// set, and you want to retain them, you _must_ call
    /// [`TransactionUpdateBuilder::surrogate_keys()`] with the desired keys. Most configuration is
    /// available in the [`Found`] object.
    pub fn update(self, ttl: Duration) -> TransactionUpdateBuilder {
        TransactionUpdateBuilder {
            tx: self,
            options: WriteOptions::with_ttl(ttl),
        }
    }

    /// Closes the transaction.
    ///
    /// An obligation that has not been resolved is cancelled, as with
    /// [`Transaction::cancel_insert_or_update()`], and the transaction's [`Found`] is detached
    /// from the cached item: no new streams can be opened from it.
    ///
    /// A [`Body`] already obtained from [`Found::to_stream()`] owns its reader, so closing the
    /// transaction does not cut it short; drop the body to release it. This differs from hosts
    /// where closing a transaction also closes the found object's open body.
    ///
    /// Closing is idempotent, and also happens when the transaction is dropped.
    pub fn close(&self) -> Result<(), CacheError> {
        Ok(self.handle.close()?)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // `Found` objects may still share the handle, so only release the obligation here; the
        // handle closes when the last of them is dropped.
        if self.must_insert_or_update() {
            tracing::debug!(key_len = self.key.len(), "transaction dropped while obligated");
            let _ = self.handle.transaction_cancel();
        }
    }
}

/// A builder-style API for configuring a transactional lookup.
pub struct TransactionLookupBuilder {
    host: Host,
    key: CacheKey,
    options: LookupOptions,
    timeout: Option<Duration>,
}

impl TransactionLookupBuilder {
    /// Sets a multi-value header for this lookup, discarding any previous values associated
    /// with the header `name`.
    ///
    /// Concurrent lookups are only collapsed together when they match the same variant of the
    /// item, as selected by these headers.
    pub fn header_values<'a>(
        mut self,
        name: impl ToHeaderName,
        values: impl IntoIterator<Item = &'a HeaderValue>,
    ) -> Self {
        set_header_values(&mut self.options.request_headers, name.into_owned(), values);
        self
    }

    /// Sets a single-value header for this lookup, discarding any previous values associated
    /// with the header `name`.
    pub fn header(self, name: impl ToHeaderName, value: impl ToHeaderValue) -> Self {
        self.header_values(&name.into_owned(), Some(&value.into_owned()))
    }

    pub(crate) fn headers(mut self, headers: HeaderMap) -> Self {
        self.options.request_headers = Some(headers);
        self
    }

    /// Bounds how long the lookup may wait on another client that is obligated to provide the
    /// item.
    ///
    /// If the wait exceeds `timeout`, the lookup fails with [`CacheError::TimedOut`] and this
    /// client leaves the set of waiters; the obligation is unaffected. Dropping the future
    /// returned by [`execute()`][Self::execute()] has the same effect.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Perform the lookup, entering a [`Transaction`].
    ///
    /// This waits while another client is obligated to provide the item. Accessors like
    /// [`Transaction::found()`] can be used to determine the outcome of the lookup.
    ///
    /// If the client this lookup waited on failed with
    /// [`Transaction::fail_insert_or_update()`], this returns [`CacheError::ProducerFailed`].
    pub async fn execute(self) -> Result<Transaction, CacheError> {
        let TransactionLookupBuilder {
            host,
            key,
            options,
            timeout,
        } = self;
        let lookup = handle::transaction_lookup(&host, key.clone(), options.as_handle_options());
        let handle = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, lookup)
                .await
                .map_err(|_| {
                    tracing::debug!(key_len = key.len(), ?timeout, "transactional lookup timed out");
                    CacheError::TimedOut
                })??,
            None => lookup.await?,
        };
        if let Some(reason) = handle.producer_failure() {
            return Err(CacheError::ProducerFailed(reason));
        }
        let handle = Arc::new(handle);
        let found = if handle.get_state().contains(CacheLookupState::FOUND) {
            Some(Found::snapshot(key.clone(), Arc::clone(&handle))?)
        } else {
            None
        };
        Ok(Transaction { handle, key, found })
    }
}

/// A builder-style API for configuring a transactional cache insertion.
pub struct TransactionInsertBuilder {
    tx: Transaction,
    options: WriteOptions,
}

impl TransactionInsertBuilder {
    /// Sets the list of headers that must match when looking up this cached item.
    ///
    /// The values are taken from the headers of the lookup that started the transaction.
    pub fn vary_by<'a>(mut self, headers: impl IntoIterator<Item = &'a HeaderName>) -> Self {
        self.options.vary_by(headers);
        self
    }

    /// Sets the initial age of the cached item, to be used in freshness calculations.
    ///
    /// The initial age is `Duration::ZERO` by default.
    pub fn initial_age(mut self, age: Duration) -> Self {
        self.options.initial_age = Some(age);
        self
    }

    /// Sets the stale-while-revalidate period of the cached item.
    pub fn stale_while_revalidate(mut self, duration: Duration) -> Self {
        self.options.stale_while_revalidate = Some(duration);
        self
    }

    /// Sets the surrogate keys that can be used for purging this cached item.
    pub fn surrogate_keys<'a>(mut self, keys: impl IntoIterator<Item = &'a str>) -> Self {
        self.options.surrogate_keys(keys);
        self
    }

    /// Sets the size of the cached item, in bytes, when known prior to actually providing the
    /// bytes.
    pub fn known_length(mut self, length: u64) -> Self {
        self.options.length = Some(length);
        self
    }

    /// Sets the user-defined metadata to associate with the cached item.
    pub fn user_metadata(mut self, user_metadata: Bytes) -> Self {
        self.options.user_metadata = Some(user_metadata);
        self
    }

    /// Marks the cached item as sensitive, restricting it to compliant storage.
    pub fn sensitive_data(mut self, is_sensitive_data: bool) -> Self {
        self.options.sensitive_data = is_sensitive_data;
        self
    }

    /// Begin the insertion, returning a [`StreamingBody`] for providing the cached object itself.
    ///
    /// Waiting transactional lookups are released as soon as this returns, and read the body as
    /// it is written.
    pub fn execute(self) -> Result<StreamingBody, CacheError> {
        let options = self.options.as_handle_options()?;
        Ok(self.tx.handle.transaction_insert(options)?)
    }

    /// Begin the insertion, and provide a `Found` object that can be used to stream out of the
    /// newly-inserted object.
    ///
    /// The returned [`Found`] object allows the client inserting a cache item to efficiently read
    /// back the contents of that item, avoiding the need to buffer contents for copying to multiple
    /// destinations. This pattern is commonly required when caching an item that also must be
    /// provided to, e.g., the client response.
    pub fn execute_and_stream_back(self) -> Result<(StreamingBody, Found), CacheError> {
        self.try_execute_and_stream_back().map_err(|(e, _)| e)
    }

    /// As [`execute_and_stream_back()`][Self::execute_and_stream_back()], but a failure hands
    /// the transaction back so its obligation can still be resolved.
    pub(crate) fn try_execute_and_stream_back(
        self,
    ) -> Result<(StreamingBody, Found), (CacheError, Transaction)> {
        let TransactionInsertBuilder { tx, options } = self;
        let options = match options.as_handle_options() {
            Ok(options) => options,
            Err(e) => return Err((e, tx)),
        };
        let (body, handle) = match tx.handle.transaction_insert_and_stream_back(options) {
            Ok(inserted) => inserted,
            Err(e) => return Err((e.into(), tx)),
        };
        let key = tx.key.clone();
        let found = Found::snapshot(key, Arc::new(handle)).map_err(|e| (e, tx))?;
        Ok((body, found))
    }
}

/// A builder-style API for configuring a transactional cache update.
pub struct TransactionUpdateBuilder {
    tx: Transaction,
    options: WriteOptions,
}

impl TransactionUpdateBuilder {
    /// Sets the list of headers that must match when looking up this cached item.
    pub fn vary_by<'a>(mut self, headers: impl IntoIterator<Item = &'a HeaderName>) -> Self {
        self.options.vary_by(headers);
        self
    }

    /// Sets the updated age of the cached item, to be used in freshness calculations.
    ///
    /// The updated age is `Duration::ZERO` by default.
    pub fn age(mut self, age: Duration) -> Self {
        self.options.initial_age = Some(age);
        self
    }

    /// Sets the stale-while-revalidate period of the cached item.
    pub fn stale_while_revalidate(mut self, duration: Duration) -> Self {
        self.options.stale_while_revalidate = Some(duration);
        self
    }

    /// Sets the surrogate keys that can be used for purging this cached item.
    pub fn surrogate_keys<'a>(mut self, keys: impl IntoIterator<Item = &'a str>) -> Self {
        self.options.surrogate_keys(keys);
        self
    }

    /// Sets the user-defined metadata to associate with the cached item.
    pub fn user_metadata(mut self, user_metadata: Bytes) -> Self {
        self.options.user_metadata = Some(user_metadata);
        self
    }

    /// Marks the cached item as sensitive, restricting it to compliant storage.
    pub fn sensitive_data(mut self, is_sensitive_data: bool) -> Self {
        self.options.sensitive_data = is_sensitive_data;
        self
    }

    /// Perform the update of the cache item's metadata.
    pub fn execute(self) -> Result<(), CacheError> {
        self.try_execute().map_err(|(e, _)| e)
    }

    /// As [`execute()`][Self::execute()], but a failure hands the transaction back so its
    /// obligation can still be resolved.
    pub(crate) fn try_execute(self) -> Result<(), (CacheError, Transaction)> {
        let TransactionUpdateBuilder { tx, options } = self;
        let options = match options.as_handle_options() {
            Ok(options) => options,
            Err(e) => return Err((e, tx)),
        };
        match tx.handle.transaction_update(options) {
            Ok(()) => Ok(()),
            Err(e) => Err((e.into(), tx)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(matches!(CacheStatus::NONE.into(), CacheError::NotFound));
        assert!(matches!(CacheStatus::INVAL.into(), CacheError::InvalidArgument));
        assert!(matches!(CacheStatus::BADF.into(), CacheError::InvalidOperation));
        assert!(matches!(CacheStatus::LIMITEXCEEDED.into(), CacheError::LimitExceeded));
        assert!(matches!(CacheStatus::UNSUPPORTED.into(), CacheError::Unsupported));
        assert!(matches!(
            CacheStatus::ERROR.into(),
            CacheError::Other(CacheStatus::ERROR)
        ));
    }

    #[test]
    fn write_options_saturate_and_join() {
        let mut options = WriteOptions::with_ttl(Duration::MAX);
        options.vary_by([&http::header::ACCEPT, &http::header::ACCEPT_ENCODING]);
        options.surrogate_keys(["a", "b"]);
        let handle_options = options.as_handle_options().unwrap();
        assert_eq!(handle_options.max_age_ns, u64::MAX);
        assert_eq!(handle_options.vary_rule.as_deref(), Some("accept accept-encoding"));
        assert_eq!(handle_options.surrogate_keys.as_deref(), Some("a b"));

        options.initial_age = Some(Duration::MAX);
        assert!(matches!(
            options.as_handle_options(),
            Err(CacheError::InvalidArgument)
        ));
    }
}
