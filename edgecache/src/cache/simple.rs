//! The Simple Cache API.
//!
//! This is a non-durable key-value API backed by the same cache as the [Core Cache API][core].
//!
//! ## Cache scope and purging
//!
//! Cache entries are scoped to a point of presence (POP): the value set for a key through one
//! [`Host`] is not expected to be visible through hosts in other POPs. The POP is identified by
//! [`CacheConfig::pop`][crate::CacheConfig::pop].
//!
//! Purging is scoped to the POP by default, but can be configured to purge globally, either per
//! call with [`purge_with_opts()`] or per host with
//! [`CacheConfig::default_purge_scope`][crate::CacheConfig::default_purge_scope].
//!
//! ## Interoperability
//!
//! The Simple Cache API is implemented in terms of the [Core Cache API][core]. Items inserted with
//! the Core Cache API can be read by the Simple Cache API, and vice versa. However, some metadata
//! and advanced features like revalidation may be not be available via the Simple Cache API.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;

use crate::http::purge::purge_surrogate_key;
use crate::{Body, Host};

pub use super::core::CacheKey;
use super::core::{self, Transaction};

/// Errors arising from cache operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CacheError {
    /// Operation failed due to a limit.
    #[error("Simple Cache operation failed due to a limit")]
    LimitExceeded,
    /// An argument was rejected by the underlying cache.
    #[error("invalid argument to Simple Cache operation")]
    InvalidArgument,
    /// An underlying Core Cache API operation found an invalid state.
    ///
    /// This should not arise during use of this API. If encountered, please report it as a bug.
    #[error("invalid Simple Cache operation; please report this as a bug")]
    InvalidOperation,
    /// Cache operation is not supported.
    #[error("unsupported Simple Cache operation")]
    Unsupported,
    /// An IO error occurred during an operation.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An error occurred when purging a value.
    #[error("purging error: {0}")]
    Purge(#[source] crate::Error),
    /// An error occurred while running the closure argument of [`get_or_set_with()`].
    ///
    /// Callers that were waiting on another caller's closure receive this error too, carrying
    /// that closure's error message.
    ///
    /// This uses [`anyhow::Error`] to provide maximum flexibility in how the closure reports errors.
    #[error("get_or_set closure error: {0}")]
    GetOrSet(#[source] anyhow::Error),
    /// An unknown error occurred.
    #[error("unknown Simple Cache operation error; please report this as a bug: {0:?}")]
    Other(edgecache_shared::CacheStatus),
}

impl From<core::CacheError> for CacheError {
    fn from(value: core::CacheError) -> Self {
        match value {
            core::CacheError::LimitExceeded => Self::LimitExceeded,
            core::CacheError::InvalidArgument => Self::InvalidArgument,
            core::CacheError::Unsupported => Self::Unsupported,
            core::CacheError::ProducerFailed(reason) => {
                Self::GetOrSet(anyhow::Error::msg(reason))
            }
            core::CacheError::Other(st) => Self::Other(st),
            core::CacheError::InvalidOperation
            | core::CacheError::NotFound
            | core::CacheError::TimedOut => Self::InvalidOperation,
        }
    }
}

/// Get the entry associated with the given cache key, if it exists.
///
/// ```no_run
/// # use edgecache::Host;
/// # use edgecache::cache::simple::*;
/// # async fn f(host: Host) -> Result<(), Box<dyn std::error::Error>> {
/// if let Some(value) = get(&host, "my_key").await? {
///     let cached_string = value.into_string().await?;
///     println!("the cached string was: {cached_string}");
/// }
/// # Ok(())
/// # }
/// ```
pub async fn get(host: &Host, key: impl Into<CacheKey>) -> Result<Option<Body>, CacheError> {
    let Some(found) = core::lookup(host, key.into()).execute().await? else {
        return Ok(None);
    };
    Ok(Some(found.to_stream()?))
}

/// Get the entry associated with the given cache key if it exists, or insert and return the
/// specified entry.
///
/// If the value is costly to compute, consider using [`get_or_set_with()`] instead to avoid
/// computation in the case where the value is already present.
///
/// ```no_run
/// # use edgecache::Host;
/// # use edgecache::cache::simple::*;
/// # use std::time::Duration;
/// # async fn f(host: Host) -> Result<(), Box<dyn std::error::Error>> {
/// let value = get_or_set(&host, "my_key", "hello!", Duration::from_secs(60)).await?;
/// let cached_string = value.into_string().await?;
/// println!("the cached string was: {cached_string}");
/// # Ok(())
/// # }
/// ```
pub async fn get_or_set(
    host: &Host,
    key: impl Into<CacheKey>,
    value: impl Into<Body>,
    ttl: Duration,
) -> Result<Body, CacheError> {
    let value = value.into();
    get_or_set_with(host, key, move || async move { Ok(CacheEntry { value, ttl }) }).await
}

/// The return type of the closure provided to [`get_or_set_with()`].
#[derive(Debug)]
pub struct CacheEntry {
    /// The value to cache.
    pub value: Body,
    /// The time-to-live for the cache entry.
    pub ttl: Duration,
}

/// Get the entry associated with the given cache key if it exists, or insert and return an entry
/// specified by running the given closure.
///
/// The closure is only run when no value is present for the key, and no other caller is in the
/// process of setting it: concurrent callers for the same key wait for the one running closure
/// and then share its value. The closure takes no arguments, and returns a future resolving to
/// either `Ok` with a [`CacheEntry`] describing the entry to set, or `Err` with an
/// [`anyhow::Error`]. The error is not interpreted by the API. No value is cached on error, and
/// every caller waiting on this closure fails with [`CacheError::GetOrSet`] as well.
///
/// ## Example successful insertion
///
/// ```no_run
/// # use edgecache::Host;
/// # use edgecache::cache::simple::*;
/// # use std::time::Duration;
/// # async fn f(host: Host) -> Result<(), Box<dyn std::error::Error>> {
/// let value = get_or_set_with(&host, "my_key", || async {
///     Ok(CacheEntry {
///         value: "hello!".into(),
///         ttl: Duration::from_secs(60),
///     })
/// })
/// .await?;
/// let cached_string = value.into_string().await?;
/// println!("the cached string was: {cached_string}");
/// # Ok(())
/// # }
/// ```
///
/// ## Example unsuccessful insertion
///
/// ```no_run
/// # use edgecache::Host;
/// # use edgecache::cache::simple::*;
/// # async fn f(host: Host) {
/// let result = get_or_set_with(&host, "my_key", || async {
///     Err::<CacheEntry, _>(anyhow::anyhow!("I changed my mind!"))
/// })
/// .await;
/// assert!(matches!(result, Err(CacheError::GetOrSet(_))));
/// # }
/// ```
pub async fn get_or_set_with<F, Fut>(
    host: &Host,
    key: impl Into<CacheKey>,
    make_entry: F,
) -> Result<Body, CacheError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CacheEntry, anyhow::Error>>,
{
    let key = key.into();
    let lookup_tx = Transaction::lookup(host, key.clone()).execute().await?;
    if !lookup_tx.must_insert_or_update() {
        return match lookup_tx.found() {
            // the value is already present, so just return it
            Some(found) => Ok(found.to_stream()?),
            // we're not in the insert-or-update case, but there's no found?
            None => Err(CacheError::InvalidOperation),
        };
    }
    // run the user-provided closure to produce the entry; its failure is shared with everyone
    // collapsed onto this transaction
    let CacheEntry { value, ttl } = match make_entry().await {
        Ok(entry) => entry,
        Err(e) => {
            let _ = lookup_tx.fail_insert_or_update(&e.to_string());
            return Err(CacheError::GetOrSet(e));
        }
    };
    let pop = host.config().pop.as_deref();
    // perform a standard insert-and-read-back
    let (mut insert_body, found) = lookup_tx
        .insert(ttl)
        .surrogate_keys([
            surrogate_key_for_cache_key(&key, PurgeScope::Pop, pop).as_str(),
            surrogate_key_for_cache_key(&key, PurgeScope::Global, pop).as_str(),
        ])
        .execute_and_stream_back()?;
    insert_body.append(value).await?;
    insert_body.finish()?;
    Ok(found.to_stream()?)
}

/// The scope of a purge.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurgeScope {
    /// Only the current POP.
    #[default]
    Pop,
    /// Every POP.
    Global,
}

/// Options for [`purge_with_opts()`].
#[derive(Copy, Clone, Debug, Default)]
pub struct PurgeOptions {
    scope: PurgeScope,
}

impl PurgeOptions {
    /// Purge the key from the current POP (default behavior).
    ///
    /// This allows a higher throughput of purging than purging globally.
    pub fn pop_scope() -> Self {
        Self {
            scope: PurgeScope::Pop,
        }
    }

    /// Purge the key globally.
    pub fn global_scope() -> Self {
        Self {
            scope: PurgeScope::Global,
        }
    }

    /// The scope these options purge.
    pub fn scope(&self) -> PurgeScope {
        self.scope
    }
}

/// Purge the entry associated with the given cache key.
///
/// The purge uses the host's [default purge
/// scope][crate::CacheConfig::default_purge_scope]. To choose the scope per call, use
/// [`purge_with_opts()`].
///
/// ## Note
///
/// Purged values may persist in cache for a short time after this function returns.
pub fn purge(host: &Host, key: impl Into<CacheKey>) -> Result<(), CacheError> {
    let opts = PurgeOptions {
        scope: host.config().default_purge_scope,
    };
    purge_with_opts(host, key, opts)
}

/// Purge the entry associated with the given cache key.
///
/// The [`PurgeOptions`] argument determines the scope of the purge operation.
///
/// ## Note
///
/// Purged values may persist in cache for a short time after this function returns.
///
/// ## Example global-scoped purge
///
/// ```no_run
/// # use edgecache::Host;
/// # use edgecache::cache::simple::*;
/// # fn f(host: Host) {
/// purge_with_opts(&host, "my_key", PurgeOptions::global_scope()).unwrap();
/// # }
/// ```
pub fn purge_with_opts(
    host: &Host,
    key: impl Into<CacheKey>,
    opts: PurgeOptions,
) -> Result<(), CacheError> {
    let surrogate_key =
        surrogate_key_for_cache_key(&key.into(), opts.scope, host.config().pop.as_deref());
    purge_surrogate_key(host, &surrogate_key).map_err(CacheError::Purge)
}

/// Create the surrogate key for the given cache key that the Simple Cache API purges with.
///
/// Each cache entry for the Simple Cache API is configured with the `Pop` and `Global` surrogate
/// keys from this function. Adding the same keys to items inserted via the [Core Cache API][core]
/// makes them purgeable with [`purge()`].
///
/// The key is the uppercase hex SHA-256 of the cache key. For the `Pop` scope it is salted with
/// `pop`; without a POP identifier the `Pop` key equals the `Global` key, so POP purges become
/// global.
pub fn surrogate_key_for_cache_key(key: &CacheKey, scope: PurgeScope, pop: Option<&str>) -> String {
    let mut sha = Sha256::new();
    sha.update(key);
    if let (PurgeScope::Pop, Some(pop)) = (scope, pop) {
        sha.update(pop.as_bytes());
    }
    sha.finalize().iter().map(|b| format!("{b:02X}")).collect()
}
