//! Automatically enforced limits for cache writes.
//!
//! These limits are checked before a lookup or insertion reaches the cache host. Exceeding one
//! fails the operation with [`CacheError::LimitExceeded`][crate::cache::core::CacheError].
//!
//! # Examples
//!
//! **Allowing larger user metadata**
//!
//! ```
//! use edgecache::limits::CacheLimits;
//! CacheLimits::set_max_user_metadata_bytes(Some(64 * 1024));
//! assert_eq!(CacheLimits::get_max_user_metadata_bytes(), Some(64 * 1024));
//! # CacheLimits::set_all_default();
//! ```
use edgecache_shared::MAX_CACHE_KEY_LEN;
use lazy_static::lazy_static;
use std::sync::{PoisonError, RwLock};

/// The default cache key size limit for [`CacheLimits`].
pub const DEFAULT_MAX_CACHE_KEY_BYTES: usize = MAX_CACHE_KEY_LEN;
/// The default user metadata size limit for [`CacheLimits`].
pub const DEFAULT_MAX_USER_METADATA_BYTES: usize = 16 * 1024;
/// The default limit on the combined size of an object's surrogate keys.
pub const DEFAULT_MAX_SURROGATE_KEYS_BYTES: usize = 16 * 1024;

lazy_static! {
    pub(crate) static ref CACHE_LIMITS: RwLock<CacheLimits> = RwLock::new(CacheLimits::default());
}

/// The limits for cache keys and object metadata.
///
/// The cache key limit can be lowered but never raised above [`DEFAULT_MAX_CACHE_KEY_BYTES`], which
/// the host enforces on its own.
///
/// # Default values
///
/// | Limit                 | Default value                        |
/// |-----------------------|--------------------------------------|
/// | Cache key size        | [`DEFAULT_MAX_CACHE_KEY_BYTES`]      |
/// | User metadata size    | [`DEFAULT_MAX_USER_METADATA_BYTES`]  |
/// | Surrogate keys size   | [`DEFAULT_MAX_SURROGATE_KEYS_BYTES`] |
#[derive(Clone, Copy, Debug)]
pub struct CacheLimits {
    pub(crate) max_cache_key_bytes: usize,
    pub(crate) max_user_metadata_bytes: Option<usize>,
    pub(crate) max_surrogate_keys_bytes: Option<usize>,
}

impl CacheLimits {
    const fn default() -> Self {
        CacheLimits {
            max_cache_key_bytes: DEFAULT_MAX_CACHE_KEY_BYTES,
            max_user_metadata_bytes: Some(DEFAULT_MAX_USER_METADATA_BYTES),
            max_surrogate_keys_bytes: Some(DEFAULT_MAX_SURROGATE_KEYS_BYTES),
        }
    }

    pub(crate) fn current() -> Self {
        *CACHE_LIMITS.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(f: impl FnOnce(&mut CacheLimits)) {
        f(&mut CACHE_LIMITS.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Set all cache limits to their default values.
    pub fn set_all_default() {
        Self::update(|limits| *limits = CacheLimits::default());
    }

    /// Get the current cache key size limit.
    pub fn get_max_cache_key_bytes() -> usize {
        Self::current().max_cache_key_bytes
    }

    /// Set the cache key size limit. Values above [`DEFAULT_MAX_CACHE_KEY_BYTES`] are clamped.
    pub fn set_max_cache_key_bytes(max: usize) {
        Self::update(|limits| limits.max_cache_key_bytes = max.min(DEFAULT_MAX_CACHE_KEY_BYTES));
    }

    /// Get the current user metadata size limit.
    pub fn get_max_user_metadata_bytes() -> Option<usize> {
        Self::current().max_user_metadata_bytes
    }

    /// Set the user metadata size limit.
    pub fn set_max_user_metadata_bytes(max: Option<usize>) {
        Self::update(|limits| limits.max_user_metadata_bytes = max);
    }

    /// Get the current surrogate keys size limit.
    pub fn get_max_surrogate_keys_bytes() -> Option<usize> {
        Self::current().max_surrogate_keys_bytes
    }

    /// Set the surrogate keys size limit.
    pub fn set_max_surrogate_keys_bytes(max: Option<usize>) {
        Self::update(|limits| limits.max_surrogate_keys_bytes = max);
    }

    pub(crate) fn allows_key(&self, len: usize) -> bool {
        len <= self.max_cache_key_bytes
    }

    pub(crate) fn allows_user_metadata(&self, len: usize) -> bool {
        self.max_user_metadata_bytes.map_or(true, |max| len <= max)
    }

    pub(crate) fn allows_surrogate_keys(&self, len: usize) -> bool {
        self.max_surrogate_keys_bytes.map_or(true, |max| len <= max)
    }
}
