//! Surrogate-key purging.
//!
//! Purges are eventually consistent: objects carrying the key may still be served for a short
//! time after a purge call returns.
use edgecache_sys::purge::PurgeOptionsMask;

use anyhow::anyhow;

use crate::{Error, Host};

/// Purge a surrogate key, removing every cached object that carries it.
pub fn purge_surrogate_key(host: &Host, surrogate_key: &str) -> Result<(), Error> {
    purge_surrogate_key_impl(host, surrogate_key, false)
}

/// Soft-purge a surrogate key.
///
/// Objects carrying the key are marked stale rather than removed, so they can still be served
/// within their stale-while-revalidate period while they are revalidated.
pub fn soft_purge_surrogate_key(host: &Host, surrogate_key: &str) -> Result<(), Error> {
    purge_surrogate_key_impl(host, surrogate_key, true)
}

fn purge_surrogate_key_impl(host: &Host, surrogate_key: &str, soft: bool) -> Result<(), Error> {
    let mut options_mask = PurgeOptionsMask::empty();
    options_mask.set(PurgeOptionsMask::SOFT_PURGE, soft);
    tracing::debug!(surrogate_key, soft, "purging surrogate key");
    host.purge_service()
        .purge_surrogate_key(surrogate_key, options_mask)
        .map_err(|e| anyhow!("purge error: {:?}", e))
}
