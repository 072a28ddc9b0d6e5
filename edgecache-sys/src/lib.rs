//! Host interface for the edge cache transaction core.
//!
//! This is a low-level package; the [`edgecache`](../edgecache/index.html) crate wraps these
//! traits in a much friendlier interface. A host (for example the in-memory store in
//! `edgecache-host`) implements [`cache::CacheStore`], [`cache::CacheEntry`] and
//! [`purge::PurgeService`]; body bytes cross the boundary through [`body::BodyReader`] and
//! [`body::BodyWriter`].
//!
//! Every fallible operation reports a [`CacheStatus`] rather than a rich error type, so that the
//! mapping onto user-facing errors lives in one place on the guest side.
pub use edgecache_shared::CacheStatus;

pub mod body;
pub mod cache;
pub mod purge;
