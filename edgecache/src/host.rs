//! The services cache operations run against.

use std::fmt;
use std::sync::Arc;

use edgecache_sys::cache::CacheStore;
use edgecache_sys::purge::PurgeService;

use crate::config::CacheConfig;

/// A handle onto the cache storage and purge services, plus their configuration.
///
/// `Host` is cheap to clone; clones share the same services.
///
/// ```
/// # use std::sync::Arc;
/// # use edgecache::{CacheConfig, Host};
/// # use edgecache_host::MemoryCache;
/// let host = Host::from_store(Arc::new(MemoryCache::new()))
///     .with_config(CacheConfig::default().with_pop("LCY"));
/// assert_eq!(host.config().pop.as_deref(), Some("LCY"));
/// ```
#[derive(Clone)]
pub struct Host {
    store: Arc<dyn CacheStore>,
    purge: Arc<dyn PurgeService>,
    config: Arc<CacheConfig>,
}

impl Host {
    /// Create a host from separate storage and purge services.
    pub fn new(store: Arc<dyn CacheStore>, purge: Arc<dyn PurgeService>) -> Self {
        Host {
            store,
            purge,
            config: Arc::new(CacheConfig::default()),
        }
    }

    /// Create a host from a single service providing both storage and purging.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: CacheStore + PurgeService + 'static,
    {
        let purge: Arc<dyn PurgeService> = store.clone();
        Host::new(store, purge)
    }

    /// Replace the configuration of this host.
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// The configuration of this host.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn CacheStore {
        self.store.as_ref()
    }

    pub(crate) fn purge_service(&self) -> &dyn PurgeService {
        self.purge.as_ref()
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
