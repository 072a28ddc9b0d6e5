//! Configuration for a [`Host`][crate::Host].

use serde::Deserialize;

use crate::cache::simple::PurgeScope;

/// Settings shared by every cache operation run against a [`Host`][crate::Host].
///
/// The configuration can be built directly or deserialized; missing fields take their defaults:
///
/// ```
/// # use edgecache::CacheConfig;
/// # use edgecache::cache::simple::PurgeScope;
/// let config = CacheConfig::from_json(r#"{ "pop": "LCY" }"#).unwrap();
/// assert_eq!(config.pop.as_deref(), Some("LCY"));
/// assert_eq!(config.default_purge_scope, PurgeScope::Pop);
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Identifier of the point of presence this process serves.
    ///
    /// Simple cache entries are tagged with a surrogate key salted with this identifier, so that
    /// purges can be scoped to this POP. When unset, POP-scoped purges act globally.
    pub pop: Option<String>,
    /// The scope used by [`simple::purge()`][crate::cache::simple::purge()].
    pub default_purge_scope: PurgeScope,
}

impl CacheConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Set the POP identifier.
    pub fn with_pop(mut self, pop: impl Into<String>) -> Self {
        self.pop = Some(pop.into());
        self
    }

    /// Set the default purge scope.
    pub fn with_default_purge_scope(mut self, scope: PurgeScope) -> Self {
        self.default_purge_scope = scope;
        self
    }
}
