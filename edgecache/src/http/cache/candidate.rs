use super::suggest::Suggestion;
use super::BodyTransform;
use crate::convert::{ToHeaderName, ToHeaderValue, ToStatusCode};
use crate::error::Error;
use crate::http::body::Body;
use bytes::Bytes;
use edgecache_shared::HttpStorageAction;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use std::fmt;
use std::time::Duration;

/// A backend response that has not been stored in the cache yet.
///
/// The `after_send` hook receives the candidate and may adjust how it is cached before the cache
/// commits to a storage decision. The initial caching policy is suggested by the response's
/// `Cache-Control`, `Surrogate-Control`, `Age`, `Vary` and `Surrogate-Key` headers, and by the
/// overrides set on the request.
///
/// ```
/// # use edgecache::Request;
/// let req = Request::get("https://example.com/").with_after_send(|candidate| {
///     if candidate.get_status().is_server_error() {
///         candidate.set_uncacheable();
///     } else {
///         candidate.set_ttl(std::time::Duration::from_secs(300));
///     }
///     Ok(())
/// });
/// ```
pub struct CandidateResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
    policy: Suggestion,
    body_transform: Option<BodyTransform>,
    found_stale: Option<bool>,
}

impl fmt::Debug for CandidateResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CandidateResponse {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Body,
        policy: Suggestion,
        found_stale: Option<bool>,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            policy,
            body_transform: None,
            found_stale,
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (StatusCode, HeaderMap, Body, Suggestion, Option<BodyTransform>) {
        (
            self.status,
            self.headers,
            self.body,
            self.policy,
            self.body_transform,
        )
    }

    /// Get the HTTP status code of the response.
    pub fn get_status(&self) -> StatusCode {
        self.status
    }

    /// Set the HTTP status code of the response.
    pub fn set_status(&mut self, status: impl ToStatusCode) {
        self.status = status.into_owned();
    }

    /// Get the value of a header, or `None` if the header is not present.
    pub fn get_header(&self, name: impl ToHeaderName) -> Option<&HeaderValue> {
        self.headers.get(name.into_owned())
    }

    /// Get the value of a header as a string, or `None` if the header is not present or is not
    /// valid UTF-8.
    pub fn get_header_str(&self, name: impl ToHeaderName) -> Option<&str> {
        self.get_header(name).and_then(|v| v.to_str().ok())
    }

    /// Set a response header to the given value, discarding any previous values for the given
    /// header name.
    pub fn set_header(&mut self, name: impl ToHeaderName, value: impl ToHeaderValue) {
        self.headers.insert(name.into_owned(), value.into_owned());
    }

    /// Add a response header with given value, keeping existing values.
    pub fn append_header(&mut self, name: impl ToHeaderName, value: impl ToHeaderValue) {
        self.headers.append(name.into_owned(), value.into_owned());
    }

    /// Remove all response headers of the given name, and return one of the removed header values
    /// if any were present.
    pub fn remove_header(&mut self, name: impl ToHeaderName) -> Option<HeaderValue> {
        self.headers.remove(name.into_owned())
    }

    /// Store the response in the cache.
    ///
    /// A `304 Not Modified` revalidation of a cached response stays an update of the cached
    /// response's metadata.
    pub fn set_cacheable(&mut self) {
        if self.policy.storage_action != HttpStorageAction::Update {
            self.policy.storage_action = HttpStorageAction::Insert;
        }
    }

    /// Do not store the response in the cache.
    ///
    /// Requests that were collapsed onto this one are released, and one of them fetches from the
    /// backend in turn.
    pub fn set_uncacheable(&mut self) {
        self.policy.storage_action = HttpStorageAction::DoNotStore;
    }

    /// Do not store the response in the cache, and stop collapsing requests for it.
    ///
    /// For the response's TTL (or two minutes if it has none), every request for the same cache
    /// key and variant fetches from the backend independently, running its own hooks.
    pub fn set_uncacheable_disable_collapsing(&mut self) {
        self.policy.storage_action = HttpStorageAction::RecordUncacheable;
    }

    /// Returns `true` if the response will be stored in the cache.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self.policy.storage_action,
            HttpStorageAction::Insert | HttpStorageAction::Update
        )
    }

    /// The storage decision the cache will apply to this response.
    pub fn get_storage_action(&self) -> HttpStorageAction {
        self.policy.storage_action
    }

    /// Returns `true` if this response revalidates a cached response that is stale.
    pub fn is_stale(&self) -> bool {
        self.found_stale.unwrap_or(false)
    }

    /// The age of the response, as reported by its `Age` header.
    pub fn get_age(&self) -> Duration {
        self.policy.age
    }

    /// The remaining time the response will be considered fresh.
    pub fn get_ttl(&self) -> Duration {
        self.policy.max_age.saturating_sub(self.policy.age)
    }

    /// Set the remaining time the response will be considered fresh.
    pub fn set_ttl(&mut self, ttl: Duration) {
        self.policy.max_age = ttl.saturating_add(self.policy.age);
    }

    /// The time for which the response can be served stale while it is revalidated.
    pub fn get_stale_while_revalidate(&self) -> Duration {
        self.policy.stale_while_revalidate
    }

    /// Set the time for which the response can be served stale while it is revalidated.
    pub fn set_stale_while_revalidate(&mut self, swr: Duration) {
        self.policy.stale_while_revalidate = swr;
    }

    /// Returns `true` if the response will be cached as sensitive data.
    pub fn get_pci(&self) -> bool {
        self.policy.pci
    }

    /// Set whether the response is cached as sensitive data.
    pub fn set_pci(&mut self, pci: bool) {
        self.policy.pci = pci;
    }

    /// The request headers the response varies on.
    pub fn get_vary(&self) -> &[HeaderName] {
        &self.policy.vary
    }

    /// Set the request headers the response varies on.
    ///
    /// Requests that differ in any of these headers are cached, and collapsed, separately.
    pub fn set_vary<'a>(&mut self, headers: impl IntoIterator<Item = &'a HeaderName>) {
        self.policy.vary = headers.into_iter().cloned().collect();
    }

    /// The surrogate keys the response will be stored with.
    pub fn get_surrogate_keys(&self) -> impl Iterator<Item = &str> {
        self.policy.surrogate_keys.iter().map(String::as_str)
    }

    /// Replace the surrogate keys the response will be stored with.
    pub fn set_surrogate_keys<'a>(&mut self, keys: impl IntoIterator<Item = &'a str>) {
        self.policy.surrogate_keys = keys.into_iter().map(str::to_owned).collect();
    }

    /// Install a transform applied to the response body, one chunk at a time, as it flows to the
    /// cache and to every request reading it.
    ///
    /// If the transform fails, the body ends with an error. For a cacheable response that error
    /// is seen by every reader of the shared body, and nothing is stored.
    ///
    /// ```
    /// # use edgecache::Request;
    /// let req = Request::get("https://example.com/").with_after_send(|candidate| {
    ///     candidate.set_body_transform(|chunk| Ok(chunk.to_ascii_uppercase().into()));
    ///     Ok(())
    /// });
    /// ```
    pub fn set_body_transform(
        &mut self,
        transform: impl FnMut(Bytes) -> Result<Bytes, Error> + Send + 'static,
    ) {
        self.body_transform = Some(Box::new(transform));
    }
}
