//! HTTP responses.

use super::body::Body;
use crate::convert::{ToHeaderName, ToHeaderValue, ToStatusCode};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use std::io;
use std::time::Duration;

/// An HTTP response, including body, headers, and status code.
///
/// # Creation
///
/// Responses can be created programmatically, typically by an
/// [`Origin`][crate::backend::Origin]:
///
/// - [`Response::new()`]
/// - [`Response::from_body()`]
/// - [`Response::from_status()`]
///
/// Responses are also returned from [`Request::send()`][crate::Request::send()], in which case
/// they carry information about how the cache handled them; see [`Response::is_from_cache()`].
///
/// # Builder-style methods
///
/// Methods with the `with_` name prefix, such as [`with_header()`][`Self::with_header()`], return
/// `Self` to allow chaining:
///
/// ```
/// # use edgecache::Response;
/// let resp = Response::from_body("hello")
///     .with_status(201)
///     .with_header("my-header", "hello!");
/// assert_eq!(resp.get_header_str("my-header"), Some("hello!"));
/// ```
///
/// # Setter methods
///
/// Setter methods, such as [`set_header()`][`Self::set_header()`], are prefixed by `set_`, and can
/// be used interchangeably with the builder-style methods.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<Body>,
    cache_info: Option<CacheInfo>,
}

/// How the cache handled a response returned from `Request::send()`.
#[derive(Clone, Debug, Default)]
pub(crate) struct CacheInfo {
    pub(crate) from_cache: bool,
    pub(crate) hits: u64,
    pub(crate) ttl: Duration,
    pub(crate) age: Duration,
    pub(crate) stale_while_revalidate: Duration,
    pub(crate) vary: String,
    pub(crate) surrogate_keys: Vec<String>,
    pub(crate) sensitive: bool,
}

impl Response {
    /// Create a new [`Response`].
    ///
    /// The new response is created with status code `200 OK`, no headers, and an empty body.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: None,
            cache_info: None,
        }
    }

    /// Create a new `200 OK` [`Response`] with the given value as the body.
    pub fn from_body(body: impl Into<Body>) -> Self {
        Self::new().with_body(body)
    }

    /// Create a new response with the given status code.
    pub fn from_status(status: impl ToStatusCode) -> Self {
        Self::new().with_status(status)
    }

    pub(crate) fn from_parts(status: StatusCode, headers: HeaderMap, body: Body) -> Self {
        Self {
            status,
            headers,
            body: Some(body),
            cache_info: None,
        }
    }

    pub(crate) fn into_parts(mut self) -> (StatusCode, HeaderMap, Body) {
        let body = self.take_body();
        (self.status, self.headers, body)
    }

    /// Builder-style equivalent of [`set_body()`][`Self::set_body()`].
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.set_body(body);
        self
    }

    /// Returns `true` if this response has a body.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Get a mutable reference to the body of this response.
    ///
    /// An empty body is inserted if the response does not have one.
    pub fn get_body_mut(&mut self) -> &mut Body {
        self.body.get_or_insert_with(Body::new)
    }

    /// Set the given value as the response's body.
    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = Some(body.into());
    }

    /// Take and return the body from this response.
    ///
    /// After calling this method, this response will no longer have a body.
    pub fn take_body(&mut self) -> Body {
        self.body.take().unwrap_or_else(Body::new)
    }

    /// Append another [`Body`] to the body of this response.
    pub fn append_body(&mut self, other: Body) {
        self.get_body_mut().append(other);
    }

    /// Consume the response and return its body.
    pub fn into_body(self) -> Body {
        self.body.unwrap_or_else(Body::new)
    }

    /// Consume the response and read its entire body into a byte vector.
    ///
    /// Reading a body that streams out of the cache fails if the insertion feeding it was
    /// abandoned.
    pub async fn into_body_bytes(self) -> io::Result<Vec<u8>> {
        self.into_body().into_bytes().await
    }

    /// Consume the response and read its entire body into a `String`.
    ///
    /// Fails with [`io::ErrorKind::InvalidData`] if the body is not valid UTF-8.
    pub async fn into_body_str(self) -> io::Result<String> {
        self.into_body().into_string().await
    }

    /// Returns whether the given header name is present in the response.
    pub fn contains_header(&self, name: impl ToHeaderName) -> bool {
        self.headers.contains_key(name.into_owned())
    }

    /// Builder-style equivalent of [`append_header()`][`Self::append_header()`].
    pub fn with_header(mut self, name: impl ToHeaderName, value: impl ToHeaderValue) -> Self {
        self.append_header(name, value);
        self
    }

    /// Builder-style equivalent of [`set_header()`][`Self::set_header()`].
    pub fn with_set_header(mut self, name: impl ToHeaderName, value: impl ToHeaderValue) -> Self {
        self.set_header(name, value);
        self
    }

    /// Get the value of a header as a string, or `None` if the header is not present or is not
    /// valid UTF-8.
    ///
    /// If there are multiple values for the header, only one is returned.
    pub fn get_header_str(&self, name: impl ToHeaderName) -> Option<&str> {
        self.get_header(name).and_then(|v| v.to_str().ok())
    }

    /// Get the value of a header, or `None` if the header is not present.
    ///
    /// If there are multiple values for the header, only one is returned.
    pub fn get_header(&self, name: impl ToHeaderName) -> Option<&HeaderValue> {
        self.headers.get(name.into_owned())
    }

    /// Get an iterator of all the values of a header.
    pub fn get_header_all(&self, name: impl ToHeaderName) -> impl Iterator<Item = &HeaderValue> {
        self.headers.get_all(name.into_owned()).into_iter()
    }

    /// Get an iterator of all the response's header names and values.
    pub fn get_headers(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.headers.iter()
    }

    /// Get all of the response's header names.
    pub fn get_header_names(&self) -> impl Iterator<Item = &HeaderName> {
        self.headers.keys()
    }

    /// Set a response header to the given value, discarding any previous values for the given
    /// header name.
    pub fn set_header(&mut self, name: impl ToHeaderName, value: impl ToHeaderValue) {
        self.headers.insert(name.into_owned(), value.into_owned());
    }

    /// Add a response header with given value.
    ///
    /// Unlike [`set_header()`][`Self::set_header()`], this does not discard existing values for
    /// the same header name.
    pub fn append_header(&mut self, name: impl ToHeaderName, value: impl ToHeaderValue) {
        self.headers.append(name.into_owned(), value.into_owned());
    }

    /// Remove all response headers of the given name, and return one of the removed header values
    /// if any were present.
    pub fn remove_header(&mut self, name: impl ToHeaderName) -> Option<HeaderValue> {
        self.headers.remove(name.into_owned())
    }

    /// Builder-style equivalent of [`set_status()`][`Self::set_status()`].
    pub fn with_status(mut self, status: impl ToStatusCode) -> Self {
        self.set_status(status);
        self
    }

    /// Get the HTTP status code of the response.
    pub fn get_status(&self) -> StatusCode {
        self.status
    }

    /// Set the HTTP status code of the response.
    pub fn set_status(&mut self, status: impl ToStatusCode) {
        self.status = status.into_owned();
    }

    pub(crate) fn set_cache_info(&mut self, info: CacheInfo) {
        self.cache_info = Some(info);
    }

    /// Returns `true` if this response was served from the cache rather than produced for this
    /// request by a backend fetch.
    ///
    /// Among requests collapsed onto the same fetch, only the one that performed the fetch gets
    /// `false`.
    pub fn is_from_cache(&self) -> bool {
        self.cache_info.as_ref().map_or(false, |info| info.from_cache)
    }

    /// The number of cache hits of the cached object, if the response passed through the cache.
    pub fn get_hits(&self) -> Option<u64> {
        self.cache_info.as_ref().map(|info| info.hits)
    }

    /// The remaining time the response is considered fresh, if the response passed through the
    /// cache.
    pub fn get_ttl(&self) -> Option<Duration> {
        self.cache_info
            .as_ref()
            .map(|info| info.ttl.saturating_sub(info.age))
    }

    /// The age of the response, if the response passed through the cache.
    pub fn get_age(&self) -> Option<Duration> {
        self.cache_info.as_ref().map(|info| info.age)
    }

    /// The stale-while-revalidate period of the response, if the response passed through the
    /// cache.
    pub fn get_stale_while_revalidate(&self) -> Option<Duration> {
        self.cache_info
            .as_ref()
            .map(|info| info.stale_while_revalidate)
    }

    /// The space-separated request headers the cached response varies on, if the response passed
    /// through the cache.
    pub fn get_vary(&self) -> Option<&str> {
        self.cache_info.as_ref().map(|info| info.vary.as_str())
    }

    /// The surrogate keys of the cached response, if the response passed through the cache.
    pub fn get_surrogate_keys(&self) -> Option<impl Iterator<Item = &str>> {
        self.cache_info
            .as_ref()
            .map(|info| info.surrogate_keys.iter().map(String::as_str))
    }

    /// Returns `true` if the response was cached as sensitive data.
    pub fn is_sensitive(&self) -> bool {
        self.cache_info.as_ref().map_or(false, |info| info.sensitive)
    }
}

impl From<http::Response<Body>> for Response {
    fn from(from: http::Response<Body>) -> Self {
        let (parts, body) = from.into_parts();
        Response::from_parts(parts.status, parts.headers, body)
    }
}

impl From<Response> for http::Response<Body> {
    fn from(from: Response) -> Self {
        let (status, headers, body) = from.into_parts();
        let mut resp = http::Response::new(body);
        *resp.status_mut() = status;
        *resp.headers_mut() = headers;
        resp
    }
}
