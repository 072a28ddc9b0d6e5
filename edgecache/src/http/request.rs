//! HTTP requests.

use super::body::Body;
use super::cache::{self, AfterSendHook, BeforeSendHook, CacheOptions, CandidateResponse};
use super::response::Response;
use crate::backend::Backend;
use crate::cache::core::CacheError;
use crate::convert::{ToHeaderName, ToHeaderValue, ToMethod, ToUri};
use crate::error::{ensure, Error};
use crate::Host;
use bytes::Bytes;
use edgecache_shared::HTTP_CACHE_OVERRIDE_KEY_LEN;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use std::sync::Arc;
use thiserror::Error;

/// An HTTP request, including body, headers, method, and URI.
///
/// # Creation
///
/// New requests can be created programmatically with [`Request::new()`]. In addition, there are
/// convenience constructors like [`Request::get()`] which automatically select the appropriate
/// method.
///
/// # Sending backend requests
///
/// Requests are sent to a [`Backend`] with [`send()`][`Self::send()`], which reads through the
/// cache for `GET` and `HEAD` requests. The caching behavior can be tuned per request, for example
/// with [`set_ttl()`][`Self::set_ttl()`], [`set_pass()`][`Self::set_pass()`], or the
/// [`before_send`][`Self::set_before_send()`] and [`after_send`][`Self::set_after_send()`] hooks.
///
/// # Builder-style methods
///
/// Methods with the `with_` name prefix, such as [`with_header()`][`Self::with_header()`], return
/// `Self` to allow chaining. Setter methods, such as [`set_header()`][`Self::set_header()`], can be
/// used interchangeably with them:
///
/// ```
/// # use edgecache::Request;
/// # let needs_translation = true;
/// let mut req = Request::get("https://example.com").with_header("my-header", "hello!");
/// if needs_translation {
///     req.set_header("accept-language", "fr");
/// }
/// assert_eq!(req.get_header_str("accept-language"), Some("fr"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Body>,
    pub(crate) cache_options: CacheOptions,
}

impl Request {
    /// Create a new request with the given method and URI, no headers, and an empty body.
    ///
    /// # Argument type conversion
    ///
    /// The method and URI arguments use the [`ToMethod`] and [`ToUri`] traits to convert from
    /// common string types; both panic if the string is invalid.
    pub fn new(method: impl ToMethod, uri: impl ToUri) -> Self {
        Self {
            method: method.into_owned(),
            uri: uri.into_owned(),
            headers: HeaderMap::new(),
            body: None,
            cache_options: CacheOptions::default(),
        }
    }

    /// Create a new `GET` [`Request`] with the given URI, no headers, and an empty body.
    pub fn get(uri: impl ToUri) -> Self {
        Self::new(Method::GET, uri)
    }

    /// Create a new `HEAD` [`Request`] with the given URI, no headers, and an empty body.
    pub fn head(uri: impl ToUri) -> Self {
        Self::new(Method::HEAD, uri)
    }

    /// Create a new `POST` [`Request`] with the given URI, no headers, and an empty body.
    pub fn post(uri: impl ToUri) -> Self {
        Self::new(Method::POST, uri)
    }

    /// Create a new `PUT` [`Request`] with the given URI, no headers, and an empty body.
    pub fn put(uri: impl ToUri) -> Self {
        Self::new(Method::PUT, uri)
    }

    /// Send the request to the given backend, and return once the response headers are
    /// available, or an error occurs.
    ///
    /// `GET` and `HEAD` requests read through the cache of `host`: a usable cached response is
    /// returned without contacting the backend, and concurrent requests for the same uncached
    /// response are collapsed into a single backend fetch. Other methods, and requests with
    /// [`pass`][`Self::set_pass()`] set, go straight to the backend.
    ///
    /// ```no_run
    /// # use edgecache::{backend::Backend, Host, Request};
    /// # async fn f(host: Host, backend: Backend) -> Result<(), edgecache::Error> {
    /// let resp = Request::get("https://example.com/")
    ///     .with_ttl(60)
    ///     .send(&host, &backend)
    ///     .await?;
    /// if resp.is_from_cache() {
    ///     println!("served from cache");
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn send(self, host: &Host, backend: &Backend) -> Result<Response, SendError> {
        validate_request(&self)
            .map_err(|e| SendError::new(backend.name(), SendErrorCause::InvalidRequest(e)))?;
        cache::send(self, host, backend)
            .await
            .map_err(|cause| SendError::new(backend.name(), cause))
    }

    /// Builder-style equivalent of [`set_body()`][`Self::set_body()`].
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.set_body(body);
        self
    }

    /// Returns `true` if this request has a body.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Get a mutable reference to the body of this request.
    ///
    /// An empty body is inserted if the request does not have one.
    pub fn get_body_mut(&mut self) -> &mut Body {
        self.body.get_or_insert_with(Body::new)
    }

    /// Set the given value as the request's body.
    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = Some(body.into());
    }

    /// Take and return the body from this request.
    ///
    /// After calling this method, this request will no longer have a body.
    pub fn take_body(&mut self) -> Body {
        self.body.take().unwrap_or_else(Body::new)
    }

    /// Consume the request and return its body.
    pub fn into_body(self) -> Body {
        self.body.unwrap_or_else(Body::new)
    }

    /// Returns whether the given header name is present in the request.
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
    pub fn get_header_str(&self, name: impl ToHeaderName) -> Option<&str> {
        self.get_header(name).and_then(|v| v.to_str().ok())
    }

    /// Get the value of a header, or `None` if the header is not present.
    pub fn get_header(&self, name: impl ToHeaderName) -> Option<&HeaderValue> {
        self.headers.get(name.into_owned())
    }

    /// Get an iterator of all the values of a header.
    pub fn get_header_all(&self, name: impl ToHeaderName) -> impl Iterator<Item = &HeaderValue> {
        self.headers.get_all(name.into_owned()).into_iter()
    }

    /// Get an iterator of all the request's header names and values.
    pub fn get_headers(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.headers.iter()
    }

    pub(crate) fn header_map(&self) -> &HeaderMap {
        &self.headers
    }

    /// Set a request header to the given value, discarding any previous values for the given
    /// header name.
    pub fn set_header(&mut self, name: impl ToHeaderName, value: impl ToHeaderValue) {
        self.headers.insert(name.into_owned(), value.into_owned());
    }

    /// Add a request header with given value.
    ///
    /// Unlike [`set_header()`][`Self::set_header()`], this does not discard existing values for
    /// the same header name.
    pub fn append_header(&mut self, name: impl ToHeaderName, value: impl ToHeaderValue) {
        self.headers.append(name.into_owned(), value.into_owned());
    }

    /// Remove all request headers of the given name, and return one of the removed header values
    /// if any were present.
    pub fn remove_header(&mut self, name: impl ToHeaderName) -> Option<HeaderValue> {
        self.headers.remove(name.into_owned())
    }

    /// Builder-style equivalent of [`set_method()`][`Self::set_method()`].
    pub fn with_method(mut self, method: impl ToMethod) -> Self {
        self.set_method(method);
        self
    }

    /// Get the request method.
    pub fn get_method(&self) -> &Method {
        &self.method
    }

    /// Set the request method.
    pub fn set_method(&mut self, method: impl ToMethod) {
        self.method = method.into_owned();
    }

    /// Builder-style equivalent of [`set_uri()`][`Self::set_uri()`].
    pub fn with_uri(mut self, uri: impl ToUri) -> Self {
        self.set_uri(uri);
        self
    }

    /// Get the request URI.
    pub fn get_uri(&self) -> &Uri {
        &self.uri
    }

    /// Set the request URI.
    pub fn set_uri(&mut self, uri: impl ToUri) {
        self.uri = uri.into_owned();
    }

    /// Builder-style equivalent of [`set_pass()`][`Self::set_pass()`].
    pub fn with_pass(mut self, pass: bool) -> Self {
        self.set_pass(pass);
        self
    }

    /// Set whether this request should bypass the cache when sent to a backend.
    ///
    /// By default this is `false`, which means the backend will only be reached if a cached
    /// response is not available. Set this to `true` to send the request directly to the backend
    /// without caching.
    ///
    /// # Overrides
    ///
    /// Setting this to `true` overrides any other custom caching behaviors for this request, such
    /// as [`Request::set_ttl()`] or [`Request::set_surrogate_key()`], and the
    /// [`before_send`][`Self::set_before_send()`] and [`after_send`][`Self::set_after_send()`]
    /// hooks do not run.
    pub fn set_pass(&mut self, pass: bool) {
        self.cache_options.cache_override.set_pass(pass);
    }

    /// Builder-style equivalent of [`set_ttl()`][`Self::set_ttl()`].
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.set_ttl(ttl);
        self
    }

    /// Override the caching behavior of this request to use the given Time to Live (TTL), in seconds.
    ///
    /// # Overrides
    ///
    /// This overrides the behavior specified in the response headers, and sets the
    /// [`pass`][`Self::set_pass()`] behavior to `false`.
    pub fn set_ttl(&mut self, ttl: u32) {
        self.cache_options.cache_override.set_ttl(ttl);
    }

    /// Builder-style equivalent of [`set_stale_while_revalidate()`][`Self::set_stale_while_revalidate()`].
    pub fn with_stale_while_revalidate(mut self, swr: u32) -> Self {
        self.set_stale_while_revalidate(swr);
        self
    }

    /// Override the caching behavior of this request to use the given `stale-while-revalidate`
    /// time, in seconds.
    ///
    /// # Overrides
    ///
    /// This overrides the behavior specified in the response headers, and sets the
    /// [`pass`][`Self::set_pass()`] behavior to `false`.
    pub fn set_stale_while_revalidate(&mut self, swr: u32) {
        self.cache_options
            .cache_override
            .set_stale_while_revalidate(swr);
    }

    /// Builder-style equivalent of [`set_pci()`][`Self::set_pci()`].
    pub fn with_pci(mut self, pci: bool) -> Self {
        self.set_pci(pci);
        self
    }

    /// Override the caching behavior of this request to mark the response as sensitive, restricting
    /// it to compliant storage.
    ///
    /// # Overrides
    ///
    /// This sets the [`pass`][`Self::set_pass()`] behavior to `false`.
    pub fn set_pci(&mut self, pci: bool) {
        self.cache_options.cache_override.set_pci(pci);
    }

    /// Builder-style equivalent of [`set_surrogate_key()`][`Self::set_surrogate_key()`].
    pub fn with_surrogate_key(mut self, sk: HeaderValue) -> Self {
        self.set_surrogate_key(sk);
        self
    }

    /// Override the caching behavior of this request to include the given surrogate key(s),
    /// provided as a header value.
    ///
    /// The header value can contain more than one surrogate key, separated by spaces.
    ///
    /// Surrogate keys must contain only printable ASCII characters (those between `0x21` and
    /// `0x7E`, inclusive). Any invalid keys will be ignored.
    ///
    /// # Overrides
    ///
    /// This sets the [`pass`][`Self::set_pass()`] behavior to `false`, and extends (but does not
    /// replace) any `Surrogate-Key` response headers from the backend.
    pub fn set_surrogate_key(&mut self, sk: HeaderValue) {
        self.cache_options.cache_override.set_surrogate_key(sk);
    }

    /// Builder-style equivalent of [`set_cache_key()`][`Self::set_cache_key()`].
    pub fn with_cache_key(mut self, key: impl Into<Bytes>) -> Result<Self, CacheError> {
        self.set_cache_key(key)?;
        Ok(self)
    }

    /// Set the cache key used to look up and store the response of this request, instead of the
    /// key derived from its URI.
    ///
    /// The key must be exactly 32 bytes long, such as a SHA-256 digest; other lengths fail with
    /// [`CacheError::InvalidArgument`].
    pub fn set_cache_key(&mut self, key: impl Into<Bytes>) -> Result<(), CacheError> {
        let key = key.into();
        if key.len() != HTTP_CACHE_OVERRIDE_KEY_LEN {
            return Err(CacheError::InvalidArgument);
        }
        self.cache_options.override_key = Some(key);
        Ok(())
    }

    /// Builder-style equivalent of [`set_before_send()`][`Self::set_before_send()`].
    pub fn with_before_send(
        mut self,
        hook: impl Fn(&mut Request) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Self {
        self.set_before_send(hook);
        self
    }

    /// Set a hook that runs just before the request is sent to the backend on a cache miss.
    ///
    /// The hook can modify the outgoing request, for example to add authorization headers that
    /// should not be sent for cache hits. When concurrent requests are collapsed, it runs once, for
    /// the request that performs the fetch. An error from the hook fails that request and every
    /// request collapsed onto it.
    pub fn set_before_send(
        &mut self,
        hook: impl Fn(&mut Request) -> Result<(), Error> + Send + Sync + 'static,
    ) {
        let hook: BeforeSendHook = Arc::new(hook);
        self.cache_options.before_send = Some(hook);
    }

    /// Builder-style equivalent of [`set_after_send()`][`Self::set_after_send()`].
    pub fn with_after_send(
        mut self,
        hook: impl Fn(&mut CandidateResponse) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Self {
        self.set_after_send(hook);
        self
    }

    /// Set a hook that runs on the backend response before it is stored in the cache.
    ///
    /// The hook receives a [`CandidateResponse`] and may change its status, headers, and caching
    /// policy, or install a body transform. Like the `before_send` hook, it runs once per collapsed
    /// fetch, and its error is shared by every request collapsed onto the fetch.
    pub fn set_after_send(
        &mut self,
        hook: impl Fn(&mut CandidateResponse) -> Result<(), Error> + Send + Sync + 'static,
    ) {
        let hook: AfterSendHook = Arc::new(hook);
        self.cache_options.after_send = Some(hook);
    }
}

impl From<http::Request<Body>> for Request {
    fn from(from: http::Request<Body>) -> Self {
        let (parts, body) = from.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body: Some(body),
            cache_options: CacheOptions::default(),
        }
    }
}

/// The reason a [`SendError`] occurred.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SendErrorCause {
    /// The request was not suitable for sending to a backend.
    #[error("invalid request: {0}")]
    InvalidRequest(#[source] Error),
    /// A cache operation failed.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    /// The backend fetch failed.
    #[error("backend error: {0}")]
    Backend(#[source] Error),
    /// The `before_send` hook returned an error.
    #[error("before_send hook error: {0}")]
    BeforeSend(#[source] Error),
    /// The `after_send` hook returned an error.
    #[error("after_send hook error: {0}")]
    AfterSend(#[source] Error),
    /// This request was collapsed onto a fetch for another request, and that fetch failed.
    #[error("collapsed request failed: {0}")]
    Collapsed(Arc<str>),
    /// The cached response head could not be encoded or decoded.
    #[error("cached response metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// An error that occurred while sending a request.
///
/// Use [`SendError::root_cause()`] to inspect details about what caused the error.
#[derive(Debug, Error)]
#[error("error sending request: {error} to backend {backend}")]
pub struct SendError {
    backend: String,
    #[source]
    error: SendErrorCause,
}

impl SendError {
    pub(crate) fn new(backend: impl Into<String>, error: SendErrorCause) -> Self {
        SendError {
            backend: backend.into(),
            error,
        }
    }

    /// Get the name of the backend the request was sent to.
    pub fn backend_name(&self) -> &str {
        self.backend.as_str()
    }

    /// Get the underlying cause of this `SendError`.
    pub fn root_cause(&self) -> &SendErrorCause {
        &self.error
    }
}

/// Check whether a request looks suitable for sending to a backend.
fn validate_request(req: &Request) -> Result<(), Error> {
    let scheme_ok = req
        .uri
        .scheme_str()
        .map_or(false, |s| s.eq_ignore_ascii_case("http") || s.eq_ignore_ascii_case("https"));
    ensure!(
        scheme_ok && req.uri.authority().is_some(),
        "request URIs must have a scheme (http/https) and an authority (host)"
    );
    Ok(())
}
