//! Backend servers.
//!
//! A [`Backend`] names an [`Origin`]: the service the HTTP cache fetches from on a miss.
use crate::http::{Request, Response};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// The maximum length in characters of a backend name.
pub(crate) const MAX_BACKEND_NAME_LEN: usize = 255;

/// The server a [`Backend`] sends requests to.
///
/// Implementations perform the actual fetch, for example over an HTTP client, or return canned
/// responses in tests.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Send `req` to the origin and return its response.
    async fn fetch(&self, req: Request) -> Result<Response, anyhow::Error>;
}

/// A named backend.
///
/// This represents an origin that we can send requests to, potentially caching the responses
/// received. To use a backend, pass it to [`Request::send()`][crate::Request::send()].
///
/// ```no_run
/// # use std::sync::Arc;
/// # use edgecache::backend::{Backend, Origin};
/// # use edgecache::{Host, Request, Response};
/// struct Static;
///
/// #[async_trait::async_trait]
/// impl Origin for Static {
///     async fn fetch(&self, _req: Request) -> Result<Response, anyhow::Error> {
///         Ok(Response::from_body("hello"))
///     }
/// }
///
/// # async fn f(host: Host) -> Result<(), Box<dyn std::error::Error>> {
/// let backend = Backend::new("static_origin", Arc::new(Static))?;
/// let resp = Request::get("http://example.org/").send(&host, &backend).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Backend {
    name: String,
    origin: Arc<dyn Origin>,
}

impl Backend {
    /// Create a backend with the given name, sending requests to `origin`.
    ///
    /// This function will return a [`BackendError`] if an invalid name was given.
    ///
    /// Backend names:
    ///   * cannot be empty
    ///   * cannot be longer than 255 characters
    ///   * cannot contain ASCII control characters such as `'\n'` or `DELETE`.
    ///   * cannot contain special Unicode characters
    ///   * should only contain visible ASCII characters or spaces
    pub fn new(name: &str, origin: Arc<dyn Origin>) -> Result<Self, BackendError> {
        validate_backend(name)?;
        Ok(Backend {
            name: name.to_owned(),
            origin,
        })
    }

    /// Get the name of this backend.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub(crate) async fn fetch(&self, req: Request) -> Result<Response, anyhow::Error> {
        tracing::debug!(backend = %self.name, "fetching from origin");
        self.origin.fetch(req).await
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_str())
    }
}

/// [`Backend`]-related errors.
#[derive(Copy, Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend name was empty.
    #[error("an empty string is not a valid backend")]
    EmptyName,
    /// The backend name was too long.
    #[error("backend names must be <= 255 characters")]
    TooLong,
    /// The backend name contained invalid characters.
    #[error("backend names must only contain visible ASCII characters or spaces")]
    InvalidName,
}

/// Validate that a string looks like an acceptable [`Backend`] name.
///
/// This function will return a [`BackendError`] if an invalid name was given. The naming rules are
/// listed on [`Backend::new()`].
pub fn validate_backend(backend: &str) -> Result<(), BackendError> {
    if backend.is_empty() {
        Err(BackendError::EmptyName)
    } else if backend.len() > MAX_BACKEND_NAME_LEN {
        Err(BackendError::TooLong)
    } else if backend.chars().any(is_invalid_char) {
        Err(BackendError::InvalidName)
    } else {
        Ok(())
    }
}

#[inline]
fn is_invalid_char(c: char) -> bool {
    c != ' ' && !c.is_ascii_graphic()
}
