//! HTTP types and read-through caching of backend requests.
//!
//! The [`Request`], [`Response`] and [`Body`] types mirror the [`http`][::http] crate's, and
//! convert to and from them. [`Request::send()`] reads the request through the cache; see the
//! [`cache`] module.

pub mod body;
pub mod cache;
pub mod purge;
pub mod request;
pub mod response;

pub use ::http::header::{self, HeaderMap, HeaderName, HeaderValue};
pub use ::http::{Method, StatusCode, Uri};

#[doc(inline)]
pub use self::body::{Body, StreamingBody};
#[doc(inline)]
pub use self::cache::CandidateResponse;
#[doc(inline)]
pub use self::request::Request;
#[doc(inline)]
pub use self::response::Response;
