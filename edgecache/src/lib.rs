#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::invalid_codeblock_attributes)]

//! # Edge cache SDK.
//!
//! This crate exposes transactional cache primitives with request collapsing, streaming inserts,
//! revalidation and surrogate-key purging, plus two layers built on top of them: a key-value
//! [simple cache][cache::simple] and read-through [HTTP caching][http::cache].
//!
//! Every operation runs against a [`Host`], which bundles the cache storage and purge services
//! along with their configuration. The `edgecache-host` crate provides an in-memory host.
//!
//! All operations that may wait on other callers are `async` and expect a tokio runtime.

pub mod backend;
pub mod cache;
pub mod config;
pub mod convert;
pub mod error;
pub mod host;
pub mod http;
pub mod limits;

pub use crate::backend::Backend;
#[doc(inline)]
pub use crate::config::CacheConfig;
#[doc(inline)]
pub use crate::error::Error;
#[doc(inline)]
pub use crate::host::Host;
#[doc(inline)]
pub use crate::http::{Body, Request, Response};
