//! Cache APIs.
//!
//! The cache is exposed through three interfaces, each built on the one below it:
//!
//! ## Read-through HTTP caching
//!
//! [`Request::send()`][crate::Request::send()] reads HTTP requests through the cache. A backend
//! response is cached and reused for later requests if it meets cacheability requirements, and
//! concurrent requests for the same response are collapsed onto a single backend fetch. Caching can
//! be tuned per request with methods like [`Request::set_ttl()`][crate::Request::set_ttl()],
//! [`Request::set_pass()`][crate::Request::set_pass()] and the `after_send` hook. See
//! [`http::cache`][crate::http::cache].
//!
//! ## Simple Cache API
//!
//! The [`simple`] module is a non-durable key-value API on top of the [Core Cache API][core]. It
//! collapses concurrent misses for a key onto one call of the value-producing closure.
//!
//! ## Core Cache API
//!
//! The [`core`] module exposes the primitive operations: lookups, inserts, and transactions that
//! carry an obligation to insert or update an item. It requires manual serialization of cache
//! contents and explicit handling of request collapsing and revalidation control flow.

pub mod core;
pub mod simple;
