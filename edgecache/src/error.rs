//! Error-handling utilities.

pub use crate::backend::BackendError;
pub use crate::cache::core::CacheError;
pub use crate::http::request::{SendError, SendErrorCause};
pub use anyhow::{anyhow, bail, ensure, Context, Error};
