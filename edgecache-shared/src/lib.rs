// Warnings (other than unused variables) in doctests are promoted to errors.
#![doc(test(attr(deny(warnings))))]
#![doc(test(attr(allow(dead_code))))]
#![doc(test(attr(allow(unused_variables))))]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::invalid_codeblock_attributes)]

//! Definitions shared between cache hosts and the guest-side SDK.

use std::fmt;

use http::HeaderValue;

/// The maximum length of a cache key, in bytes.
pub const MAX_CACHE_KEY_LEN: usize = 4096;

/// The length of an HTTP cache override key, in bytes.
pub const HTTP_CACHE_OVERRIDE_KEY_LEN: usize = 32;

#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct CacheStatus {
    pub code: i32,
}

impl CacheStatus {
    /// Success value.
    ///
    /// This indicates that a host operation finished successfully.
    pub const OK: Self = Self { code: 0 };
    /// Generic error value.
    ///
    /// This means that some unexpected error occurred inside the host.
    pub const ERROR: Self = Self { code: 1 };
    /// Invalid argument.
    pub const INVAL: Self = Self { code: 2 };
    /// Invalid handle.
    ///
    /// Returned when a cache handle is closed, or is used in a state that does not permit the
    /// operation (for example, updating an entry without holding the obligation to do so).
    pub const BADF: Self = Self { code: 3 };
    /// Unsupported operation error.
    ///
    /// This error is returned when some operation cannot be performed, because it is not supported.
    pub const UNSUPPORTED: Self = Self { code: 5 };
    /// A `None` error.
    ///
    /// This status code is used to indicate when an optional value did not exist, as opposed to
    /// an empty value.
    pub const NONE: Self = Self { code: 10 };
    /// Limit exceeded
    ///
    /// This is returned when a key, metadata block, or other input exceeds the maximum size the
    /// host permits.
    pub const LIMITEXCEEDED: Self = Self { code: 13 };

    pub fn is_ok(&self) -> bool {
        self == &Self::OK
    }

    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }

    /// Convert a `CacheStatus` value to a `Result<(), CacheStatus>`.
    ///
    /// This will consume a status code, and return `Ok(())` if and only if the value was
    /// `CacheStatus::OK`. If the status code was some error, then it will be returned in the
    /// result's `Err` variant.
    pub fn result(self) -> Result<(), Self> {
        if let Self::OK = self {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Debug for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::OK => "OK",
            Self::ERROR => "ERROR",
            Self::INVAL => "INVAL",
            Self::BADF => "BADF",
            Self::UNSUPPORTED => "UNSUPPORTED",
            Self::NONE => "NONE",
            Self::LIMITEXCEEDED => "LIMIT_EXCEEDED",
            _ => "UNKNOWN",
        })
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache host status {:?} ({})", self, self.code)
    }
}

impl std::error::Error for CacheStatus {}

/// The storage decision made for a response passing through the HTTP cache.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
pub enum HttpStorageAction {
    /// Insert the response body and metadata as a new cached object.
    Insert = 0,
    /// Refresh the metadata of the existing object, leaving its body in place.
    Update = 1,
    /// Do not store the response; waiting requests are released to fetch on their own.
    DoNotStore = 2,
    /// Do not store the response, and stop collapsing requests for this object.
    RecordUncacheable = 3,
}

/// Optional override for response caching behavior.
#[derive(Clone, Debug)]
pub enum CacheOverride {
    /// Do not override the behavior specified in the origin response's cache control headers.
    None,
    /// Do not cache the response to this request, regardless of the origin response's headers.
    Pass,
    /// Override particular cache control settings.
    ///
    /// The origin response's cache control headers will be used for ttl and stale_while_revalidate if `None`.
    Override {
        ttl: Option<u32>,
        stale_while_revalidate: Option<u32>,
        pci: bool,
        surrogate_key: Option<HeaderValue>,
    },
}

impl Default for CacheOverride {
    fn default() -> Self {
        Self::default()
    }
}

impl CacheOverride {
    pub const fn none() -> Self {
        Self::None
    }

    pub const fn pass() -> Self {
        Self::Pass
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub const fn ttl(ttl: u32) -> Self {
        Self::Override {
            ttl: Some(ttl),
            stale_while_revalidate: None,
            pci: false,
            surrogate_key: None,
        }
    }

    pub const fn stale_while_revalidate(swr: u32) -> Self {
        Self::Override {
            ttl: None,
            stale_while_revalidate: Some(swr),
            pci: false,
            surrogate_key: None,
        }
    }

    pub const fn pci(pci: bool) -> Self {
        Self::Override {
            ttl: None,
            stale_while_revalidate: None,
            pci,
            surrogate_key: None,
        }
    }

    pub const fn surrogate_key(sk: HeaderValue) -> Self {
        Self::Override {
            ttl: None,
            stale_while_revalidate: None,
            pci: false,
            surrogate_key: Some(sk),
        }
    }

    pub fn set_none(&mut self) {
        *self = Self::None;
    }

    pub fn set_pass(&mut self, pass: bool) {
        if pass {
            *self = Self::Pass;
        } else if let Self::Pass = self {
            *self = Self::None;
        }
    }

    pub fn get_ttl(&self) -> Option<u32> {
        if let Self::Override { ttl, .. } = self {
            *ttl
        } else {
            None
        }
    }

    pub fn set_ttl(&mut self, new_ttl: u32) {
        match self {
            Self::Override { ttl, .. } => *ttl = Some(new_ttl),
            _ => *self = Self::ttl(new_ttl),
        }
    }

    pub fn get_stale_while_revalidate(&self) -> Option<u32> {
        if let Self::Override {
            stale_while_revalidate,
            ..
        } = self
        {
            *stale_while_revalidate
        } else {
            None
        }
    }

    pub fn set_stale_while_revalidate(&mut self, new_swr: u32) {
        match self {
            Self::Override {
                stale_while_revalidate,
                ..
            } => *stale_while_revalidate = Some(new_swr),
            _ => *self = Self::stale_while_revalidate(new_swr),
        }
    }

    pub fn get_pci(&self) -> bool {
        matches!(self, Self::Override { pci: true, .. })
    }

    pub fn set_pci(&mut self, new_pci: bool) {
        match self {
            Self::Override { pci, .. } => *pci = new_pci,
            _ => *self = Self::pci(new_pci),
        }
    }

    pub fn get_surrogate_key(&self) -> Option<&HeaderValue> {
        if let Self::Override { surrogate_key, .. } = self {
            surrogate_key.as_ref()
        } else {
            None
        }
    }

    pub fn set_surrogate_key(&mut self, new_surrogate_key: HeaderValue) {
        match self {
            Self::Override { surrogate_key, .. } => *surrogate_key = Some(new_surrogate_key),
            _ => *self = Self::surrogate_key(new_surrogate_key),
        }
    }

    pub const fn default() -> Self {
        Self::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_result() {
        assert_eq!(CacheStatus::OK.result(), Ok(()));
        assert_eq!(CacheStatus::BADF.result(), Err(CacheStatus::BADF));
        assert!(CacheStatus::NONE.is_err());
        assert_eq!(format!("{:?}", CacheStatus::LIMITEXCEEDED), "LIMIT_EXCEEDED");
        assert_eq!(format!("{:?}", CacheStatus { code: 99 }), "UNKNOWN");
    }

    #[test]
    fn override_setters_accumulate() {
        let mut o = CacheOverride::none();
        o.set_ttl(60);
        o.set_stale_while_revalidate(30);
        o.set_pci(true);
        assert_eq!(o.get_ttl(), Some(60));
        assert_eq!(o.get_stale_while_revalidate(), Some(30));
        assert!(o.get_pci());

        o.set_pass(true);
        assert!(o.is_pass());
        assert_eq!(o.get_ttl(), None);

        o.set_pass(false);
        assert!(matches!(o, CacheOverride::None));
    }
}
