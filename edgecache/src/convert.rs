//! Convenient conversion traits.
//
// Methods taking `impl ToHeaderName` rather than `HeaderName` accept string and byte types
// directly. Like `TryInto` but panicking on failure: the documentation for each trait says which
// conversions can fail, and explicit conversion with error handling is preferred for untrusted
// input. The traits are sealed so that they cannot be implemented outside this crate.

use http::header::{HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};

pub use self::header_name::ToHeaderName;
pub use self::header_value::ToHeaderValue;
pub use self::method::ToMethod;
pub use self::status_code::ToStatusCode;
pub use self::uri::ToUri;

/// Implement a sealed conversion trait for the string types, and optionally for byte types.
macro_rules! convert_stringy {
    ($type:ty, $trait:ident, $fail_msg:literal) => {
        impl $trait for $type {}
        impl $trait for &$type {}
        impl $trait for &str {}
        impl $trait for String {}
        impl $trait for &String {}

        pub trait Sealed {
            fn into_owned(self) -> $type;
        }

        impl Sealed for $type {
            fn into_owned(self) -> $type {
                self
            }
        }

        impl Sealed for &$type {
            fn into_owned(self) -> $type {
                self.clone()
            }
        }

        impl Sealed for &str {
            fn into_owned(self) -> $type {
                self.parse::<$type>()
                    .unwrap_or_else(|_| panic!(concat!($fail_msg, ": {}"), self))
            }
        }

        impl Sealed for String {
            fn into_owned(self) -> $type {
                Sealed::into_owned(self.as_str())
            }
        }

        impl Sealed for &String {
            fn into_owned(self) -> $type {
                Sealed::into_owned(self.as_str())
            }
        }
    };
    (@with_byte_impls, $type:ty, $trait:ident, $fail_msg:literal) => {
        convert_stringy!($type, $trait, $fail_msg);

        impl $trait for &[u8] {}
        impl $trait for Vec<u8> {}

        impl Sealed for &[u8] {
            fn into_owned(self) -> $type {
                <$type>::try_from(self)
                    .unwrap_or_else(|_| panic!(concat!($fail_msg, ": {:?}"), self))
            }
        }

        impl Sealed for Vec<u8> {
            fn into_owned(self) -> $type {
                Sealed::into_owned(self.as_slice())
            }
        }
    };
}

mod header_name {
    use super::*;

    /// Types that can be converted to a [`HeaderName`].
    ///
    /// Strings and byte slices are parsed, and panic if they are not a valid header name.
    pub trait ToHeaderName: Sealed {}

    convert_stringy!(@with_byte_impls, HeaderName, ToHeaderName, "invalid HTTP header name");
}

mod header_value {
    use super::*;

    /// Types that can be converted to a [`HeaderValue`].
    ///
    /// Strings and byte slices are parsed, and panic if they are not a valid header value.
    pub trait ToHeaderValue: Sealed {}

    convert_stringy!(@with_byte_impls, HeaderValue, ToHeaderValue, "invalid HTTP header value");

    impl ToHeaderValue for HeaderName {}

    impl Sealed for HeaderName {
        fn into_owned(self) -> HeaderValue {
            HeaderValue::from(self)
        }
    }
}

mod method {
    use super::*;

    /// Types that can be converted to a [`Method`].
    ///
    /// Strings and byte slices are parsed, and panic if they are not a valid method.
    pub trait ToMethod: Sealed {}

    convert_stringy!(@with_byte_impls, Method, ToMethod, "invalid HTTP method");
}

mod status_code {
    use super::*;

    /// Types that can be converted to a [`StatusCode`].
    ///
    /// Integers outside `100..=999` panic.
    pub trait ToStatusCode: Sealed {}

    impl ToStatusCode for StatusCode {}
    impl ToStatusCode for u16 {}

    pub trait Sealed {
        fn into_owned(self) -> StatusCode;
    }

    impl Sealed for StatusCode {
        fn into_owned(self) -> StatusCode {
            self
        }
    }

    impl Sealed for u16 {
        fn into_owned(self) -> StatusCode {
            StatusCode::from_u16(self)
                .unwrap_or_else(|_| panic!("invalid HTTP status code: {}", self))
        }
    }
}

mod uri {
    use super::*;

    /// Types that can be converted to a [`Uri`].
    ///
    /// Strings are parsed, and panic if they are not a valid URI.
    pub trait ToUri: Sealed {}

    convert_stringy!(Uri, ToUri, "invalid URI");
}
