//! Caching policy suggested by a backend response.
//!
//! The suggestion is the starting point of a [`CandidateResponse`][super::CandidateResponse];
//! the `after_send` hook may override any part of it.

use crate::cache::core::Found;
use edgecache_shared::{CacheOverride, HttpStorageAction};
use http::header::{self, HeaderMap, HeaderName};
use http::{StatusCode, Uri};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// The TTL used when the response carries no freshness information.
pub(crate) const DEFAULT_TTL: Duration = Duration::from_secs(120);

const SURROGATE_CONTROL: &str = "surrogate-control";
const SURROGATE_KEY: &str = "surrogate-key";

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Suggestion {
    pub(crate) storage_action: HttpStorageAction,
    /// The total time the response is fresh, counted from its origin; `age` is subtracted to get
    /// the remaining TTL.
    pub(crate) max_age: Duration,
    pub(crate) age: Duration,
    pub(crate) stale_while_revalidate: Duration,
    pub(crate) pci: bool,
    pub(crate) vary: Vec<HeaderName>,
    pub(crate) surrogate_keys: Vec<String>,
}

pub(crate) fn suggest(
    status: StatusCode,
    headers: &HeaderMap,
    uri: &Uri,
    cache_override: &CacheOverride,
    found: Option<&Found>,
) -> Suggestion {
    let surrogate_control = directives(headers, SURROGATE_CONTROL);
    let cache_control = directives(headers, header::CACHE_CONTROL.as_str());

    let max_age = cache_override
        .get_ttl()
        .map(|ttl| Duration::from_secs(ttl.into()))
        .or_else(|| seconds(&surrogate_control, "max-age"))
        .or_else(|| seconds(&cache_control, "s-maxage"))
        .or_else(|| seconds(&cache_control, "max-age"))
        .unwrap_or(DEFAULT_TTL);
    let age = headers
        .get(header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .map(Duration::from_secs)
        .unwrap_or_default();
    let stale_while_revalidate = cache_override
        .get_stale_while_revalidate()
        .map(|swr| Duration::from_secs(swr.into()))
        .or_else(|| seconds(&surrogate_control, "stale-while-revalidate"))
        .or_else(|| seconds(&cache_control, "stale-while-revalidate"))
        .unwrap_or_default();

    let (vary, vary_any) = vary(headers);

    let mut surrogate_keys = Vec::new();
    if let Some(keys) = cache_override
        .get_surrogate_key()
        .and_then(|v| v.to_str().ok())
    {
        surrogate_keys.extend(keys.split_ascii_whitespace().map(str::to_owned));
    }
    for keys in headers.get_all(SURROGATE_KEY) {
        if let Ok(keys) = keys.to_str() {
            surrogate_keys.extend(keys.split_ascii_whitespace().map(str::to_owned));
        }
    }
    surrogate_keys.push(default_surrogate_key(uri));

    let no_store = cache_control
        .iter()
        .any(|(name, _)| name == "no-store" || name == "private");
    let storage_action = if status == StatusCode::NOT_MODIFIED && found.is_some() {
        HttpStorageAction::Update
    } else if !is_cacheable_status(status) || vary_any || no_store {
        HttpStorageAction::DoNotStore
    } else if headers.contains_key(header::SET_COOKIE) {
        HttpStorageAction::RecordUncacheable
    } else {
        HttpStorageAction::Insert
    };

    Suggestion {
        storage_action,
        max_age,
        age,
        stale_while_revalidate,
        pci: cache_override.get_pci(),
        vary,
        surrogate_keys,
    }
}

/// The surrogate key every cached response carries, so a response can be purged by its URI.
pub(crate) fn default_surrogate_key(uri: &Uri) -> String {
    Sha256::digest(uri.to_string().as_bytes())
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect()
}

fn is_cacheable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 203 | 300 | 301 | 302 | 404 | 410)
}

/// The comma-separated directives of every value of `name`, lowercased.
fn directives(headers: &HeaderMap, name: &str) -> Vec<(String, Option<String>)> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|directive| {
            let directive = directive.trim();
            if directive.is_empty() {
                return None;
            }
            Some(match directive.split_once('=') {
                Some((name, value)) => (
                    name.trim().to_ascii_lowercase(),
                    Some(value.trim().trim_matches('"').to_owned()),
                ),
                None => (directive.to_ascii_lowercase(), None),
            })
        })
        .collect()
}

fn seconds(directives: &[(String, Option<String>)], name: &str) -> Option<Duration> {
    directives
        .iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, value)| value.as_deref()?.parse().ok())
        .map(Duration::from_secs)
}

/// The header names in `Vary`, and whether it contained `*`.
fn vary(headers: &HeaderMap) -> (Vec<HeaderName>, bool) {
    let mut names = Vec::new();
    let mut any = false;
    for value in headers.get_all(header::VARY) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if name == "*" {
                any = true;
            } else if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    (names, any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(*value));
        }
        map
    }

    fn suggest_for(status: u16, pairs: &[(&'static str, &'static str)]) -> Suggestion {
        suggest(
            StatusCode::from_u16(status).unwrap(),
            &headers(pairs),
            &Uri::from_static("http://example.com/a"),
            &CacheOverride::None,
            None,
        )
    }

    #[test]
    fn ttl_precedence() {
        let s = suggest_for(
            200,
            &[
                ("cache-control", "max-age=10, s-maxage=20"),
                ("surrogate-control", "max-age=30"),
            ],
        );
        assert_eq!(s.max_age, Duration::from_secs(30));
        let s = suggest_for(200, &[("cache-control", "max-age=10, s-maxage=20")]);
        assert_eq!(s.max_age, Duration::from_secs(20));
        let s = suggest_for(200, &[("cache-control", "public, max-age=10")]);
        assert_eq!(s.max_age, Duration::from_secs(10));
        assert_eq!(suggest_for(200, &[]).max_age, DEFAULT_TTL);
    }

    #[test]
    fn override_ttl_wins() {
        let s = suggest(
            StatusCode::OK,
            &headers(&[("cache-control", "max-age=10")]),
            &Uri::from_static("http://example.com/a"),
            &CacheOverride::ttl(600),
            None,
        );
        assert_eq!(s.max_age, Duration::from_secs(600));
    }

    #[test]
    fn age_and_swr() {
        let s = suggest_for(
            200,
            &[
                ("age", "7"),
                ("cache-control", "max-age=60, stale-while-revalidate=30"),
            ],
        );
        assert_eq!(s.age, Duration::from_secs(7));
        assert_eq!(s.stale_while_revalidate, Duration::from_secs(30));
    }

    #[test]
    fn storage_actions() {
        use HttpStorageAction::*;
        assert_eq!(suggest_for(200, &[]).storage_action, Insert);
        assert_eq!(suggest_for(500, &[]).storage_action, DoNotStore);
        assert_eq!(
            suggest_for(200, &[("cache-control", "private")]).storage_action,
            DoNotStore
        );
        assert_eq!(
            suggest_for(200, &[("cache-control", "no-store")]).storage_action,
            DoNotStore
        );
        assert_eq!(suggest_for(200, &[("vary", "*")]).storage_action, DoNotStore);
        assert_eq!(
            suggest_for(200, &[("set-cookie", "a=b")]).storage_action,
            RecordUncacheable
        );
        // nothing to update without a cached object
        assert_eq!(suggest_for(304, &[]).storage_action, DoNotStore);
    }

    #[test]
    fn vary_and_surrogate_keys() {
        let s = suggest_for(
            200,
            &[
                ("vary", "Accept-Language, accept-encoding"),
                ("vary", "accept-language"),
                ("surrogate-key", "a  b"),
            ],
        );
        assert_eq!(
            s.vary,
            vec![header::ACCEPT_LANGUAGE, header::ACCEPT_ENCODING]
        );
        assert_eq!(&s.surrogate_keys[..2], ["a", "b"]);
        assert_eq!(
            s.surrogate_keys[2],
            default_surrogate_key(&Uri::from_static("http://example.com/a"))
        );
        assert_eq!(s.surrogate_keys[2].len(), 64);
    }
}
