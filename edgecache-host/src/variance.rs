//! Vary rules and the variants they select.

use http::{HeaderMap, HeaderName, HeaderValue};

/// The set of request headers an object varies on, sorted and deduplicated.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct VaryRule {
    headers: Vec<HeaderName>,
}

impl VaryRule {
    pub fn new<'a>(headers: impl Iterator<Item = &'a HeaderName>) -> Self {
        let mut headers: Vec<HeaderName> = headers.cloned().collect();
        headers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        headers.dedup();
        VaryRule { headers }
    }

    /// Parse a space- or comma-separated list of header names. Invalid names are skipped.
    pub fn parse(rule: &str) -> Self {
        let headers: Vec<HeaderName> = rule
            .split(|c: char| c == ' ' || c == ',')
            .filter(|s| !s.is_empty())
            .filter_map(|s| HeaderName::from_bytes(s.trim().as_bytes()).ok())
            .collect();
        VaryRule::new(headers.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// The variant selected by these request headers.
    pub fn variant(&self, request_headers: &HeaderMap) -> Variant {
        let values = self
            .headers
            .iter()
            .map(|name| request_headers.get_all(name).iter().cloned().collect())
            .collect();
        Variant {
            rule: self.clone(),
            values,
        }
    }
}

impl std::fmt::Display for VaryRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.headers.iter().map(HeaderName::as_str).collect();
        f.write_str(&names.join(" "))
    }
}

/// One vary rule plus the request header values it selected.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct Variant {
    rule: VaryRule,
    values: Vec<Vec<HeaderValue>>,
}
