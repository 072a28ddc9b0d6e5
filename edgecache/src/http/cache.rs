//! Read-through HTTP caching.
//!
//! [`Request::send()`] reads `GET` and `HEAD` requests through the cache. Concurrent requests for
//! the same uncached response are collapsed: one of them fetches from the backend while the others
//! wait, then stream the response out of the cache as it is written.
//!
//! The request that fetches runs two hooks, once for the whole collapsed group:
//!
//! * `before_send` may modify the outgoing request. See [`Request::set_before_send()`].
//! * `after_send` receives the backend response as a [`CandidateResponse`] and decides how it is
//!   cached. See [`Request::set_after_send()`].
//!
//! A response is cached under the SHA-256 of the request URI, or under the key set with
//! [`Request::set_cache_key()`]. A response with a `Vary` rule is cached, and collapsed, separately
//! for each combination of the varied request headers.
//!
//! A usable cached response is served without contacting the backend. If it is stale but within
//! its stale-while-revalidate period, one request is chosen to revalidate it in the background.

mod candidate;
mod suggest;

pub use candidate::CandidateResponse;

use self::suggest::DEFAULT_TTL;
use super::request::SendErrorCause;
use super::response::CacheInfo;
use super::{Body, Request, Response, StreamingBody};
use crate::backend::Backend;
use crate::cache::core::{CacheError, CacheKey, Found, Transaction};
use crate::error::Error;
use crate::Host;
use async_trait::async_trait;
use bytes::Bytes;
use edgecache_shared::{CacheOverride, HttpStorageAction};
use edgecache_sys::body::BodyReader;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::sync::Arc;

pub(crate) type BeforeSendHook = Arc<dyn Fn(&mut Request) -> Result<(), Error> + Send + Sync>;
pub(crate) type AfterSendHook =
    Arc<dyn Fn(&mut CandidateResponse) -> Result<(), Error> + Send + Sync>;
pub(crate) type BodyTransform = Box<dyn FnMut(Bytes) -> Result<Bytes, Error> + Send>;

const X_CACHE: &str = "x-cache";
const X_CACHE_HITS: &str = "x-cache-hits";
const SURROGATE_CONTROL: &str = "surrogate-control";
const SURROGATE_KEY: &str = "surrogate-key";

/// Per-request caching options, set through `Request` methods.
#[derive(Clone, Default)]
pub(crate) struct CacheOptions {
    pub(crate) cache_override: CacheOverride,
    pub(crate) override_key: Option<CacheKey>,
    pub(crate) before_send: Option<BeforeSendHook>,
    pub(crate) after_send: Option<AfterSendHook>,
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("cache_override", &self.cache_override)
            .field("override_key", &self.override_key)
            .field("before_send", &self.before_send.is_some())
            .field("after_send", &self.after_send.is_some())
            .finish()
    }
}

/// The status and headers of a cached response, kept in the object's user metadata.
#[derive(Debug, Serialize, Deserialize)]
struct StoredHead {
    status: u16,
    headers: Vec<(String, Vec<u8>)>,
}

impl StoredHead {
    fn new(status: StatusCode, headers: &HeaderMap) -> Self {
        StoredHead {
            status: status.as_u16(),
            headers: headers
                .iter()
                .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
                .collect(),
        }
    }

    fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    fn decode(metadata: &[u8]) -> Result<(StatusCode, HeaderMap), serde_json::Error> {
        let head: StoredHead = serde_json::from_slice(metadata)?;
        let status = StatusCode::from_u16(head.status)
            .map_err(<serde_json::Error as serde::de::Error>::custom)?;
        let mut headers = HeaderMap::with_capacity(head.headers.len());
        for (name, value) in head.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(&value),
            ) {
                headers.append(name, value);
            }
        }
        Ok((status, headers))
    }
}

/// A body with a transform applied to each chunk.
struct TransformedBody {
    inner: Body,
    transform: BodyTransform,
}

#[async_trait]
impl BodyReader for TransformedBody {
    async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        match self.inner.read_chunk().await? {
            Some(chunk) => (self.transform)(chunk)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
            None => Ok(None),
        }
    }
}

fn transformed(body: Body, transform: Option<BodyTransform>) -> Body {
    match transform {
        Some(transform) => Body::from_reader(Box::new(TransformedBody {
            inner: body,
            transform,
        })),
        None => body,
    }
}

fn cache_key(req: &Request) -> CacheKey {
    match &req.cache_options.override_key {
        Some(key) => key.clone(),
        None => {
            let digest = Sha256::digest(req.get_uri().to_string().as_bytes());
            Bytes::copy_from_slice(&digest)
        }
    }
}

fn strip_surrogate_headers(headers: &mut HeaderMap) {
    headers.remove(SURROGATE_KEY);
    headers.remove(SURROGATE_CONTROL);
}

fn lookup_error(e: CacheError) -> SendErrorCause {
    match e {
        CacheError::ProducerFailed(reason) => SendErrorCause::Collapsed(reason),
        e => SendErrorCause::Cache(e),
    }
}

/// Give up the obligation because producing the response failed, sharing the failure with every
/// collapsed request.
fn fail(tx: &Transaction, cause: SendErrorCause) -> SendErrorCause {
    let _ = tx.fail_insert_or_update(&cause.to_string());
    cause
}

pub(crate) async fn send(
    req: Request,
    host: &Host,
    backend: &Backend,
) -> Result<Response, SendErrorCause> {
    let is_head = *req.get_method() == Method::HEAD;
    let cacheable_method = is_head || *req.get_method() == Method::GET;
    if !cacheable_method || req.cache_options.cache_override.is_pass() {
        tracing::debug!(method = %req.get_method(), uri = %req.get_uri(), "bypassing cache");
        return fetch_uncached(req, backend).await;
    }
    let resp = send_cached(req, host, backend).await?;
    Ok(if is_head { without_body(resp) } else { resp })
}

/// `HEAD` shares the `GET` entry, so its responses carry the stored head but no body.
fn without_body(mut resp: Response) -> Response {
    drop(resp.take_body());
    resp
}

async fn send_cached(
    req: Request,
    host: &Host,
    backend: &Backend,
) -> Result<Response, SendErrorCause> {
    let tx = Transaction::lookup(host, cache_key(&req))
        .headers(req.header_map().clone())
        .execute()
        .await
        .map_err(lookup_error)?;

    if let Some(found) = tx.found().filter(Found::is_usable) {
        tracing::debug!(uri = %req.get_uri(), stale = found.is_stale(), "cache hit");
        let resp = response_from_found(&found, true)?;
        if tx.must_insert_or_update() {
            let backend = backend.clone();
            tokio::spawn(async move {
                // The hit above holds the found object's body stream, so only store here.
                if let Err(e) = produce(tx, req, &backend, Some(found)).await {
                    tracing::warn!(error = %e, "background revalidation failed");
                }
            });
        }
        return Ok(resp);
    }

    if tx.must_insert_or_update() {
        tracing::debug!(uri = %req.get_uri(), "cache miss");
        let found = tx.found();
        produce(tx, req, backend, found).await?.into_response()
    } else {
        // An unusable object that another request is already revalidating.
        fetch_uncached(req, backend).await
    }
}

async fn fetch_uncached(req: Request, backend: &Backend) -> Result<Response, SendErrorCause> {
    let resp = backend.fetch(req).await.map_err(SendErrorCause::Backend)?;
    let (status, mut headers, body) = resp.into_parts();
    strip_surrogate_headers(&mut headers);
    Ok(Response::from_parts(status, headers, body))
}

/// Ask the backend to confirm the cached response rather than resend it.
fn add_conditional_headers(req: &mut Request, found: &Found) {
    let Ok((_, stored)) = StoredHead::decode(&found.user_metadata()) else {
        return;
    };
    if !req.contains_header(header::IF_NONE_MATCH) {
        if let Some(etag) = stored.get(header::ETAG) {
            req.set_header(header::IF_NONE_MATCH, etag);
        }
    }
    if !req.contains_header(header::IF_MODIFIED_SINCE) {
        if let Some(last_modified) = stored.get(header::LAST_MODIFIED) {
            req.set_header(header::IF_MODIFIED_SINCE, last_modified);
        }
    }
}

/// The outcome of resolving an obligation.
enum Produced {
    /// The response was stored, and streams out of the cache.
    Stored(Found),
    Uncached(Response),
}

impl Produced {
    fn into_response(self) -> Result<Response, SendErrorCause> {
        match self {
            Produced::Stored(found) => response_from_found(&found, false),
            Produced::Uncached(resp) => Ok(resp),
        }
    }
}

/// Fetch the response for a request holding the obligation, and resolve the obligation.
async fn produce(
    tx: Transaction,
    mut req: Request,
    backend: &Backend,
    found: Option<Found>,
) -> Result<Produced, SendErrorCause> {
    let options = req.cache_options.clone();
    // The stored object answers `GET`s too, so always fetch the full response.
    if *req.get_method() == Method::HEAD {
        req.set_method(Method::GET);
    }
    if let Some(found) = &found {
        add_conditional_headers(&mut req, found);
    }
    if let Some(before_send) = &options.before_send {
        if let Err(e) = before_send(&mut req) {
            return Err(fail(&tx, SendErrorCause::BeforeSend(e)));
        }
    }

    let uri = req.get_uri().clone();
    let resp = match backend.fetch(req).await {
        Ok(resp) => resp,
        Err(e) => return Err(fail(&tx, SendErrorCause::Backend(e))),
    };
    let (status, headers, body) = resp.into_parts();
    let policy = suggest::suggest(
        status,
        &headers,
        &uri,
        &options.cache_override,
        found.as_ref(),
    );
    let mut candidate = CandidateResponse::new(
        status,
        headers,
        body,
        policy,
        found.as_ref().map(Found::is_stale),
    );
    if let Some(after_send) = &options.after_send {
        if let Err(e) = after_send(&mut candidate) {
            return Err(fail(&tx, SendErrorCause::AfterSend(e)));
        }
    }

    let storage_action = candidate.get_storage_action();
    tracing::debug!(%uri, ?storage_action, "storing backend response");
    match (storage_action, found) {
        (HttpStorageAction::Update, Some(found)) => update(tx, candidate, found),
        (HttpStorageAction::Insert | HttpStorageAction::Update, _) => insert(tx, candidate),
        (HttpStorageAction::DoNotStore, _) => {
            let _ = tx.cancel_insert_or_update();
            Ok(Produced::Uncached(serve_uncached(candidate)))
        }
        (HttpStorageAction::RecordUncacheable, _) => {
            let ttl = Some(candidate.get_ttl())
                .filter(|ttl| !ttl.is_zero())
                .unwrap_or(DEFAULT_TTL);
            if let Err(e) = tx.record_uncacheable(ttl) {
                tracing::warn!(error = %e, "failed to disable request collapsing");
            }
            Ok(Produced::Uncached(serve_uncached(candidate)))
        }
    }
}

fn insert(tx: Transaction, candidate: CandidateResponse) -> Result<Produced, SendErrorCause> {
    let (status, mut headers, body, policy, transform) = candidate.into_parts();
    strip_surrogate_headers(&mut headers);
    let metadata = match StoredHead::new(status, &headers).encode() {
        Ok(metadata) => metadata,
        Err(e) => return Err(fail(&tx, e.into())),
    };
    let mut builder = tx
        .insert(policy.max_age)
        .initial_age(policy.age)
        .stale_while_revalidate(policy.stale_while_revalidate)
        .vary_by(policy.vary.iter())
        .surrogate_keys(policy.surrogate_keys.iter().map(String::as_str))
        .user_metadata(metadata)
        .sensitive_data(policy.pci);
    if transform.is_none() {
        if let Some(length) = body.known_length() {
            builder = builder.known_length(length);
        }
    }
    let (writer, found) = match builder.try_execute_and_stream_back() {
        Ok(inserted) => inserted,
        Err((e, tx)) => return Err(fail(&tx, e.into())),
    };
    tokio::spawn(pump(transformed(body, transform), writer));
    Ok(Produced::Stored(found))
}

/// Copy the backend body into the cache, abandoning the object if the body fails.
async fn pump(body: Body, mut writer: StreamingBody) {
    match writer.append(body).await {
        Ok(()) => {
            if let Err(e) = writer.finish() {
                tracing::warn!(error = %e, "failed to finish cached response body");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "response body failed; abandoning cached object");
            writer.abandon();
        }
    }
}

fn update(
    tx: Transaction,
    candidate: CandidateResponse,
    found: Found,
) -> Result<Produced, SendErrorCause> {
    let (_, _, _, policy, _) = candidate.into_parts();
    // A 304 rarely repeats `Vary`, so keep the cached rule unless a new one was given.
    let vary: Vec<HeaderName> = if policy.vary.is_empty() {
        found
            .vary_rule()
            .split(' ')
            .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
            .collect()
    } else {
        policy.vary
    };
    // Updates replace every surrogate key, so carry the stored ones forward.
    let mut surrogate_keys: Vec<&str> = found.surrogate_keys().collect();
    for key in &policy.surrogate_keys {
        if !surrogate_keys.contains(&key.as_str()) {
            surrogate_keys.push(key);
        }
    }
    let updated = tx
        .update(policy.max_age)
        .age(policy.age)
        .stale_while_revalidate(policy.stale_while_revalidate)
        .vary_by(vary.iter())
        .surrogate_keys(surrogate_keys)
        .user_metadata(found.user_metadata())
        .sensitive_data(policy.pci)
        .try_execute();
    if let Err((e, tx)) = updated {
        return Err(fail(&tx, e.into()));
    }
    Ok(Produced::Stored(found))
}

fn serve_uncached(candidate: CandidateResponse) -> Response {
    let (status, mut headers, body, policy, transform) = candidate.into_parts();
    strip_surrogate_headers(&mut headers);
    headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
    let vary: Vec<&str> = policy.vary.iter().map(HeaderName::as_str).collect();
    let mut resp = Response::from_parts(status, headers, transformed(body, transform));
    resp.set_cache_info(CacheInfo {
        from_cache: false,
        hits: 0,
        ttl: policy.max_age,
        age: policy.age,
        stale_while_revalidate: policy.stale_while_revalidate,
        vary: vary.join(" "),
        sensitive: policy.pci,
        surrogate_keys: policy.surrogate_keys,
    });
    resp
}

fn response_from_found(found: &Found, from_cache: bool) -> Result<Response, SendErrorCause> {
    let (status, mut headers) = StoredHead::decode(&found.user_metadata())?;
    let x_cache = if from_cache { "HIT" } else { "MISS" };
    headers.insert(X_CACHE, HeaderValue::from_static(x_cache));
    headers.insert(X_CACHE_HITS, HeaderValue::from(found.hits()));
    headers.insert(header::AGE, HeaderValue::from(found.age().as_secs()));
    let body = found.to_stream()?;
    let mut resp = Response::from_parts(status, headers, body);
    resp.set_cache_info(CacheInfo {
        from_cache,
        hits: found.hits(),
        ttl: found.ttl(),
        age: found.age(),
        stale_while_revalidate: found.stale_while_revalidate(),
        vary: found.vary_rule().to_owned(),
        surrogate_keys: found.surrogate_keys().map(str::to_owned).collect(),
        sensitive: found.is_sensitive_data(),
    });
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_head_keeps_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));
        headers.insert(header::ETAG, HeaderValue::from_static("\"v1\""));
        let metadata = StoredHead::new(StatusCode::NOT_FOUND, &headers)
            .encode()
            .unwrap();
        let (status, decoded) = StoredHead::decode(&metadata).unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(decoded.get_all(header::SET_COOKIE).iter().count(), 2);
        assert_eq!(decoded.get(header::ETAG).unwrap(), "\"v1\"");
    }

    #[test]
    fn garbage_metadata_is_an_error() {
        assert!(StoredHead::decode(b"not json").is_err());
        assert!(StoredHead::decode(br#"{"status":1000,"headers":[]}"#).is_err());
    }

    #[test]
    fn cache_key_is_uri_digest_unless_overridden() {
        let req = Request::get("http://example.com/a");
        assert_eq!(cache_key(&req).len(), 32);
        assert_ne!(cache_key(&req), cache_key(&Request::get("http://example.com/b")));
        let req = req.with_cache_key(vec![1u8; 32]).unwrap();
        assert_eq!(cache_key(&req), Bytes::from(vec![1u8; 32]));
    }

    #[tokio::test]
    async fn transform_errors_end_the_body() {
        let mut calls = 0;
        let transform: BodyTransform = Box::new(move |chunk: Bytes| {
            calls += 1;
            if calls > 1 {
                anyhow::bail!("too many chunks");
            }
            Ok(chunk)
        });
        let mut body = Body::from("first");
        body.write_str("second");
        let mut body = transformed(body, Some(transform));
        assert_eq!(body.read_chunk().await.unwrap().unwrap(), "first");
        let err = body.read_chunk().await.unwrap_err();
        assert!(err.to_string().contains("too many chunks"));
    }
}
