//! Objects stored under one cache key, and the obligations to (re)fill them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use edgecache_sys::cache::CacheWriteOptions;
use http::HeaderMap;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::collecting_body::CollectingBody;
use crate::variance::{VaryRule, Variant};

/// Surrogate keys attached to an object.
#[derive(Debug, Default)]
pub struct SurrogateKeySet(HashSet<String>);

impl SurrogateKeySet {
    fn parse(keys: &str) -> Self {
        let keys = keys
            .split(' ')
            .filter(|key| !key.is_empty())
            .filter(|key| {
                let valid = key.bytes().all(|b| b.is_ascii_graphic());
                if !valid {
                    tracing::debug!(surrogate_key = key, "dropping invalid surrogate key");
                }
                valid
            })
            .map(str::to_owned)
            .collect();
        SurrogateKeySet(keys)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    fn to_header_string(&self) -> String {
        let mut keys: Vec<&str> = self.0.iter().map(String::as_str).collect();
        keys.sort_unstable();
        keys.join(" ")
    }
}

/// Metadata associated with a particular object on insert.
#[derive(Debug)]
pub struct ObjectMeta {
    /// The time at which the object was inserted into this cache.
    ///
    /// Include `initial_age` in any calculation of the object's absolute age.
    inserted: Instant,
    initial_age: Duration,
    max_age: Duration,
    /// Applies after `max_age` runs out.
    stale_while_revalidate: Duration,

    request_headers: HeaderMap,
    vary_rule: VaryRule,

    user_metadata: Bytes,
    length: Option<u64>,
    surrogate_keys: SurrogateKeySet,
    sensitive_data: bool,

    // Only ever transitions false -> true.
    soft_purge: AtomicBool,
}

impl ObjectMeta {
    pub fn new(options: &CacheWriteOptions, request_headers: HeaderMap) -> Self {
        ObjectMeta {
            inserted: Instant::now(),
            initial_age: Duration::from_nanos(options.initial_age_ns.unwrap_or(0)),
            max_age: Duration::from_nanos(options.max_age_ns),
            stale_while_revalidate: Duration::from_nanos(
                options.stale_while_revalidate_ns.unwrap_or(0),
            ),
            request_headers,
            vary_rule: options
                .vary_rule
                .as_deref()
                .map(VaryRule::parse)
                .unwrap_or_default(),
            user_metadata: options.user_metadata.clone().unwrap_or_default(),
            length: options.length,
            surrogate_keys: options
                .surrogate_keys
                .as_deref()
                .map(SurrogateKeySet::parse)
                .unwrap_or_default(),
            sensitive_data: options.sensitive_data,
            soft_purge: AtomicBool::new(false),
        }
    }

    pub fn age(&self) -> Duration {
        self.inserted.elapsed() + self.initial_age
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn stale_while_revalidate(&self) -> Duration {
        self.stale_while_revalidate
    }

    /// Return true if the entry is fresh at the current time.
    pub fn is_fresh(&self) -> bool {
        !self.soft_purge.load(Ordering::SeqCst) && self.age() < self.max_age
    }

    /// Return true if the entry is usable even if stale.
    pub fn is_usable(&self) -> bool {
        self.age() < self.max_age + self.stale_while_revalidate
    }

    pub fn variant(&self) -> Variant {
        self.vary_rule.variant(&self.request_headers)
    }

    pub fn vary_rule(&self) -> &VaryRule {
        &self.vary_rule
    }

    pub fn user_metadata(&self) -> Bytes {
        self.user_metadata.clone()
    }

    pub fn surrogate_keys(&self) -> String {
        self.surrogate_keys.to_header_string()
    }

    pub fn sensitive_data(&self) -> bool {
        self.sensitive_data
    }
}

/// The data stored in cache for a metadata-complete entry.
#[derive(Debug)]
pub struct CacheData {
    meta: ObjectMeta,
    body: Arc<CollectingBody>,
    hits: AtomicU64,
}

impl CacheData {
    pub fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    pub fn body(&self) -> &Arc<CollectingBody> {
        &self.body
    }

    /// Return the length of this object, if the final or expected length is known.
    pub fn length(&self) -> Option<u64> {
        self.body.length().or(self.meta.length)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn hit(self: &Arc<Self>) -> Arc<Self> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        Arc::clone(self)
    }
}

/// What a transactional lookup hands back: data found (possibly stale), an obligation to
/// provide data, or both.
pub type TransactionOutcome = (Option<Arc<CacheData>>, Option<Obligation>);

/// Object(s) indexed by a cache key.
#[derive(Debug)]
pub struct CacheKeyObjects(watch::Sender<CacheKeyObjectsInner>);

impl Default for CacheKeyObjects {
    fn default() -> Self {
        let (tx, _) = watch::channel(CacheKeyObjectsInner::default());
        CacheKeyObjects(tx)
    }
}

impl CacheKeyObjects {
    /// Get the applicable CacheData, if available.
    pub fn get(&self, request_headers: &HeaderMap) -> Option<Arc<CacheData>> {
        let key_objects = self.0.borrow();
        key_objects
            .vary_rules
            .iter()
            .map(|rule| rule.variant(request_headers))
            .find_map(|variant| {
                key_objects
                    .objects
                    .get(&variant)
                    .and_then(|v| v.present.as_ref())
                    .map(CacheData::hit)
            })
    }

    /// Perform a transactional lookup.
    ///
    /// Returns a CacheData if existing data were found (even if stale), and an Obligation if the
    /// data need to be freshened. This may wait for another task to complete, cancel, or fail its
    /// own Obligation; a failure is returned as `Err` carrying the producer's reason.
    pub async fn transaction_get(
        self: &Arc<Self>,
        request_headers: &HeaderMap,
    ) -> Result<TransactionOutcome, Arc<str>> {
        let mut sub = self.0.subscribe();
        // Generations of the obligations we last waited on.
        let mut waiting_on: Vec<u64> = Vec::new();

        loop {
            let mut awaitable = Vec::new();
            {
                let key_objects = sub.borrow_and_update();
                let now = Instant::now();

                let response_values = key_objects
                    .vary_rules
                    .iter()
                    .map(|v| v.variant(request_headers))
                    .filter_map(|variant| key_objects.objects.get(&variant).map(|v| (variant, v)));
                for (variant, cache_value) in response_values {
                    if let Some((generation, reason)) = &cache_value.failure {
                        if waiting_on.contains(generation) {
                            return Err(Arc::clone(reason));
                        }
                    }
                    if let Some(data) = &cache_value.present {
                        if data.meta.is_fresh() {
                            return Ok((Some(data.hit()), None));
                        }
                        if data.meta.is_usable() && cache_value.obligated.is_some() {
                            // Someone is already freshening it; serve it stale.
                            return Ok((Some(data.hit()), None));
                        }
                    }
                    if cache_value.is_uncacheable(now) {
                        // Collapsing is disabled here: every caller fetches for itself.
                        tracing::debug!("collapsing disabled for variant; detached obligation");
                        let present = cache_value.present.as_ref().map(CacheData::hit);
                        let obligation = Obligation {
                            object: Arc::clone(self),
                            request_headers: request_headers.clone(),
                            variant,
                            present: present.clone(),
                            generation: None,
                            completed: false,
                        };
                        return Ok((present, Some(obligation)));
                    }
                    if let Some(generation) = cache_value.obligated {
                        awaitable.push(generation);
                    }
                }
            }

            if !awaitable.is_empty() {
                waiting_on = awaitable;
                tracing::trace!(?waiting_on, "waiting on outstanding obligation");
                // The sender lives as long as `self`, so this only returns on a change.
                let _ = sub.changed().await;
                continue;
            }

            // Nothing usable and nothing to wait on: try to take the obligation ourselves.
            let mut obligated: Option<Obligation> = None;
            let mut data: Option<Arc<CacheData>> = None;
            // No notification needed: tasks only wait on obligations being resolved, never on
            // new ones appearing.
            self.0.send_if_modified(|key_objects| {
                let response_keys: Vec<Variant> = key_objects
                    .vary_rules
                    .iter()
                    .map(|v| v.variant(request_headers))
                    .collect();

                let mut fresh = None;
                let mut revalidatable = None;
                let mut in_flight = false;
                for variant in &response_keys {
                    let Some(value) = key_objects.objects.get(variant) else {
                        continue;
                    };
                    in_flight = in_flight || value.obligated.is_some();
                    if let Some(present) = &value.present {
                        if present.meta.is_fresh() && fresh.is_none() {
                            fresh = Some(Arc::clone(present));
                        } else if present.meta.is_usable() && revalidatable.is_none() {
                            revalidatable = Some((variant.clone(), Arc::clone(present)));
                        }
                    }
                }

                if let Some(fresh) = fresh {
                    data = Some(fresh.hit());
                    return false;
                }

                if let Some((variant, present)) = revalidatable {
                    data = Some(present.hit());
                    let value = key_objects.objects.entry(variant.clone()).or_default();
                    if value.obligated.is_some() {
                        return false;
                    }
                    let generation = key_objects.next_generation();
                    if let Some(value) = key_objects.objects.get_mut(&variant) {
                        value.obligated = Some(generation);
                    }
                    tracing::debug!(generation, "obligation to revalidate stale object");
                    obligated = Some(Obligation {
                        object: Arc::clone(self),
                        request_headers: request_headers.clone(),
                        variant,
                        present: Some(present),
                        generation: Some(generation),
                        completed: false,
                    });
                    return true;
                }

                // We raced another task to the obligation; defer to it.
                if in_flight {
                    return false;
                }

                // Obligate ourselves to replace an unusable object if there is one, else to
                // insert under the most recent vary rule (or an empty default if there have been
                // no vary rules so far).
                let expired = response_keys.iter().find_map(|variant| {
                    key_objects
                        .objects
                        .get(variant)
                        .and_then(|v| v.present.clone())
                        .map(|present| (variant.clone(), present))
                });
                let (variant, present) = match (expired, response_keys.into_iter().next()) {
                    (Some((variant, present)), _) => (variant, Some(present)),
                    (None, Some(variant)) => (variant, None),
                    (None, None) => {
                        key_objects.vary_rules.push_front(VaryRule::default());
                        (VaryRule::default().variant(request_headers), None)
                    }
                };
                let generation = key_objects.next_generation();
                key_objects.objects.entry(variant.clone()).or_default().obligated =
                    Some(generation);
                tracing::debug!(generation, stale = present.is_some(), "obligation to insert");
                data = present.as_ref().map(CacheData::hit);
                obligated = Some(Obligation {
                    object: Arc::clone(self),
                    request_headers: request_headers.clone(),
                    variant,
                    present,
                    generation: Some(generation),
                    completed: false,
                });
                false
            });

            if data.is_some() || obligated.is_some() {
                return Ok((data, obligated));
            }
            // Go around again: look for the obligation we missed in the read pass.
        }
    }

    /// Insert into the corresponding entry.
    ///
    /// If `clear` is provided, its obligation is cleared in the same update so there's only one
    /// wakeup. The cleared variant may differ from the one inserted: obligations are placed
    /// using the existing vary rules, inserts use the rule received with the object.
    pub fn insert(
        &self,
        request_headers: HeaderMap,
        options: &CacheWriteOptions,
        body: Arc<CollectingBody>,
        clear: Option<(&Variant, Option<u64>)>,
    ) -> Arc<CacheData> {
        let meta = ObjectMeta::new(options, request_headers);
        let vary_rule = meta.vary_rule().clone();
        let variant = meta.variant();
        let object = Arc::new(CacheData {
            meta,
            body,
            hits: AtomicU64::new(0),
        });
        let result = Arc::clone(&object);

        self.0.send_modify(|key_objects| {
            if let Some((cleared, generation)) = clear {
                if let Some(value) = key_objects.objects.get_mut(cleared) {
                    value.uncacheable_until = None;
                    if generation.is_some() && value.obligated == generation {
                        value.obligated = None;
                    }
                }
            }

            // Most-recently inserted rule goes to the front.
            if let Some(i) = key_objects.vary_rules.iter().position(|r| r == &vary_rule) {
                key_objects.vary_rules.remove(i);
            }
            key_objects.vary_rules.push_front(vary_rule);

            let value = key_objects.objects.entry(variant).or_default();
            value.present = Some(object);
            value.failure = None;
        });

        result
    }

    /// Purge all variants carrying the given surrogate key.
    ///
    /// Returns the number of variants purged.
    pub fn purge(&self, surrogate_key: &str, soft_purge: bool) -> usize {
        let mut count = 0;
        self.0.send_if_modified(|key_objects| {
            key_objects.objects.retain(|_, value| {
                let Some(present) = value.present.as_ref() else {
                    // Obligated but not yet written: surrogate keys unknown, so leave it.
                    return true;
                };
                if !present.meta.surrogate_keys.contains(surrogate_key) {
                    return true;
                }
                count += 1;
                if soft_purge {
                    present.meta.soft_purge.store(true, Ordering::SeqCst);
                    true
                } else {
                    value.present = None;
                    // Keep the slot while someone is obligated to fill it.
                    value.obligated.is_some() || value.uncacheable_until.is_some()
                }
            });
            // Nothing that anyone waits on changed.
            false
        });
        count
    }
}

#[derive(Debug, Default)]
struct CacheKeyObjectsInner {
    /// All the vary rules that might apply, most recent first.
    vary_rules: VecDeque<VaryRule>,

    /// The variants that may be served.
    //
    // INVARIANT: there is exactly one exclusive Obligation for each `obligated` generation.
    objects: HashMap<Variant, CacheValue>,

    generation: u64,
}

impl CacheKeyObjectsInner {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

#[derive(Debug, Default)]
struct CacheValue {
    /// If this entry has been filled, the most recent data that has been inserted.
    present: Option<Arc<CacheData>>,

    /// Generation of the outstanding exclusive Obligation to freshen this entry.
    obligated: Option<u64>,

    /// The most recent failed obligation and its reason.
    failure: Option<(u64, Arc<str>)>,

    /// Collapsing is disabled for this variant until this time.
    uncacheable_until: Option<Instant>,
}

impl CacheValue {
    fn is_uncacheable(&self, now: Instant) -> bool {
        self.uncacheable_until.map_or(false, |until| now < until)
            && !self
                .present
                .as_ref()
                .map_or(false, |present| present.meta.is_usable())
    }
}

/// An obligation to fetch and fill (or freshen) a cache entry.
///
/// Exclusive obligations carry a generation and are the only producer for their variant;
/// dropping one unresolved hands the role to a waiter. Detached obligations come from variants
/// with collapsing disabled and nobody waits on them.
#[derive(Debug)]
pub struct Obligation {
    object: Arc<CacheKeyObjects>,
    request_headers: HeaderMap,
    variant: Variant,
    present: Option<Arc<CacheData>>,
    generation: Option<u64>,
    completed: bool,
}

impl Obligation {
    pub fn present(&self) -> Option<&Arc<CacheData>> {
        self.present.as_ref()
    }

    /// Fulfill the obligation by providing a new entry, whose body will be written to `body`.
    pub fn insert(
        mut self,
        options: &CacheWriteOptions,
        body: Arc<CollectingBody>,
    ) -> Arc<CacheData> {
        let request_headers = options
            .request_headers
            .clone()
            .unwrap_or_else(|| std::mem::take(&mut self.request_headers));
        let data = self.object.insert(
            request_headers,
            options,
            body,
            Some((&self.variant, self.generation)),
        );
        self.completed = true;
        data
    }

    /// Fulfill the obligation by replacing the metadata of the present entry.
    ///
    /// Every field of the metadata comes from `options`; nothing carries over.
    pub fn update(mut self, options: &CacheWriteOptions) -> Result<Arc<CacheData>, Self> {
        let Some(present) = self.present.clone() else {
            return Err(self);
        };
        let request_headers = std::mem::take(&mut self.request_headers);
        let data = self.object.insert(
            request_headers,
            options,
            Arc::clone(present.body()),
            Some((&self.variant, self.generation)),
        );
        self.completed = true;
        Ok(data)
    }

    /// Resolve the obligation as failed; everyone waiting on it gets `reason`.
    pub fn fail(mut self, reason: Arc<str>) {
        self.completed = true;
        let Some(generation) = self.generation else {
            return;
        };
        tracing::warn!(generation, %reason, "producer failed");
        self.object.0.send_if_modified(|key_objects| {
            let Some(value) = key_objects.objects.get_mut(&self.variant) else {
                return false;
            };
            if value.obligated == Some(generation) {
                value.obligated = None;
            }
            value.failure = Some((generation, reason));
            true
        });
    }

    /// Resolve the obligation by disabling collapsing for this variant until `until`.
    ///
    /// Everyone currently waiting is released with a detached obligation of their own.
    pub fn record_uncacheable(mut self, until: Instant) {
        self.completed = true;
        tracing::debug!(generation = ?self.generation, "recording variant as uncacheable");
        let generation = self.generation;
        self.object.0.send_modify(|key_objects| {
            let value = key_objects.objects.entry(self.variant.clone()).or_default();
            value.uncacheable_until = Some(until);
            if generation.is_some() && value.obligated == generation {
                value.obligated = None;
            }
        });
    }
}

impl Drop for Obligation {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let Some(generation) = self.generation else {
            return;
        };
        // Dropped without being resolved: clear our bit so a waiter can take over.
        tracing::debug!(generation, "obligation released without resolution");
        self.object.0.send_if_modified(|key_objects| {
            match key_objects.objects.get_mut(&self.variant) {
                Some(value) if value.obligated == Some(generation) => {
                    value.obligated = None;
                    true
                }
                _ => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use edgecache_sys::body::{BodyReader, BodyWriter};
    use http::{HeaderName, HeaderValue};

    use super::*;

    fn options(max_age: Duration) -> CacheWriteOptions {
        CacheWriteOptions {
            max_age_ns: max_age.as_nanos() as u64,
            ..Default::default()
        }
    }

    fn fill(
        objects: &CacheKeyObjects,
        headers: &HeaderMap,
        options: &CacheWriteOptions,
        contents: &str,
        clear: Option<(&Variant, Option<u64>)>,
    ) -> Arc<CacheData> {
        let body = CollectingBody::new();
        let mut writer: Box<dyn BodyWriter> = Box::new(body.writer(None));
        writer.write(contents.as_bytes()).unwrap();
        writer.finish().unwrap();
        objects.insert(headers.clone(), options, body, clear)
    }

    fn complete(obligation: Obligation, options: &CacheWriteOptions, contents: &str) {
        let body = CollectingBody::new();
        let mut writer: Box<dyn BodyWriter> = Box::new(body.writer(None));
        obligation.insert(options, Arc::clone(&body));
        writer.write(contents.as_bytes()).unwrap();
        writer.finish().unwrap();
    }

    async fn read(data: &CacheData) -> String {
        let mut reader = data.body().read_range(0, None, None);
        let mut out = Vec::new();
        while let Some(chunk) = reader.read_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8(out).unwrap()
    }

    fn header(value: &'static str) -> HeaderMap {
        [(
            HeaderName::from_static("x-edge-test"),
            HeaderValue::from_static(value),
        )]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn single_obligation() {
        let objects = Arc::new(CacheKeyObjects::default());
        let obligations = Arc::new(AtomicUsize::new(0));

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let ko = Arc::clone(&objects);
            let obligations = Arc::clone(&obligations);
            set.spawn(async move {
                let (found, obligation) = ko.transaction_get(&HeaderMap::new()).await.unwrap();
                // Either obligated to fetch, or blocked until the obligation completed.
                assert!(found.is_some() != obligation.is_some());
                if let Some(obligation) = obligation {
                    obligations.fetch_add(1, Ordering::SeqCst);
                    complete(obligation, &options(Duration::from_secs(100)), "hello");
                }
                if let Some(found) = found {
                    assert_eq!(read(&found).await, "hello");
                }
            });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap();
        }
        assert_eq!(obligations.load(Ordering::SeqCst), 1);
        assert!(objects.get(&HeaderMap::new()).is_some());
    }

    #[tokio::test]
    async fn obligation_when_stale() {
        let objects = Arc::new(CacheKeyObjects::default());
        fill(&objects, &HeaderMap::new(), &options(Duration::ZERO), "hello", None);
        let (found, obligation) = objects.transaction_get(&HeaderMap::new()).await.unwrap();
        assert!(found.is_none() || !found.unwrap().meta().is_usable());
        assert!(obligation.is_some());
    }

    #[tokio::test]
    async fn stale_while_revalidate_obligates_one() {
        let objects = Arc::new(CacheKeyObjects::default());
        let stale = CacheWriteOptions {
            initial_age_ns: Some(Duration::from_secs(20).as_nanos() as u64),
            stale_while_revalidate_ns: Some(Duration::from_secs(60).as_nanos() as u64),
            ..options(Duration::from_secs(10))
        };
        fill(&objects, &HeaderMap::new(), &stale, "old", None);

        let (found1, obligation1) = objects.transaction_get(&HeaderMap::new()).await.unwrap();
        assert_eq!(read(&found1.unwrap()).await, "old");
        assert!(obligation1.is_some());

        // Served stale without waiting, and without a second obligation.
        let (found2, obligation2) = objects.transaction_get(&HeaderMap::new()).await.unwrap();
        assert!(found2.is_some());
        assert!(obligation2.is_none());
    }

    #[tokio::test]
    async fn obligation_by_vary_key() {
        let objects = Arc::new(CacheKeyObjects::default());
        let vary = CacheWriteOptions {
            vary_rule: Some("x-edge-test".to_string()),
            ..options(Duration::from_secs(100))
        };
        let (h1, h2, h3) = (header("assert"), header("assume"), header("verify"));

        fill(&objects, &h3, &vary, "", None);
        let (found1, obligation1) = objects.transaction_get(&h1).await.unwrap();
        assert!(found1.is_none());
        let (found2, obligation2) = objects.transaction_get(&h2).await.unwrap();
        assert!(found2.is_none());

        // Another transaction on the same headers should pick up the same result.
        let busy1 = {
            let objects = Arc::clone(&objects);
            let h1 = h1.clone();
            tokio::spawn(async move { objects.transaction_get(&h1).await })
        };
        let busy2 = {
            let objects = Arc::clone(&objects);
            let h2 = h2.clone();
            tokio::spawn(async move { objects.transaction_get(&h2).await })
        };
        tokio::task::yield_now().await;
        complete(obligation2.unwrap(), &vary, "object 2");
        complete(obligation1.unwrap(), &vary, "object 1");

        match busy1.await.unwrap().unwrap() {
            (Some(found), None) => assert_eq!(read(&found).await, "object 1"),
            _ => panic!("expected to block on object 1"),
        }
        match busy2.await.unwrap().unwrap() {
            (Some(found), None) => assert_eq!(read(&found).await, "object 2"),
            _ => panic!("expected to block on object 2"),
        }
    }

    #[tokio::test]
    async fn modified_vary() {
        let objects = Arc::new(CacheKeyObjects::default());
        let vary = CacheWriteOptions {
            vary_rule: Some("x-edge-test".to_string()),
            ..options(Duration::from_secs(100))
        };
        let (h1, h2) = (header("assert"), header("assume"));

        // No vary known in the original request:
        let (found1, obligation1) = objects.transaction_get(&h1).await.unwrap();
        assert!(found1.is_none());
        complete(obligation1.unwrap(), &vary, "object 1");

        assert!(objects.get(&h1).is_some());
        let (found2, obligation2) = objects.transaction_get(&h2).await.unwrap();
        assert!(found2.is_none());
        assert!(obligation2.is_some());
    }

    #[tokio::test]
    async fn drop_obligation() {
        let ko = Arc::new(CacheKeyObjects::default());
        let empty_headers = HeaderMap::new();

        let (_not_found, obligation1) = ko.transaction_get(&empty_headers).await.unwrap();
        assert!(obligation1.is_some());
        // This future won't resolve while the obligation is outstanding...
        let busy2 = ko.transaction_get(&empty_headers);
        // ...but once we drop the first obligation, it picks up another.
        drop(obligation1);
        let (found2, obligation2) = busy2.await.unwrap();
        assert!(obligation2.is_some());
        assert!(found2.is_none());
    }

    #[tokio::test]
    async fn failed_obligation_reaches_waiters() {
        let ko = Arc::new(CacheKeyObjects::default());
        let (_, obligation) = ko.transaction_get(&HeaderMap::new()).await.unwrap();

        let waiter = {
            let ko = Arc::clone(&ko);
            tokio::spawn(async move { ko.transaction_get(&HeaderMap::new()).await })
        };
        tokio::task::yield_now().await;
        obligation.unwrap().fail("origin exploded".into());

        let reason = waiter.await.unwrap().err().unwrap();
        assert_eq!(&*reason, "origin exploded");

        // Later callers are not affected by an old failure.
        let (_, fresh_obligation) = ko.transaction_get(&HeaderMap::new()).await.unwrap();
        assert!(fresh_obligation.is_some());
    }

    #[tokio::test]
    async fn uncacheable_variant_detaches_obligations() {
        let ko = Arc::new(CacheKeyObjects::default());
        let (_, obligation) = ko.transaction_get(&HeaderMap::new()).await.unwrap();
        obligation
            .unwrap()
            .record_uncacheable(Instant::now() + Duration::from_secs(60));

        let (_, first) = ko.transaction_get(&HeaderMap::new()).await.unwrap();
        let (_, second) = ko.transaction_get(&HeaderMap::new()).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn update_replaces_metadata_and_keeps_body() {
        let ko = Arc::new(CacheKeyObjects::default());
        let stale = CacheWriteOptions {
            surrogate_keys: Some("a b".to_string()),
            user_metadata: Some(Bytes::from_static(b"meta")),
            ..options(Duration::ZERO)
        };
        fill(&ko, &HeaderMap::new(), &stale, "body", None);
        let (found, obligation) = ko.transaction_get(&HeaderMap::new()).await.unwrap();
        assert!(found.is_some());

        let updated = obligation
            .unwrap()
            .update(&options(Duration::from_secs(60)))
            .unwrap();
        assert!(updated.meta().is_fresh());
        assert_eq!(updated.meta().surrogate_keys(), "");
        assert!(updated.meta().user_metadata().is_empty());
        assert_eq!(read(&updated).await, "body");
    }

    #[tokio::test]
    async fn purge_removes_and_soft_purge_stales() {
        let ko = Arc::new(CacheKeyObjects::default());
        let keyed = CacheWriteOptions {
            surrogate_keys: Some("my_key other".to_string()),
            ..options(Duration::from_secs(100))
        };
        fill(&ko, &HeaderMap::new(), &keyed, "x", None);

        assert_eq!(ko.purge("unrelated", false), 0);
        assert_eq!(ko.purge("my_key", true), 1);
        let data = ko.get(&HeaderMap::new()).unwrap();
        assert!(!data.meta().is_fresh());

        assert_eq!(ko.purge("other", false), 1);
        assert!(ko.get(&HeaderMap::new()).is_none());
    }
}
