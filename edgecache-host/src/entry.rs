use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use edgecache_shared::CacheStatus;
use edgecache_sys::body::{BodyReader, BodyWriter};
use edgecache_sys::cache::{
    CacheDurationNs, CacheEntry, CacheGetBodyOptions, CacheHitCount, CacheLookupState,
    CacheObjectLength, CacheWriteOptions,
};
use tokio::time::Instant;

use crate::collecting_body::{BodyLease, CollectingBody};
use crate::store::{CacheData, Obligation};

struct EntryState {
    data: Option<Arc<CacheData>>,
    obligation: Option<Obligation>,
    closed: bool,
}

/// A handle onto one lookup's result in a [`MemoryCache`](crate::MemoryCache).
pub(crate) struct MemoryEntry {
    state: Mutex<EntryState>,
    lease_slot: Arc<AtomicU64>,
    next_lease: AtomicU64,
    failure: Option<Arc<str>>,
    uncacheable_ttl: Duration,
}

impl MemoryEntry {
    pub(crate) fn new(
        data: Option<Arc<CacheData>>,
        obligation: Option<Obligation>,
        uncacheable_ttl: Duration,
    ) -> Self {
        MemoryEntry {
            state: Mutex::new(EntryState {
                data,
                obligation,
                closed: false,
            }),
            lease_slot: Arc::new(AtomicU64::new(0)),
            next_lease: AtomicU64::new(0),
            failure: None,
            uncacheable_ttl,
        }
    }

    pub(crate) fn failed(reason: Arc<str>) -> Self {
        let mut entry = MemoryEntry::new(None, None, Duration::ZERO);
        entry.failure = Some(reason);
        entry
    }

    fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_data<T>(&self, f: impl FnOnce(&CacheData) -> T) -> Result<Option<T>, CacheStatus> {
        let state = self.state();
        if state.closed {
            return Err(CacheStatus::BADF);
        }
        Ok(state.data.as_deref().map(f))
    }

    fn take_obligation(&self) -> Result<Obligation, CacheStatus> {
        let mut state = self.state();
        if state.closed {
            return Err(CacheStatus::BADF);
        }
        state.obligation.take().ok_or(CacheStatus::BADF)
    }

    fn insert_body(
        &self,
        options: &CacheWriteOptions,
    ) -> Result<(Box<dyn BodyWriter>, Arc<CacheData>), CacheStatus> {
        let obligation = self.take_obligation()?;
        let body = CollectingBody::new();
        let data = obligation.insert(options, Arc::clone(&body));
        tracing::debug!(length = ?options.length, "transactional insert");
        Ok((Box::new(body.writer(options.length)), data))
    }
}

fn duration_ns(d: Duration) -> CacheDurationNs {
    d.as_nanos().try_into().unwrap_or(CacheDurationNs::MAX)
}

impl CacheEntry for MemoryEntry {
    fn get_state(&self) -> Result<CacheLookupState, CacheStatus> {
        let state = self.state();
        if state.closed {
            return Err(CacheStatus::BADF);
        }
        let mut lookup_state = CacheLookupState::empty();
        if let Some(data) = &state.data {
            lookup_state |= CacheLookupState::FOUND;
            if data.meta().is_usable() {
                lookup_state |= CacheLookupState::USABLE;
            }
            if !data.meta().is_fresh() {
                lookup_state |= CacheLookupState::STALE;
            }
        }
        if state.obligation.is_some() {
            lookup_state |= CacheLookupState::MUST_INSERT_OR_UPDATE;
        }
        Ok(lookup_state)
    }

    fn get_producer_failure(&self) -> Option<Arc<str>> {
        self.failure.clone()
    }

    fn get_user_metadata(&self) -> Result<Option<Bytes>, CacheStatus> {
        self.with_data(|data| data.meta().user_metadata())
    }

    fn get_body(
        &self,
        options: CacheGetBodyOptions,
    ) -> Result<Option<Box<dyn BodyReader>>, CacheStatus> {
        let data = {
            let state = self.state();
            if state.closed {
                return Err(CacheStatus::BADF);
            }
            match &state.data {
                Some(data) => Arc::clone(data),
                None => return Ok(None),
            }
        };
        let mut from = options.from.unwrap_or(0);
        let mut to = options.to;
        if to.map_or(false, |to| to < from) {
            return Err(CacheStatus::INVAL);
        }
        if let Some(length) = data.length() {
            // A start past the end selects the whole object.
            if from > 0 && from >= length {
                from = 0;
                to = None;
            }
        }
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed) + 1;
        let lease = BodyLease::acquire(&self.lease_slot, id).ok_or(CacheStatus::BADF)?;
        let reader = data
            .body()
            .read_range(from, to.map(|to| to + 1), Some(lease));
        Ok(Some(Box::new(reader)))
    }

    fn get_length(&self) -> Result<Option<CacheObjectLength>, CacheStatus> {
        self.with_data(CacheData::length).map(Option::flatten)
    }

    fn get_max_age_ns(&self) -> Result<Option<CacheDurationNs>, CacheStatus> {
        self.with_data(|data| duration_ns(data.meta().max_age()))
    }

    fn get_stale_while_revalidate_ns(&self) -> Result<Option<CacheDurationNs>, CacheStatus> {
        self.with_data(|data| duration_ns(data.meta().stale_while_revalidate()))
    }

    fn get_age_ns(&self) -> Result<Option<CacheDurationNs>, CacheStatus> {
        self.with_data(|data| duration_ns(data.meta().age()))
    }

    fn get_hits(&self) -> Result<Option<CacheHitCount>, CacheStatus> {
        self.with_data(CacheData::hits)
    }

    fn get_vary_rule(&self) -> Result<Option<String>, CacheStatus> {
        self.with_data(|data| data.meta().vary_rule().to_string())
    }

    fn get_surrogate_keys(&self) -> Result<Option<String>, CacheStatus> {
        self.with_data(|data| data.meta().surrogate_keys())
    }

    fn get_sensitive_data(&self) -> Result<Option<bool>, CacheStatus> {
        self.with_data(|data| data.meta().sensitive_data())
    }

    fn transaction_insert(
        &self,
        options: CacheWriteOptions,
    ) -> Result<Box<dyn BodyWriter>, CacheStatus> {
        self.insert_body(&options).map(|(writer, _)| writer)
    }

    fn transaction_insert_and_stream_back(
        &self,
        options: CacheWriteOptions,
    ) -> Result<(Box<dyn BodyWriter>, Box<dyn CacheEntry>), CacheStatus> {
        let (writer, data) = self.insert_body(&options)?;
        let found = MemoryEntry::new(Some(data), None, self.uncacheable_ttl);
        Ok((writer, Box::new(found)))
    }

    fn transaction_update(&self, options: CacheWriteOptions) -> Result<(), CacheStatus> {
        if options.request_headers.is_some() {
            return Err(CacheStatus::INVAL);
        }
        let mut state = self.state();
        if state.closed || state.data.is_none() {
            return Err(CacheStatus::BADF);
        }
        let obligation = state.obligation.take().ok_or(CacheStatus::BADF)?;
        match obligation.update(&options) {
            Ok(data) => {
                tracing::debug!("transactional update");
                state.data = Some(data);
                Ok(())
            }
            Err(obligation) => {
                state.obligation = Some(obligation);
                Err(CacheStatus::BADF)
            }
        }
    }

    fn transaction_cancel(&self) -> Result<(), CacheStatus> {
        let obligation = self.take_obligation()?;
        tracing::debug!("obligation cancelled");
        drop(obligation);
        Ok(())
    }

    fn transaction_fail(&self, reason: &str) -> Result<(), CacheStatus> {
        self.take_obligation()?.fail(reason.into());
        Ok(())
    }

    fn transaction_record_uncacheable(
        &self,
        options: CacheWriteOptions,
    ) -> Result<(), CacheStatus> {
        let obligation = self.take_obligation()?;
        let ttl = match options.max_age_ns {
            0 => self.uncacheable_ttl,
            ns => Duration::from_nanos(ns),
        };
        obligation.record_uncacheable(Instant::now() + ttl);
        Ok(())
    }

    fn close(&self) -> Result<(), CacheStatus> {
        let obligation = {
            let mut state = self.state();
            state.closed = true;
            state.data = None;
            state.obligation.take()
        };
        // An unresolved obligation is handed to a waiter on drop.
        drop(obligation);
        Ok(())
    }
}

impl Drop for MemoryEntry {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
