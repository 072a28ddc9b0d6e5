//! An append-only body shared by one writer and any number of readers.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use edgecache_shared::CacheStatus;
use edgecache_sys::body::{BodyReader, BodyWriter};
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Outcome {
    #[default]
    Streaming,
    Complete,
    Abandoned,
}

#[derive(Debug, Default)]
struct BodyState {
    chunks: Vec<Bytes>,
    written: u64,
    outcome: Outcome,
}

/// The body of a cached object.
///
/// Chunks are only ever appended; readers hold an index into the chunk list and are woken
/// through the watch channel whenever a chunk lands or the outcome changes.
#[derive(Debug)]
pub struct CollectingBody {
    state: watch::Sender<BodyState>,
}

impl CollectingBody {
    pub fn new() -> Arc<Self> {
        let (state, _) = watch::channel(BodyState::default());
        Arc::new(CollectingBody { state })
    }

    /// The final length, once the writer has finished.
    pub fn length(&self) -> Option<u64> {
        let state = self.state.borrow();
        (state.outcome == Outcome::Complete).then_some(state.written)
    }

    pub fn writer(self: &Arc<Self>, expected_length: Option<u64>) -> CollectingWriter {
        CollectingWriter {
            body: Arc::clone(self),
            expected_length,
            done: false,
        }
    }

    /// Read bytes `from..to` (exclusive end), following the writer if it is still going.
    pub fn read_range(
        self: &Arc<Self>,
        from: u64,
        to: Option<u64>,
        lease: Option<BodyLease>,
    ) -> CollectingReader {
        CollectingReader {
            rx: self.state.subscribe(),
            body: Arc::clone(self),
            chunk: 0,
            pos: 0,
            from,
            to,
            lease,
            done: false,
        }
    }

    fn append(&self, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let chunk = Bytes::copy_from_slice(buf);
        self.state.send_modify(|state| {
            state.written += chunk.len() as u64;
            state.chunks.push(chunk);
        });
    }

    fn end(&self, outcome: Outcome) {
        self.state.send_modify(|state| {
            if state.outcome == Outcome::Streaming {
                state.outcome = outcome;
            }
        });
    }

    fn written(&self) -> u64 {
        self.state.borrow().written
    }
}

/// Exclusive right to have one body reader open on a handle.
///
/// The slot holds the id of the current holder, or zero when free.
#[derive(Debug)]
pub struct BodyLease {
    slot: Arc<AtomicU64>,
    id: u64,
}

impl BodyLease {
    pub fn acquire(slot: &Arc<AtomicU64>, id: u64) -> Option<Self> {
        slot.compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BodyLease {
                slot: Arc::clone(slot),
                id,
            })
    }
}

impl Drop for BodyLease {
    fn drop(&mut self) {
        let _ = self
            .slot
            .compare_exchange(self.id, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

pub struct CollectingWriter {
    body: Arc<CollectingBody>,
    expected_length: Option<u64>,
    done: bool,
}

impl BodyWriter for CollectingWriter {
    fn write(&mut self, buf: &[u8]) -> Result<(), CacheStatus> {
        if let Some(expected) = self.expected_length {
            if self.body.written() + buf.len() as u64 > expected {
                return Err(CacheStatus::INVAL);
            }
        }
        self.body.append(buf);
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), CacheStatus> {
        self.done = true;
        if let Some(expected) = self.expected_length {
            let written = self.body.written();
            if written != expected {
                tracing::warn!(expected, written, "body length mismatch; abandoning object");
                self.body.end(Outcome::Abandoned);
                return Err(CacheStatus::INVAL);
            }
        }
        self.body.end(Outcome::Complete);
        Ok(())
    }

    fn abandon(mut self: Box<Self>) {
        self.done = true;
        self.body.end(Outcome::Abandoned);
    }
}

impl Drop for CollectingWriter {
    fn drop(&mut self) {
        if !self.done {
            tracing::debug!("body writer dropped without finishing; abandoning object");
            self.body.end(Outcome::Abandoned);
        }
    }
}

pub struct CollectingReader {
    rx: watch::Receiver<BodyState>,
    // Keeps the sender alive so `changed` only returns on real updates.
    body: Arc<CollectingBody>,
    chunk: usize,
    pos: u64,
    from: u64,
    to: Option<u64>,
    lease: Option<BodyLease>,
    done: bool,
}

impl CollectingReader {
    fn release(&mut self) {
        self.done = true;
        self.lease = None;
    }
}

#[async_trait]
impl BodyReader for CollectingReader {
    async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if self.done {
                return Ok(None);
            }
            let (next, outcome) = {
                let state = self.rx.borrow_and_update();
                let mut next = None;
                while next.is_none() && self.chunk < state.chunks.len() {
                    let chunk = &state.chunks[self.chunk];
                    let start = self.pos;
                    let end = start + chunk.len() as u64;
                    self.chunk += 1;
                    self.pos = end;
                    let lo = start.max(self.from);
                    let hi = self.to.map_or(end, |to| end.min(to));
                    if lo < hi {
                        next = Some(chunk.slice((lo - start) as usize..(hi - start) as usize));
                    }
                }
                (next, state.outcome)
            };
            if let Some(bytes) = next {
                return Ok(Some(bytes));
            }
            if outcome == Outcome::Complete || self.to.map_or(false, |to| self.pos >= to) {
                self.release();
                return Ok(None);
            }
            if outcome == Outcome::Abandoned {
                self.release();
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "cached object was abandoned before it was complete",
                ));
            }
            if self.rx.changed().await.is_err() {
                self.release();
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "cached object body is gone",
                ));
            }
        }
    }

    fn known_length(&self) -> Option<u64> {
        let total = self.body.length()?;
        let end = self.to.map_or(total, |to| to.min(total));
        Some(end.saturating_sub(self.from))
    }
}
