//! A `Source` wraps one open wire handle to one data server and everything
//! needed to track requests dispatched to it: its quality metric and the
//! arena of requests currently in flight against it.
//!
//! The self-pin arena is an `Arc<Source<W>>` cloned into the wire
//! completion closure together with the slab key, rather than a raw
//! self-referential pointer — the same ownership-through-`Arc` idiom
//! `protocols::posix::peer` uses for its background-task closures.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use slab::Slab;

use crate::fail::Fail;
use crate::quality::{Quality, QualityMetric};
use crate::request::{completion_pair, AnyReadFuture, ClientRequest, ReadFuture};
use crate::wire::{IoOffset, IoSize, IoVec, Wire, WireHandle};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(0);

/// One open connection to a data server, plus the quality metric and
/// in-flight request arena belonging to it.
pub struct Source<W: Wire> {
    id: u64,
    name: String,
    handle: Mutex<Option<W::Handle>>,
    wire: W,
    quality: Arc<dyn QualityMetric>,
    inflight: Mutex<Slab<Arc<Mutex<ClientRequest>>>>,
}

impl<W: Wire> Source<W> {
    pub fn new(name: String, handle: W::Handle, wire: W, quality: Arc<dyn QualityMetric>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            handle: Mutex::new(Some(handle)),
            wire,
            quality,
            inflight: Mutex::new(Slab::new()),
        })
    }

    fn with_handle<R>(&self, f: impl FnOnce(&W::Handle) -> R) -> R {
        let guard = self.handle.lock().expect("handle mutex poisoned");
        f(guard.as_ref().expect("source used after close"))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_id(&self) -> String {
        self.with_handle(|h| h.server_id().to_owned())
    }

    pub fn quality(&self) -> Quality {
        self.quality.score()
    }

    pub fn idle_tick(&self) {
        self.quality.idle_tick();
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().expect("inflight mutex poisoned").len()
    }

    /// Dispatches a single scalar read to this source's wire handle. The
    /// returned future resolves once the wire layer calls back, regardless
    /// of whether the caller keeps polling it. `active_sources` is a
    /// snapshot of every source id active in the owning manager at dispatch
    /// time, carried through to a `Fail::Read` if the read fails.
    pub fn dispatch_read(self: &Arc<Self>, into: IoVec, active_sources: Vec<String>) -> ReadFuture {
        let (tx, fut) = completion_pair();
        let request = Arc::new(Mutex::new(ClientRequest::new(into.offset, into.size, tx)));
        let key = self
            .inflight
            .lock()
            .expect("inflight mutex poisoned")
            .insert(request);

        let watch = self.quality.clone().start(into.size);
        let source = Arc::clone(self);
        let offset = into.offset;
        let size = into.size;
        self.with_handle(|handle| {
            self.wire.read(
                handle,
                offset,
                size,
                into,
                Box::new(move |result| source.complete(key, result, watch, offset, size, active_sources)),
            )
        });
        fut
    }

    /// Dispatches a vector read covering `chunks` in one wire-level call.
    /// Used when a request is served entirely by this source, rather than
    /// split across two. See [`Source::dispatch_read`] for `active_sources`.
    pub fn dispatch_read_vector(self: &Arc<Self>, chunks: Vec<IoVec>, active_sources: Vec<String>) -> ReadFuture {
        let total: IoSize = chunks.iter().map(|c| c.size).sum();
        let (tx, fut) = completion_pair();
        let request = Arc::new(Mutex::new(ClientRequest::new(0, total, tx)));
        let key = self
            .inflight
            .lock()
            .expect("inflight mutex poisoned")
            .insert(request);

        let watch = self.quality.clone().start(total);
        let source = Arc::clone(self);
        self.with_handle(|handle| {
            self.wire.read_vector(
                handle,
                chunks,
                Box::new(move |result| source.complete(key, result, watch, 0, total, active_sources)),
            )
        });
        fut
    }

    /// Resolves the pending request at `key` with the wire layer's result,
    /// removing it from the in-flight arena. Called from whatever thread
    /// the wire layer's completion callback runs on. `active_sources` is
    /// the manager's active-source snapshot taken when the request was
    /// dispatched, reported on failure so a caller losing one source can
    /// still see which others remain.
    fn complete(
        &self,
        key: usize,
        result: Result<IoSize, crate::wire::WireStatus>,
        watch: crate::quality::ActiveWatch,
        offset: IoOffset,
        size: IoSize,
        active_sources: Vec<String>,
    ) {
        let request = {
            let mut inflight = self.inflight.lock().expect("inflight mutex poisoned");
            if !inflight.contains(key) {
                warn!(
                    "source {} ({}): completion for unknown request key {}",
                    self.id, self.name, key
                );
                return;
            }
            inflight.remove(key)
        };

        let outcome = match result {
            Ok(bytes) => {
                watch.stop();
                debug!(
                    "source {} ({}): read offset={} size={} -> {} bytes",
                    self.id, self.name, offset, size, bytes
                );
                Ok(bytes)
            }
            Err(status) => {
                watch.discard();
                warn!(
                    "source {} ({}): read offset={} size={} failed: {}",
                    self.id, self.name, offset, size, status
                );
                Err(Fail::Read {
                    name: self.name.clone(),
                    status: status.message,
                    errno: status.errno,
                    code: status.code,
                    active_sources,
                })
            }
        };

        request
            .lock()
            .expect("client request mutex poisoned")
            .complete(outcome);
    }
}

impl<W: Wire> Drop for Source<W> {
    fn drop(&mut self) {
        debug!("source {} ({}): closing", self.id, self.name);
        if let Some(handle) = self.handle.get_mut().expect("handle mutex poisoned").take() {
            self.wire.close(handle);
        }
    }
}

impl<W: Wire> fmt::Debug for Source<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("quality", &self.quality())
            .field("inflight", &self.inflight_count())
            .finish()
    }
}

/// Splits a `Vector` request's chunks between two sources per the
/// front/back consumption algorithm, dispatching each half and returning a
/// future that resolves once both complete.
pub fn dispatch_split<W: Wire>(
    front: &Arc<Source<W>>,
    back: &Arc<Source<W>>,
    front_chunks: Vec<IoVec>,
    back_chunks: Vec<IoVec>,
    active_sources: Vec<String>,
) -> AnyReadFuture {
    let front_fut = front.dispatch_read_vector(front_chunks, active_sources.clone());
    let back_fut = back.dispatch_read_vector(back_chunks, active_sources);
    AnyReadFuture::Split(crate::request::SplitReadFuture::new(front_fut, back_fut))
}
