//! A single request handed to [`crate::RequestManager`]: either a scalar
//! read (one offset/size/buffer) or a vector read (many), and the future
//! handed back to the caller for it.
//!
//! The future side is modeled on `operations::ResultFuture`: a thin
//! `Future` wrapper that resolves exactly once, backed here by a
//! `futures::channel::oneshot` pair instead of manual polling of an inner
//! future, since completion genuinely arrives from another thread (a wire
//! completion callback) rather than from polling a nested future.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{join, Join};
use futures::FutureExt;
use pin_project::pin_project;

use crate::fail::Fail;
use crate::wire::{IoOffset, IoSize, IoVec};

/// What a request asks for: a single buffer, or several to be satisfied as
/// one logical operation split across active sources.
pub enum RequestKind {
    Scalar(IoVec),
    Vector(Vec<IoVec>),
}

impl RequestKind {
    pub fn total_size(&self) -> IoSize {
        match self {
            RequestKind::Scalar(v) => v.size,
            RequestKind::Vector(vs) => vs.iter().map(|v| v.size).sum(),
        }
    }
}

/// The sending half of a request's completion channel. Handed to a `Source`
/// at dispatch time and consumed exactly once when the wire layer's
/// callback fires.
pub type Completion = oneshot::Sender<Result<IoSize, Fail>>;

/// Builds a fresh completion channel for a request about to be dispatched.
pub fn completion_pair() -> (Completion, ReadFuture) {
    let (tx, rx) = oneshot::channel();
    (tx, ReadFuture { rx })
}

/// The future returned to callers of [`crate::RequestManager::read`] and
/// [`crate::RequestManager::read_vector`] for a request that was satisfied
/// by a single source.
///
/// A dropped `ReadFuture` does not cancel the underlying wire operation:
/// the in-flight request still owns its slab entry via the source and
/// still resolves its (now-unread) completion channel.
#[pin_project]
pub struct ReadFuture {
    #[pin]
    rx: oneshot::Receiver<Result<IoSize, Fail>>,
}

impl Future for ReadFuture {
    type Output = Result<IoSize, Fail>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.rx.poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Fail::Cancelled {
                details: "completion sender dropped without resolving".into(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The future returned for a vector read that was split across two active
/// sources: both halves must complete (or either may fail) before the
/// caller sees a result, and a successful result reports total bytes read
/// across both.
#[pin_project]
pub struct SplitReadFuture {
    #[pin]
    inner: Join<ReadFuture, ReadFuture>,
}

impl SplitReadFuture {
    pub fn new(front: ReadFuture, back: ReadFuture) -> Self {
        Self {
            inner: join(front, back),
        }
    }
}

impl Future for SplitReadFuture {
    type Output = Result<IoSize, Fail>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready((front, back)) => Poll::Ready(match (front, back) {
                (Ok(a), Ok(b)) => Ok(a + b),
                (Err(e), _) | (_, Err(e)) => Err(e),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Either shape a dispatched request's future can take: satisfied by one
/// source, or by two sources splitting a vector read between them.
pub enum AnyReadFuture {
    Single(ReadFuture),
    Split(SplitReadFuture),
}

impl Future for AnyReadFuture {
    type Output = Result<IoSize, Fail>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: the match only ever reaches into the active variant's
        // field, never moves it, and the whole enum is dropped in place —
        // the usual "pin projection through an enum" pattern `pin-project`
        // itself does not support.
        match unsafe { self.get_unchecked_mut() } {
            AnyReadFuture::Single(f) => unsafe { Pin::new_unchecked(f) }.poll(cx),
            AnyReadFuture::Split(f) => unsafe { Pin::new_unchecked(f) }.poll(cx),
        }
    }
}

/// Tracks one outstanding request from the wire layer's point of view:
/// which offset/buffers it covers and the channel its resolution is
/// reported through. Owned exclusively by the `Source` it was dispatched
/// to, via that source's slab.
pub struct ClientRequest {
    pub offset: IoOffset,
    pub size: IoSize,
    completion: Option<Completion>,
}

impl ClientRequest {
    pub fn new(offset: IoOffset, size: IoSize, completion: Completion) -> Self {
        Self {
            offset,
            size,
            completion: Some(completion),
        }
    }

    /// Resolves this request's future with the outcome of its wire
    /// operation. Idempotent-safe: a second call is a silent no-op, since a
    /// request is removed from its owning source's slab (and dropped)
    /// immediately after its first completion.
    pub fn complete(&mut self, result: Result<IoSize, Fail>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}
