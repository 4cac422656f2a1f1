//! The consumer handle of a readable stream.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Reason, StreamError, StreamResult};
use crate::readable::ReadableShared;
use crate::sync::{settled, LockToken, Signal, StreamFuture};

/// What a reader knows about its stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ReaderStatus {
    Attached,
    Closed,
    Errored(StreamError),
    Released,
}

/// Reader-side state that outlives the lock.
///
/// The stream settles it when it closes, errors or lets the reader go.
#[derive(Debug)]
pub(crate) struct ReaderCore {
    status: Mutex<ReaderStatus>,
    closed: Signal,
    /// Total weight of the chunks handed to this reader.
    consumed: Mutex<f64>,
}

impl ReaderCore {
    pub(crate) fn new() -> Self {
        Self {
            status: Mutex::new(ReaderStatus::Attached),
            closed: Signal::pending(),
            consumed: Mutex::new(0.0),
        }
    }

    pub(crate) fn consumed(&self) -> f64 {
        *self.consumed.lock()
    }

    pub(crate) fn advance(&self, weight: f64) {
        *self.consumed.lock() += weight;
    }

    pub(crate) fn set_consumed(&self, position: f64) {
        *self.consumed.lock() = position;
    }

    pub(crate) fn status(&self) -> ReaderStatus {
        self.status.lock().clone()
    }

    pub(crate) fn settle(&self, status: ReaderStatus) {
        match &status {
            ReaderStatus::Closed => self.closed.resolve(),
            ReaderStatus::Errored(err) => self.closed.reject(err.clone()),
            ReaderStatus::Released => self.closed.reject(StreamError::lock("reader was released")),
            ReaderStatus::Attached => {}
        }
        *self.status.lock() = status;
    }
}

/// Exclusive reader of a [`ReadableStream`](crate::ReadableStream).
///
/// Holding a reader locks the stream. The lock is given up by
/// [`release_lock`](Self::release_lock), by the stream closing or erroring,
/// or by dropping the reader.
pub struct ReadableStreamReader<T> {
    stream: Arc<ReadableShared<T>>,
    token: LockToken,
    core: Arc<ReaderCore>,
}

impl<T: Send + 'static> ReadableStreamReader<T> {
    pub(crate) fn acquire(stream: &Arc<ReadableShared<T>>) -> StreamResult<Self> {
        let (token, core) = stream.acquire_reader()?;
        Ok(Self {
            stream: Arc::clone(stream),
            token,
            core,
        })
    }

    /// Read the next chunk; `None` once the stream is closed.
    ///
    /// The request is registered immediately. If a chunk is queued the
    /// returned future is already resolved; otherwise it resolves when the
    /// source enqueues, or when the stream closes or errors. Several reads may
    /// be outstanding at once and resolve in call order.
    pub fn read(&self) -> StreamFuture<Option<T>> {
        let request = self.stream.read(self.token, &self.core);
        Box::pin(async move { Ok(request.await?.map(|(chunk, _)| chunk)) })
    }

    pub(crate) fn stream(&self) -> &Arc<ReadableShared<T>> {
        &self.stream
    }

    pub(crate) fn token(&self) -> LockToken {
        self.token
    }

    /// Cancel the underlying stream.
    ///
    /// Pending reads are rejected. Cancelling after the stream closed is a
    /// no-op; after it errored, a state error.
    pub fn cancel(&self, reason: impl Into<Reason>) -> StreamFuture<()> {
        if self.stream.is_attached(self.token) {
            return self.stream.cancel(reason.into());
        }
        settled(match self.core.status() {
            ReaderStatus::Closed => Ok(()),
            ReaderStatus::Errored(err) => Err(StreamError::state(format!(
                "cannot cancel an errored stream: {}",
                err
            ))),
            _ => Err(StreamError::lock("reader is not attached to a stream")),
        })
    }
}

impl<T> ReadableStreamReader<T> {
    pub(crate) fn core(&self) -> &ReaderCore {
        &self.core
    }

    /// Settles when the stream closes (Ok) or errors (Err). Also rejects with
    /// a lock error if the reader is released first.
    pub fn closed(&self) -> StreamFuture<()> {
        self.core.closed.wait()
    }

    /// Give up the lock.
    ///
    /// Fails while read requests are still pending. Releasing a reader whose
    /// stream already closed or errored is a no-op.
    pub fn release_lock(&self) -> StreamResult<()> {
        self.stream.release_reader(self.token)
    }

    /// Whether this reader still holds its stream's lock.
    pub fn is_attached(&self) -> bool {
        self.stream.is_attached(self.token)
    }
}

impl<T> fmt::Debug for ReadableStreamReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamReader")
            .field("status", &self.core.status())
            .finish()
    }
}

impl<T> Drop for ReadableStreamReader<T> {
    fn drop(&mut self) {
        self.stream.detach_reader(self.token);
    }
}
