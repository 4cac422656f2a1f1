//! Readable streams and their producer-facing controller.
//!
//! A [`ReadableStream`] owns a [`SizeQueue`] of chunks, the underlying
//! [`Source`] and a [`Strategy`]. Producers push through a
//! [`ReadableStreamController`]; consumers pull through a single
//! [`ReadableStreamReader`].
//!
//! Pulling is demand driven. The source is asked for more data while the
//! stream is readable, has started, has no close pending, and either a read
//! request is waiting or the queue weighs less than the high-water mark. Pulls
//! never overlap: a pull requested while another is in flight is remembered
//! and issued as soon as the in-flight one resolves.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::Strategy;
use crate::error::{Reason, StreamError, StreamResult};
use crate::reader::{ReadableStreamReader, ReaderCore, ReaderStatus};
use crate::size_queue::SizeQueue;
use crate::source::{IterSource, Source};
use crate::sync::{settled, LockToken, Signal, StreamFuture};

/// Lifecycle state of a readable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableStreamState {
    /// Chunks may still be enqueued or read
    Readable,
    /// Closed and drained, or cancelled
    Closed,
    /// Failed; the stored error is reported to every consumer
    Errored,
}

/// Answer to a single read request.
pub(crate) enum ReadOutcome<T> {
    Chunk(T, f64),
    Done,
    Failed(StreamError),
}

type ReadRequest<T> = oneshot::Sender<ReadOutcome<T>>;

struct ReaderLink<T> {
    token: LockToken,
    core: Arc<ReaderCore>,
    requests: VecDeque<ReadRequest<T>>,
}

struct ReadableInner<T> {
    state: ReadableStreamState,
    queue: SizeQueue<T>,
    strategy: Strategy<T>,
    close_requested: bool,
    started: bool,
    pulling: bool,
    pull_again: bool,
    /// Source-requested close leaves the stream readable (seekable streams).
    prevent_close: bool,
    /// Set instead of `close_requested` when `prevent_close` is on.
    end_of_data: bool,
    stored_error: Option<StreamError>,
    reader: Option<ReaderLink<T>>,
    /// Resolved once the stream is closed, errored or cancelled.
    finished: Signal,
}

impl<T> ReadableInner<T> {
    fn desired_size(&self) -> f64 {
        self.strategy.high_water_mark() - self.queue.total_size()
    }

    fn has_pending_reads(&self) -> bool {
        self.reader
            .as_ref()
            .map(|link| !link.requests.is_empty())
            .unwrap_or(false)
    }

    fn should_pull(&self) -> bool {
        if self.state != ReadableStreamState::Readable
            || self.close_requested
            || self.end_of_data
            || !self.started
        {
            return false;
        }
        self.has_pending_reads() || self.desired_size() > 0.0
    }

    fn is_attached(&self, token: LockToken) -> bool {
        matches!(&self.reader, Some(link) if link.token == token)
    }

    /// Hand a chunk straight to the oldest live read request. Returns the
    /// chunk if nobody was waiting for it.
    fn deliver(&mut self, mut chunk: T, weight: f64) -> Option<(T, f64)> {
        let Some(link) = self.reader.as_mut() else {
            return Some((chunk, weight));
        };
        while let Some(request) = link.requests.pop_front() {
            match request.send(ReadOutcome::Chunk(chunk, weight)) {
                Ok(()) => {
                    link.core.advance(weight);
                    return None;
                }
                Err(ReadOutcome::Chunk(returned, _)) => chunk = returned,
                Err(_) => return None,
            }
        }
        Some((chunk, weight))
    }

    fn finalize_close(&mut self) {
        self.state = ReadableStreamState::Closed;
        self.finished.resolve();
        if let Some(link) = self.reader.take() {
            for request in link.requests {
                let _ = request.send(ReadOutcome::Done);
            }
            link.core.settle(ReaderStatus::Closed);
        }
        debug!("readable stream closed");
    }

    /// Move to `Errored`. Returns false if the stream had already finished.
    fn fail(&mut self, err: StreamError) -> bool {
        if self.state != ReadableStreamState::Readable {
            return false;
        }
        self.state = ReadableStreamState::Errored;
        self.queue.empty();
        self.stored_error = Some(err.clone());
        self.finished.resolve();
        if let Some(link) = self.reader.take() {
            for request in link.requests {
                let _ = request.send(ReadOutcome::Failed(err.clone()));
            }
            link.core.settle(ReaderStatus::Errored(err.clone()));
        }
        debug!(error = %err, "readable stream errored");
        true
    }

    fn cancel_locked(&mut self, reason: &Reason) {
        self.queue.empty();
        self.state = ReadableStreamState::Closed;
        self.finished.resolve();
        if let Some(link) = self.reader.take() {
            for request in link.requests {
                let _ = request.send(ReadOutcome::Failed(StreamError::Cancelled(reason.clone())));
            }
            link.core.settle(ReaderStatus::Closed);
        }
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| StreamError::state("stream is errored"))
    }
}

/// State shared by a stream, its controller, its reader and its tasks.
pub(crate) struct ReadableShared<T> {
    inner: Mutex<ReadableInner<T>>,
    source: tokio::sync::Mutex<Box<dyn Source<T>>>,
    source_can_seek: bool,
}

impl<T> ReadableShared<T> {
    pub(crate) fn state(&self) -> ReadableStreamState {
        self.inner.lock().state
    }

    pub(crate) fn source_can_seek(&self) -> bool {
        self.source_can_seek
    }

    /// Drop-time release: pending requests of the vanished reader are rejected.
    pub(crate) fn detach_reader(&self, token: LockToken) {
        let mut inner = self.inner.lock();
        if !inner.is_attached(token) {
            return;
        }
        if let Some(link) = inner.reader.take() {
            let err = StreamError::lock("reader was dropped");
            for request in link.requests {
                let _ = request.send(ReadOutcome::Failed(err.clone()));
            }
            link.core.settle(ReaderStatus::Released);
        }
    }

    pub(crate) fn release_reader(&self, token: LockToken) -> StreamResult<()> {
        let mut inner = self.inner.lock();
        match inner.reader.as_mut() {
            Some(link) if link.token == token => {
                link.requests.retain(|request| !request.is_closed());
                if !link.requests.is_empty() {
                    return Err(StreamError::lock(
                        "cannot release a reader with pending read requests",
                    ));
                }
            }
            _ => return Ok(()),
        }
        if let Some(link) = inner.reader.take() {
            link.core.settle(ReaderStatus::Released);
        }
        Ok(())
    }

    pub(crate) fn is_attached(&self, token: LockToken) -> bool {
        self.inner.lock().is_attached(token)
    }
}

impl<T: Send + 'static> ReadableShared<T> {
    fn spawn(source: Box<dyn Source<T>>, strategy: Strategy<T>, prevent_close: bool) -> Arc<Self> {
        let source_can_seek = source.can_seek();
        let shared = Arc::new(Self {
            inner: Mutex::new(ReadableInner {
                state: ReadableStreamState::Readable,
                queue: SizeQueue::new(),
                strategy,
                close_requested: false,
                started: false,
                pulling: false,
                pull_again: false,
                prevent_close,
                end_of_data: false,
                stored_error: None,
                reader: None,
                finished: Signal::pending(),
            }),
            source: tokio::sync::Mutex::new(source),
            source_can_seek,
        });

        let task = Arc::clone(&shared);
        tokio::spawn(async move {
            let controller = ReadableStreamController::new(&task);
            let result = {
                let mut source = task.source.lock().await;
                source.start(&controller).await
            };
            match result {
                Ok(()) => {
                    task.inner.lock().started = true;
                    task.call_pull_if_needed();
                }
                Err(err) => {
                    task.inner.lock().fail(err);
                }
            }
        });

        shared
    }

    pub(crate) fn enqueue(self: &Arc<Self>, chunk: T) -> StreamResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != ReadableStreamState::Readable {
            return Err(StreamError::state(format!(
                "cannot enqueue into a {:?} stream",
                inner.state
            )));
        }
        if inner.close_requested || inner.end_of_data {
            return Err(StreamError::state("cannot enqueue after close was requested"));
        }
        let weight = match inner.strategy.size_of(&chunk) {
            Ok(weight) => weight,
            Err(err) => {
                inner.fail(err.clone());
                return Err(err);
            }
        };
        if let Some((chunk, weight)) = inner.deliver(chunk, weight) {
            inner.queue.enqueue(chunk, weight);
        }
        trace!(queued = inner.queue.len(), "chunk enqueued");
        drop(inner);

        self.call_pull_if_needed();
        Ok(())
    }

    pub(crate) fn request_close(&self) -> StreamResult<()> {
        let mut inner = self.inner.lock();
        if inner.close_requested || inner.end_of_data {
            return Err(StreamError::state("close was already requested"));
        }
        if inner.state != ReadableStreamState::Readable {
            return Err(StreamError::state(format!(
                "cannot close a {:?} stream",
                inner.state
            )));
        }

        if inner.prevent_close {
            inner.end_of_data = true;
            if let Some(link) = inner.reader.as_mut() {
                for request in link.requests.drain(..) {
                    let _ = request.send(ReadOutcome::Done);
                }
            }
            debug!("end of data reached, stream kept open");
            return Ok(());
        }

        inner.close_requested = true;
        if inner.queue.is_empty() {
            inner.finalize_close();
        }
        Ok(())
    }

    pub(crate) fn error(&self, err: StreamError) -> StreamResult<()> {
        if self.inner.lock().fail(err) {
            Ok(())
        } else {
            Err(StreamError::state("cannot error a stream that is not readable"))
        }
    }

    pub(crate) fn call_pull_if_needed(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if !inner.should_pull() {
            return;
        }
        if inner.pulling {
            inner.pull_again = true;
            return;
        }
        inner.pulling = true;
        drop(inner);

        trace!("scheduling pull");
        let shared = Arc::clone(self);
        tokio::spawn(shared.run_pulls());
    }

    async fn run_pulls(self: Arc<Self>) {
        let controller = ReadableStreamController::new(&self);
        loop {
            let result = {
                let mut source = self.source.lock().await;
                source.pull(&controller).await
            };
            let again = {
                let mut inner = self.inner.lock();
                inner.pulling = false;
                match result {
                    Err(err) => {
                        inner.fail(err);
                        false
                    }
                    Ok(()) if inner.pull_again => {
                        inner.pull_again = false;
                        inner.pulling = inner.should_pull();
                        inner.pulling
                    }
                    Ok(()) => false,
                }
            };
            if !again {
                return;
            }
        }
    }

    pub(crate) fn cancel(self: &Arc<Self>, reason: Reason) -> StreamFuture<()> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                ReadableStreamState::Closed => return settled(Ok(())),
                ReadableStreamState::Errored => return settled(Err(inner.stored_error())),
                ReadableStreamState::Readable => inner.cancel_locked(&reason),
            }
        }
        debug!(reason = %reason, "readable stream cancelled");

        let shared = Arc::clone(self);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = {
                let mut source = shared.source.lock().await;
                source.cancel(reason).await
            };
            let _ = tx.send(result);
        });
        Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(StreamError::state("source cancellation was dropped")))
        })
    }

    pub(crate) fn acquire_reader(&self) -> StreamResult<(LockToken, Arc<ReaderCore>)> {
        let mut inner = self.inner.lock();
        if inner.reader.is_some() {
            return Err(StreamError::lock("stream is already locked to a reader"));
        }
        if inner.state != ReadableStreamState::Readable {
            return Err(StreamError::state(format!(
                "cannot get a reader for a {:?} stream",
                inner.state
            )));
        }
        let token = LockToken::mint();
        let core = Arc::new(ReaderCore::new());
        inner.reader = Some(ReaderLink {
            token,
            core: Arc::clone(&core),
            requests: VecDeque::new(),
        });
        Ok((token, core))
    }

    pub(crate) fn read(
        self: &Arc<Self>,
        token: LockToken,
        core: &ReaderCore,
    ) -> StreamFuture<Option<(T, f64)>> {
        let mut inner = self.inner.lock();
        if !inner.is_attached(token) {
            drop(inner);
            return settled(match core.status() {
                ReaderStatus::Closed => Ok(None),
                ReaderStatus::Errored(err) => Err(err),
                _ => Err(StreamError::lock("reader is not attached to a stream")),
            });
        }

        if let Some((chunk, weight)) = inner.queue.dequeue() {
            core.advance(weight);
            if inner.close_requested && inner.queue.is_empty() {
                inner.finalize_close();
            } else {
                drop(inner);
                self.call_pull_if_needed();
            }
            return settled(Ok(Some((chunk, weight))));
        }

        if inner.end_of_data {
            return settled(Ok(None));
        }

        let (tx, rx) = oneshot::channel();
        if let Some(link) = inner.reader.as_mut() {
            link.requests.push_back(tx);
        }
        drop(inner);
        self.call_pull_if_needed();

        Box::pin(async move {
            match rx.await {
                Ok(ReadOutcome::Chunk(chunk, weight)) => Ok(Some((chunk, weight))),
                Ok(ReadOutcome::Done) => Ok(None),
                Ok(ReadOutcome::Failed(err)) => Err(err),
                Err(_) => Err(StreamError::lock("read request was abandoned")),
            }
        })
    }

    /// Consume queued chunks until `target` is reached or the queue runs dry.
    pub(crate) fn skip_queued(
        self: &Arc<Self>,
        token: LockToken,
        from: f64,
        target: f64,
    ) -> StreamResult<f64> {
        let mut position = from;
        {
            let mut inner = self.inner.lock();
            if !inner.is_attached(token) {
                return Err(StreamError::lock("reader is not attached to a stream"));
            }
            while position < target {
                match inner.queue.dequeue() {
                    Some((_, weight)) => position += weight,
                    None => break,
                }
            }
            if inner.close_requested && inner.queue.is_empty() {
                inner.finalize_close();
            }
        }
        self.call_pull_if_needed();
        Ok(position)
    }

    /// Discard buffered data and ask the source to reposition itself.
    pub(crate) async fn seek_source(
        self: &Arc<Self>,
        token: LockToken,
        position: f64,
    ) -> StreamResult<()> {
        let controller = ReadableStreamController::new(self);
        let mut source = self.source.lock().await;
        {
            let mut inner = self.inner.lock();
            if !inner.is_attached(token) {
                return Err(StreamError::lock("reader is not attached to a stream"));
            }
            if inner.state != ReadableStreamState::Readable {
                return Err(StreamError::state(format!(
                    "cannot seek a {:?} stream",
                    inner.state
                )));
            }
            let discarded = inner.queue.empty().len();
            inner.end_of_data = false;
            trace!(discarded, position, "seeking source");
        }
        let result = source.seek(position, &controller).await;
        drop(source);

        if let Err(err) = &result {
            debug!(error = %err, position, "source seek failed");
        }
        self.call_pull_if_needed();
        result
    }
}

/// Producer-facing handle of a readable stream.
///
/// Only the stream mints controllers. A controller holds a weak reference, so
/// a source that keeps its controller does not keep the stream alive; once the
/// stream is gone every call fails with a state error.
pub struct ReadableStreamController<T> {
    stream: Weak<ReadableShared<T>>,
}

impl<T> Clone for ReadableStreamController<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<T> fmt::Debug for ReadableStreamController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamController")
            .field("alive", &(self.stream.strong_count() > 0))
            .finish()
    }
}

impl<T: Send + 'static> ReadableStreamController<T> {
    pub(crate) fn new(shared: &Arc<ReadableShared<T>>) -> Self {
        Self {
            stream: Arc::downgrade(shared),
        }
    }

    fn stream(&self) -> StreamResult<Arc<ReadableShared<T>>> {
        self.stream
            .upgrade()
            .ok_or_else(|| StreamError::state("stream has been dropped"))
    }

    /// Push a chunk. Fails once close has been requested or the stream has
    /// finished.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        self.stream()?.enqueue(chunk)
    }

    /// Request close. Already queued chunks are still delivered.
    pub fn close(&self) -> StreamResult<()> {
        self.stream()?.request_close()
    }

    /// Error the stream, discarding queued chunks.
    pub fn error(&self, err: impl Into<StreamError>) -> StreamResult<()> {
        self.stream()?.error(err.into())
    }

    /// `high_water_mark - queue_size`; `None` once the stream has errored.
    pub fn desired_size(&self) -> Option<f64> {
        let stream = self.stream.upgrade()?;
        let inner = stream.inner.lock();
        match inner.state {
            ReadableStreamState::Readable => Some(inner.desired_size()),
            ReadableStreamState::Closed => Some(0.0),
            ReadableStreamState::Errored => None,
        }
    }

    /// Resolves once the stream has closed, errored or been cancelled.
    ///
    /// Lets a source stop waiting on an external producer.
    pub(crate) fn finished(&self) -> StreamFuture<()> {
        match self.stream.upgrade() {
            Some(stream) => stream.inner.lock().finished.wait(),
            None => settled(Ok(())),
        }
    }

    /// Whether close was requested (or end of data was signalled).
    pub fn is_close_requested(&self) -> bool {
        self.stream
            .upgrade()
            .map(|stream| {
                let inner = stream.inner.lock();
                inner.close_requested || inner.end_of_data
            })
            .unwrap_or(true)
    }
}

/// A stream of chunks produced by a [`Source`].
///
/// Handles are cheap to clone; clones refer to the same stream.
///
/// # Example
///
/// ```rust
/// use backflow::ReadableStream;
///
/// # async fn example() -> backflow::StreamResult<()> {
/// let stream = ReadableStream::from_chunks(vec!["a", "b"]);
/// let reader = stream.get_reader()?;
///
/// assert_eq!(reader.read().await?, Some("a"));
/// assert_eq!(reader.read().await?, Some("b"));
/// assert_eq!(reader.read().await?, None);
/// # Ok(())
/// # }
/// ```
pub struct ReadableStream<T> {
    shared: Arc<ReadableShared<T>>,
}

impl<T> Clone for ReadableStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for ReadableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("ReadableStream")
            .field("state", &inner.state)
            .field("queued", &inner.queue.len())
            .field("locked", &inner.reader.is_some())
            .finish()
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Create a stream over `source` with the default strategy.
    ///
    /// # Panics
    ///
    /// Must be called within a tokio runtime; the source is started on a
    /// spawned task.
    pub fn new<S: Source<T>>(source: S) -> Self {
        Self::build(Box::new(source), Strategy::default(), false)
    }

    /// Create a stream with an explicit strategy.
    pub fn with_strategy<S: Source<T>>(source: S, strategy: Strategy<T>) -> StreamResult<Self> {
        Ok(Self::build(Box::new(source), strategy.checked()?, false))
    }

    /// Create a stream that yields the given chunks and then closes.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(IterSource::new(chunks.into_iter()))
    }

    pub(crate) fn build(
        source: Box<dyn Source<T>>,
        strategy: Strategy<T>,
        prevent_close: bool,
    ) -> Self {
        Self {
            shared: ReadableShared::spawn(source, strategy, prevent_close),
        }
    }

    /// Lock the stream to a new reader.
    ///
    /// Fails if the stream is already locked or is no longer readable.
    pub fn get_reader(&self) -> StreamResult<ReadableStreamReader<T>> {
        ReadableStreamReader::acquire(&self.shared)
    }

    /// Cancel the stream, discarding queued chunks.
    ///
    /// A closed stream cancels successfully as a no-op; an errored stream
    /// reports its error. Fails with a lock error while a reader holds the
    /// stream.
    pub fn cancel(&self, reason: impl Into<Reason>) -> StreamFuture<()> {
        if self.locked() {
            return settled(Err(StreamError::lock("cannot cancel a locked stream")));
        }
        self.shared.cancel(reason.into())
    }

    pub(crate) fn controller(&self) -> ReadableStreamController<T> {
        ReadableStreamController::new(&self.shared)
    }
}

impl<T> ReadableStream<T> {
    /// Current lifecycle state.
    pub fn state(&self) -> ReadableStreamState {
        self.shared.state()
    }

    /// Whether a reader currently holds the stream.
    pub fn locked(&self) -> bool {
        self.shared.inner.lock().reader.is_some()
    }

    /// `high_water_mark - queue_size`.
    pub fn desired_size(&self) -> f64 {
        self.shared.inner.lock().desired_size()
    }

    /// Number of chunks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub(crate) fn shared(&self) -> &Arc<ReadableShared<T>> {
        &self.shared
    }
}
