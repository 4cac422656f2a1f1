//! Writable streams.
//!
//! A [`WritableStream`] queues chunks and hands them to its [`Sink`] one at a
//! time. The stream moves between `Writable` and `Waiting` as the queued weight
//! (the chunk in flight included) crosses the strategy's high-water mark; new
//! writes are only accepted while `Writable`, and [`ready`](WritableStream::ready)
//! resolves whenever the stream leaves `Waiting`.
//!
//! ```text
//! Writable <-> Waiting
//!     \         /
//!      Closing ---> Closed
//!
//! any non-terminal state ---> Errored
//! ```

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::Strategy;
use crate::error::{Reason, StreamError, StreamResult};
use crate::sink::Sink;
use crate::size_queue::SizeQueue;
use crate::sync::{settled, LockToken, Signal, StreamFuture};

/// Lifecycle state of a writable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableStreamState {
    /// Accepting writes
    Writable,
    /// Backpressure applied; wait for `ready` before writing
    Waiting,
    /// Close requested; queued writes are still being flushed
    Closing,
    /// Sink closed successfully
    Closed,
    /// Failed or aborted
    Errored,
}

type Completion = oneshot::Sender<StreamResult<()>>;

enum WriteRecord<T> {
    Chunk(T, Completion),
    Close(Completion),
}

impl<T> WriteRecord<T> {
    fn reject(self, err: StreamError) {
        match self {
            WriteRecord::Chunk(_, done) | WriteRecord::Close(done) => {
                let _ = done.send(Err(err));
            }
        }
    }
}

fn completion(rx: oneshot::Receiver<StreamResult<()>>) -> StreamFuture<()> {
    Box::pin(async move {
        rx.await
            .unwrap_or_else(|_| Err(StreamError::state("write request was dropped")))
    })
}

struct WritableInner<T> {
    state: WritableStreamState,
    queue: SizeQueue<WriteRecord<T>>,
    strategy: Strategy<T>,
    started: bool,
    writing: bool,
    in_flight: f64,
    stored_error: Option<StreamError>,
    writer: Option<LockToken>,
    ready: Signal,
    closed: Signal,
}

impl<T> WritableInner<T> {
    fn queued_size(&self) -> f64 {
        self.queue.total_size() + self.in_flight
    }

    fn desired_size(&self) -> f64 {
        self.strategy.high_water_mark() - self.queued_size()
    }

    fn sync_backpressure(&mut self) {
        let backpressure = self.queued_size() > self.strategy.high_water_mark();
        match self.state {
            WritableStreamState::Writable if backpressure => {
                self.state = WritableStreamState::Waiting;
                self.ready.reset();
            }
            WritableStreamState::Waiting if !backpressure => {
                self.state = WritableStreamState::Writable;
                self.ready.resolve();
            }
            _ => {}
        }
    }

    fn fail(&mut self, err: StreamError) -> bool {
        if matches!(
            self.state,
            WritableStreamState::Closed | WritableStreamState::Errored
        ) {
            return false;
        }
        self.state = WritableStreamState::Errored;
        self.stored_error = Some(err.clone());
        for record in self.queue.empty() {
            record.reject(err.clone());
        }
        self.ready.resolve();
        self.closed.reject(err.clone());
        debug!(error = %err, "writable stream errored");
        true
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| StreamError::state("stream is errored"))
    }

    fn check_holder(&self, holder: Option<LockToken>) -> StreamResult<()> {
        if self.writer == holder {
            return Ok(());
        }
        Err(match holder {
            None => StreamError::lock("stream is locked to a writer"),
            Some(_) => StreamError::lock("writer is not attached to a stream"),
        })
    }
}

pub(crate) struct WritableShared<T> {
    inner: Mutex<WritableInner<T>>,
    sink: tokio::sync::Mutex<Box<dyn Sink<T>>>,
}

impl<T> WritableShared<T> {
    fn release_writer(&self, token: LockToken) {
        let mut inner = self.inner.lock();
        if inner.writer == Some(token) {
            inner.writer = None;
        }
    }
}

impl<T: Send + 'static> WritableShared<T> {
    fn spawn(sink: Box<dyn Sink<T>>, strategy: Strategy<T>) -> Arc<Self> {
        let shared = Arc::new(Self {
            inner: Mutex::new(WritableInner {
                state: WritableStreamState::Writable,
                queue: SizeQueue::new(),
                strategy,
                started: false,
                writing: false,
                in_flight: 0.0,
                stored_error: None,
                writer: None,
                ready: Signal::resolved(),
                closed: Signal::pending(),
            }),
            sink: tokio::sync::Mutex::new(sink),
        });

        let task = Arc::clone(&shared);
        tokio::spawn(async move {
            let controller = WritableStreamController {
                stream: Arc::downgrade(&task),
            };
            let result = {
                let mut sink = task.sink.lock().await;
                sink.start(&controller).await
            };
            match result {
                Ok(()) => {
                    task.inner.lock().started = true;
                    task.advance();
                }
                Err(err) => {
                    task.inner.lock().fail(err);
                }
            }
        });

        shared
    }

    fn write(self: &Arc<Self>, holder: Option<LockToken>, chunk: T) -> StreamFuture<()> {
        let mut inner = self.inner.lock();
        if let Err(err) = inner.check_holder(holder) {
            return settled(Err(err));
        }
        match inner.state {
            WritableStreamState::Writable => {}
            WritableStreamState::Errored => return settled(Err(inner.stored_error())),
            state => {
                return settled(Err(StreamError::state(format!(
                    "cannot write to a {:?} stream",
                    state
                ))))
            }
        }
        let weight = match inner.strategy.size_of(&chunk) {
            Ok(weight) => weight,
            Err(err) => {
                inner.fail(err.clone());
                return settled(Err(err));
            }
        };

        let (tx, rx) = oneshot::channel();
        inner.queue.enqueue(WriteRecord::Chunk(chunk, tx), weight);
        inner.sync_backpressure();
        trace!(queued = inner.queue.len(), state = ?inner.state, "write queued");
        drop(inner);

        self.advance();
        completion(rx)
    }

    fn close(self: &Arc<Self>, holder: Option<LockToken>) -> StreamFuture<()> {
        let mut inner = self.inner.lock();
        if let Err(err) = inner.check_holder(holder) {
            return settled(Err(err));
        }
        match inner.state {
            WritableStreamState::Writable | WritableStreamState::Waiting => {}
            WritableStreamState::Errored => return settled(Err(inner.stored_error())),
            state => {
                return settled(Err(StreamError::state(format!(
                    "cannot close a {:?} stream",
                    state
                ))))
            }
        }

        inner.state = WritableStreamState::Closing;
        inner.ready.resolve();
        let (tx, rx) = oneshot::channel();
        inner.queue.enqueue(WriteRecord::Close(tx), 0.0);
        drop(inner);

        self.advance();
        completion(rx)
    }

    fn abort(self: &Arc<Self>, holder: Option<LockToken>, reason: Reason) -> StreamFuture<()> {
        {
            let mut inner = self.inner.lock();
            if let Err(err) = inner.check_holder(holder) {
                return settled(Err(err));
            }
            match inner.state {
                WritableStreamState::Closed => return settled(Ok(())),
                WritableStreamState::Errored => return settled(Err(inner.stored_error())),
                _ => {
                    inner.fail(StreamError::Aborted(reason.clone()));
                }
            }
        }
        debug!(reason = %reason, "writable stream aborted");

        let shared = Arc::clone(self);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = {
                let mut sink = shared.sink.lock().await;
                sink.abort(reason).await
            };
            let _ = tx.send(result);
        });
        completion(rx)
    }

    /// Start the write loop unless it is already running or cannot run yet.
    fn advance(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if !inner.started
            || inner.writing
            || inner.queue.is_empty()
            || inner.state == WritableStreamState::Errored
        {
            return;
        }
        inner.writing = true;
        drop(inner);

        tokio::spawn(Arc::clone(self).pump());
    }

    async fn pump(self: Arc<Self>) {
        loop {
            let record = {
                let mut inner = self.inner.lock();
                if inner.state == WritableStreamState::Errored {
                    inner.writing = false;
                    return;
                }
                match inner.queue.dequeue() {
                    Some((record, weight)) => {
                        inner.in_flight = weight;
                        record
                    }
                    None => {
                        inner.writing = false;
                        return;
                    }
                }
            };

            match record {
                WriteRecord::Chunk(chunk, done) => {
                    let result = {
                        let mut sink = self.sink.lock().await;
                        sink.write(chunk).await
                    };
                    let mut inner = self.inner.lock();
                    inner.in_flight = 0.0;
                    match result {
                        Ok(()) => {
                            let _ = done.send(Ok(()));
                            inner.sync_backpressure();
                        }
                        Err(err) => {
                            let _ = done.send(Err(err.clone()));
                            inner.fail(err);
                            inner.writing = false;
                            return;
                        }
                    }
                }
                WriteRecord::Close(done) => {
                    let result = {
                        let mut sink = self.sink.lock().await;
                        sink.close().await
                    };
                    let mut inner = self.inner.lock();
                    match result {
                        Ok(()) => {
                            if inner.state == WritableStreamState::Closing {
                                inner.state = WritableStreamState::Closed;
                                inner.closed.resolve();
                                debug!("writable stream closed");
                            }
                            let _ = done.send(Ok(()));
                        }
                        Err(err) => {
                            let _ = done.send(Err(err.clone()));
                            inner.fail(err);
                        }
                    }
                    inner.writing = false;
                    return;
                }
            }
        }
    }
}

/// Sink-facing handle of a writable stream, handed to [`Sink::start`].
pub struct WritableStreamController<T> {
    stream: Weak<WritableShared<T>>,
}

impl<T> Clone for WritableStreamController<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<T> fmt::Debug for WritableStreamController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStreamController")
            .field("alive", &(self.stream.strong_count() > 0))
            .finish()
    }
}

impl<T> WritableStreamController<T> {
    /// Error the stream, rejecting every queued write.
    pub fn error(&self, err: impl Into<StreamError>) -> StreamResult<()> {
        let stream = self
            .stream
            .upgrade()
            .ok_or_else(|| StreamError::state("stream has been dropped"))?;
        let failed = stream.inner.lock().fail(err.into());
        if failed {
            Ok(())
        } else {
            Err(StreamError::state("stream has already finished"))
        }
    }

    /// `high_water_mark - queued weight`; `None` once the stream is gone or errored.
    pub fn desired_size(&self) -> Option<f64> {
        let stream = self.stream.upgrade()?;
        let inner = stream.inner.lock();
        match inner.state {
            WritableStreamState::Errored => None,
            _ => Some(inner.desired_size()),
        }
    }
}

/// A stream of chunks consumed by a [`Sink`].
///
/// Handles are cheap to clone; clones refer to the same stream.
pub struct WritableStream<T> {
    shared: Arc<WritableShared<T>>,
}

impl<T> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for WritableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("WritableStream")
            .field("state", &inner.state)
            .field("queued", &inner.queue.len())
            .field("ready", &inner.ready.is_settled())
            .field("locked", &inner.writer.is_some())
            .finish()
    }
}

impl<T: Send + 'static> WritableStream<T> {
    /// Create a stream over `sink` with the default strategy.
    ///
    /// # Panics
    ///
    /// Must be called within a tokio runtime; the sink is started on a
    /// spawned task.
    pub fn new<S: Sink<T>>(sink: S) -> Self {
        Self::build(Box::new(sink), Strategy::default())
    }

    /// Create a stream with an explicit strategy.
    pub fn with_strategy<S: Sink<T>>(sink: S, strategy: Strategy<T>) -> StreamResult<Self> {
        Ok(Self::build(Box::new(sink), strategy.checked()?))
    }

    pub(crate) fn build(sink: Box<dyn Sink<T>>, strategy: Strategy<T>) -> Self {
        Self {
            shared: WritableShared::spawn(sink, strategy),
        }
    }

    /// Lock the stream to a new writer.
    pub fn get_writer(&self) -> StreamResult<WritableStreamWriter<T>> {
        let token = {
            let mut inner = self.shared.inner.lock();
            if inner.writer.is_some() {
                return Err(StreamError::lock("stream is already locked to a writer"));
            }
            let token = LockToken::mint();
            inner.writer = Some(token);
            token
        };
        Ok(WritableStreamWriter {
            stream: Arc::clone(&self.shared),
            token,
        })
    }

    /// Queue a chunk. Rejected unless the stream is `Writable` and unlocked.
    pub fn write(&self, chunk: T) -> StreamFuture<()> {
        self.shared.write(None, chunk)
    }

    /// Close after every queued chunk has been written.
    pub fn close(&self) -> StreamFuture<()> {
        self.shared.close(None)
    }

    /// Abort: queued writes are rejected and the sink is told to give up.
    pub fn abort(&self, reason: impl Into<Reason>) -> StreamFuture<()> {
        self.shared.abort(None, reason.into())
    }

    pub(crate) fn controller(&self) -> WritableStreamController<T> {
        WritableStreamController {
            stream: Arc::downgrade(&self.shared),
        }
    }
}

impl<T> WritableStream<T> {
    /// Current lifecycle state.
    pub fn state(&self) -> WritableStreamState {
        self.shared.inner.lock().state
    }

    /// Whether a writer currently holds the stream.
    pub fn locked(&self) -> bool {
        self.shared.inner.lock().writer.is_some()
    }

    /// `high_water_mark - queued weight`.
    pub fn desired_size(&self) -> f64 {
        self.shared.inner.lock().desired_size()
    }

    /// Resolves when the stream is not `Waiting`.
    pub fn ready(&self) -> StreamFuture<()> {
        self.shared.inner.lock().ready.wait()
    }

    /// Resolves when the sink has closed; rejects if the stream errors.
    pub fn closed(&self) -> StreamFuture<()> {
        self.shared.inner.lock().closed.wait()
    }
}

/// Exclusive writer of a [`WritableStream`].
pub struct WritableStreamWriter<T> {
    stream: Arc<WritableShared<T>>,
    token: LockToken,
}

impl<T: Send + 'static> WritableStreamWriter<T> {
    /// Queue a chunk. Rejected unless the stream is `Writable`.
    pub fn write(&self, chunk: T) -> StreamFuture<()> {
        self.stream.write(Some(self.token), chunk)
    }

    /// Close after every queued chunk has been written.
    pub fn close(&self) -> StreamFuture<()> {
        self.stream.close(Some(self.token))
    }

    /// Abort the stream.
    pub fn abort(&self, reason: impl Into<Reason>) -> StreamFuture<()> {
        self.stream.abort(Some(self.token), reason.into())
    }
}

impl<T> WritableStreamWriter<T> {
    /// Resolves when the stream is not `Waiting`.
    pub fn ready(&self) -> StreamFuture<()> {
        self.stream.inner.lock().ready.wait()
    }

    /// Resolves when the sink has closed; rejects if the stream errors.
    pub fn closed(&self) -> StreamFuture<()> {
        self.stream.inner.lock().closed.wait()
    }

    /// Current state of the underlying stream.
    pub fn state(&self) -> WritableStreamState {
        self.stream.inner.lock().state
    }

    /// `high_water_mark - queued weight`.
    pub fn desired_size(&self) -> f64 {
        self.stream.inner.lock().desired_size()
    }

    /// Give up the lock. Queued writes still complete.
    pub fn release_lock(&self) {
        self.stream.release_writer(self.token);
    }
}

impl<T> fmt::Debug for WritableStreamWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStreamWriter")
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Drop for WritableStreamWriter<T> {
    fn drop(&mut self) {
        self.stream.release_writer(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Clone, Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Sink<&'static str> for Recorder {
        async fn write(&mut self, chunk: &'static str) -> StreamResult<()> {
            tokio::task::yield_now().await;
            if self.fail_on == Some(chunk) {
                return Err(StreamError::Failed(format!("cannot write {}", chunk)));
            }
            self.log.lock().push(format!("write:{}", chunk));
            Ok(())
        }

        async fn close(&mut self) -> StreamResult<()> {
            self.log.lock().push("close".to_string());
            Ok(())
        }

        async fn abort(&mut self, reason: Reason) -> StreamResult<()> {
            self.log.lock().push(format!("abort:{}", reason));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_writes_then_close_in_order() {
        let sink = Recorder::default();
        let log = sink.log.clone();
        let stream = WritableStream::new(sink);

        let first = stream.write("a");
        assert_eq!(stream.state(), WritableStreamState::Writable);
        first.await.unwrap();
        stream.write("b").await.unwrap();
        stream.close().await.unwrap();

        assert_eq!(stream.state(), WritableStreamState::Closed);
        assert!(stream.closed().await.is_ok());
        assert_eq!(*log.lock(), vec!["write:a", "write:b", "close"]);
        assert!(matches!(stream.write("c").await, Err(StreamError::State(_))));
    }

    #[tokio::test]
    async fn test_zero_high_water_mark_waits_per_write() {
        let stream =
            WritableStream::with_strategy(Recorder::default(), Strategy::new(0.0)).unwrap();

        let pending = stream.write("a");
        assert_eq!(stream.state(), WritableStreamState::Waiting);
        assert!(matches!(stream.write("b").await, Err(StreamError::State(_))));

        pending.await.unwrap();
        stream.ready().await.unwrap();
        assert_eq!(stream.state(), WritableStreamState::Writable);
    }

    #[tokio::test]
    async fn test_backpressure_above_high_water_mark() {
        let stream =
            WritableStream::with_strategy(Recorder::default(), Strategy::new(1.0)).unwrap();

        let a = stream.write("a");
        assert_eq!(stream.state(), WritableStreamState::Writable);
        let b = stream.write("b");
        assert_eq!(stream.state(), WritableStreamState::Waiting);
        assert_eq!(stream.desired_size(), -1.0);

        a.await.unwrap();
        b.await.unwrap();
        stream.ready().await.unwrap();
        assert_eq!(stream.state(), WritableStreamState::Writable);
    }

    #[tokio::test]
    async fn test_sink_failure_errors_stream() {
        let sink = Recorder {
            fail_on: Some("bad"),
            ..Default::default()
        };
        let stream = WritableStream::with_strategy(sink, Strategy::new(10.0)).unwrap();

        let bad = stream.write("bad");
        let after = stream.write("after");
        assert!(matches!(bad.await, Err(StreamError::Failed(_))));
        assert!(matches!(after.await, Err(StreamError::Failed(_))));
        assert_eq!(stream.state(), WritableStreamState::Errored);
        assert!(stream.closed().await.is_err());
    }

    #[tokio::test]
    async fn test_abort_rejects_queue_and_calls_sink() {
        let sink = Recorder::default();
        let log = sink.log.clone();
        let stream = WritableStream::with_strategy(sink, Strategy::new(10.0)).unwrap();

        let queued = stream.write("a");
        stream.abort("shutting down").await.unwrap();

        assert!(matches!(queued.await, Err(StreamError::Aborted(_))));
        assert_eq!(stream.state(), WritableStreamState::Errored);
        assert_eq!(*log.lock(), vec!["abort:shutting down"]);
        assert!(stream.abort("twice").await.is_err());
    }

    #[tokio::test]
    async fn test_writer_locks_stream() {
        let stream = WritableStream::new(Recorder::default());
        let writer = stream.get_writer().unwrap();

        assert!(stream.locked());
        assert!(stream.get_writer().is_err());
        assert!(matches!(stream.write("x").await, Err(StreamError::Lock(_))));

        writer.write("y").await.unwrap();
        writer.release_lock();
        assert!(matches!(writer.write("z").await, Err(StreamError::Lock(_))));
        stream.write("z").await.unwrap();
    }

    #[tokio::test]
    async fn test_controller_error() {
        let stream = WritableStream::new(Recorder::default());
        let controller = stream.controller();
        controller.error("sink unplugged").unwrap();

        assert_eq!(stream.state(), WritableStreamState::Errored);
        assert_eq!(controller.desired_size(), None);
        assert!(controller.error("again").is_err());
    }
}
