//! Transform streams: a writable side feeding a readable side through a
//! [`Transformer`].

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::Strategy;
use crate::error::{Reason, StreamError, StreamResult};
use crate::readable::{ReadableStream, ReadableStreamController};
use crate::sink::Sink;
use crate::source::Source;
use crate::writable::WritableStream;

/// Turns chunks written to a [`TransformStream`] into chunks read from it.
#[async_trait]
pub trait Transformer<I: Send + 'static, O: Send + 'static>: Send + 'static {
    /// Handle one written chunk, enqueueing any number of output chunks.
    ///
    /// The write that delivered `chunk` resolves when this returns. An error
    /// errors both sides of the stream.
    async fn transform(
        &mut self,
        chunk: I,
        controller: &TransformStreamController<O>,
    ) -> StreamResult<()>;

    /// Called when the writable side closes, before the readable side does.
    async fn flush(&mut self, _controller: &TransformStreamController<O>) -> StreamResult<()> {
        Ok(())
    }
}

/// [`Transformer`] backed by a closure.
pub struct FnTransformer<F> {
    f: F,
}

#[async_trait]
impl<I, O, F> Transformer<I, O> for FnTransformer<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnMut(I, &TransformStreamController<O>) -> StreamResult<()> + Send + 'static,
{
    async fn transform(
        &mut self,
        chunk: I,
        controller: &TransformStreamController<O>,
    ) -> StreamResult<()> {
        (self.f)(chunk, controller)
    }
}

type ErrorFn = Arc<dyn Fn(StreamError) + Send + Sync>;

/// Transformer-facing handle: output goes to the readable side.
pub struct TransformStreamController<O> {
    readable: ReadableStreamController<O>,
    error_writable: ErrorFn,
}

impl<O> Clone for TransformStreamController<O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            error_writable: Arc::clone(&self.error_writable),
        }
    }
}

impl<O> fmt::Debug for TransformStreamController<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStreamController")
            .field("readable", &self.readable)
            .finish()
    }
}

impl<O: Send + 'static> TransformStreamController<O> {
    /// Push a chunk to the readable side.
    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        self.readable.enqueue(chunk)
    }

    /// Close the readable side. Later transforms can no longer enqueue.
    pub fn close(&self) -> StreamResult<()> {
        self.readable.close()
    }

    /// Error both sides.
    pub fn error(&self, err: impl Into<StreamError>) {
        let err = err.into();
        let _ = self.readable.error(err.clone());
        (self.error_writable)(err);
    }

    /// Desired size of the readable side.
    pub fn desired_size(&self) -> Option<f64> {
        self.readable.desired_size()
    }
}

struct TransformState<I> {
    pending: Option<(I, oneshot::Sender<StreamResult<()>>)>,
    transforming: bool,
}

struct TransformCore<I, O> {
    transformer: tokio::sync::Mutex<Box<dyn Transformer<I, O>>>,
    state: Mutex<TransformState<I>>,
    controller: OnceLock<TransformStreamController<O>>,
}

impl<I: Send + 'static, O: Send + 'static> TransformCore<I, O> {
    fn controller(&self) -> StreamResult<TransformStreamController<O>> {
        self.controller
            .get()
            .cloned()
            .ok_or_else(|| StreamError::state("transform stream is not wired yet"))
    }

    /// Run the transform on the pending chunk unless one is already running.
    fn maybe_transform(self: &Arc<Self>) {
        let (chunk, done) = {
            let mut state = self.state.lock();
            if state.transforming {
                return;
            }
            let Some(pending) = state.pending.take() else {
                return;
            };
            state.transforming = true;
            pending
        };

        let core = Arc::clone(self);
        tokio::spawn(async move {
            let result = match core.controller() {
                Ok(controller) => {
                    let result = {
                        let mut transformer = core.transformer.lock().await;
                        transformer.transform(chunk, &controller).await
                    };
                    if let Err(err) = &result {
                        debug!(error = %err, "transform failed");
                        controller.error(err.clone());
                    }
                    result
                }
                Err(err) => Err(err),
            };
            core.state.lock().transforming = false;
            let _ = done.send(result);
        });
    }
}

struct TransformSink<I, O> {
    core: Arc<TransformCore<I, O>>,
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Sink<I> for TransformSink<I, O> {
    async fn write(&mut self, chunk: I) -> StreamResult<()> {
        let (tx, rx) = oneshot::channel();
        self.core.state.lock().pending = Some((chunk, tx));
        trace!("chunk handed to transformer");
        self.core.maybe_transform();
        rx.await
            .unwrap_or_else(|_| Err(StreamError::state("transform was dropped")))
    }

    async fn close(&mut self) -> StreamResult<()> {
        let controller = self.core.controller()?;
        let result = {
            let mut transformer = self.core.transformer.lock().await;
            transformer.flush(&controller).await
        };
        match result {
            Ok(()) => {
                if !controller.readable.is_close_requested() {
                    let _ = controller.readable.close();
                }
                Ok(())
            }
            Err(err) => {
                debug!(error = %err, "flush failed");
                controller.error(err.clone());
                Err(err)
            }
        }
    }

    async fn abort(&mut self, reason: Reason) -> StreamResult<()> {
        let controller = self.core.controller()?;
        let _ = controller.readable.error(StreamError::Aborted(reason));
        Ok(())
    }
}

struct TransformSource<I, O> {
    core: Arc<TransformCore<I, O>>,
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Source<O> for TransformSource<I, O> {
    async fn pull(&mut self, _controller: &ReadableStreamController<O>) -> StreamResult<()> {
        self.core.maybe_transform();
        Ok(())
    }

    async fn cancel(&mut self, reason: Reason) -> StreamResult<()> {
        let controller = self.core.controller()?;
        (controller.error_writable)(StreamError::Cancelled(reason));
        Ok(())
    }
}

/// A writable/readable pair joined by a [`Transformer`].
///
/// # Example
///
/// ```rust
/// use backflow::{TransformStream, TransformStreamController, StreamResult};
///
/// # async fn example() -> StreamResult<()> {
/// let upper = TransformStream::from_fn(
///     |chunk: String, controller: &TransformStreamController<String>| {
///         controller.enqueue(chunk.to_uppercase())
///     },
/// );
/// upper.writable().write("a".to_string()).await?;
/// let reader = upper.readable().get_reader()?;
/// assert_eq!(reader.read().await?, Some("A".to_string()));
/// # Ok(())
/// # }
/// ```
pub struct TransformStream<I, O> {
    writable: WritableStream<I>,
    readable: ReadableStream<O>,
}

impl<I, O> Clone for TransformStream<I, O> {
    fn clone(&self) -> Self {
        Self {
            writable: self.writable.clone(),
            readable: self.readable.clone(),
        }
    }
}

impl<I, O> fmt::Debug for TransformStream<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStream")
            .field("writable", &self.writable)
            .field("readable", &self.readable)
            .finish()
    }
}

impl<I: Send + 'static, O: Send + 'static> TransformStream<I, O> {
    /// Writable side buffers one chunk; readable side buffers none.
    pub fn new<X: Transformer<I, O>>(transformer: X) -> Self {
        Self::build(Box::new(transformer), Strategy::default(), Strategy::new(0.0))
    }

    /// Explicit strategies for each side.
    pub fn with_strategies<X: Transformer<I, O>>(
        transformer: X,
        writable_strategy: Strategy<I>,
        readable_strategy: Strategy<O>,
    ) -> StreamResult<Self> {
        Ok(Self::build(
            Box::new(transformer),
            writable_strategy.checked()?,
            readable_strategy.checked()?,
        ))
    }

    /// Transform each chunk with a closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnMut(I, &TransformStreamController<O>) -> StreamResult<()> + Send + 'static,
    {
        Self::new(FnTransformer { f })
    }

    fn build(
        transformer: Box<dyn Transformer<I, O>>,
        writable_strategy: Strategy<I>,
        readable_strategy: Strategy<O>,
    ) -> Self {
        let core = Arc::new(TransformCore {
            transformer: tokio::sync::Mutex::new(transformer),
            state: Mutex::new(TransformState {
                pending: None,
                transforming: false,
            }),
            controller: OnceLock::new(),
        });

        let readable = ReadableStream::build(
            Box::new(TransformSource {
                core: Arc::clone(&core),
            }),
            readable_strategy,
            false,
        );
        let writable = WritableStream::build(
            Box::new(TransformSink {
                core: Arc::clone(&core),
            }),
            writable_strategy,
        );

        let writable_controller = writable.controller();
        let _ = core.controller.set(TransformStreamController {
            readable: readable.controller(),
            error_writable: Arc::new(move |err| {
                let _ = writable_controller.error(err);
            }),
        });

        Self { writable, readable }
    }
}

impl<I, O> TransformStream<I, O> {
    /// The side chunks are written to.
    pub fn writable(&self) -> &WritableStream<I> {
        &self.writable
    }

    /// The side transformed chunks are read from.
    pub fn readable(&self) -> &ReadableStream<O> {
        &self.readable
    }

    /// Split into the writable and readable sides.
    pub fn into_parts(self) -> (WritableStream<I>, ReadableStream<O>) {
        (self.writable, self.readable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readable::ReadableStreamState;
    use crate::writable::WritableStreamState;

    fn shout(
        chunk: &'static str,
        controller: &TransformStreamController<String>,
    ) -> StreamResult<()> {
        controller.enqueue(chunk.to_uppercase())
    }

    fn upper() -> TransformStream<&'static str, String> {
        TransformStream::from_fn(shout)
    }

    struct Summing(u32);

    #[async_trait]
    impl Transformer<u32, u32> for Summing {
        async fn transform(
            &mut self,
            chunk: u32,
            _controller: &TransformStreamController<u32>,
        ) -> StreamResult<()> {
            if chunk == 0 {
                return Err(StreamError::Failed("zero is not allowed".to_string()));
            }
            self.0 += chunk;
            Ok(())
        }

        async fn flush(&mut self, controller: &TransformStreamController<u32>) -> StreamResult<()> {
            controller.enqueue(self.0)
        }
    }

    #[tokio::test]
    async fn test_sequential_writes_come_out_in_order() {
        let stream = upper();
        stream.writable().write("a").await.unwrap();
        stream.writable().write("b").await.unwrap();

        let reader = stream.readable().get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some("A".to_string()));
        assert_eq!(reader.read().await.unwrap(), Some("B".to_string()));
    }

    #[tokio::test]
    async fn test_flush_runs_before_readable_closes() {
        let stream = TransformStream::new(Summing(0));
        let reader = stream.readable().get_reader().unwrap();

        stream.writable().write(2).await.unwrap();
        stream.writable().write(3).await.unwrap();
        stream.writable().close().await.unwrap();

        assert_eq!(reader.read().await.unwrap(), Some(5));
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(stream.writable().state(), WritableStreamState::Closed);
    }

    #[tokio::test]
    async fn test_transform_error_errors_both_sides() {
        let stream = TransformStream::new(Summing(0));

        assert!(stream.writable().write(0).await.is_err());
        assert_eq!(stream.writable().state(), WritableStreamState::Errored);
        assert_eq!(stream.readable().state(), ReadableStreamState::Errored);
    }

    #[tokio::test]
    async fn test_abort_errors_readable_side() {
        let stream = upper();
        stream.writable().abort("stop").await.unwrap();

        assert_eq!(stream.readable().state(), ReadableStreamState::Errored);
        assert!(stream.readable().get_reader().is_err());
    }

    #[tokio::test]
    async fn test_cancel_errors_writable_side() {
        let stream = upper();
        stream.readable().cancel("no more").await.unwrap();

        assert_eq!(stream.readable().state(), ReadableStreamState::Closed);
        assert_eq!(stream.writable().state(), WritableStreamState::Errored);
        assert!(matches!(
            stream.writable().write("late").await,
            Err(StreamError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_controller_close_terminates_readable() {
        let stream = TransformStream::from_fn(|chunk, controller: &TransformStreamController<u32>| {
            controller.enqueue(chunk)?;
            controller.close()
        });
        let reader = stream.readable().get_reader().unwrap();

        stream.writable().write(7).await.unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(7));
        assert_eq!(reader.read().await.unwrap(), None);
    }
}
