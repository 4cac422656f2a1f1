//! Piping a readable stream into a writable stream.

use tokio::sync::oneshot;
use tracing::debug;

use crate::config::PipeOptions;
use crate::error::{Reason, StreamError, StreamResult};
use crate::readable::ReadableStream;
use crate::reader::ReadableStreamReader;
use crate::sync::{settled, StreamFuture};
use crate::transform::TransformStream;
use crate::writable::{WritableStream, WritableStreamState, WritableStreamWriter};

enum Step<T> {
    DestinationClosed(StreamResult<()>),
    Read(StreamResult<Option<T>>),
    Ready,
}

/// A running pipe. Owns both locks until it finishes.
struct Pipe<T> {
    reader: ReadableStreamReader<T>,
    writer: WritableStreamWriter<T>,
    options: PipeOptions,
}

impl<T: Send + 'static> Pipe<T> {
    fn lock(
        source: &ReadableStream<T>,
        dest: &WritableStream<T>,
        options: PipeOptions,
    ) -> StreamResult<Self> {
        let reader = source.get_reader()?;
        let writer = dest.get_writer()?;
        Ok(Self {
            reader,
            writer,
            options,
        })
    }

    async fn run(self) -> StreamResult<()> {
        let mut dest_closed = self.writer.closed();
        let mut last_write: Option<StreamFuture<()>> = None;

        loop {
            let mut read = self.reader.read();
            let step: Step<T> = tokio::select! {
                biased;
                outcome = &mut dest_closed => Step::DestinationClosed(outcome),
                result = &mut read => Step::Read(result),
            };
            let chunk = match step {
                Step::DestinationClosed(outcome) => {
                    drop(read);
                    return self.cancel_source(destination_gone(outcome)).await;
                }
                Step::Read(Err(err)) => return self.abort_dest(err).await,
                Step::Read(Ok(None)) => return self.close_dest(last_write).await,
                Step::Read(Ok(Some(chunk))) => chunk,
                Step::Ready => continue,
            };

            let ready = self.writer.ready();
            let step: Step<T> = tokio::select! {
                biased;
                outcome = &mut dest_closed => Step::DestinationClosed(outcome),
                _ = ready => Step::Ready,
            };
            if let Step::DestinationClosed(outcome) = step {
                return self.cancel_source(destination_gone(outcome)).await;
            }

            if self.writer.state() != WritableStreamState::Writable {
                let err = StreamError::state(format!(
                    "destination is {:?}",
                    self.writer.state()
                ));
                return self.cancel_source(err).await;
            }
            last_write = Some(self.writer.write(chunk));
        }
    }

    /// The destination went away: cancel the source, or just let go of it.
    async fn cancel_source(self, err: StreamError) -> StreamResult<()> {
        if self.options.prevent_cancel {
            self.reader.release_lock()?;
            debug!(error = %err, "pipe released source");
        } else {
            let _ = self.reader.cancel(Reason::from(err.clone())).await;
            debug!(error = %err, "pipe cancelled source");
        }
        Err(err)
    }

    async fn abort_dest(self, err: StreamError) -> StreamResult<()> {
        if !self.options.prevent_abort {
            let _ = self.writer.abort(Reason::from(err.clone())).await;
        }
        debug!(error = %err, "pipe source errored");
        Err(err)
    }

    async fn close_dest(self, last_write: Option<StreamFuture<()>>) -> StreamResult<()> {
        if self.options.prevent_close {
            if let Some(write) = last_write {
                write.await?;
            }
        } else {
            self.writer.close().await?;
        }
        debug!("pipe finished");
        Ok(())
    }
}

fn destination_gone(outcome: StreamResult<()>) -> StreamError {
    match outcome {
        Ok(()) => StreamError::state("destination closed"),
        Err(err) => err,
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Pipe every chunk into `dest`.
    ///
    /// Both streams are locked before this returns. The future resolves once
    /// the source is exhausted and `dest` is closed, or rejects with the error
    /// that ended the pipe. A source error aborts `dest`; `dest` closing or
    /// erroring first cancels the source. `options` turns each of those
    /// propagations off.
    pub fn pipe_to(&self, dest: &WritableStream<T>, options: PipeOptions) -> StreamFuture<()> {
        let pipe = match Pipe::lock(self, dest, options) {
            Ok(pipe) => pipe,
            Err(err) => return settled(Err(err)),
        };

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(pipe.run().await);
        });
        Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(StreamError::state("pipe task was dropped")))
        })
    }

    /// Pipe into the writable side of `transform` and return its readable side.
    pub fn pipe_through<O: Send + 'static>(
        &self,
        transform: &TransformStream<T, O>,
        options: PipeOptions,
    ) -> StreamResult<ReadableStream<O>> {
        let pipe = Pipe::lock(self, transform.writable(), options)?;
        tokio::spawn(async move {
            if let Err(err) = pipe.run().await {
                debug!(error = %err, "pipe through transform ended early");
            }
        });
        Ok(transform.readable().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readable::{ReadableStreamController, ReadableStreamState};
    use crate::sink::Sink;
    use crate::source::Source;
    use crate::transform::TransformStreamController;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Collect {
        chunks: Arc<Mutex<Vec<u32>>>,
        closed: Arc<Mutex<bool>>,
        aborted: Arc<Mutex<Option<Reason>>>,
        fail_on: Option<u32>,
    }

    #[async_trait]
    impl Sink<u32> for Collect {
        async fn write(&mut self, chunk: u32) -> StreamResult<()> {
            if self.fail_on == Some(chunk) {
                return Err(StreamError::Failed(format!("rejected {}", chunk)));
            }
            self.chunks.lock().push(chunk);
            Ok(())
        }

        async fn close(&mut self) -> StreamResult<()> {
            *self.closed.lock() = true;
            Ok(())
        }

        async fn abort(&mut self, reason: Reason) -> StreamResult<()> {
            *self.aborted.lock() = Some(reason);
            Ok(())
        }
    }

    /// Counts up forever and remembers whether it was cancelled.
    #[derive(Default)]
    struct Counter {
        next: u32,
        cancelled: Arc<Mutex<Option<Reason>>>,
    }

    #[async_trait]
    impl Source<u32> for Counter {
        async fn pull(&mut self, controller: &ReadableStreamController<u32>) -> StreamResult<()> {
            self.next += 1;
            controller.enqueue(self.next)
        }

        async fn cancel(&mut self, reason: Reason) -> StreamResult<()> {
            *self.cancelled.lock() = Some(reason);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pipe_copies_and_closes() {
        let sink = Collect::default();
        let source = ReadableStream::from_chunks(vec![1, 2, 3]);
        let dest = WritableStream::new(sink.clone());

        source.pipe_to(&dest, PipeOptions::default()).await.unwrap();

        assert_eq!(*sink.chunks.lock(), vec![1, 2, 3]);
        assert!(*sink.closed.lock());
        assert_eq!(dest.state(), WritableStreamState::Closed);
        assert!(!dest.locked());
    }

    #[tokio::test]
    async fn test_pipe_locks_both_streams() {
        let source = ReadableStream::from_chunks(vec![1u32]);
        let dest = WritableStream::new(Collect::default());
        let _reader = source.get_reader().unwrap();

        let result = source.pipe_to(&dest, PipeOptions::default()).await;
        assert!(matches!(result, Err(StreamError::Lock(_))));
        assert!(!dest.locked());
    }

    #[tokio::test]
    async fn test_prevent_close_leaves_destination_open() {
        let sink = Collect::default();
        let dest = WritableStream::new(sink.clone());

        ReadableStream::from_chunks(vec![4, 5])
            .pipe_to(&dest, PipeOptions::new().prevent_close())
            .await
            .unwrap();

        assert_eq!(*sink.chunks.lock(), vec![4, 5]);
        assert_eq!(dest.state(), WritableStreamState::Writable);
        dest.write(6).await.unwrap();
    }

    #[tokio::test]
    async fn test_source_error_aborts_destination() {
        let sink = Collect::default();
        let source = ReadableStream::new(Counter::default());
        let dest = WritableStream::new(sink.clone());
        let controller = source.controller();

        let piping = source.pipe_to(&dest, PipeOptions::default());
        controller.error("upstream broke").unwrap();

        assert!(matches!(piping.await, Err(StreamError::Failed(_))));
        assert!(sink.aborted.lock().is_some());
        assert_eq!(dest.state(), WritableStreamState::Errored);
    }

    #[tokio::test]
    async fn test_prevent_abort_leaves_destination_writable() {
        let sink = Collect::default();
        let source = ReadableStream::new(Counter::default());
        let dest = WritableStream::new(sink.clone());
        let controller = source.controller();

        let piping = source.pipe_to(&dest, PipeOptions::new().prevent_abort());
        controller.error("upstream broke").unwrap();

        assert!(matches!(piping.await, Err(StreamError::Failed(_))));
        assert!(sink.aborted.lock().is_none());
        assert_eq!(dest.state(), WritableStreamState::Writable);
        assert!(!dest.locked());
    }

    #[tokio::test]
    async fn test_destination_error_cancels_source() {
        let counter = Counter::default();
        let cancelled = counter.cancelled.clone();
        let source = ReadableStream::new(counter);
        let sink = Collect {
            fail_on: Some(3),
            ..Default::default()
        };
        let dest = WritableStream::new(sink.clone());

        let result = source.pipe_to(&dest, PipeOptions::default()).await;

        assert!(matches!(result, Err(StreamError::Failed(_))));
        assert_eq!(source.state(), ReadableStreamState::Closed);
        assert!(cancelled.lock().is_some());
        assert_eq!(*sink.chunks.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_prevent_cancel_releases_source() {
        let counter = Counter::default();
        let cancelled = counter.cancelled.clone();
        let source = ReadableStream::new(counter);
        let dest = WritableStream::new(Collect {
            fail_on: Some(2),
            ..Default::default()
        });

        let result = source
            .pipe_to(&dest, PipeOptions::new().prevent_cancel())
            .await;

        assert!(result.is_err());
        assert!(cancelled.lock().is_none());
        assert_eq!(source.state(), ReadableStreamState::Readable);
        assert!(!source.locked());
        let reader = source.get_reader().unwrap();
        assert!(reader.read().await.unwrap().is_some());
    }

    fn double(chunk: u32, controller: &TransformStreamController<u32>) -> StreamResult<()> {
        controller.enqueue(chunk * 2)
    }

    #[tokio::test]
    async fn test_pipe_through_transform() {
        let doubler = TransformStream::from_fn(double);
        let output = ReadableStream::from_chunks(vec![1u32, 2, 3])
            .pipe_through(&doubler, PipeOptions::default())
            .unwrap();

        let reader = output.get_reader().unwrap();
        let mut seen = Vec::new();
        while let Some(chunk) = reader.read().await.unwrap() {
            seen.push(chunk);
        }
        assert_eq!(seen, vec![2, 4, 6]);
    }
}
