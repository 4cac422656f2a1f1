//! Readable streams with a read position.
//!
//! A [`SeekableStream`] keeps its source open past a logical end: when the
//! source closes, readers see end of data but the stream stays `Readable`, so
//! a later [`seek`](SeekableStreamReader::seek) can rewind into it.

use std::fmt;

use tracing::debug;

use crate::config::Strategy;
use crate::error::{Reason, StreamError, StreamResult};
use crate::readable::{ReadableStream, ReadableStreamState};
use crate::reader::ReadableStreamReader;
use crate::source::Source;
use crate::sync::StreamFuture;

/// A readable stream whose reader tracks and moves its position.
pub struct SeekableStream<T> {
    stream: ReadableStream<T>,
}

impl<T> Clone for SeekableStream<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<T> fmt::Debug for SeekableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SeekableStream").field(&self.stream).finish()
    }
}

impl<T: Send + 'static> SeekableStream<T> {
    /// Create a seekable stream with the default strategy.
    pub fn new<S: Source<T>>(source: S) -> Self {
        Self {
            stream: ReadableStream::build(Box::new(source), Strategy::default(), true),
        }
    }

    /// Create a seekable stream with an explicit strategy.
    pub fn with_strategy<S: Source<T>>(source: S, strategy: Strategy<T>) -> StreamResult<Self> {
        Self::with_prevent_close(source, strategy, true)
    }

    /// Choose whether a source close only marks end of data (`true`, the
    /// default) or closes the stream for good.
    pub fn with_prevent_close<S: Source<T>>(
        source: S,
        strategy: Strategy<T>,
        prevent_close: bool,
    ) -> StreamResult<Self> {
        Ok(Self {
            stream: ReadableStream::build(Box::new(source), strategy.checked()?, prevent_close),
        })
    }

    /// Lock the stream to a new reader positioned at 0.
    pub fn get_reader(&self) -> StreamResult<SeekableStreamReader<T>> {
        Ok(SeekableStreamReader {
            reader: self.stream.get_reader()?,
        })
    }

    /// Cancel the stream.
    pub fn cancel(&self, reason: impl Into<Reason>) -> StreamFuture<()> {
        self.stream.cancel(reason)
    }
}

impl<T> SeekableStream<T> {
    /// Current lifecycle state.
    pub fn state(&self) -> ReadableStreamState {
        self.stream.state()
    }

    /// Whether a reader currently holds the stream.
    pub fn locked(&self) -> bool {
        self.stream.locked()
    }

    /// Whether the source can reposition itself.
    pub fn can_seek(&self) -> bool {
        self.stream.shared().source_can_seek()
    }

    /// The plain readable stream underneath.
    pub fn as_readable(&self) -> &ReadableStream<T> {
        &self.stream
    }
}

/// Reader of a [`SeekableStream`].
///
/// The position advances by each chunk's weight as soon as the chunk leaves
/// the stream, even if the read future is never polled.
pub struct SeekableStreamReader<T> {
    reader: ReadableStreamReader<T>,
}

impl<T: Send + 'static> SeekableStreamReader<T> {
    /// Read the next chunk, advancing the position by its weight.
    pub fn read(&self) -> StreamFuture<Option<T>> {
        self.reader.read()
    }

    /// Move to `position` and return the position actually reached.
    ///
    /// Chunks already in the queue are skipped first. A source that supports
    /// seeking is then asked to reposition; otherwise only forward seeks are
    /// possible, and they read and discard chunks until `position` is reached
    /// or the data runs out. Positions land on chunk boundaries, so the result
    /// may overshoot `position` by part of a chunk.
    pub async fn seek(&self, position: f64) -> StreamResult<f64> {
        if !position.is_finite() || position < 0.0 {
            return Err(StreamError::Seek(format!(
                "invalid seek position {}",
                position
            )));
        }

        let current = self.current_position();
        if position == current {
            return Ok(current);
        }

        let stream = self.reader.stream();
        let token = self.reader.token();
        if position > current {
            let reached = stream.skip_queued(token, current, position)?;
            self.reader.core().set_consumed(reached);
            if reached >= position {
                return Ok(reached);
            }
        }

        if stream.source_can_seek() {
            stream.seek_source(token, position).await?;
            self.reader.core().set_consumed(position);
            debug!(position, "seeked source");
            return Ok(position);
        }

        if position < current {
            return Err(StreamError::Seek(
                "cannot seek backward without source support".to_string(),
            ));
        }

        loop {
            let reached = self.current_position();
            if reached >= position {
                return Ok(reached);
            }
            if self.read().await?.is_none() {
                debug!(position, reached, "seek stopped at end of data");
                return Ok(reached);
            }
        }
    }

    /// Cancel the underlying stream.
    pub fn cancel(&self, reason: impl Into<Reason>) -> StreamFuture<()> {
        self.reader.cancel(reason)
    }
}

impl<T> SeekableStreamReader<T> {
    /// Sum of the weights of every chunk read or skipped so far.
    pub fn current_position(&self) -> f64 {
        self.reader.core().consumed()
    }

    /// Settles when the stream closes or errors.
    pub fn closed(&self) -> StreamFuture<()> {
        self.reader.closed()
    }

    /// Give up the lock.
    pub fn release_lock(&self) -> StreamResult<()> {
        self.reader.release_lock()
    }
}

impl<T> fmt::Debug for SeekableStreamReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeekableStreamReader")
            .field("position", &self.current_position())
            .field("reader", &self.reader)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readable::ReadableStreamController;
    use crate::source::IterSource;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Numbers {
        next: u64,
        end: u64,
        seeks: Arc<Mutex<Vec<f64>>>,
    }

    impl Numbers {
        fn new(end: u64) -> Self {
            Self {
                next: 0,
                end,
                seeks: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Source<u64> for Numbers {
        async fn pull(&mut self, controller: &ReadableStreamController<u64>) -> StreamResult<()> {
            if self.next >= self.end {
                return controller.close();
            }
            self.next += 1;
            controller.enqueue(self.next - 1)
        }

        fn can_seek(&self) -> bool {
            true
        }

        async fn seek(
            &mut self,
            position: f64,
            _controller: &ReadableStreamController<u64>,
        ) -> StreamResult<()> {
            self.seeks.lock().push(position);
            self.next = position as u64;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_position_tracks_weights() {
        let strategy = Strategy::new(0.0).with_size(|n: &u64| *n as f64);
        let source = IterSource::new(vec![2u64, 3, 5].into_iter());
        let stream = SeekableStream::with_strategy(source, strategy).unwrap();
        let reader = stream.get_reader().unwrap();

        reader.read().await.unwrap();
        reader.read().await.unwrap();
        assert_eq!(reader.current_position(), 5.0);
    }

    #[tokio::test]
    async fn test_dropped_read_still_advances_position() {
        let source = IterSource::new(0..10u32);
        let stream = SeekableStream::with_strategy(source, Strategy::new(5.0)).unwrap();
        let reader = stream.get_reader().unwrap();

        assert_eq!(reader.read().await.unwrap(), Some(0));
        drop(reader.read());

        let next = reader.read().await.unwrap().unwrap();
        assert_eq!(reader.current_position(), f64::from(next) + 1.0);
        assert_eq!(reader.seek(6.0).await.unwrap(), 6.0);
        assert_eq!(reader.read().await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_backward_seek_needs_source_support() {
        let source = IterSource::new(0..10u32);
        let stream = SeekableStream::with_strategy(source, Strategy::new(0.0)).unwrap();
        let reader = stream.get_reader().unwrap();
        reader.read().await.unwrap();
        reader.read().await.unwrap();

        assert!(matches!(reader.seek(1.0).await, Err(StreamError::Seek(_))));
        assert!(matches!(reader.seek(-1.0).await, Err(StreamError::Seek(_))));
        assert_eq!(reader.seek(2.0).await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_forward_seek_scans_reads() {
        let source = IterSource::new(0..10u32);
        let stream = SeekableStream::with_strategy(source, Strategy::new(0.0)).unwrap();
        let reader = stream.get_reader().unwrap();

        assert_eq!(reader.seek(4.0).await.unwrap(), 4.0);
        assert_eq!(reader.read().await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_forward_seek_stops_at_end_of_data() {
        let source = IterSource::new(0..3u32);
        let stream = SeekableStream::with_strategy(source, Strategy::new(0.0)).unwrap();
        let reader = stream.get_reader().unwrap();

        assert_eq!(reader.seek(10.0).await.unwrap(), 3.0);
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(stream.state(), ReadableStreamState::Readable);
    }

    #[tokio::test]
    async fn test_source_seek_rewinds() {
        let source = Numbers::new(5);
        let seeks = source.seeks.clone();
        let stream = SeekableStream::with_strategy(source, Strategy::new(0.0)).unwrap();
        assert!(stream.can_seek());
        let reader = stream.get_reader().unwrap();

        for expected in 0..3 {
            assert_eq!(reader.read().await.unwrap(), Some(expected));
        }
        assert_eq!(reader.seek(1.0).await.unwrap(), 1.0);
        assert_eq!(reader.current_position(), 1.0);
        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert_eq!(*seeks.lock(), vec![1.0]);
    }

    #[tokio::test]
    async fn test_seek_back_after_end_of_data() {
        let stream = SeekableStream::with_strategy(Numbers::new(2), Strategy::new(0.0)).unwrap();
        let reader = stream.get_reader().unwrap();

        assert_eq!(reader.read().await.unwrap(), Some(0));
        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(stream.state(), ReadableStreamState::Readable);

        assert_eq!(reader.seek(0.0).await.unwrap(), 0.0);
        assert_eq!(reader.read().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_without_prevent_close_the_stream_closes() {
        let source = IterSource::new(0..1u32);
        let stream = SeekableStream::with_prevent_close(source, Strategy::new(0.0), false).unwrap();
        let reader = stream.get_reader().unwrap();

        assert_eq!(reader.read().await.unwrap(), Some(0));
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(stream.state(), ReadableStreamState::Closed);
    }
}
