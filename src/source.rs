//! Underlying source contract for readable streams.
//!
//! A `Source` is the producer side of a [`ReadableStream`](crate::ReadableStream).
//! The stream calls into it through `&mut self`, and never runs two calls at
//! once: the source lives behind an async mutex that the start, pull, cancel
//! and seek tasks take in turn.

use async_trait::async_trait;

use crate::error::{Reason, StreamError, StreamResult};
use crate::readable::ReadableStreamController;

/// Producer of chunks for a readable stream.
///
/// # Example
///
/// ```rust
/// use backflow::{async_trait, ReadableStreamController, Source, StreamResult};
///
/// struct Countdown(u32);
///
/// #[async_trait]
/// impl Source<u32> for Countdown {
///     async fn pull(&mut self, controller: &ReadableStreamController<u32>) -> StreamResult<()> {
///         if self.0 == 0 {
///             controller.close()
///         } else {
///             self.0 -= 1;
///             controller.enqueue(self.0)
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Source<T: Send + 'static>: Send + 'static {
    /// Called once when the stream is constructed. Pulls wait for it.
    async fn start(&mut self, _controller: &ReadableStreamController<T>) -> StreamResult<()> {
        Ok(())
    }

    /// Called whenever the stream wants more data.
    ///
    /// Returning an error errors the stream.
    async fn pull(&mut self, _controller: &ReadableStreamController<T>) -> StreamResult<()> {
        Ok(())
    }

    /// Called when the consumer cancels the stream.
    async fn cancel(&mut self, _reason: Reason) -> StreamResult<()> {
        Ok(())
    }

    /// Whether [`seek`](Source::seek) is implemented.
    ///
    /// Queried once, when a [`SeekableStream`](crate::SeekableStream) is built.
    fn can_seek(&self) -> bool {
        false
    }

    /// Reposition the source so that the next chunk it enqueues starts at
    /// `position`.
    async fn seek(
        &mut self,
        _position: f64,
        _controller: &ReadableStreamController<T>,
    ) -> StreamResult<()> {
        Err(StreamError::Seek(
            "source does not support seeking".to_string(),
        ))
    }
}

/// Source that drains an iterator, one chunk per pull.
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I> {
    /// Wrap an iterator.
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

#[async_trait]
impl<I> Source<I::Item> for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    async fn pull(&mut self, controller: &ReadableStreamController<I::Item>) -> StreamResult<()> {
        match self.iter.next() {
            Some(chunk) => controller.enqueue(chunk),
            None => controller.close(),
        }
    }
}

/// Source that never produces anything on its own; tests drive it through
/// the controller.
#[cfg(test)]
pub(crate) struct IdleSource;

#[cfg(test)]
#[async_trait]
impl<T: Send + 'static> Source<T> for IdleSource {}
