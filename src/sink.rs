//! Underlying sink contract for writable streams.

use async_trait::async_trait;

use crate::error::{Reason, StreamResult};
use crate::writable::WritableStreamController;

/// Consumer of chunks for a writable stream.
///
/// Writes are delivered one at a time, in order; the next `write` is not
/// issued until the previous one has resolved.
///
/// # Example
///
/// ```rust
/// use backflow::{async_trait, Sink, StreamResult};
///
/// #[derive(Default)]
/// struct Collect(Vec<String>);
///
/// #[async_trait]
/// impl Sink<String> for Collect {
///     async fn write(&mut self, chunk: String) -> StreamResult<()> {
///         self.0.push(chunk);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Sink<T: Send + 'static>: Send + 'static {
    /// Called once when the stream is constructed. Writes wait for it.
    ///
    /// The controller may be cloned and kept to error the stream later.
    async fn start(&mut self, _controller: &WritableStreamController<T>) -> StreamResult<()> {
        Ok(())
    }

    /// Consume one chunk.
    async fn write(&mut self, chunk: T) -> StreamResult<()>;

    /// Called after every queued write has been consumed.
    async fn close(&mut self) -> StreamResult<()> {
        Ok(())
    }

    /// Called when the producer gives up on the stream.
    async fn abort(&mut self, _reason: Reason) -> StreamResult<()> {
        Ok(())
    }
}
