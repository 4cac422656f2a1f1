//! Channel adapters between readable streams and plain async streams.
//!
//! [`StreamBuilder`] pairs an [`EventSender`] with a [`ReadableStream`] fed by
//! it, so push-style producers can sit behind a pull-driven stream. The other
//! direction, [`ReadableStream::into_event_stream`], drains a readable stream
//! into a `futures_core::Stream`.

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::config::Strategy;
use crate::error::{Reason, StreamResult};
use crate::readable::{ReadableStream, ReadableStreamController};
use crate::source::Source;

/// Type alias for a boxed async stream of events.
pub type EventStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Producer handle of a channel-fed [`ReadableStream`].
///
/// The channel buffer bounds how far the producer can run ahead of the
/// stream's pulls. Dropping every sender closes the stream.
#[derive(Debug)]
pub struct EventSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> EventSender<T> {
    /// Wrap an mpsc sender.
    pub fn new(tx: mpsc::Sender<T>) -> Self {
        Self { tx }
    }

    /// Send an event.
    ///
    /// Returns `Err(event)` if the stream was cancelled or dropped.
    pub async fn send(&self, event: T) -> Result<(), T> {
        self.tx.send(event).await.map_err(|e| e.0)
    }

    /// Try to send an event without waiting.
    ///
    /// Returns `Err(event)` if the channel is full or closed.
    pub fn try_send(&self, event: T) -> Result<(), T> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(v) => v,
            mpsc::error::TrySendError::Closed(v) => v,
        })
    }

    /// Whether the stream side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Free slots in the channel buffer.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Source that takes one event off a channel per pull.
struct ChannelSource<T> {
    rx: mpsc::Receiver<T>,
}

#[async_trait]
impl<T: Send + 'static> Source<T> for ChannelSource<T> {
    async fn pull(&mut self, controller: &ReadableStreamController<T>) -> StreamResult<()> {
        let finished = controller.finished();
        tokio::select! {
            event = self.rx.recv() => match event {
                Some(event) => controller.enqueue(event),
                None => controller.close(),
            },
            _ = finished => Ok(()),
        }
    }

    async fn cancel(&mut self, reason: Reason) -> StreamResult<()> {
        debug!(reason = %reason, "channel stream cancelled");
        self.rx.close();
        Ok(())
    }
}

/// Builder for channel-fed readable streams.
///
/// # Example
///
/// ```rust
/// use backflow::StreamBuilder;
///
/// #[derive(Debug, Clone, PartialEq)]
/// enum MyEvent {
///     Started,
///     Progress(u32),
///     Complete,
/// }
///
/// # async fn example() -> backflow::StreamResult<()> {
/// let (sender, stream) = StreamBuilder::<MyEvent>::new()
///     .buffer_size(100)
///     .build()?;
///
/// sender.send(MyEvent::Started).await.ok();
/// let reader = stream.get_reader()?;
/// assert_eq!(reader.read().await?, Some(MyEvent::Started));
/// # Ok(())
/// # }
/// ```
pub struct StreamBuilder<T> {
    buffer_size: usize,
    strategy: Strategy<T>,
}

impl<T: Send + 'static> StreamBuilder<T> {
    /// Create a new stream builder with default settings.
    pub fn new() -> Self {
        Self {
            buffer_size: 100,
            strategy: Strategy::default(),
        }
    }

    /// Set the buffer size for the underlying channel.
    ///
    /// Default is 100.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the queuing strategy of the readable stream.
    pub fn strategy(mut self, strategy: Strategy<T>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Build the sender and the stream it feeds.
    pub fn build(self) -> StreamResult<(EventSender<T>, ReadableStream<T>)> {
        let strategy = self.strategy.checked()?;
        Ok(channel_stream(self.buffer_size, strategy))
    }
}

impl<T: Send + 'static> Default for StreamBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn channel_stream<T: Send + 'static>(
    buffer_size: usize,
    strategy: Strategy<T>,
) -> (EventSender<T>, ReadableStream<T>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    let stream = ReadableStream::build(Box::new(ChannelSource { rx }), strategy, false);
    (EventSender::new(tx), stream)
}

/// Create a channel-fed stream with the default buffer size and strategy.
///
/// # Example
///
/// ```rust
/// use backflow::stream::create_stream;
///
/// # async fn example() {
/// let (sender, stream) = create_stream::<String>();
/// sender.send("Hello".to_string()).await.unwrap();
/// # }
/// ```
pub fn create_stream<T: Send + 'static>() -> (EventSender<T>, ReadableStream<T>) {
    channel_stream(100, Strategy::default())
}

/// Create a channel-fed stream with a specific buffer size.
pub fn create_stream_with_buffer<T: Send + 'static>(
    buffer_size: usize,
) -> (EventSender<T>, ReadableStream<T>) {
    channel_stream(buffer_size, Strategy::default())
}

/// Extension trait for working with event streams.
pub trait EventStreamExt<T> {
    /// Convert into a boxed stream.
    fn boxed(self) -> EventStream<T>;
}

impl<S, T> EventStreamExt<T> for S
where
    S: Stream<Item = T> + Send + 'static,
{
    fn boxed(self) -> EventStream<T> {
        Box::pin(self)
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Lock the stream and drain it into an async stream.
    ///
    /// Each item is one chunk, or the error that ended the stream. Dropping
    /// the returned stream cancels this one.
    pub fn into_event_stream(&self) -> StreamResult<EventStream<StreamResult<T>>> {
        let reader = self.get_reader()?;
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            loop {
                match reader.read().await {
                    Ok(Some(chunk)) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            let _ = reader.cancel("event stream dropped").await;
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::readable::ReadableStreamState;
    use futures::StreamExt;

    #[derive(Debug, Clone, PartialEq)]
    enum TestEvent {
        Start,
        Progress(u32),
        Complete,
    }

    #[tokio::test]
    async fn test_stream_builder() {
        let (sender, stream) = StreamBuilder::<TestEvent>::new()
            .buffer_size(10)
            .build()
            .unwrap();

        sender.send(TestEvent::Start).await.unwrap();
        sender.send(TestEvent::Progress(50)).await.unwrap();
        sender.send(TestEvent::Complete).await.unwrap();
        drop(sender);

        let events: Vec<_> = stream
            .into_event_stream()
            .unwrap()
            .map(|event| event.unwrap())
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                TestEvent::Start,
                TestEvent::Progress(50),
                TestEvent::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn test_sender_clone() {
        let (sender, stream) = create_stream::<u32>();
        let reader = stream.get_reader().unwrap();

        let sender2 = sender.clone();
        sender.send(1).await.unwrap();
        sender2.send(2).await.unwrap();
        drop(sender);
        drop(sender2);

        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert_eq!(reader.read().await.unwrap(), Some(2));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_try_send_respects_channel_buffer() {
        let (sender, stream) = StreamBuilder::<u32>::new()
            .buffer_size(2)
            .strategy(Strategy::new(0.0))
            .build()
            .unwrap();
        assert_eq!(sender.capacity(), 2);

        assert_eq!(sender.try_send(1), Ok(()));
        assert_eq!(sender.try_send(2), Ok(()));
        assert_eq!(sender.capacity(), 0);
        assert_eq!(sender.try_send(3), Err(3));

        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert_eq!(sender.capacity(), 1);
        assert_eq!(sender.try_send(3), Ok(()));
        assert_eq!(reader.read().await.unwrap(), Some(2));
        assert_eq!(reader.read().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_cancel_closes_channel() {
        let (sender, stream) = create_stream_with_buffer::<u32>(4);

        stream.cancel("not interested").await.unwrap();
        assert_eq!(stream.state(), ReadableStreamState::Closed);
        assert!(sender.send(1).await.is_err());
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_strategy_rejected() {
        let built = StreamBuilder::<u32>::new()
            .strategy(Strategy::new(f64::NAN))
            .build();
        assert!(matches!(built, Err(StreamError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_event_stream_reports_error() {
        let (_sender, stream) = create_stream::<u32>();
        let controller = stream.controller();
        let mut events = stream.into_event_stream().unwrap();

        controller.error("producer crashed").unwrap();
        assert!(matches!(events.next().await, Some(Err(StreamError::Failed(_)))));
        assert!(events.next().await.is_none());
    }
}
