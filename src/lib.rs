//! # Backflow
//!
//! **Backflow** is a backpressure-aware streaming engine: readable, writable
//! and transform streams that move typed chunks between producers and
//! consumers, with queues weighed by a pluggable [`Strategy`].
//!
//! ## Overview
//!
//! - A [`ReadableStream`] pulls from a [`Source`] only while its queue is
//!   below the high-water mark or a reader is waiting.
//! - A [`WritableStream`] feeds a [`Sink`] one chunk at a time and reports
//!   backpressure through its state and [`ready`](WritableStream::ready).
//! - A [`TransformStream`] joins the two through a [`Transformer`].
//! - [`ReadableStream::pipe_to`], [`ReadableStream::pipe_through`] and
//!   [`ReadableStream::tee`] compose streams.
//! - A [`SeekableStream`] adds a read position and `seek`.
//!
//! Every stream has at most one reader or writer at a time. The lock is
//! checked at every entry point and released when the reader or writer is
//! dropped.
//!
//! ## Layout
//!
//! ```text
//! readable / reader / seekable   consumer side
//! writable                       producer side
//! transform / pipe / tee         composition
//! source / sink                  extension traits
//! config / error / size_queue    foundation
//! stream                         channel adapters
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use backflow::prelude::*;
//!
//! # async fn example() -> StreamResult<()> {
//! let stream = ReadableStream::from_chunks(vec!["a", "b", "c"]);
//! let reader = stream.get_reader()?;
//! while let Some(chunk) = reader.read().await? {
//!     println!("{}", chunk);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! All stream constructors spawn tasks and must run inside a tokio runtime.

mod config;
mod error;
mod pipe;
mod readable;
mod reader;
mod seekable;
mod sink;
mod size_queue;
mod source;
pub mod stream;
mod sync;
mod tee;
mod transform;
mod writable;

pub mod prelude;

// Re-export core types
pub use config::{Config, PipeOptions, SizeFn, Strategy};
pub use error::{Reason, StreamError, StreamResult};
pub use readable::{ReadableStream, ReadableStreamController, ReadableStreamState};
pub use reader::ReadableStreamReader;
pub use seekable::{SeekableStream, SeekableStreamReader};
pub use sink::Sink;
pub use size_queue::SizeQueue;
pub use source::{IterSource, Source};
pub use stream::{create_stream, EventSender, EventStream, StreamBuilder};
pub use sync::StreamFuture;
pub use transform::{FnTransformer, TransformStream, TransformStreamController, Transformer};
pub use writable::{
    WritableStream, WritableStreamController, WritableStreamState, WritableStreamWriter,
};

// Re-export async-trait for convenience
pub use async_trait::async_trait;
