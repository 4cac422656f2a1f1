//! Prelude module for convenient imports.
//!
//! This module re-exports the most commonly used types and traits
//! from Backflow for convenient glob imports.
//!
//! # Example
//!
//! ```rust
//! use backflow::prelude::*;
//! ```

// Configuration
pub use crate::config::{Config, PipeOptions, Strategy};

// Extension traits
pub use crate::sink::Sink;
pub use crate::source::Source;
pub use crate::transform::Transformer;

// Streams
pub use crate::readable::{ReadableStream, ReadableStreamController, ReadableStreamState};
pub use crate::reader::ReadableStreamReader;
pub use crate::seekable::{SeekableStream, SeekableStreamReader};
pub use crate::transform::{TransformStream, TransformStreamController};
pub use crate::writable::{
    WritableStream, WritableStreamController, WritableStreamState, WritableStreamWriter,
};

// Adapters
pub use crate::stream::{create_stream, EventSender, EventStream, EventStreamExt, StreamBuilder};

// Errors
pub use crate::error::{Reason, StreamError, StreamResult};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
