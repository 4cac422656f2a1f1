//! Error types for Backflow streams.

use std::fmt;

use thiserror::Error;

/// Root error type for stream operations.
///
/// Errors are `Clone` because a single failure is observed by many parties:
/// every pending read request, the reader's `closed` signal and any later
/// call on the errored stream all receive the same value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    /// Operation is invalid for the stream's current state
    #[error("Invalid stream state: {0}")]
    State(String),

    /// Operation requires or forbids a lock that is in the wrong state
    #[error("Lock error: {0}")]
    Lock(String),

    /// A user supplied strategy or callback misbehaved
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Seek could not be satisfied
    #[error("Seek error: {0}")]
    Seek(String),

    /// The stream (or one of its requests) was cancelled
    #[error("Stream cancelled: {0}")]
    Cancelled(Reason),

    /// The writable side was aborted
    #[error("Stream aborted: {0}")]
    Aborted(Reason),

    /// A source, sink or transformer reported a failure
    #[error("Stream failed: {0}")]
    Failed(String),
}

impl StreamError {
    pub(crate) fn state(msg: impl Into<String>) -> Self {
        StreamError::State(msg.into())
    }

    pub(crate) fn lock(msg: impl Into<String>) -> Self {
        StreamError::Lock(msg.into())
    }
}

impl From<String> for StreamError {
    fn from(msg: String) -> Self {
        StreamError::Failed(msg)
    }
}

impl From<&str> for StreamError {
    fn from(msg: &str) -> Self {
        StreamError::Failed(msg.to_string())
    }
}

/// Why a stream was cancelled or aborted.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Reason {
    /// No reason given
    #[default]
    Unspecified,
    /// Free-form message
    Message(String),
    /// An error caused the cancellation
    Error(Box<StreamError>),
    /// Several reasons combined, e.g. the two branch reasons of a tee
    Composite(Vec<Reason>),
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Unspecified => write!(f, "no reason given"),
            Reason::Message(msg) => write!(f, "{}", msg),
            Reason::Error(err) => write!(f, "{}", err),
            Reason::Composite(reasons) => {
                write!(f, "[")?;
                for (i, reason) in reasons.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", reason)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<StreamError> for Reason {
    fn from(err: StreamError) -> Self {
        Reason::Error(Box::new(err))
    }
}

impl From<String> for Reason {
    fn from(msg: String) -> Self {
        Reason::Message(msg)
    }
}

impl From<&str> for Reason {
    fn from(msg: &str) -> Self {
        Reason::Message(msg.to_string())
    }
}

/// Result type alias for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;
