//! Configuration types for streams.
//!
//! A [`Strategy`] decides how much a chunk weighs and how much weight a stream
//! may buffer before it applies backpressure. [`PipeOptions`] controls how
//! [`pipe_to`](crate::ReadableStream::pipe_to) propagates closing and failures.

use std::fmt;
use std::sync::Arc;

use crate::error::{StreamError, StreamResult};

/// Base trait for configuration types.
///
/// # Example
///
/// ```rust
/// use backflow::{Config, Strategy};
///
/// let strategy: Strategy<String> = Strategy::new(4.0);
/// assert!(strategy.validate().is_ok());
///
/// let broken: Strategy<String> = Strategy::new(f64::NAN);
/// assert!(broken.validate().is_err());
/// ```
pub trait Config: Send + Sync {
    /// Returns the configuration name/identifier.
    fn name(&self) -> &str {
        "default"
    }

    /// Validates the configuration.
    ///
    /// Returns Ok(()) if valid, or an error message describing the issue.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Weighs a chunk for queue accounting.
pub type SizeFn<T> = Arc<dyn Fn(&T) -> f64 + Send + Sync>;

/// Queuing strategy: chunk weight function plus backpressure threshold.
pub struct Strategy<T> {
    size: Option<SizeFn<T>>,
    high_water_mark: f64,
    name: &'static str,
}

impl<T> Strategy<T> {
    /// Create a strategy that weighs every chunk as 1.
    pub fn new(high_water_mark: f64) -> Self {
        Self {
            size: None,
            high_water_mark,
            name: "count",
        }
    }

    /// Alias of [`Strategy::new`], named after what it measures.
    pub fn count(high_water_mark: f64) -> Self {
        Self::new(high_water_mark)
    }

    /// Set the function used to weigh chunks.
    pub fn with_size<F>(mut self, size: F) -> Self
    where
        F: Fn(&T) -> f64 + Send + Sync + 'static,
    {
        self.size = Some(Arc::new(size));
        self.name = "custom";
        self
    }

    /// The backpressure threshold.
    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    /// Weigh a chunk. Non-finite or negative weights are configuration errors.
    pub fn size_of(&self, chunk: &T) -> StreamResult<f64> {
        let weight = match &self.size {
            Some(size) => size(chunk),
            None => 1.0,
        };
        if !weight.is_finite() || weight < 0.0 {
            return Err(StreamError::Configuration(format!(
                "size function returned invalid chunk weight {}",
                weight
            )));
        }
        Ok(weight)
    }

    pub(crate) fn checked(self) -> StreamResult<Self> {
        self.validate().map_err(StreamError::Configuration)?;
        Ok(self)
    }
}

impl<T: AsRef<[u8]> + 'static> Strategy<T> {
    /// Weigh chunks by their length in bytes.
    pub fn byte_length(high_water_mark: f64) -> Self {
        let mut strategy =
            Self::new(high_water_mark).with_size(|chunk: &T| chunk.as_ref().len() as f64);
        strategy.name = "byte-length";
        strategy
    }
}

impl<T> Default for Strategy<T> {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl<T> Clone for Strategy<T> {
    fn clone(&self) -> Self {
        Self {
            size: self.size.clone(),
            high_water_mark: self.high_water_mark,
            name: self.name,
        }
    }
}

impl<T> fmt::Debug for Strategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("name", &self.name)
            .field("high_water_mark", &self.high_water_mark)
            .finish()
    }
}

impl<T> Config for Strategy<T> {
    fn name(&self) -> &str {
        self.name
    }

    fn validate(&self) -> Result<(), String> {
        if !self.high_water_mark.is_finite() || self.high_water_mark < 0.0 {
            return Err(format!(
                "high water mark must be a finite, non-negative number, got {}",
                self.high_water_mark
            ));
        }
        Ok(())
    }
}

/// Options for piping a readable stream into a writable stream.
///
/// # Example
///
/// ```rust
/// use backflow::PipeOptions;
///
/// let options = PipeOptions::new().prevent_close().prevent_cancel();
/// assert!(options.prevent_close);
/// assert!(!options.prevent_abort);
/// assert!(options.prevent_cancel);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeOptions {
    /// Do not abort the destination when the source errors
    pub prevent_abort: bool,
    /// Do not cancel the source when the destination closes or errors
    pub prevent_cancel: bool,
    /// Do not close the destination when the source is exhausted
    pub prevent_close: bool,
}

impl PipeOptions {
    /// Create options that propagate everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave the destination open when the source is exhausted.
    pub fn prevent_close(mut self) -> Self {
        self.prevent_close = true;
        self
    }

    /// Leave the destination untouched when the source errors.
    pub fn prevent_abort(mut self) -> Self {
        self.prevent_abort = true;
        self
    }

    /// Release, rather than cancel, the source when the destination fails.
    pub fn prevent_cancel(mut self) -> Self {
        self.prevent_cancel = true;
        self
    }
}

impl Config for PipeOptions {
    fn name(&self) -> &str {
        "pipe"
    }
}
