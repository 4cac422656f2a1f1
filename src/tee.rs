//! Splitting a readable stream into two branches.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::Strategy;
use crate::error::{Reason, StreamError, StreamResult};
use crate::readable::{ReadableStream, ReadableStreamController};
use crate::reader::ReadableStreamReader;
use crate::source::Source;
use crate::sync::Signal;

#[derive(Default)]
struct TeeState {
    reading: bool,
    closed_or_errored: bool,
    canceled: [bool; 2],
    reasons: [Option<Reason>; 2],
}

struct TeeShared<T> {
    reader: ReadableStreamReader<T>,
    state: Mutex<TeeState>,
    branches: [OnceLock<ReadableStreamController<T>>; 2],
    /// Settles once both branches have cancelled and the source has been told,
    /// or once the source finishes on its own.
    completion: Signal,
}

impl<T: Clone + Send + 'static> TeeShared<T> {
    /// Read one chunk from the source for both branches, unless a read is
    /// already in flight.
    fn pull(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.reading || state.closed_or_errored {
                return;
            }
            state.reading = true;
        }

        let read = self.reader.read();
        let tee = Arc::clone(self);
        tokio::spawn(async move {
            let result = read.await;
            tee.state.lock().reading = false;
            match result {
                Ok(Some(chunk)) => tee.distribute(chunk),
                Ok(None) => tee.close_branches(),
                Err(err) => tee.error_branches(err),
            }
        });
    }

    fn distribute(&self, chunk: T) {
        let canceled = self.state.lock().canceled;
        for (branch, canceled) in self.branches.iter().zip(canceled) {
            if canceled {
                continue;
            }
            if let Some(controller) = branch.get() {
                let _ = controller.enqueue(chunk.clone());
            }
        }
        trace!("tee distributed chunk");
    }

    fn close_branches(&self) {
        let canceled = {
            let mut state = self.state.lock();
            if state.closed_or_errored {
                return;
            }
            state.closed_or_errored = true;
            state.canceled
        };
        if !(canceled[0] && canceled[1]) {
            self.completion.resolve();
        }
        for (branch, canceled) in self.branches.iter().zip(canceled) {
            if canceled {
                continue;
            }
            if let Some(controller) = branch.get() {
                let _ = controller.close();
            }
        }
        debug!("tee source closed");
    }

    fn error_branches(&self, err: StreamError) {
        {
            let mut state = self.state.lock();
            if state.closed_or_errored {
                return;
            }
            state.closed_or_errored = true;
            if !(state.canceled[0] && state.canceled[1]) {
                self.completion.resolve();
            }
        }
        for branch in &self.branches {
            if let Some(controller) = branch.get() {
                let _ = controller.error(err.clone());
            }
        }
        debug!(error = %err, "tee source errored");
    }

    async fn cancel_branch(&self, index: usize, reason: Reason) -> StreamResult<()> {
        let composite = {
            let mut state = self.state.lock();
            state.canceled[index] = true;
            if state.closed_or_errored {
                debug!(branch = index, "tee branch cancelled after the source finished");
                return Ok(());
            }
            state.reasons[index] = Some(reason);
            if state.canceled[0] && state.canceled[1] {
                let reasons = state
                    .reasons
                    .iter_mut()
                    .map(|reason| reason.take().unwrap_or_default())
                    .collect();
                Some(Reason::Composite(reasons))
            } else {
                None
            }
        };
        debug!(branch = index, "tee branch cancelled");

        if let Some(composite) = composite {
            match self.reader.cancel(composite).await {
                Ok(()) => self.completion.resolve(),
                Err(err) => self.completion.reject(err),
            }
        }
        self.completion.wait().await
    }
}

struct TeeBranch<T> {
    tee: Arc<TeeShared<T>>,
    index: usize,
}

#[async_trait]
impl<T: Clone + Send + 'static> Source<T> for TeeBranch<T> {
    async fn pull(&mut self, _controller: &ReadableStreamController<T>) -> StreamResult<()> {
        self.tee.pull();
        Ok(())
    }

    async fn cancel(&mut self, reason: Reason) -> StreamResult<()> {
        self.tee.cancel_branch(self.index, reason).await
    }
}

impl<T: Clone + Send + 'static> ReadableStream<T> {
    /// Split into two branches that each see every chunk.
    ///
    /// This stream stays locked for as long as either branch is alive.
    /// Cancelling one branch does not affect the other; the source is only
    /// cancelled once both branches have been, with both reasons combined,
    /// and each branch's cancel settles at that point. Once the source has
    /// closed or errored, cancelling a branch settles right away.
    pub fn tee(&self) -> StreamResult<(ReadableStream<T>, ReadableStream<T>)> {
        let reader = self.get_reader()?;
        let closed = reader.closed();
        let tee = Arc::new(TeeShared {
            reader,
            state: Mutex::new(TeeState::default()),
            branches: [OnceLock::new(), OnceLock::new()],
            completion: Signal::pending(),
        });

        let branch = |index| {
            ReadableStream::build(
                Box::new(TeeBranch {
                    tee: Arc::clone(&tee),
                    index,
                }),
                Strategy::default(),
                false,
            )
        };
        let first = branch(0);
        let second = branch(1);
        let _ = tee.branches[0].set(first.controller());
        let _ = tee.branches[1].set(second.controller());

        let watched: Weak<TeeShared<T>> = Arc::downgrade(&tee);
        tokio::spawn(async move {
            if let Err(err) = closed.await {
                if let Some(tee) = watched.upgrade() {
                    tee.error_branches(err);
                }
            }
        });

        Ok((first, second))
    }
}
