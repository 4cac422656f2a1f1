//! Settle-once signals and lock tokens shared by the stream types.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

use crate::error::{StreamError, StreamResult};

/// Boxed future returned by stream operations.
///
/// Operations that return a `StreamFuture` have already performed their state
/// transition when they return; the future only reports completion.
pub type StreamFuture<T> = Pin<Box<dyn Future<Output = StreamResult<T>> + Send>>;

/// A future that is already settled.
pub(crate) fn settled<T: Send + 'static>(result: StreamResult<T>) -> StreamFuture<T> {
    Box::pin(std::future::ready(result))
}

#[derive(Debug, Clone, PartialEq)]
enum Settlement {
    Pending,
    Resolved,
    Rejected(StreamError),
}

/// A resolve/reject signal any number of waiters can observe.
///
/// Once settled it stays settled unless explicitly [`reset`](Signal::reset),
/// which is how the writable side re-arms its `ready` signal.
#[derive(Debug)]
pub(crate) struct Signal {
    tx: watch::Sender<Settlement>,
}

impl Signal {
    pub(crate) fn pending() -> Self {
        let (tx, _rx) = watch::channel(Settlement::Pending);
        Self { tx }
    }

    pub(crate) fn resolved() -> Self {
        let (tx, _rx) = watch::channel(Settlement::Resolved);
        Self { tx }
    }

    pub(crate) fn resolve(&self) {
        self.tx.send_if_modified(|current| {
            if *current == Settlement::Pending {
                *current = Settlement::Resolved;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn reject(&self, err: StreamError) {
        self.tx.send_if_modified(|current| {
            if *current == Settlement::Pending {
                *current = Settlement::Rejected(err);
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn reset(&self) {
        self.tx.send_replace(Settlement::Pending);
    }

    pub(crate) fn is_settled(&self) -> bool {
        *self.tx.borrow() != Settlement::Pending
    }

    pub(crate) fn wait(&self) -> StreamFuture<()> {
        let mut rx = self.tx.subscribe();
        Box::pin(async move {
            let outcome = match rx.wait_for(|s| *s != Settlement::Pending).await {
                Ok(settlement) => settlement.clone(),
                Err(_) => return Err(StreamError::state("stream was dropped")),
            };
            match outcome {
                Settlement::Rejected(err) => Err(err),
                _ => Ok(()),
            }
        })
    }
}

static NEXT_LOCK_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identity of a reader or writer.
///
/// Tokens are minted only here, so a stream can tell its own lock holder apart
/// from a stale or foreign handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LockToken(u64);

impl LockToken {
    pub(crate) fn mint() -> Self {
        Self(NEXT_LOCK_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}
