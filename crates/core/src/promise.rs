//! Single-assignment completion primitive connecting a batch drain to the
//! callers that contributed to it.
//!
//! A [`Promise`] is the writer half, a [`ResponseFuture`] the reader half.
//! Promises are cheap to clone so the engine can keep a handle on every
//! pending request while the batch handler owns another; whichever side
//! resolves first wins and every later attempt is a no-op.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::Shared;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{CoalesceError, CoalesceResult};

/// Multi-waiter view of a response, as handed out by counter batchers and
/// key coalescers.
pub type SharedResponse<T> = Shared<ResponseFuture<T>>;

/// Creates a connected promise / future pair.
pub fn promise<T>() -> (Promise<T>, ResponseFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Promise {
            sender: Arc::new(Mutex::new(Some(tx))),
        },
        ResponseFuture { receiver: rx },
    )
}

/// Writer half. Resolved at most once across all clones.
pub struct Promise<T> {
    sender: Arc<Mutex<Option<oneshot::Sender<CoalesceResult<T>>>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl<T> Promise<T> {
    /// Resolves with `result`. Returns `false` if the promise was already
    /// resolved, in which case `result` is discarded.
    pub fn resolve(&self, result: CoalesceResult<T>) -> bool {
        let sender = self.sender.lock().take();
        match sender {
            Some(tx) => {
                // A dropped receiver still counts as a resolution.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn complete(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    pub fn fail(&self, err: CoalesceError) -> bool {
        self.resolve(Err(err))
    }

    pub fn is_completed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Reader half. Yields [`CoalesceError::Abandoned`] if every promise clone
/// is dropped without resolving.
pub struct ResponseFuture<T> {
    receiver: oneshot::Receiver<CoalesceResult<T>>,
}

impl<T> ResponseFuture<T> {
    /// A future that is already resolved.
    pub fn ready(result: CoalesceResult<T>) -> Self {
        let (promise, future) = promise();
        promise.resolve(result);
        future
    }

    /// Converts into a clonable multi-waiter future.
    pub fn shared(self) -> SharedResponse<T>
    where
        T: Clone,
    {
        FutureExt::shared(self)
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = CoalesceResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CoalesceError::Abandoned)))
    }
}
