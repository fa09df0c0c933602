// ── Deferred operation results ──

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::CoreError;

/// The eventual outcome of an operation submitted to a [`Collection`].
///
/// The operation never waits for its `Deferred` to be polled. On a bound
/// collection it is spawned right away; on an unbound one it is queued and
/// runs when the queue drains. In both cases the outcome arrives through a
/// oneshot channel, and dropping the `Deferred` only discards it.
///
/// [`Collection`]: crate::Collection
#[must_use = "dropping a Deferred discards the operation's outcome"]
pub struct Deferred<T> {
    operation: &'static str,
    /// Whether the operation had to wait behind the readiness gate.
    queued: bool,
    rx: oneshot::Receiver<Result<T, CoreError>>,
}

impl<T> Deferred<T> {
    /// An operation already running against a bound handle.
    pub(crate) fn started(operation: &'static str, rx: oneshot::Receiver<Result<T, CoreError>>) -> Self {
        Self {
            operation,
            queued: false,
            rx,
        }
    }

    /// An operation waiting in a collection's queue.
    pub(crate) fn queued(operation: &'static str, rx: oneshot::Receiver<Result<T, CoreError>>) -> Self {
        Self {
            operation,
            queued: true,
            rx,
        }
    }

    /// Whether the operation was queued behind the readiness gate.
    pub fn is_queued(&self) -> bool {
        self.queued
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T, CoreError>;

    /// A dropped reply sender means the operation died before answering,
    /// e.g. it panicked.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let operation = this.operation;
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CoreError::OperationAbandoned { operation })))
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("operation", &self.operation)
            .field("queued", &self.queued)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn started_settles_from_sender() {
        let (tx, rx) = oneshot::channel();
        let deferred: Deferred<u64> = Deferred::started("count", rx);
        assert!(!deferred.is_queued());
        tx.send(Ok(7)).unwrap();
        assert_eq!(deferred.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn queued_settles_from_sender() {
        let (tx, rx) = oneshot::channel();
        let deferred: Deferred<&str> = Deferred::queued("find", rx);
        assert!(deferred.is_queued());
        tx.send(Ok("done")).unwrap();
        assert_eq!(deferred.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn dropped_sender_reports_abandoned() {
        let (tx, rx) = oneshot::channel::<Result<(), CoreError>>();
        drop(tx);
        let err = Deferred::queued("count", rx).await.unwrap_err();
        assert!(matches!(err, CoreError::OperationAbandoned { operation: "count" }));
    }
}
