//! Awaitable handles for asynchronous operations

use super::lock;
use crate::error::{MqttError, MqttResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

/// Completion of one open, close, publish, subscribe or unsubscribe request
///
/// The handle is a future resolving exactly once. It may be awaited, polled
/// with [`try_result`](Self::try_result), waited on from a non-async thread
/// with [`blocking_wait`](Self::blocking_wait), or simply dropped.
#[derive(Debug)]
pub struct OperationHandle {
    rx: oneshot::Receiver<MqttResult<()>>,
}

impl OperationHandle {
    /// Create a linked completion and handle
    pub(crate) fn pair() -> (Completion, OperationHandle) {
        let (tx, rx) = oneshot::channel();
        let completion = Completion(Arc::new(CompletionInner {
            resolved: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
        }));
        (completion, OperationHandle { rx })
    }

    /// A handle that is already resolved
    pub fn ready(result: MqttResult<()>) -> Self {
        let (completion, handle) = Self::pair();
        completion.complete(result);
        handle
    }

    /// A handle that already failed with `error`
    pub fn failed(error: MqttError) -> Self {
        Self::ready(Err(error))
    }

    /// Non-blocking check; `None` while the operation is still in flight
    pub fn try_result(&mut self) -> Option<MqttResult<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(MqttError::Closed)),
        }
    }

    /// Wait from a thread that is not driving a tokio runtime
    ///
    /// Panics if called from within an async context, like
    /// `tokio::sync::oneshot::Receiver::blocking_recv`.
    pub fn blocking_wait(self) -> MqttResult<()> {
        self.rx.blocking_recv().unwrap_or(Err(MqttError::Closed))
    }

    /// Await the result, giving up after `limit`
    ///
    /// Giving up does not cancel the operation itself.
    pub async fn wait_timeout(self, limit: Duration) -> MqttResult<()> {
        match tokio::time::timeout(limit, self).await {
            Ok(result) => result,
            Err(_) => Err(MqttError::Timeout {
                operation: "operation handle",
            }),
        }
    }
}

impl Future for OperationHandle {
    type Output = MqttResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(MqttError::Closed)))
    }
}

#[derive(Debug)]
struct CompletionInner {
    resolved: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<MqttResult<()>>>>,
}

/// Resolving side of an [`OperationHandle`]
///
/// Clones share one underlying slot; only the first `complete` call wins.
#[derive(Debug, Clone)]
pub(crate) struct Completion(Arc<CompletionInner>);

impl Completion {
    /// Resolve the handle; returns false if it was already resolved
    pub fn complete(&self, result: MqttResult<()>) -> bool {
        if self
            .0
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if let Some(tx) = lock(&self.0.sender).take() {
            // The caller may have dropped the handle
            let _ = tx.send(result);
        }
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.0.resolved.load(Ordering::Acquire)
    }

    /// Whether both completions resolve the same handle
    pub fn same_as(&self, other: &Completion) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_resolves_with_completion_result() {
        let (completion, handle) = OperationHandle::pair();
        assert!(completion.complete(Ok(())));
        assert_eq!(handle.await, Ok(()));
    }

    #[test]
    fn test_handle_pending_until_completed() {
        let (completion, handle) = OperationHandle::pair();
        let mut task = tokio_test::task::spawn(handle);

        tokio_test::assert_pending!(task.poll());

        completion.complete(Ok(()));
        assert!(task.is_woken());
        tokio_test::assert_ready_eq!(task.poll(), Ok(()));
    }

    #[tokio::test]
    async fn test_completion_resolves_only_once() {
        // Arrange
        let (completion, handle) = OperationHandle::pair();
        let other = completion.clone();

        // Act
        assert!(completion.complete(Err(MqttError::Closed)));
        let second = other.complete(Ok(()));

        // Assert
        assert!(!second, "Second completion must be rejected");
        assert!(other.is_resolved());
        assert_eq!(handle.await, Err(MqttError::Closed));
    }

    #[tokio::test]
    async fn test_dropped_completion_reports_closed() {
        let (completion, handle) = OperationHandle::pair();
        drop(completion);
        assert_eq!(handle.await, Err(MqttError::Closed));
    }

    #[test]
    fn test_try_result_before_and_after() {
        let (completion, mut handle) = OperationHandle::pair();
        assert_eq!(handle.try_result(), None);

        completion.complete(Err(MqttError::PacketIdsExhausted));
        assert_eq!(handle.try_result(), Some(Err(MqttError::PacketIdsExhausted)));
    }

    #[test]
    fn test_blocking_wait_from_plain_thread() {
        let (completion, handle) = OperationHandle::pair();
        let waiter = std::thread::spawn(move || handle.blocking_wait());

        completion.complete(Ok(()));
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_wait_timeout_gives_up() {
        let (_completion, handle) = OperationHandle::pair();
        let result = handle.wait_timeout(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(MqttError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_ready_and_failed_handles() {
        assert_eq!(OperationHandle::ready(Ok(())).await, Ok(()));
        assert_eq!(
            OperationHandle::failed(MqttError::Closed).await,
            Err(MqttError::Closed)
        );
    }

    #[test]
    fn test_same_as_identity() {
        let (a, _ha) = OperationHandle::pair();
        let (b, _hb) = OperationHandle::pair();
        assert!(a.same_as(&a.clone()));
        assert!(!a.same_as(&b));
    }
}
