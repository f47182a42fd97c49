//! One-shot completion slots.
//!
//! Every outstanding command owns a [`CompletionSender`] inside the
//! controller's outstanding table; the caller's
//! [`CommandHandle`](crate::nvme::CommandHandle) holds the matching
//! [`CompletionReceiver`]. Whoever drains the device resolves the sender, the
//! waiter observes the receiver.
//!
//! # Pattern
//!
//! 1. Create a completion pair with [`completion()`]
//! 2. Park the sender next to the command it belongs to
//! 3. On the matching device completion, resolve it with
//!    [`success`](CompletionSender::success) or [`error`](CompletionSender::error)
//! 4. Poll or [`block_on`] the receiver, servicing the device while pending

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use futures_channel::oneshot;

use crate::error::{DeviceError, Error, Result};

/// Sender half of a completion pair.
pub struct CompletionSender<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> CompletionSender<T> {
    /// Deliver a successful value.
    pub fn success(self, value: T) {
        // Ignore send error - receiver may have been dropped
        let _ = self.tx.send(Ok(value));
    }

    /// Deliver an error.
    pub fn error(self, err: Error) {
        let _ = self.tx.send(Err(err));
    }
}

/// Receiver half of a completion pair.
///
/// Implements `Future`. A sender dropped without delivering resolves to
/// [`DeviceError::Aborted`].
pub struct CompletionReceiver<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> CompletionReceiver<T> {
    /// Non-blocking check. `None` while the sender is still pending.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(Some(result)) => Some(result),
            Ok(None) => None,
            Err(_) => Some(Err(DeviceError::Aborted.into())),
        }
    }
}

impl<T> Future for CompletionReceiver<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DeviceError::Aborted.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a completion sender/receiver pair.
pub fn completion<T>() -> (CompletionSender<T>, CompletionReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (CompletionSender { tx }, CompletionReceiver { rx })
}

/// A simple waker that does nothing - we poll manually.
struct NoopWaker;

impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

/// Block on a future, calling `idle` each time it is still pending.
///
/// `idle` is where the caller makes progress on whatever resolves the
/// future (draining completions, parking on a condition variable). It must
/// eventually cause the future to resolve or this never returns.
pub fn block_on<F: Future>(future: F, mut idle: impl FnMut()) -> F::Output {
    let waker = Waker::from(Arc::new(NoopWaker));
    let mut cx = Context::from_waker(&waker);

    let mut future = std::pin::pin!(future);

    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(result) => return result,
            Poll::Pending => idle(),
        }
    }
}
