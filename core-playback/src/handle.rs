//! Awaitable completion for tracked play requests.

use crate::error::{DriverError, Result};
use crate::registry::RequestId;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot::{self, error::TryRecvError};

/// Resolves with the final result of a request started by
/// [`Driver::play_tracked`](crate::Driver::play_tracked).
///
/// Can be awaited from async code or waited on from a plain thread. If the
/// driver goes away without reporting, the handle resolves to
/// [`DriverError::Destroyed`].
#[derive(Debug)]
pub struct PlaybackHandle {
    id: RequestId,
    receiver: oneshot::Receiver<Result<()>>,
}

impl PlaybackHandle {
    pub(crate) fn new(id: RequestId, receiver: oneshot::Receiver<Result<()>>) -> Self {
        Self { id, receiver }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Block the current thread until the request finishes.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime; `.await` the handle
    /// there instead.
    pub fn wait(self) -> Result<()> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(DriverError::Destroyed))
    }

    /// The final result if it already arrived.
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(DriverError::Destroyed)),
        }
    }
}

impl Future for PlaybackHandle {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(DriverError::Destroyed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_result() {
        let (tx, rx) = oneshot::channel();
        let mut handle = PlaybackHandle::new(4, rx);
        assert_eq!(handle.id(), 4);
        assert_eq!(handle.try_result(), None);

        tx.send(Err(DriverError::Canceled)).unwrap();
        assert_eq!(handle.try_result(), Some(Err(DriverError::Canceled)));
    }

    #[test]
    fn test_dropped_sender_is_destroyed() {
        let (tx, rx) = oneshot::channel::<Result<()>>();
        drop(tx);
        assert_eq!(PlaybackHandle::new(1, rx).wait(), Err(DriverError::Destroyed));
    }

    #[tokio::test]
    async fn test_await_handle() {
        let (tx, rx) = oneshot::channel();
        let handle = PlaybackHandle::new(2, rx);
        std::thread::spawn(move || tx.send(Ok(())).unwrap());
        assert_eq!(handle.await, Ok(()));
    }
}
