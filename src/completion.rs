//! One-shot completion bridge
//!
//! Turns a callback-style, fire-once native notification into a future that
//! the waiting task can `.await`. A registration delivers exactly one outcome:
//!
//! - [`Completer::succeed`] resumes the task with a value,
//! - [`Completer::fail`] resumes it with an error,
//! - dropping the [`Completer`] unused resumes it with [`VfsError::Abandoned`].
//!
//! All three consume the completer, so a second delivery cannot be expressed.
//!
//! # Example
//!
//! ```rust,ignore
//! let value = completion::bridge(|completer| {
//!     scheduler.set_timeout(Duration::from_millis(5), move || completer.succeed(42));
//! })
//! .await?;
//! ```

use crate::error::{Result, VfsError};
use futures::channel::oneshot;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Sending half of a completion; deliver exactly once
#[derive(Debug)]
pub struct Completer<T> {
    sender: oneshot::Sender<Result<T>>,
}

impl<T> Completer<T> {
    /// Resume the waiting task with `value`
    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    /// Resume the waiting task with `error`
    pub fn fail(self, error: VfsError) {
        self.complete(Err(error));
    }

    /// Deliver an already-built outcome
    pub fn complete(self, outcome: Result<T>) {
        if self.sender.send(outcome).is_err() {
            tracing::trace!("completion delivered after its waiter went away");
        }
    }

    /// Whether the waiting side has been dropped
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.sender.is_canceled()
    }
}

/// Receiving half of a completion
#[derive(Debug)]
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(VfsError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a linked completer / completion pair
pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    let (sender, receiver) = oneshot::channel();
    (Completer { sender }, Completion { receiver })
}

/// Hand a completer to `register` and suspend until it is delivered
///
/// # Errors
///
/// Returns the error the completer failed with, or [`VfsError::Abandoned`]
/// if it was dropped without a result.
pub async fn bridge<T, F>(register: F) -> Result<T>
where
    F: FnOnce(Completer<T>),
{
    let (completer, completion) = completion();
    register(completer);
    completion.await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_success_resumes_with_value() {
        let value = block_on(bridge(|completer| completer.succeed(7u32))).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_failure_is_raised_at_suspension_point() {
        let result: Result<()> =
            block_on(bridge(|completer| completer.fail(VfsError::InvalidArgument("bad".into()))));
        assert!(matches!(result, Err(VfsError::InvalidArgument(_))));
    }

    #[test]
    fn test_dropped_completer_is_abandoned() {
        let result: Result<u8> = block_on(bridge(drop));
        assert!(matches!(result, Err(VfsError::Abandoned)));
    }

    #[test]
    fn test_completion_from_other_thread() {
        let (completer, completion) = completion::<String>();
        let worker = std::thread::spawn(move || completer.succeed("done".to_string()));
        assert_eq!(block_on(completion).unwrap(), "done");
        worker.join().unwrap();
    }

    #[test]
    fn test_is_canceled_after_waiter_dropped() {
        let (completer, completion) = completion::<()>();
        assert!(!completer.is_canceled());
        drop(completion);
        assert!(completer.is_canceled());
        completer.succeed(());
    }
}
