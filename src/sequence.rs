//! Backpressured, single-consumer async sequences
//!
//! A producer pushes items through an [`AsyncSequenceEmitter`]; the consumer
//! pulls them from the matching [`AsyncSequence`], which is a plain
//! [`futures::Stream`]. The channel between them is bounded, so `emit`
//! suspends once the consumer falls behind.
//!
//! Closing is one-way: items already buffered still reach the consumer, after
//! which the stream ends. The emitter closes itself on drop, which makes a
//! producer's error paths safe without extra cleanup code.

use crate::error::{Result, VfsError};
use futures::channel::mpsc;
use futures::stream::{self, BoxStream};
use futures::{SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Create a connected emitter / sequence pair with room for `capacity` items
#[must_use]
pub fn channel<T: Send + 'static>(capacity: usize) -> (AsyncSequenceEmitter<T>, AsyncSequence<T>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (
        AsyncSequenceEmitter {
            sender,
            closed: false,
        },
        AsyncSequence {
            inner: receiver.boxed(),
        },
    )
}

/// Producer half of a sequence
#[derive(Debug)]
pub struct AsyncSequenceEmitter<T> {
    sender: mpsc::Sender<T>,
    closed: bool,
}

impl<T> AsyncSequenceEmitter<T> {
    /// Push one item, suspending while the buffer is full
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::SequenceClosed`] if [`close`](Self::close) was
    /// already called or the consumer dropped its end.
    pub async fn emit(&mut self, item: T) -> Result<()> {
        if self.closed {
            return Err(VfsError::SequenceClosed);
        }
        self.sender
            .send(item)
            .await
            .map_err(|_| VfsError::SequenceClosed)
    }

    /// End the sequence; idempotent
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.sender.close_channel();
        }
    }

    /// Whether the sequence has been closed from this side
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T> Drop for AsyncSequenceEmitter<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer half of a sequence: a forward-only stream of items
pub struct AsyncSequence<T> {
    inner: BoxStream<'static, T>,
}

impl<T: Send + 'static> AsyncSequence<T> {
    /// A sequence that ends immediately
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: stream::empty().boxed(),
        }
    }

    /// A sequence over already materialized items
    #[must_use]
    pub fn from_vec(items: Vec<T>) -> Self {
        Self {
            inner: stream::iter(items).boxed(),
        }
    }

    /// Lazily transform every item
    #[must_use]
    pub fn map<U, F>(self, f: F) -> AsyncSequence<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        AsyncSequence {
            inner: self.inner.map(f).boxed(),
        }
    }

    /// Drain the sequence into a vector
    pub async fn to_vec(self) -> Vec<T> {
        self.inner.collect().await
    }
}

impl<T> Stream for AsyncSequence<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<T> std::fmt::Debug for AsyncSequence<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSequence").finish_non_exhaustive()
    }
}
