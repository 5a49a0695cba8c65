//! Offloading blocking native calls to the runtime's worker pool
//!
//! compio keeps a bounded pool of blocking threads next to each runtime (its
//! size comes from [`RuntimeOptions::worker_threads`] for loops started by this
//! crate). Work is handed over with `spawn_blocking` and the result travels
//! back through the completion bridge, so a panicking worker still resumes the
//! caller, with [`VfsError::Abandoned`].
//!
//! Must be called from inside a compio runtime.
//!
//! [`RuntimeOptions::worker_threads`]: crate::event_loop::RuntimeOptions::worker_threads

use crate::completion;
use crate::error::{Result, VfsError};
use std::io;

/// Run `work` on the blocking pool and suspend until it returns
///
/// # Errors
///
/// Returns [`VfsError::Abandoned`] if the worker panicked before producing a
/// value.
pub async fn offload<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    completion::bridge(move |completer| {
        compio::runtime::spawn_blocking(move || completer.succeed(work())).detach();
    })
    .await
}

/// [`offload`] for native calls returning `io::Result`
///
/// # Errors
///
/// The native error is mapped through [`VfsError::io`] with `context`.
pub async fn offload_io<T, F>(context: impl Into<String>, work: F) -> Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let context = context.into();
    offload(work)
        .await?
        .map_err(|e| VfsError::io(context, e))
}
