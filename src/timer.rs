//! Timer bookkeeping shared by the event loop implementations
//!
//! Timers are stored in buckets keyed by their due time. Within a bucket the
//! callbacks keep registration order, so draining buckets in ascending key
//! order yields non-decreasing due times with ties broken by registration.
//!
//! The key type is generic: the compio loop keys by [`std::time::Instant`],
//! the virtual-clock loop by virtual milliseconds.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-shot unit of work handed to an event loop
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct TimerState {
    cancelled: AtomicBool,
    fired: AtomicBool,
}

/// Cancellation handle returned by `set_timeout` / `set_interval`
///
/// Cancelling before the timer fires guarantees it never fires. Cancelling
/// after it fired (or while its callback is already running) is a no-op.
/// Dropping the handle does not cancel anything.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    state: Arc<TimerState>,
}

impl TimerHandle {
    /// Create a fresh, armed handle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent any future firing
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    /// Whether `cancel` has been called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Whether the callback has been dispatched at least once
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.state.fired.load(Ordering::Acquire)
    }

    fn mark_fired(&self) {
        self.state.fired.store(true, Ordering::Release);
    }
}

/// A callback waiting in a [`TimerQueue`]
pub(crate) struct TimerEntry {
    handle: TimerHandle,
    callback: Callback,
}

impl TimerEntry {
    pub(crate) fn new(handle: TimerHandle, callback: Callback) -> Self {
        Self { handle, callback }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Run the callback unless the timer was cancelled
    ///
    /// Panics raised by the callback are caught and logged so a misbehaving
    /// timer never takes down the loop that dispatches it.
    pub(crate) fn fire(self) {
        if self.handle.is_cancelled() {
            tracing::trace!("skipping cancelled timer");
            return;
        }
        self.handle.mark_fired();
        run_guarded("timer", self.callback);
    }
}

/// Invoke a callback, reporting instead of propagating a panic
pub(crate) fn run_guarded(what: &str, callback: Callback) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        tracing::error!("{what} callback panicked");
    }
}

/// Due-time ordered buckets of timer callbacks
pub(crate) struct TimerQueue<K> {
    buckets: BTreeMap<K, Vec<TimerEntry>>,
}

impl<K: Ord + Copy> TimerQueue<K> {
    pub(crate) fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }

    /// Append a callback to the bucket for `due`
    pub(crate) fn insert(&mut self, due: K, entry: TimerEntry) {
        self.buckets.entry(due).or_default().push(entry);
    }

    /// Earliest due time still queued
    pub(crate) fn next_due(&self) -> Option<K> {
        self.buckets.first_key_value().map(|(due, _)| *due)
    }

    /// Remove and return the earliest bucket if it is due at `now`
    pub(crate) fn pop_due_bucket(&mut self, now: K) -> Option<(K, Vec<TimerEntry>)> {
        match self.next_due() {
            Some(due) if due <= now => self.buckets.pop_first(),
            _ => None,
        }
    }

    /// Remove every bucket due at `now`, flattened in firing order
    pub(crate) fn pop_all_due(&mut self, now: K) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while let Some((_, bucket)) = self.pop_due_bucket(now) {
            due.extend(bucket);
        }
        due
    }

    /// Number of queued callbacks that have not been cancelled
    pub(crate) fn live_len(&self) -> usize {
        self.buckets
            .values()
            .flatten()
            .filter(|entry| !entry.is_cancelled())
            .count()
    }
}

impl<K: Ord + Copy> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
