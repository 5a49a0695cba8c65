//! Deterministic event loop driven by explicit time steps
//!
//! Time only moves when the owner calls [`VirtualEventLoop::step`]. Timers are
//! keyed by virtual milliseconds; a step walks the due buckets in order,
//! setting the clock to each bucket's due time before dispatching it, so
//! chained timers scheduled from a callback can fire within the same step.
//!
//! Immediates and local tasks run on the calling thread right away. Calls made
//! while the loop is already draining (from a callback or task) are queued and
//! picked up by that drain, so nested immediates trampoline instead of
//! recursing. Tasks live in a [`LocalPool`] kept in thread-local storage and
//! are polled until neither immediates nor tasks make progress.
//!
//! Callbacks and tasks usually hold a [`Scheduler`](super::Scheduler), and
//! with it the loop itself. [`VirtualEventLoop::shutdown`] drops everything
//! still pending so those cycles are released.

use super::{EventLoop, LocalTask};
use crate::timer::{run_guarded, Callback, TimerEntry, TimerHandle, TimerQueue};
use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Task pools of every virtual loop driven from this thread, by loop id
    static POOLS: RefCell<HashMap<u64, LocalPool>> = RefCell::new(HashMap::new());
}

#[derive(Default)]
struct State {
    now_ms: u64,
    timers: TimerQueue<u64>,
    immediates: VecDeque<Callback>,
    tasks: Vec<LocalTask>,
    driving: bool,
    closed: bool,
}

/// Event loop whose clock only moves when told to
pub struct VirtualEventLoop {
    id: u64,
    state: Mutex<State>,
}

impl VirtualEventLoop {
    /// A loop at virtual time zero with nothing scheduled
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current virtual time since creation
    #[must_use]
    pub fn now(&self) -> Duration {
        Duration::from_millis(self.state().now_ms)
    }

    /// Number of armed timers that have not been cancelled
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.state().timers.live_len()
    }

    /// Advance the clock by `delta`, firing every timer that becomes due
    ///
    /// Buckets fire in due-time order, ties in registration order. Queued
    /// immediates and local tasks run before the first bucket and after each
    /// one. Calling `step` from inside a callback or task of the same loop is
    /// ignored.
    pub fn step(&self, delta: Duration) {
        let target = {
            let mut state = self.state();
            if state.driving {
                tracing::warn!("virtual loop stepped re-entrantly; ignoring");
                return;
            }
            state.driving = true;
            state.now_ms.saturating_add(millis(delta))
        };

        self.drain();
        loop {
            let bucket = {
                let mut state = self.state();
                let bucket = state.timers.pop_due_bucket(target);
                if let Some((due, _)) = &bucket {
                    state.now_ms = state.now_ms.max(*due);
                }
                bucket
            };
            let Some((due, entries)) = bucket else {
                break;
            };
            tracing::trace!("virtual loop firing {} timers at {due}ms", entries.len());
            for entry in entries {
                entry.fire();
            }
            self.drain();
        }

        let mut state = self.state();
        state.now_ms = target;
        state.driving = false;
    }

    /// Run queued immediates and ready tasks without moving the clock
    pub fn run_pending(&self) {
        {
            let mut state = self.state();
            if state.driving {
                return;
            }
            state.driving = true;
        }
        self.drain();
        self.state().driving = false;
    }

    /// Drop every pending timer, immediate and task
    ///
    /// Later registrations are discarded. Tasks parked on this thread are
    /// dropped here; a drain in progress drops its pool when it finishes.
    pub fn shutdown(&self) {
        let (timers, immediates, tasks) = {
            let mut state = self.state();
            state.closed = true;
            (
                std::mem::take(&mut state.timers),
                std::mem::take(&mut state.immediates),
                std::mem::take(&mut state.tasks),
            )
        };
        tracing::debug!(
            "virtual loop shut down with {} timers and {} immediates pending",
            timers.live_len(),
            immediates.len()
        );
        // Dropped outside the lock: their destructors may call back in.
        drop((timers, immediates, tasks));
        self.release_pool();
    }

    fn release_pool(&self) {
        let pool = POOLS
            .try_with(|pools| {
                pools
                    .try_borrow_mut()
                    .ok()
                    .and_then(|mut pools| pools.remove(&self.id))
            })
            .ok()
            .flatten();
        drop(pool);
    }

    fn drain(&self) {
        let mut pool = POOLS
            .with(|pools| pools.borrow_mut().remove(&self.id))
            .unwrap_or_default();

        loop {
            // Immediates queued while draining join the back of this pass.
            loop {
                let next = self.state().immediates.pop_front();
                let Some(callback) = next else {
                    break;
                };
                run_guarded("immediate", callback);
            }

            let tasks = std::mem::take(&mut self.state().tasks);
            let spawner = pool.spawner();
            for task in tasks {
                if let Err(e) = spawner.spawn_local(task()) {
                    tracing::warn!("virtual loop could not spawn task: {e:?}");
                }
            }

            pool.run_until_stalled();

            let state = self.state();
            if state.immediates.is_empty() && state.tasks.is_empty() {
                break;
            }
        }

        if self.state().closed {
            drop(pool);
        } else {
            POOLS.with(|pools| pools.borrow_mut().insert(self.id, pool));
        }
    }
}

impl Default for VirtualEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VirtualEventLoop {
    fn drop(&mut self) {
        // Pools on other threads are released when those threads exit.
        self.release_pool();
    }
}

impl std::fmt::Debug for VirtualEventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("VirtualEventLoop")
            .field("now_ms", &state.now_ms)
            .field("timers", &state.timers.live_len())
            .field("immediates", &state.immediates.len())
            .finish_non_exhaustive()
    }
}

impl EventLoop for VirtualEventLoop {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn priority(&self) -> i32 {
        i32::MAX - 1000
    }

    fn set_immediate(&self, callback: Callback) {
        let run_now = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.immediates.push_back(callback);
            !state.driving
        };
        if run_now {
            self.run_pending();
        }
    }

    fn set_timeout(&self, delay: Duration, callback: Callback) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = self.state();
        if state.closed {
            return handle;
        }
        let due = state.now_ms.saturating_add(millis(delay));
        state
            .timers
            .insert(due, TimerEntry::new(handle.clone(), callback));
        handle
    }

    fn spawn_local(&self, task: LocalTask) {
        let run_now = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.tasks.push(task);
            !state.driving
        };
        if run_now {
            self.run_pending();
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::error::VfsError;
    use crate::event_loop::Scheduler;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;

    fn setup() -> (Arc<VirtualEventLoop>, Scheduler) {
        let event_loop = Arc::new(VirtualEventLoop::new());
        let scheduler = Scheduler::new(event_loop.clone());
        (event_loop, scheduler)
    }

    fn log() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_step_fires_only_due_timers() {
        let (event_loop, scheduler) = setup();
        let seen = log();
        for (name, delay) in [("b", 20), ("a", 10), ("c", 30)] {
            let seen = Arc::clone(&seen);
            let _ = scheduler.set_timeout(Duration::from_millis(delay), move || {
                seen.lock().unwrap().push(name);
            });
        }

        event_loop.step(Duration::from_millis(20));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(event_loop.now(), Duration::from_millis(20));
        assert_eq!(event_loop.pending_timers(), 1);

        event_loop.step(Duration::from_millis(10));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_timers_at_same_time_keep_registration_order() {
        let (event_loop, scheduler) = setup();
        let seen = log();
        for name in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            let _ = scheduler.set_timeout(Duration::from_millis(5), move || {
                seen.lock().unwrap().push(name);
            });
        }
        event_loop.step(Duration::from_millis(5));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let (event_loop, scheduler) = setup();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        let handle = scheduler.set_timeout(Duration::from_millis(10), move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        handle.cancel();
        event_loop.step(Duration::from_millis(100));
        assert!(!fired.load(Ordering::SeqCst));
        assert!(!handle.has_fired());
    }

    #[test]
    fn test_interval_fires_once_per_period_in_single_step() {
        let (event_loop, scheduler) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _handle = scheduler.set_interval(Duration::from_millis(10), move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        event_loop.step(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 5);
        event_loop.step(Duration::from_millis(9));
        assert_eq!(count.load(Ordering::SeqCst), 5);
        event_loop.step(Duration::from_millis(1));
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_interval_stops_after_cancel() {
        let (event_loop, scheduler) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let handle = scheduler.set_interval(Duration::from_millis(10), move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..3 {
            event_loop.step(Duration::from_millis(10));
        }
        handle.cancel();
        event_loop.step(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(event_loop.pending_timers(), 0);
    }

    #[test]
    fn test_set_immediate_runs_without_step() {
        let (event_loop, scheduler) = setup();
        let seen = log();
        let sink = Arc::clone(&seen);
        scheduler.set_immediate(move || sink.lock().unwrap().push("ran"));
        assert_eq!(*seen.lock().unwrap(), vec!["ran"]);
        assert_eq!(event_loop.now(), Duration::ZERO);
    }

    #[test]
    fn test_immediates_are_fifo_and_trampolined() {
        let (event_loop, scheduler) = setup();
        let seen = log();

        // Registered from inside a running immediate, so both are queued.
        let outer_scheduler = scheduler.clone();
        let outer_seen = Arc::clone(&seen);
        scheduler.set_immediate(move || {
            let inner_scheduler = outer_scheduler.clone();
            let first_seen = Arc::clone(&outer_seen);
            outer_scheduler.set_immediate(move || {
                first_seen.lock().unwrap().push("one");
                let nested_seen = Arc::clone(&first_seen);
                inner_scheduler.set_immediate(move || nested_seen.lock().unwrap().push("three"));
                assert_eq!(first_seen.lock().unwrap().len(), 1);
            });
            let second_seen = Arc::clone(&outer_seen);
            outer_scheduler.set_immediate(move || second_seen.lock().unwrap().push("two"));
            assert!(outer_seen.lock().unwrap().is_empty());
        });

        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
        assert_eq!(event_loop.now(), Duration::ZERO);
    }

    #[test]
    fn test_immediate_from_timer_runs_in_same_step() {
        let (event_loop, scheduler) = setup();
        let seen = log();
        let nested = scheduler.clone();
        let sink = Arc::clone(&seen);
        let _timer = scheduler.set_timeout(Duration::from_millis(10), move || {
            let sink = Arc::clone(&sink);
            nested.set_immediate(move || sink.lock().unwrap().push("after timer"));
        });
        event_loop.step(Duration::from_millis(10));
        assert_eq!(*seen.lock().unwrap(), vec!["after timer"]);
    }

    #[test]
    fn test_main_starts_without_step() {
        let (_event_loop, scheduler) = setup();
        let started = Arc::new(AtomicBool::new(false));
        let started_clone = Arc::clone(&started);
        scheduler.main(move || async move {
            started_clone.store(true, Ordering::SeqCst);
            Ok::<(), VfsError>(())
        });
        assert!(started.load(Ordering::SeqCst));
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn test_shutdown_frees_parked_task() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let (event_loop, scheduler) = setup();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&dropped));
        let task_scheduler = scheduler.clone();
        scheduler.main(move || async move {
            let _flag = flag;
            task_scheduler.sleep(Duration::from_secs(3600)).await?;
            Ok::<(), VfsError>(())
        });
        let _interval = scheduler.set_interval(Duration::from_millis(10), || {});
        assert_eq!(scheduler.in_flight(), 1);
        assert!(!dropped.load(Ordering::SeqCst));

        event_loop.shutdown();
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(scheduler.in_flight(), 0);
        assert_eq!(event_loop.pending_timers(), 0);

        // Only the test's own handles remain.
        drop(scheduler);
        assert_eq!(Arc::strong_count(&event_loop), 1);

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        event_loop.set_immediate(Box::new(move || ran_clone.store(true, Ordering::SeqCst)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_sleeping_entry_resumes_on_step() {
        let (event_loop, scheduler) = setup();
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = Arc::clone(&done);
        let task_scheduler = scheduler.clone();

        scheduler.main(move || async move {
            task_scheduler.sleep(Duration::from_millis(10)).await?;
            done_clone.store(true, Ordering::SeqCst);
            Ok::<(), VfsError>(())
        });
        assert_eq!(scheduler.in_flight(), 1);

        event_loop.step(Duration::from_millis(5));
        assert!(!done.load(Ordering::SeqCst));
        event_loop.step(Duration::from_millis(5));
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn test_failed_entry_is_contained() {
        let (event_loop, scheduler) = setup();
        scheduler.main(|| async { Err::<(), _>(VfsError::InvalidArgument("nope".into())) });
        assert_eq!(scheduler.in_flight(), 0);

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        scheduler.set_immediate(move || ran_clone.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(event_loop.now(), Duration::ZERO);
    }
}
