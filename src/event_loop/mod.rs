//! Pluggable event loops and the scheduler handle
//!
//! An [`EventLoop`] knows how to run callbacks (now or after a delay) and how
//! to host local tasks. Everything else (intervals, sleeping, the tracked
//! entry point) is layered on top by [`Scheduler`], so every loop
//! implementation gets the same semantics for free.
//!
//! # Architecture
//!
//! ```text
//! application
//!     ↓ Scheduler (cloneable handle, in-flight counter)
//!     ↓ Arc<dyn EventLoop>
//!     ├── CompioEventLoop   dedicated thread + compio runtime
//!     └── VirtualEventLoop  explicit time steps, for tests
//! ```
//!
//! A process-wide scheduler is available through [`global`], selected with
//! [`select_event_loop`] on first use, or set up front with [`install`].

pub mod compio_loop;
pub mod virtual_clock;

pub use compio_loop::{CompioEventLoop, RuntimeOptions};
pub use virtual_clock::VirtualEventLoop;

use crate::completion::{self, Completion};
use crate::error::{Result, VfsError};
use crate::timer::{Callback, TimerHandle};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Factory for a task that must be created and polled on the loop's own thread
pub type LocalTask = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send + 'static>;

/// A scheduler implementation
pub trait EventLoop: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Whether this implementation can run in the current process
    fn is_available(&self) -> bool {
        true
    }

    /// Ranking used by [`select_event_loop`]; higher wins
    fn priority(&self) -> i32 {
        0
    }

    /// Prepare the loop before its first use
    ///
    /// # Errors
    ///
    /// Implementations report start-up failures here.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Queue `callback` to run as soon as the loop is free (FIFO)
    fn set_immediate(&self, callback: Callback);

    /// Run `callback` no earlier than `delay` from now
    fn set_timeout(&self, delay: Duration, callback: Callback) -> TimerHandle;

    /// Create a task from `task` on the loop's execution context and drive it
    fn spawn_local(&self, task: LocalTask);
}

/// Pick the highest-priority available loop; the earliest candidate wins ties
#[must_use]
pub fn select_event_loop(candidates: &[Arc<dyn EventLoop>]) -> Option<Arc<dyn EventLoop>> {
    candidates
        .iter()
        .filter(|candidate| candidate.is_available())
        .fold(None::<&Arc<dyn EventLoop>>, |best, candidate| match best {
            Some(best) if best.priority() >= candidate.priority() => Some(best),
            _ => Some(candidate),
        })
        .cloned()
}

static GLOBAL: OnceLock<Scheduler> = OnceLock::new();

/// Serializes construction of the global scheduler
static GLOBAL_INIT: Mutex<()> = Mutex::new(());

/// Use `scheduler` as the process-wide scheduler
///
/// # Errors
///
/// Fails once the global scheduler has been initialized, either by an earlier
/// `install` or by a call to [`global`].
pub fn install(scheduler: Scheduler) -> Result<()> {
    let _init = GLOBAL_INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if GLOBAL.get().is_some() {
        return Err(already_initialized());
    }
    scheduler.event_loop.init()?;
    GLOBAL.set(scheduler).map_err(|_| already_initialized())
}

fn already_initialized() -> VfsError {
    VfsError::EventLoop("global scheduler already initialized".to_string())
}

/// The process-wide scheduler, started on first use
///
/// # Errors
///
/// Returns an error if no candidate loop is available or it fails to start.
pub fn global() -> Result<Scheduler> {
    global_with(|| {
        Ok(vec![Arc::new(CompioEventLoop::start(
            RuntimeOptions::default(),
        )?)])
    })
}

/// [`global`] with its own candidate list; `candidates` runs at most once per
/// process, and only if nothing is installed yet
fn global_with(
    candidates: impl FnOnce() -> Result<Vec<Arc<dyn EventLoop>>>,
) -> Result<Scheduler> {
    if let Some(scheduler) = GLOBAL.get() {
        return Ok(scheduler.clone());
    }
    let _init = GLOBAL_INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(scheduler) = GLOBAL.get() {
        return Ok(scheduler.clone());
    }
    let candidates = candidates()?;
    let selected = select_event_loop(&candidates)
        .ok_or_else(|| VfsError::EventLoop("no event loop available".to_string()))?;
    selected.init()?;
    tracing::debug!("global scheduler uses the {} loop", selected.name());
    Ok(GLOBAL.get_or_init(|| Scheduler::new(selected)).clone())
}

/// Count of entry tasks still running
#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightGuard {
            in_flight: Arc::clone(self),
        }
    }

    fn get(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decrements the in-flight count however the task ends (completion, failure,
/// or being dropped unpolled)
struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self
            .in_flight
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.in_flight.idle.notify_all();
        }
    }
}

/// Cloneable handle to an event loop
///
/// This is what application code holds; it is injected at the entry point
/// rather than looked up, although [`global`] offers a shared default.
#[derive(Clone)]
pub struct Scheduler {
    event_loop: Arc<dyn EventLoop>,
    in_flight: Arc<InFlight>,
}

impl Scheduler {
    /// Wrap an event loop
    #[must_use]
    pub fn new(event_loop: Arc<dyn EventLoop>) -> Self {
        Self {
            event_loop,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// The underlying loop
    #[must_use]
    pub fn event_loop(&self) -> &Arc<dyn EventLoop> {
        &self.event_loop
    }

    /// Run `callback` as soon as the loop is free
    pub fn set_immediate(&self, callback: impl FnOnce() + Send + 'static) {
        self.event_loop.set_immediate(Box::new(callback));
    }

    /// Run `callback` once after `delay`
    pub fn set_timeout(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        self.event_loop.set_timeout(delay, Box::new(callback))
    }

    /// Run `callback` every `period` until the returned handle is cancelled
    ///
    /// Each firing re-arms a fresh timeout. The shared handle is checked before
    /// invoking and again before re-arming, so cancelling from inside the
    /// callback stops the chain. A firing that was already dispatched when
    /// `cancel` is called may still run.
    pub fn set_interval(
        &self,
        period: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> TimerHandle {
        let handle = TimerHandle::new();
        arm_interval(
            Arc::clone(&self.event_loop),
            period,
            Arc::new(callback),
            handle.clone(),
        );
        handle
    }

    /// Suspend the calling task for `delay`
    ///
    /// Dropping the returned future cancels its timer.
    pub fn sleep(&self, delay: Duration) -> Sleep {
        let (completer, completion) = completion::completion();
        let timer = self.set_timeout(delay, move || completer.succeed(()));
        Sleep { timer, completion }
    }

    /// Start a tracked entry task
    ///
    /// The in-flight count goes up now and down when the task finishes, fails
    /// or is discarded. Failures and panics are logged; they never reach the
    /// loop itself.
    pub fn main<F, Fut, E>(&self, entry: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + 'static,
        E: Display + 'static,
    {
        let guard = self.in_flight.enter();
        let loop_name = self.event_loop.name();
        self.event_loop.spawn_local(Box::new(move || {
            async move {
                let _guard = guard;
                match AssertUnwindSafe(async move { entry().await })
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => tracing::debug!("entry task finished on {loop_name}"),
                    Ok(Err(e)) => tracing::error!("entry task failed on {loop_name}: {e}"),
                    Err(_) => tracing::error!("entry task panicked on {loop_name}"),
                }
            }
            .boxed_local()
        }));
    }

    /// Number of entry tasks started with [`main`](Self::main) still running
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    /// Block the calling thread until no entry task is in flight
    ///
    /// Must not be called from the loop's own thread.
    pub fn wait_idle(&self) {
        let count = self
            .in_flight
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        drop(
            self.in_flight
                .idle
                .wait_while(count, |count| *count > 0)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    /// [`wait_idle`](Self::wait_idle) with an upper bound; returns whether the
    /// loop went idle in time
    #[must_use]
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self
            .in_flight
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self
                .in_flight
                .idle
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Start `entry` and block until every entry task has finished
    pub fn run<F, Fut, E>(&self, entry: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + 'static,
        E: Display + 'static,
    {
        self.main(entry);
        self.wait_idle();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("event_loop", &self.event_loop.name())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn arm_interval(
    event_loop: Arc<dyn EventLoop>,
    period: Duration,
    callback: Arc<dyn Fn() + Send + Sync>,
    handle: TimerHandle,
) {
    let next_loop = Arc::clone(&event_loop);
    // Per-tick handles are discarded; the shared `handle` guards the chain.
    let _tick = event_loop.set_timeout(
        period,
        Box::new(move || {
            if handle.is_cancelled() {
                return;
            }
            callback();
            if handle.is_cancelled() {
                return;
            }
            arm_interval(next_loop, period, callback, handle);
        }),
    );
}

/// Future returned by [`Scheduler::sleep`]
#[must_use = "sleeping does nothing unless awaited"]
#[derive(Debug)]
pub struct Sleep {
    timer: TimerHandle,
    completion: Completion<()>,
}

impl Future for Sleep {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.completion).poll(cx)
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}
