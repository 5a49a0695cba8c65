//! Event loop on a dedicated thread running a compio runtime
//!
//! All callbacks and local tasks execute on that one thread, so they may use
//! compio I/O directly. Other threads talk to the loop through an unbounded
//! command channel; timers live in a [`TimerQueue`] owned by the loop thread,
//! which waits on whichever comes first: the next command or the next due
//! timer.
//!
//! Blocking work goes to the runtime's worker pool (see [`crate::worker`]),
//! bounded by [`RuntimeOptions::worker_threads`].

use super::{EventLoop, LocalTask};
use crate::error::{Result, VfsError};
use crate::timer::{run_guarded, Callback, TimerEntry, TimerHandle, TimerQueue};
use futures::channel::mpsc;
use futures::future::{self, Either};
use futures::StreamExt;
use std::num::NonZeroUsize;
use std::pin::pin;
use std::sync::{Mutex, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Start-up options for [`CompioEventLoop`]
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Upper bound on blocking worker threads (guaranteed >= 1)
    worker_threads: NonZeroUsize,
    /// Name given to the loop thread
    thread_name: String,
}

impl RuntimeOptions {
    /// Create options with an explicit worker bound (clamped to >= 1)
    #[must_use]
    pub fn new(worker_threads: usize) -> Self {
        Self {
            worker_threads: NonZeroUsize::new(worker_threads).unwrap_or(NonZeroUsize::MIN),
            thread_name: "avfs-loop".to_string(),
        }
    }

    /// Rename the loop thread
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Maximum number of blocking worker threads
    #[must_use]
    pub const fn worker_threads(&self) -> usize {
        self.worker_threads.get()
    }

    /// Name of the loop thread
    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::new(std::cmp::max(4, num_cpus::get()))
    }
}

// ============================================================================
// LOOP
// ============================================================================

enum Command {
    Immediate(Callback),
    Timer(Instant, TimerEntry),
    Spawn(LocalTask),
    Shutdown,
}

/// Production event loop backed by compio
pub struct CompioEventLoop {
    commands: mpsc::UnboundedSender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl CompioEventLoop {
    /// Spawn the loop thread and its runtime
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned or the runtime fails
    /// to build.
    pub fn start(options: RuntimeOptions) -> Result<Self> {
        let (commands, receiver) = mpsc::unbounded();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::io::Result<()>>();
        let worker_threads = options.worker_threads();

        let thread = std::thread::Builder::new()
            .name(options.thread_name().to_string())
            .spawn(move || {
                let runtime = match build_runtime(worker_threads) {
                    Ok(runtime) => {
                        let _ = ready_tx.send(Ok(()));
                        runtime
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                runtime.block_on(run_loop(receiver));
                tracing::debug!("event loop thread exiting");
            })
            .map_err(|e| VfsError::io("failed to spawn event loop thread", e))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(VfsError::io("failed to build compio runtime", e)),
            Err(_) => {
                return Err(VfsError::EventLoop(
                    "event loop thread exited during start-up".to_string(),
                ))
            }
        }

        tracing::debug!(
            "event loop started on {:?} with {} worker threads",
            options.thread_name(),
            worker_threads
        );
        Ok(Self {
            commands,
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn send(&self, command: Command) {
        if self.commands.unbounded_send(command).is_err() {
            tracing::warn!("event loop has shut down; dropping work");
        }
    }

    /// Stop the loop and wait for its thread to exit
    ///
    /// Pending timers and unfinished tasks are dropped. Calling this from the
    /// loop thread only requests the stop.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
        if std::thread::current().id() == self.thread_id {
            return;
        }
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("event loop thread panicked");
            }
        }
    }
}

impl Drop for CompioEventLoop {
    fn drop(&mut self) {
        // Already gone after an explicit shutdown.
        let _ = self.commands.unbounded_send(Command::Shutdown);
    }
}

impl EventLoop for CompioEventLoop {
    fn name(&self) -> &'static str {
        "compio"
    }

    fn set_immediate(&self, callback: Callback) {
        self.send(Command::Immediate(callback));
    }

    fn set_timeout(&self, delay: Duration, callback: Callback) -> TimerHandle {
        let handle = TimerHandle::new();
        let due = Instant::now() + delay;
        self.send(Command::Timer(due, TimerEntry::new(handle.clone(), callback)));
        handle
    }

    fn spawn_local(&self, task: LocalTask) {
        self.send(Command::Spawn(task));
    }
}

fn build_runtime(worker_threads: usize) -> std::io::Result<compio::runtime::Runtime> {
    let mut proactor = compio::driver::ProactorBuilder::new();
    proactor.thread_pool_limit(worker_threads);
    compio::runtime::RuntimeBuilder::new()
        .with_proactor(proactor)
        .build()
}

async fn run_loop(mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut timers: TimerQueue<Instant> = TimerQueue::new();

    loop {
        let command = match timers.next_due() {
            Some(due) => {
                let timer = pin!(compio::time::sleep_until(due));
                match future::select(commands.next(), timer).await {
                    Either::Left((command, _)) => command,
                    Either::Right(((), _)) => {
                        for entry in timers.pop_all_due(Instant::now()) {
                            entry.fire();
                        }
                        continue;
                    }
                }
            }
            None => commands.next().await,
        };

        match command {
            Some(Command::Immediate(callback)) => run_guarded("immediate", callback),
            Some(Command::Timer(due, entry)) => timers.insert(due, entry),
            Some(Command::Spawn(task)) => compio::runtime::spawn(task()).detach(),
            Some(Command::Shutdown) | None => break,
        }
    }

    tracing::debug!("event loop stopped with {} live timers", timers.live_len());
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::event_loop::Scheduler;
    use std::sync::{mpsc as std_mpsc, Arc};

    fn start() -> Scheduler {
        Scheduler::new(Arc::new(
            CompioEventLoop::start(RuntimeOptions::new(2).with_thread_name("avfs-test-loop"))
                .unwrap(),
        ))
    }

    #[test]
    fn test_immediates_run_in_fifo_order() {
        let scheduler = start();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            scheduler.set_immediate(move || tx.send(i).unwrap());
        }
        let seen: Vec<i32> = (0..16)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_timers_fire_in_due_order() {
        let scheduler = start();
        let (tx, rx) = std_mpsc::channel();
        for (id, delay) in [(3, 60), (1, 20), (2, 40)] {
            let tx = tx.clone();
            let _ = scheduler.set_timeout(Duration::from_millis(delay), move || {
                tx.send(id).unwrap();
            });
        }
        let seen: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_timeout_respects_delay_and_cancel() {
        let scheduler = start();
        let (tx, rx) = std_mpsc::channel();
        let started = Instant::now();

        let cancelled_tx = tx.clone();
        let cancelled = scheduler.set_timeout(Duration::from_millis(10), move || {
            cancelled_tx.send("cancelled").unwrap();
        });
        cancelled.cancel();
        let _ = scheduler.set_timeout(Duration::from_millis(30), move || {
            tx.send("kept").unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "kept");
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_main_tracks_in_flight_and_sleeps() {
        let scheduler = start();
        let task_scheduler = scheduler.clone();
        let started = Instant::now();
        scheduler.run(move || async move {
            task_scheduler.sleep(Duration::from_millis(20)).await?;
            Ok::<(), VfsError>(())
        });
        assert_eq!(scheduler.in_flight(), 0);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_failing_entry_does_not_stop_loop() {
        let scheduler = start();
        scheduler.run(|| async { Err::<(), _>(VfsError::InvalidArgument("boom".into())) });
        scheduler.run(|| async {
            let fail = true;
            if fail {
                panic!("entry panic");
            }
            Ok::<(), VfsError>(())
        });

        let (tx, rx) = std_mpsc::channel();
        scheduler.set_immediate(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_interval_until_cancelled() {
        let scheduler = start();
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        let handle = scheduler.set_interval(Duration::from_millis(5), move || {
            let _ = tx.lock().unwrap().send(());
        });
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        handle.cancel();
        let _already_queued = rx.try_iter().count();
        // At most one firing may already be in flight when cancel lands.
        std::thread::sleep(Duration::from_millis(30));
        let late = rx.try_iter().count();
        assert!(late <= 1, "interval kept firing after cancel: {late}");
    }

    #[test]
    fn test_shutdown_joins_thread() {
        let event_loop = CompioEventLoop::start(RuntimeOptions::new(1)).unwrap();
        event_loop.shutdown();
        event_loop.set_immediate(Box::new(|| {}));
    }
}
