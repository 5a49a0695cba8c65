//! Child process execution with incremental output draining
//!
//! The child is spawned through `compio::process`. Each of its pipes gets a
//! reader task that forwards chunks into an unbounded channel as the driver
//! completes reads. The calling task polls both channels: each iteration takes
//! whatever has arrived, hands non-empty chunks to the handler, and sleeps for
//! the poll interval.

use crate::error::{Result, VfsError};
use crate::vfs::VfsProcessHandler;
use compio::buf::BufResult;
use compio::io::AsyncRead;
use compio::process::Command;
use futures::channel::mpsc;
use futures::{FutureExt, StreamExt};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

/// Capacity of each pipe read
const READ_CHUNK: usize = 8192;

/// Most bytes taken from one pipe per iteration, so a chatty child cannot
/// starve the other stream
const MAX_DRAIN_PER_ITERATION: usize = 1024 * 1024;

/// Idle polls after the child exited before giving up on pipes that a
/// grandchild still holds open
const SETTLE_POLLS: u32 = 3;

/// Output of one pipe, fed by a detached reader task
struct Drain {
    chunks: mpsc::UnboundedReceiver<io::Result<Vec<u8>>>,
    closed: bool,
}

impl Drain {
    /// Start reading `reader` until end of file; `None` yields a closed drain
    fn spawn<R: AsyncRead + 'static>(reader: Option<R>) -> Self {
        let (sender, chunks) = mpsc::unbounded();
        if let Some(mut reader) = reader {
            compio::runtime::spawn(async move {
                loop {
                    let BufResult(result, buf) = reader.read(Vec::with_capacity(READ_CHUNK)).await;
                    match result {
                        Ok(0) => break,
                        Ok(_) => {
                            if sender.unbounded_send(Ok(buf)).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            let _ = sender.unbounded_send(Err(e));
                            break;
                        }
                    }
                }
            })
            .detach();
        }
        Self {
            chunks,
            closed: false,
        }
    }

    /// Bytes that have arrived so far, without waiting
    fn take_available(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while !self.closed && out.len() < MAX_DRAIN_PER_ITERATION {
            match self.chunks.next().now_or_never() {
                Some(Some(chunk)) => out.extend_from_slice(&chunk?),
                Some(None) => self.closed = true,
                None => break,
            }
        }
        Ok(out)
    }

    /// Everything queued, ignoring the per-iteration cap
    fn take_remaining(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.take_available()?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }
}

/// Exit status as a single code: the exit code, `128 + signal` if killed,
/// `-1` otherwise
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

fn configure_failed(stream: &str) -> VfsError {
    VfsError::io(
        format!("failed to configure {stream}"),
        io::Error::other("unsupported stdio"),
    )
}

/// Run `cmd_and_args` in `cwd`, streaming output to `handler`
///
/// Returns once both pipes reached end of file, or once the child exited and
/// a few further poll intervals brought no output (a grandchild may keep a
/// pipe open).
///
/// # Errors
///
/// Returns [`VfsError::InvalidArgument`] for an empty command, and an I/O
/// error if the process cannot be spawned, read from or waited on.
pub async fn run(
    cwd: PathBuf,
    cmd_and_args: &[String],
    handler: &mut dyn VfsProcessHandler,
    poll_interval: Duration,
) -> Result<i32> {
    let (program, args) = cmd_and_args
        .split_first()
        .ok_or_else(|| VfsError::InvalidArgument("empty command".to_string()))?;

    let mut command = Command::new(program);
    command.args(args).current_dir(&cwd);
    command
        .stdin(Stdio::null())
        .map_err(|_| configure_failed("stdin"))?;
    command
        .stdout(Stdio::piped())
        .map_err(|_| configure_failed("stdout"))?;
    command
        .stderr(Stdio::piped())
        .map_err(|_| configure_failed("stderr"))?;
    let mut child = command
        .spawn()
        .map_err(|e| VfsError::io(format!("failed to spawn {program:?} in {}", cwd.display()), e))?;
    tracing::debug!("spawned {program:?} as pid {}", child.id());

    let mut stdout = Drain::spawn(child.stdout.take());
    let mut stderr = Drain::spawn(child.stderr.take());
    let wait = compio::runtime::spawn(child.wait());

    let pipe_context = format!("failed to read output of {program:?}");
    let mut idle_since_exit = 0;
    loop {
        let out = stdout
            .take_available()
            .map_err(|e| VfsError::io(pipe_context.clone(), e))?;
        let err = stderr
            .take_available()
            .map_err(|e| VfsError::io(pipe_context.clone(), e))?;
        if !out.is_empty() {
            tracing::trace!("{program:?} stdout chunk of {} bytes", out.len());
            handler.on_out(&out);
        }
        if !err.is_empty() {
            tracing::trace!("{program:?} stderr chunk of {} bytes", err.len());
            handler.on_err(&err);
        }

        if stdout.closed && stderr.closed {
            break;
        }
        if wait.is_finished() {
            idle_since_exit = if out.is_empty() && err.is_empty() {
                idle_since_exit + 1
            } else {
                0
            };
            if idle_since_exit >= SETTLE_POLLS {
                break;
            }
        }
        compio::time::sleep(poll_interval).await;
    }

    let out = stdout
        .take_remaining()
        .map_err(|e| VfsError::io(pipe_context.clone(), e))?;
    let err = stderr
        .take_remaining()
        .map_err(|e| VfsError::io(pipe_context, e))?;
    if !out.is_empty() {
        handler.on_out(&out);
    }
    if !err.is_empty() {
        handler.on_err(&err);
    }

    let wait_context = format!("failed to wait for {program:?}");
    let status = wait
        .await
        .map_err(|_| VfsError::io(wait_context.clone(), io::Error::other("wait task panicked")))?
        .map_err(|e| VfsError::io(wait_context, e))?;
    let code = exit_code(status);
    tracing::debug!("{program:?} exited with {code}");
    Ok(code)
}
