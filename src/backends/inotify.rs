//! Minimal inotify wrapper used by the local watch loop
//!
//! One instance watches one directory for entries being created, deleted or
//! modified (moves count as delete + create). The descriptor is
//! non-blocking; [`Inotify::poll`] waits up to a timeout and returns whatever
//! events have arrived, so the caller can check its stop flag in between.

use crate::vfs::VfsFileEventKind;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

/// Size of the fixed part of `struct inotify_event`
const HEADER_LEN: usize = 16;

const WATCH_MASK: u32 = libc::IN_CREATE
    | libc::IN_DELETE
    | libc::IN_MODIFY
    | libc::IN_MOVED_FROM
    | libc::IN_MOVED_TO;

/// A decoded inotify record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    /// An entry in the watched directory changed
    Change {
        kind: VfsFileEventKind,
        /// Entry name relative to the watched directory; `None` for the
        /// directory itself
        name: Option<String>,
    },
    /// The kernel queue overflowed and events were lost
    Overflow,
}

/// An inotify instance with a single directory watch
#[derive(Debug)]
pub struct Inotify {
    fd: OwnedFd,
    buffer: Vec<u8>,
}

impl Inotify {
    /// Start watching `dir`
    ///
    /// # Errors
    ///
    /// Returns the OS error if the instance cannot be created or the watch
    /// cannot be added (e.g. `dir` does not exist).
    pub fn watch(dir: &Path) -> io::Result<Self> {
        let path = CString::new(dir.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // SAFETY: plain syscall; the returned descriptor is checked below.
        let raw = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: `path` is a valid NUL-terminated string for the call.
        let wd = unsafe { libc::inotify_add_watch(fd.as_raw_fd(), path.as_ptr(), WATCH_MASK) };
        if wd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd,
            buffer: vec![0; 64 * 1024],
        })
    }

    /// Wait up to `timeout` and return the events that arrived
    ///
    /// # Errors
    ///
    /// Returns the OS error from `poll` or `read`; an interrupted wait yields
    /// no events instead.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<Vec<RawEvent>> {
        let mut pollfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        // SAFETY: `pollfd` is a valid array of one element for the call.
        let ready = unsafe { libc::poll(&raw mut pollfd, 1, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        if ready == 0 {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        loop {
            // SAFETY: the buffer is valid for `len` bytes of writes.
            let read = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    self.buffer.as_mut_ptr().cast(),
                    self.buffer.len(),
                )
            };
            if read < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err),
                }
            }
            let read = usize::try_from(read).unwrap_or(0);
            if read == 0 {
                break;
            }
            events.extend(parse_events(&self.buffer[..read]));
        }
        Ok(events)
    }
}

/// Decode a buffer of `struct inotify_event` records
///
/// Records the watch does not translate (e.g. `IN_IGNORED`) are skipped, as
/// is a truncated trailing record.
#[must_use]
pub fn parse_events(mut bytes: &[u8]) -> Vec<RawEvent> {
    let mut events = Vec::new();
    while bytes.len() >= HEADER_LEN {
        let field = |at: usize| u32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mask = field(4);
        let name_len = field(12) as usize;
        let Some(record) = bytes.get(..HEADER_LEN + name_len) else {
            break;
        };

        let raw_name = &record[HEADER_LEN..];
        let name_end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
        let name = (name_end > 0).then(|| String::from_utf8_lossy(&raw_name[..name_end]).into_owned());

        if mask & libc::IN_Q_OVERFLOW != 0 {
            events.push(RawEvent::Overflow);
        } else if let Some(kind) = translate(mask) {
            events.push(RawEvent::Change { kind, name });
        }
        bytes = &bytes[HEADER_LEN + name_len..];
    }
    events
}

fn translate(mask: u32) -> Option<VfsFileEventKind> {
    if mask & (libc::IN_CREATE | libc::IN_MOVED_TO) != 0 {
        Some(VfsFileEventKind::Created)
    } else if mask & (libc::IN_DELETE | libc::IN_MOVED_FROM) != 0 {
        Some(VfsFileEventKind::Deleted)
    } else if mask & libc::IN_MODIFY != 0 {
        Some(VfsFileEventKind::Modified)
    } else {
        None
    }
}
