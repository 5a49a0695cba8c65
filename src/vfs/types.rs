//! Value types exchanged through the [`Vfs`](super::Vfs) surface

use super::VfsFile;
use futures::channel::oneshot;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Metadata snapshot for one path
///
/// Built through [`VfsStat::missing`] or [`VfsStat::existing`], so a stat that
/// reports a missing file always has size 0 and is never a directory. Fields
/// beyond existence, kind and size are best-effort.
#[derive(Clone)]
pub struct VfsStat {
    file: VfsFile,
    exists: bool,
    is_directory: bool,
    size: u64,
    device: i64,
    inode: i64,
    mode: u32,
    owner: String,
    group: String,
    create_time: i64,
    modified_time: Option<i64>,
    last_access_time: Option<i64>,
    extra_info: Option<Arc<dyn Any + Send + Sync>>,
}

impl VfsStat {
    fn base(file: VfsFile, exists: bool, is_directory: bool, size: u64) -> Self {
        Self {
            file,
            exists,
            is_directory,
            size,
            device: -1,
            inode: -1,
            mode: 0o777,
            owner: "nobody".to_string(),
            group: "nobody".to_string(),
            create_time: 0,
            modified_time: None,
            last_access_time: None,
            extra_info: None,
        }
    }

    /// Stat for a path that does not exist
    #[must_use]
    pub fn missing(file: VfsFile) -> Self {
        Self::base(file, false, false, 0)
    }

    /// Stat for an existing file or directory
    #[must_use]
    pub fn existing(file: VfsFile, is_directory: bool, size: u64) -> Self {
        Self::base(file, true, is_directory, size)
    }

    /// Same snapshot reported for another file handle
    #[must_use]
    pub fn with_file(mut self, file: VfsFile) -> Self {
        self.file = file;
        self
    }

    #[must_use]
    pub fn with_device_inode(mut self, device: i64, inode: i64) -> Self {
        self.device = device;
        self.inode = inode;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>, group: impl Into<String>) -> Self {
        self.owner = owner.into();
        self.group = group.into();
        self
    }

    /// Set the times in epoch milliseconds; `None` falls back as documented
    /// on the getters
    #[must_use]
    pub fn with_times(
        mut self,
        create_time: i64,
        modified_time: Option<i64>,
        last_access_time: Option<i64>,
    ) -> Self {
        self.create_time = create_time;
        self.modified_time = modified_time;
        self.last_access_time = last_access_time;
        self
    }

    /// Attach backend-specific data
    #[must_use]
    pub fn with_extra_info(mut self, extra: Arc<dyn Any + Send + Sync>) -> Self {
        self.extra_info = Some(extra);
        self
    }

    #[must_use]
    pub const fn file(&self) -> &VfsFile {
        &self.file
    }

    #[must_use]
    pub const fn exists(&self) -> bool {
        self.exists
    }

    #[must_use]
    pub const fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Device id, `-1` if unknown
    #[must_use]
    pub const fn device(&self) -> i64 {
        self.device
    }

    /// Inode number, `-1` if unknown
    #[must_use]
    pub const fn inode(&self) -> i64 {
        self.inode
    }

    #[must_use]
    pub const fn mode(&self) -> u32 {
        self.mode
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Creation time in epoch milliseconds
    #[must_use]
    pub const fn create_time(&self) -> i64 {
        self.create_time
    }

    /// Modification time; defaults to the creation time
    #[must_use]
    pub fn modified_time(&self) -> i64 {
        self.modified_time.unwrap_or(self.create_time)
    }

    /// Last access time; defaults to the modification time
    #[must_use]
    pub fn last_access_time(&self) -> i64 {
        self.last_access_time
            .unwrap_or_else(|| self.modified_time())
    }

    /// Opaque backend data, if any
    #[must_use]
    pub fn extra_info(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.extra_info.as_deref()
    }
}

impl std::fmt::Debug for VfsStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsStat")
            .field("file", &self.file)
            .field("exists", &self.exists)
            .field("is_directory", &self.is_directory)
            .field("size", &self.size)
            .field("mode", &format_args!("{:o}", self.mode))
            .field("modified_time", &self.modified_time())
            .finish_non_exhaustive()
    }
}

/// How [`Vfs::open`](super::Vfs::open) acquires a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VfsOpenMode {
    /// Read only; the file must exist
    Read,
    /// Read and write; the file must exist
    Write,
    /// Writes land at the end of the file
    Append,
    /// Read and write, creating the file if missing
    Create,
    /// Create a new file; fails if one exists
    CreateNew,
    /// Create the file, or empty it if it exists
    CreateOrTruncate,
}

impl VfsOpenMode {
    /// Whether the stream may be written
    #[must_use]
    pub const fn is_write(self) -> bool {
        !matches!(self, Self::Read)
    }

    /// Whether opening may create the file
    #[must_use]
    pub const fn creates(self) -> bool {
        matches!(self, Self::Create | Self::CreateNew | Self::CreateOrTruncate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VfsFileEventKind {
    Created,
    Modified,
    Deleted,
}

/// Change notification delivered to a watch handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsFileEvent {
    pub kind: VfsFileEventKind,
    pub file: VfsFile,
    /// Second file involved in the change, when the source reports one
    pub other: Option<VfsFile>,
}

impl VfsFileEvent {
    #[must_use]
    pub const fn new(kind: VfsFileEventKind, file: VfsFile) -> Self {
        Self {
            kind,
            file,
            other: None,
        }
    }
}

/// Receives a child process's output as it is produced
///
/// Called from the task running `exec`, never concurrently. The handler's
/// role ends once the exit code has been returned.
pub trait VfsProcessHandler {
    fn on_out(&mut self, _data: &[u8]) {}

    fn on_err(&mut self, _data: &[u8]) {}
}

/// Discards all output
impl VfsProcessHandler for () {}

/// Collects both output streams in memory
#[derive(Debug, Default, Clone)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl VfsProcessHandler for ProcessOutput {
    fn on_out(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
    }

    fn on_err(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
    }
}

/// Callback receiving watch events
pub type WatchHandler = Arc<dyn Fn(VfsFileEvent) + Send + Sync>;

/// Handle to an active watch
///
/// [`cancel`](Self::cancel) stops the source and returns once it has released
/// its native resources. Dropping the handle only asks the source to stop.
#[derive(Debug)]
#[must_use = "dropping a subscription stops the watch"]
pub struct WatchSubscription {
    running: Arc<AtomicBool>,
    finished: Option<oneshot::Receiver<()>>,
}

/// Source side of a [`WatchSubscription`], held by the watch loop
///
/// Dropping it tells a pending [`WatchSubscription::cancel`] that the loop
/// has exited.
#[derive(Debug)]
pub struct WatchControl {
    running: Arc<AtomicBool>,
    _finished: oneshot::Sender<()>,
}

impl WatchControl {
    /// Whether the subscriber still wants events
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl WatchSubscription {
    /// A linked subscription / control pair for a new watch source
    pub fn channel() -> (Self, WatchControl) {
        let running = Arc::new(AtomicBool::new(true));
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                running: Arc::clone(&running),
                finished: Some(receiver),
            },
            WatchControl {
                running,
                _finished: sender,
            },
        )
    }

    /// A subscription with nothing behind it
    pub fn inert() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            finished: None,
        }
    }

    /// Whether the source has not been asked to stop
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the watch and wait for the source to shut down
    pub async fn cancel(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(finished) = self.finished.take() {
            // The sender is only ever dropped, so `Canceled` is the signal.
            let _ = finished.await;
        }
    }
}

impl Default for WatchSubscription {
    fn default() -> Self {
        Self::inert()
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_open_mode_flags() {
        assert!(!VfsOpenMode::Read.is_write());
        assert!(VfsOpenMode::Append.is_write());
        assert!(!VfsOpenMode::Write.creates());
        assert!(VfsOpenMode::CreateNew.creates());
        assert!(VfsOpenMode::CreateOrTruncate.creates());
    }

    #[test]
    fn test_process_output_collects_streams() {
        let mut output = ProcessOutput::default();
        output.on_out(b"hello ");
        output.on_out(b"world");
        output.on_err(b"oops");
        assert_eq!(output.stdout_lossy(), "hello world");
        assert_eq!(output.stderr_lossy(), "oops");
    }

    #[test]
    fn test_subscription_cancel_waits_for_control() {
        let (subscription, control) = WatchSubscription::channel();
        assert!(control.is_running());

        let worker = std::thread::spawn(move || {
            while control.is_running() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        });
        block_on(subscription.cancel());
        worker.join().unwrap();
    }

    #[test]
    fn test_dropping_subscription_stops_source() {
        let (subscription, control) = WatchSubscription::channel();
        drop(subscription);
        assert!(!control.is_running());
    }

    #[test]
    fn test_inert_subscription() {
        let subscription = WatchSubscription::default();
        assert!(!subscription.is_active());
        block_on(subscription.cancel());
    }
}
