//! Local filesystem backend
//!
//! Maps the [`Vfs`] contract onto a directory of the host filesystem. File
//! streams use compio's completion-based `read_at`/`write_at`; metadata and
//! mutation calls (`stat`, `mkdir`, `delete`, `rename`, `set_size`) are
//! blocking syscalls and run on the worker pool via [`worker::offload_io`].
//! Directory listings are materialized on the worker pool and streamed back
//! through an [`AsyncSequence`]; watches poll inotify on the worker pool until
//! the subscription is cancelled.
//!
//! VFS paths are resolved under the backend's root and can never climb above
//! it.

#[cfg(target_os = "linux")]
use super::inotify::{Inotify, RawEvent};
use super::process;
use crate::error::{Result, VfsError};
use crate::sequence::{self, AsyncSequence};
use crate::vfs::{
    ensure_same_vfs, path, AsyncStream, Vfs, VfsFile, VfsOpenMode, VfsProcessHandler, VfsStat,
    VfsStreamBase, WatchHandler, WatchSubscription,
};
#[cfg(target_os = "linux")]
use crate::vfs::{VfsFileEvent, WatchControl};
use crate::worker;
use async_trait::async_trait;
use compio::buf::BufResult;
use compio::fs::File;
use compio::io::{AsyncReadAt, AsyncWriteAt};
use std::fs::{Metadata, ReadDir};
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tuning knobs for [`LocalVfs`]
#[derive(Debug, Clone)]
pub struct LocalVfsOptions {
    /// Pause between output drains while a child process runs
    exec_poll_interval: Duration,
    /// Longest a watch poll blocks before re-checking for cancellation
    watch_poll_timeout: Duration,
    /// Directory entries buffered ahead of the consumer
    list_buffer: NonZeroUsize,
}

impl Default for LocalVfsOptions {
    fn default() -> Self {
        Self {
            exec_poll_interval: Duration::from_millis(1),
            watch_poll_timeout: Duration::from_millis(100),
            list_buffer: NonZeroUsize::new(16).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl LocalVfsOptions {
    #[must_use]
    pub const fn with_exec_poll_interval(mut self, interval: Duration) -> Self {
        self.exec_poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_watch_poll_timeout(mut self, timeout: Duration) -> Self {
        self.watch_poll_timeout = timeout;
        self
    }

    /// Set the listing buffer; zero is raised to one
    #[must_use]
    pub fn with_list_buffer(mut self, entries: usize) -> Self {
        self.list_buffer = NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN);
        self
    }

    #[must_use]
    pub const fn exec_poll_interval(&self) -> Duration {
        self.exec_poll_interval
    }

    #[must_use]
    pub const fn watch_poll_timeout(&self) -> Duration {
        self.watch_poll_timeout
    }

    #[must_use]
    pub const fn list_buffer(&self) -> usize {
        self.list_buffer.get()
    }
}

// ============================================================================
// BACKEND
// ============================================================================

/// A [`Vfs`] over a host directory
#[derive(Debug)]
pub struct LocalVfs {
    root: PathBuf,
    options: LocalVfsOptions,
}

impl LocalVfs {
    /// Serve `root` with default options
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_options(root, LocalVfsOptions::default())
    }

    pub fn with_options(root: impl Into<PathBuf>, options: LocalVfsOptions) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            options,
        })
    }

    #[must_use]
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub const fn options(&self) -> &LocalVfsOptions {
        &self.options
    }

    /// Host path for a VFS path
    #[must_use]
    pub fn resolve(&self, vfs_path: &str) -> PathBuf {
        let normalized = path::normalize(vfs_path);
        let relative = normalized.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

#[async_trait(?Send)]
impl Vfs for LocalVfs {
    fn name(&self) -> &str {
        "local"
    }

    async fn open(&self, file: &VfsFile, mode: VfsOpenMode) -> Result<AsyncStream> {
        let native = self.resolve(file.path());
        let mut options = compio::fs::OpenOptions::new();
        options.read(true);
        match mode {
            VfsOpenMode::Read => {}
            VfsOpenMode::Write | VfsOpenMode::Append => {
                options.write(true);
            }
            VfsOpenMode::Create => {
                options.write(true).create(true);
            }
            VfsOpenMode::CreateNew => {
                options.write(true).create_new(true);
            }
            VfsOpenMode::CreateOrTruncate => {
                options.write(true).create(true).truncate(true);
            }
        }
        let handle = options.open(&native).await.map_err(|e| {
            VfsError::io(format!("failed to open {} ({mode:?})", native.display()), e)
        })?;
        tracing::trace!("opened {} ({mode:?})", native.display());
        Ok(AsyncStream::new(Box::new(LocalStream {
            file: Some(handle),
            append: mode == VfsOpenMode::Append,
            path: native,
        })))
    }

    async fn stat(&self, file: &VfsFile) -> Result<VfsStat> {
        let native = self.resolve(file.path());
        let context = format!("failed to stat {}", native.display());
        match worker::offload_io(context, move || std::fs::metadata(native)).await {
            Ok(metadata) => Ok(stat_from_metadata(file.clone(), &metadata)),
            Err(VfsError::NotFound(_)) => Ok(VfsStat::missing(file.clone())),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, dir: &VfsFile) -> Result<AsyncSequence<VfsFile>> {
        let native = self.resolve(dir.path());
        let context = format!("failed to list {}", native.display());
        let reader = worker::offload_io(context, move || std::fs::read_dir(native)).await?;

        let (mut emitter, entries) = sequence::channel(self.options.list_buffer());
        let dir = dir.clone();
        compio::runtime::spawn(async move {
            match worker::offload(move || sorted_names(reader)).await {
                Ok(names) => {
                    tracing::debug!("listing {} entries of {dir}", names.len());
                    for name in names {
                        if emitter.emit(dir.child(&name)).await.is_err() {
                            tracing::trace!("listing of {dir} abandoned by its consumer");
                            break;
                        }
                    }
                }
                Err(e) => tracing::warn!("listing {dir} failed: {e}"),
            }
            emitter.close();
        })
        .detach();
        Ok(entries)
    }

    async fn mkdir(&self, file: &VfsFile) -> Result<bool> {
        let native = self.resolve(file.path());
        let context = format!("failed to create directory {}", native.display());
        absent_is_false(worker::offload_io(context, move || std::fs::create_dir(native)).await)
    }

    async fn delete(&self, file: &VfsFile) -> Result<bool> {
        let native = self.resolve(file.path());
        let context = format!("failed to delete {}", native.display());
        absent_is_false(
            worker::offload_io(context, move || {
                if std::fs::symlink_metadata(&native)?.is_dir() {
                    std::fs::remove_dir(&native)
                } else {
                    std::fs::remove_file(&native)
                }
            })
            .await,
        )
    }

    async fn rename(&self, src: &VfsFile, dst: &VfsFile) -> Result<bool> {
        ensure_same_vfs(src, dst)?;
        let from = self.resolve(src.path());
        let to = self.resolve(dst.path());
        let context = format!("failed to rename {} to {}", from.display(), to.display());
        absent_is_false(worker::offload_io(context, move || std::fs::rename(from, to)).await)
    }

    async fn set_size(&self, file: &VfsFile, size: u64) -> Result<()> {
        let native = self.resolve(file.path());
        let context = format!("failed to resize {}", native.display());
        worker::offload_io(context, move || {
            std::fs::OpenOptions::new()
                .write(true)
                .open(native)?
                .set_len(size)
        })
        .await
    }

    async fn exec(
        &self,
        file: &VfsFile,
        cmd_and_args: &[String],
        handler: &mut dyn VfsProcessHandler,
    ) -> Result<i32> {
        process::run(
            self.resolve(file.path()),
            cmd_and_args,
            handler,
            self.options.exec_poll_interval(),
        )
        .await
    }

    #[cfg(target_os = "linux")]
    async fn watch(&self, file: &VfsFile, handler: WatchHandler) -> Result<WatchSubscription> {
        let native = self.resolve(file.path());
        let context = format!("failed to watch {}", native.display());
        let watched = native.clone();
        let inotify = worker::offload_io(context, move || Inotify::watch(&watched)).await?;

        let (subscription, control) = WatchSubscription::channel();
        compio::runtime::spawn(watch_loop(
            inotify,
            control,
            file.clone(),
            handler,
            self.options.watch_poll_timeout(),
        ))
        .detach();
        tracing::debug!("watching {}", native.display());
        Ok(subscription)
    }

    #[cfg(not(target_os = "linux"))]
    async fn watch(&self, _file: &VfsFile, _handler: WatchHandler) -> Result<WatchSubscription> {
        Err(VfsError::unsupported("watch"))
    }
}

/// Map "nothing there" / "already there" outcomes to `false`
fn absent_is_false(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(VfsError::NotFound(_) | VfsError::AlreadyExists(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

fn sorted_names(reader: ReadDir) -> Vec<String> {
    let mut names: Vec<String> = reader
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.file_name().to_string_lossy().into_owned()),
            Err(e) => {
                tracing::warn!("skipping unreadable directory entry: {e}");
                None
            }
        })
        .collect();
    names.sort();
    names
}

fn epoch_ms(time: io::Result<SystemTime>) -> Option<i64> {
    let since_epoch = time.ok()?.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}

fn stat_from_metadata(file: VfsFile, metadata: &Metadata) -> VfsStat {
    let modified = epoch_ms(metadata.modified());
    let created = epoch_ms(metadata.created()).or(modified).unwrap_or(0);
    VfsStat::existing(file, metadata.is_dir(), metadata.len())
        .with_device_inode(
            i64::try_from(metadata.dev()).unwrap_or(-1),
            i64::try_from(metadata.ino()).unwrap_or(-1),
        )
        .with_mode(metadata.mode())
        .with_owner(metadata.uid().to_string(), metadata.gid().to_string())
        .with_times(created, modified, epoch_ms(metadata.accessed()))
}

#[cfg(target_os = "linux")]
async fn watch_loop(
    inotify: Inotify,
    control: WatchControl,
    dir: VfsFile,
    handler: WatchHandler,
    timeout: Duration,
) {
    let mut inotify = Some(inotify);
    while control.is_running() {
        let Some(mut current) = inotify.take() else {
            break;
        };
        let polled = worker::offload(move || {
            let events = current.poll(timeout);
            (current, events)
        })
        .await;
        let events = match polled {
            Ok((returned, events)) => {
                inotify = Some(returned);
                events
            }
            Err(e) => {
                tracing::warn!("watch on {dir} lost its poller: {e}");
                break;
            }
        };
        let events = match events {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!("watch on {dir} failed: {e}");
                break;
            }
        };
        if !control.is_running() {
            break;
        }
        for event in events {
            match event {
                RawEvent::Overflow => tracing::warn!("watch on {dir} overflowed; events were lost"),
                RawEvent::Change { kind, name } => {
                    let file = name.map_or_else(|| dir.clone(), |name| dir.child(&name));
                    handler(VfsFileEvent::new(kind, file));
                }
            }
        }
    }
    // Release the descriptor before signalling a waiting `cancel`.
    drop(inotify);
    tracing::debug!("watch on {dir} stopped");
    drop(control);
}

// ============================================================================
// STREAMS
// ============================================================================

struct LocalStream {
    file: Option<File>,
    append: bool,
    path: PathBuf,
}

fn open_handle<'a>(file: &'a mut Option<File>, path: &Path) -> Result<&'a mut File> {
    file.as_mut().ok_or_else(|| {
        VfsError::io(
            format!("{} is closed", path.display()),
            io::Error::other("stream closed"),
        )
    })
}

#[async_trait(?Send)]
impl VfsStreamBase for LocalStream {
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = open_handle(&mut self.file, &self.path)?;
        let BufResult(result, mut buf) = file.read_at(Vec::with_capacity(len), offset).await;
        let read = result
            .map_err(|e| VfsError::io(format!("failed to read {}", self.path.display()), e))?;
        buf.truncate(read);
        Ok(buf)
    }

    async fn write_at(&mut self, offset: u64, data: Vec<u8>) -> Result<usize> {
        let file = open_handle(&mut self.file, &self.path)?;
        let offset = if self.append {
            file.metadata()
                .await
                .map_err(|e| VfsError::io(format!("failed to stat {}", self.path.display()), e))?
                .len()
        } else {
            offset
        };
        let BufResult(result, _) = file.write_at(data, offset).await;
        result.map_err(|e| VfsError::io(format!("failed to write {}", self.path.display()), e))
    }

    async fn length(&mut self) -> Result<u64> {
        let file = open_handle(&mut self.file, &self.path)?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| VfsError::io(format!("failed to stat {}", self.path.display()), e))?;
        Ok(metadata.len())
    }

    async fn set_length(&mut self, len: u64) -> Result<()> {
        let fd = open_handle(&mut self.file, &self.path)?.as_raw_fd();
        let len = libc::off_t::try_from(len)
            .map_err(|_| VfsError::InvalidArgument(format!("length {len} is too large")))?;
        let context = format!("failed to resize {}", self.path.display());
        // `self.file` stays open across the await, keeping `fd` valid.
        worker::offload_io(context, move || {
            // SAFETY: `fd` refers to the file held open by this stream.
            if unsafe { libc::ftruncate(fd, len) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.close()
                .await
                .map_err(|e| VfsError::io(format!("failed to close {}", self.path.display()), e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::vfs::VfsExt;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_stays_under_root() {
        let vfs = LocalVfs::new("/srv/root");
        assert_eq!(vfs.resolve("/"), PathBuf::from("/srv/root"));
        assert_eq!(vfs.resolve("a/b"), PathBuf::from("/srv/root/a/b"));
        assert_eq!(vfs.resolve("/../../etc/passwd"), PathBuf::from("/srv/root/etc/passwd"));
    }

    #[test]
    fn test_options_defaults_and_clamping() {
        let options = LocalVfsOptions::default();
        assert_eq!(options.exec_poll_interval(), Duration::from_millis(1));
        assert_eq!(options.watch_poll_timeout(), Duration::from_millis(100));
        assert_eq!(options.list_buffer(), 16);
        assert_eq!(options.with_list_buffer(0).list_buffer(), 1);
    }

    #[compio::test]
    async fn test_stat_reports_metadata() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), b"12345").unwrap();
        let vfs = LocalVfs::new(dir.path());

        let stat = vfs.file("/f.txt").stat().await.unwrap();
        assert!(stat.exists());
        assert!(!stat.is_directory());
        assert_eq!(stat.size(), 5);
        assert!(stat.inode() > 0);
        assert!(stat.modified_time() > 0);
        assert_eq!(stat.file().path(), "/f.txt");

        let root = vfs.root().stat().await.unwrap();
        assert!(root.is_directory());

        let missing = vfs.file("/nope").stat().await.unwrap();
        assert!(!missing.exists());
        assert_eq!(missing.size(), 0);
    }

    #[compio::test]
    async fn test_set_size_truncates_and_extends() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"abcdef").unwrap();
        let file = LocalVfs::new(dir.path()).file("/f");

        file.set_size(3).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"abc");
        file.set_size(5).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"abc\0\0");
    }

    #[compio::test]
    async fn test_closed_stream_rejects_io() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let mut stream = LocalStream {
            file: Some(File::open(dir.path().join("f")).await.unwrap()),
            append: false,
            path: dir.path().join("f"),
        };
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(matches!(stream.read_at(0, 1).await, Err(VfsError::Io { .. })));
    }
}
