//! Virtual filesystem capability layer
//!
//! A [`Vfs`] exposes a path-addressed namespace of byte-stream resources. Every
//! capability is optional: the defaults report [`VfsError::Unsupported`]
//! (or an empty/inert answer for `stat`, `list` and `watch`), so a backend
//! implements only what it can actually do.
//!
//! Callers rarely talk to a `Vfs` directly. They hold [`VfsFile`] handles,
//! which pair a shared `Arc<dyn Vfs>` with a normalized path and carry the
//! derived operations (chunked reads/writes, copy, move) built purely on top
//! of the capabilities.
//!
//! # Examples
//!
//! ```rust,ignore
//! let root = LocalVfs::new("/srv/data").root();
//! let file = root.child("notes.txt");
//! file.write_chunk(b"hello", 0, true).await?;
//! assert_eq!(file.stat().await?.size(), 5);
//! ```

pub mod path;
pub mod proxy;
pub mod stream;
pub mod types;

pub use proxy::{ProxyBuilder, ProxyVfs};
pub use stream::{AsyncStream, VfsStreamBase};
pub use types::{
    ProcessOutput, VfsFileEvent, VfsFileEventKind, VfsOpenMode, VfsProcessHandler, VfsStat,
    WatchControl, WatchHandler, WatchSubscription,
};

use crate::error::{Result, VfsError};
use crate::sequence::AsyncSequence;
use async_trait::async_trait;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Buffer size used when copying between files
const COPY_CHUNK: usize = 64 * 1024;

/// Capability interface over a hierarchical path namespace
///
/// Operations receive the [`VfsFile`] they act on; its path is the operation
/// path and its `vfs` is the handle the caller used, which lets an
/// implementation mint sibling handles (e.g. listed children) in the caller's
/// namespace.
#[async_trait(?Send)]
pub trait Vfs: Send + Sync + 'static {
    /// Name used in logs and `Debug` output
    fn name(&self) -> &str {
        "vfs"
    }

    /// Open a random-access stream positioned at 0
    async fn open(&self, _file: &VfsFile, _mode: VfsOpenMode) -> Result<AsyncStream> {
        Err(VfsError::unsupported("open"))
    }

    /// Metadata snapshot; a path this Vfs knows nothing about does not exist
    async fn stat(&self, file: &VfsFile) -> Result<VfsStat> {
        Ok(VfsStat::missing(file.clone()))
    }

    /// Children of a directory
    async fn list(&self, _file: &VfsFile) -> Result<AsyncSequence<VfsFile>> {
        Ok(AsyncSequence::empty())
    }

    /// Create a directory; `false` if it could not be created
    async fn mkdir(&self, _file: &VfsFile) -> Result<bool> {
        Err(VfsError::unsupported("mkdir"))
    }

    /// Remove a file or empty directory; `false` if there was nothing to remove
    async fn delete(&self, _file: &VfsFile) -> Result<bool> {
        Err(VfsError::unsupported("delete"))
    }

    /// Rename within this Vfs
    ///
    /// Callers go through [`VfsFile::rename_to`], which rejects handles from
    /// different instances before reaching here.
    async fn rename(&self, _src: &VfsFile, _dst: &VfsFile) -> Result<bool> {
        Err(VfsError::unsupported("rename"))
    }

    /// Truncate or extend a file
    async fn set_size(&self, file: &VfsFile, size: u64) -> Result<()> {
        let mut stream = self.open(file, VfsOpenMode::Write).await?;
        stream.set_length(size).await?;
        stream.close().await
    }

    /// Run `cmd_and_args` with `file` as working directory, streaming output
    /// to `handler`, and return the exit code
    async fn exec(
        &self,
        _file: &VfsFile,
        _cmd_and_args: &[String],
        _handler: &mut dyn VfsProcessHandler,
    ) -> Result<i32> {
        Err(VfsError::unsupported("exec"))
    }

    /// Subscribe to changes under `file`
    async fn watch(&self, _file: &VfsFile, _handler: WatchHandler) -> Result<WatchSubscription> {
        Ok(WatchSubscription::inert())
    }
}

/// Access to handles rooted at a shared Vfs
pub trait VfsExt {
    /// Handle for `/`
    fn root(&self) -> VfsFile {
        self.file("/")
    }

    /// Handle for `path` (normalized)
    fn file(&self, path: &str) -> VfsFile;
}

impl<T: Vfs> VfsExt for Arc<T> {
    fn file(&self, path: &str) -> VfsFile {
        let vfs: Arc<dyn Vfs> = self.clone();
        VfsFile::new(vfs, path)
    }
}

impl VfsExt for Arc<dyn Vfs> {
    fn file(&self, path: &str) -> VfsFile {
        VfsFile::new(Arc::clone(self), path)
    }
}

/// Reject a two-file operation whose handles belong to different instances
///
/// # Errors
///
/// Returns [`VfsError::InvalidArgument`] when `src` and `dst` do not share a Vfs.
pub fn ensure_same_vfs(src: &VfsFile, dst: &VfsFile) -> Result<()> {
    if src.same_vfs(dst) {
        Ok(())
    } else {
        Err(VfsError::InvalidArgument(format!(
            "cannot rename {src} to {dst} across different filesystems"
        )))
    }
}

/// Immutable (filesystem, path) handle
///
/// Owns no resources. Two handles are equal when they share the same Vfs
/// instance and path.
#[derive(Clone)]
pub struct VfsFile {
    vfs: Arc<dyn Vfs>,
    path: String,
}

impl VfsFile {
    #[must_use]
    pub fn new(vfs: Arc<dyn Vfs>, path: &str) -> Self {
        Self {
            vfs,
            path: path::normalize(path),
        }
    }

    #[must_use]
    pub const fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.vfs
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Another path on the same Vfs
    #[must_use]
    pub fn with_path(&self, path: &str) -> Self {
        Self::new(Arc::clone(&self.vfs), path)
    }

    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        self.with_path(&path::combine(&self.path, name))
    }

    #[must_use]
    pub fn parent(&self) -> Self {
        self.with_path(&path::parent(&self.path))
    }

    #[must_use]
    pub fn basename(&self) -> String {
        path::basename(&self.path)
    }

    /// Whether both handles address the same Vfs instance
    #[must_use]
    pub fn same_vfs(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.vfs), Arc::as_ptr(&other.vfs))
    }

    // ------------------------------------------------------------------
    // Capabilities
    // ------------------------------------------------------------------

    /// # Errors
    ///
    /// Fails with the backend's error, e.g. `NotFound` for `Read` on a missing
    /// file or `AlreadyExists` for `CreateNew` on an existing one.
    pub async fn open(&self, mode: VfsOpenMode) -> Result<AsyncStream> {
        self.vfs.open(self, mode).await
    }

    /// # Errors
    ///
    /// Propagates backend failures; a missing path is not an error.
    pub async fn stat(&self) -> Result<VfsStat> {
        self.vfs.stat(self).await
    }

    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn list(&self) -> Result<AsyncSequence<Self>> {
        self.vfs.list(self).await
    }

    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn mkdir(&self) -> Result<bool> {
        self.vfs.mkdir(self).await
    }

    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn delete(&self) -> Result<bool> {
        self.vfs.delete(self).await
    }

    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn set_size(&self, size: u64) -> Result<()> {
        self.vfs.set_size(self, size).await
    }

    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn exec(
        &self,
        cmd_and_args: &[String],
        handler: &mut dyn VfsProcessHandler,
    ) -> Result<i32> {
        self.vfs.exec(self, cmd_and_args, handler).await
    }

    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn watch(&self, handler: WatchHandler) -> Result<WatchSubscription> {
        self.vfs.watch(self, handler).await
    }

    /// Rename this file to `dst`, which must live on the same Vfs instance
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::InvalidArgument`] for handles on different
    /// instances, without touching either file. Use [`move_to`](Self::move_to)
    /// to move across filesystems.
    pub async fn rename_to(&self, dst: &Self) -> Result<bool> {
        ensure_same_vfs(self, dst)?;
        self.vfs.rename(self, dst).await
    }

    // ------------------------------------------------------------------
    // Derived operations
    // ------------------------------------------------------------------

    /// Read up to `size` bytes starting at `offset`
    ///
    /// # Errors
    ///
    /// Propagates open and read failures.
    pub async fn read_chunk(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let mut stream = self.open(VfsOpenMode::Read).await?;
        stream.set_position(offset);
        let data = stream.read_bytes(size).await?;
        stream.close().await?;
        Ok(data)
    }

    /// Write `data` at `offset`, creating the file if needed
    ///
    /// With `resize` the file is cut to end exactly where the write ended.
    ///
    /// # Errors
    ///
    /// Propagates open, write and truncate failures.
    pub async fn write_chunk(&self, data: &[u8], offset: u64, resize: bool) -> Result<()> {
        let mut stream = self.open(VfsOpenMode::Create).await?;
        stream.set_position(offset);
        stream.write_all(data).await?;
        if resize {
            stream.set_length(stream.position()).await?;
        }
        stream.close().await
    }

    /// Whole content of the file
    ///
    /// # Errors
    ///
    /// Propagates open and read failures.
    pub async fn read_all(&self) -> Result<Vec<u8>> {
        let mut stream = self.open(VfsOpenMode::Read).await?;
        let data = stream.read_to_end().await?;
        stream.close().await?;
        Ok(data)
    }

    /// Replace the content of the file with `data`
    ///
    /// # Errors
    ///
    /// Propagates open and write failures.
    pub async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        let mut stream = self.open(VfsOpenMode::CreateOrTruncate).await?;
        stream.write_all(data).await?;
        stream.close().await
    }

    /// # Errors
    ///
    /// Propagates stat failures.
    pub async fn exists(&self) -> Result<bool> {
        Ok(self.stat().await?.exists())
    }

    /// # Errors
    ///
    /// Propagates stat failures.
    pub async fn is_dir(&self) -> Result<bool> {
        Ok(self.stat().await?.is_directory())
    }

    /// Size in bytes, 0 for a missing file
    ///
    /// # Errors
    ///
    /// Propagates stat failures.
    pub async fn size(&self) -> Result<u64> {
        Ok(self.stat().await?.size())
    }

    /// Copy this file's content into `dst`, which may live on any Vfs
    ///
    /// # Errors
    ///
    /// Propagates open, read and write failures on either side.
    pub async fn copy_to(&self, dst: &Self) -> Result<()> {
        let mut src_stream = self.open(VfsOpenMode::Read).await?;
        let mut dst_stream = dst.open(VfsOpenMode::CreateOrTruncate).await?;
        let mut copied = 0u64;
        loop {
            let chunk = src_stream.read(COPY_CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            dst_stream.write_all(&chunk).await?;
            copied += chunk.len() as u64;
        }
        src_stream.close().await?;
        dst_stream.close().await?;
        tracing::debug!("copied {copied} bytes from {self} to {dst}");
        Ok(())
    }

    /// Move this file to `dst`: a rename on the same instance, otherwise
    /// copy then delete
    ///
    /// A proxy whose two paths land on different backends rejects the rename
    /// with [`VfsError::InvalidArgument`]; that case also falls back to copy
    /// then delete.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::NotFound`] if a same-instance rename found nothing
    /// to move; otherwise propagates the underlying failures. A failed copy
    /// leaves the source in place.
    pub async fn move_to(&self, dst: &Self) -> Result<()> {
        if self.same_vfs(dst) {
            match self.rename_to(dst).await {
                Ok(true) => return Ok(()),
                Ok(false) => return Err(VfsError::NotFound(self.path.clone())),
                Err(VfsError::InvalidArgument(reason)) => {
                    tracing::debug!("rename {self} -> {dst} rejected ({reason}), copying instead");
                }
                Err(e) => return Err(e),
            }
        }
        self.copy_to(dst).await?;
        self.delete().await?;
        Ok(())
    }
}

impl PartialEq for VfsFile {
    fn eq(&self, other: &Self) -> bool {
        self.same_vfs(other) && self.path == other.path
    }
}

impl Eq for VfsFile {}

impl Hash for VfsFile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.vfs).cast::<()>().hash(state);
        self.path.hash(state);
    }
}

impl std::fmt::Debug for VfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsFile")
            .field("vfs", &self.vfs.name())
            .field("path", &self.path)
            .finish()
    }
}

impl std::fmt::Display for VfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.vfs.name(), self.path)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use futures::executor::block_on;
    use std::collections::HashSet;

    /// A Vfs that implements nothing
    struct Bare;

    impl Vfs for Bare {}

    #[test]
    fn test_defaults() {
        let root = Arc::new(Bare).root();
        block_on(async {
            let stat = root.child("missing").stat().await.unwrap();
            assert!(!stat.exists());
            assert_eq!(stat.size(), 0);
            assert_eq!(stat.device(), -1);
            assert_eq!(stat.owner(), "nobody");
            assert!(root.list().await.unwrap().to_vec().await.is_empty());
            assert!(root.mkdir().await.unwrap_err().is_unsupported());
            assert!(root.open(VfsOpenMode::Read).await.unwrap_err().is_unsupported());
            assert!(root
                .exec(&["true".to_string()], &mut ())
                .await
                .unwrap_err()
                .is_unsupported());
            let subscription = root.watch(Arc::new(|_| {})).await.unwrap();
            assert!(!subscription.is_active());
        });
    }

    #[test]
    fn test_handles_normalize_and_navigate() {
        let vfs = Arc::new(Bare);
        let file = vfs.file("a/./b/../c.txt");
        assert_eq!(file.path(), "/a/c.txt");
        assert_eq!(file.basename(), "c.txt");
        assert_eq!(file.parent().path(), "/a");
        assert_eq!(file.parent().child("d").path(), "/a/d");
        assert_eq!(vfs.root().parent().path(), "/");
    }

    #[test]
    fn test_equality_is_instance_and_path() {
        let one = Arc::new(Bare);
        let two = Arc::new(Bare);
        assert_eq!(one.file("/x"), one.file("x"));
        assert_ne!(one.file("/x"), two.file("/x"));
        assert_ne!(one.file("/x"), one.file("/y"));

        let set: HashSet<VfsFile> = [one.file("/x"), one.file("/x"), two.file("/x")]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_rename_across_instances_is_invalid() {
        let one = Arc::new(Bare);
        let two = Arc::new(Bare);
        let result = block_on(one.file("/a").rename_to(&two.file("/b")));
        assert!(matches!(result, Err(VfsError::InvalidArgument(_))));

        // Same instance reaches the backend, which does not support it.
        let result = block_on(one.file("/a").rename_to(&one.file("/b")));
        assert!(result.unwrap_err().is_unsupported());
    }
}
