//! Delegating filesystems built by composition
//!
//! A [`ProxyVfs`] owns two functions: `access`, which maps a path in the
//! proxy's namespace to a [`VfsFile`] on some underlying Vfs, and `transform`,
//! which maps files coming back from the underlying Vfs into the proxy's
//! namespace. Mounts, chroots, renaming layers and read-only views are all
//! just different pairs of these functions; see [`decorator`], [`jail`] and
//! [`read_only`].
//!
//! An optional initializer runs once, lazily, before the first delegated call.

use super::{
    ensure_same_vfs, path, AsyncStream, Vfs, VfsExt, VfsFile, VfsFileEvent, VfsOpenMode,
    VfsProcessHandler, VfsStat, WatchHandler, WatchSubscription,
};
use crate::error::{Result, VfsError};
use crate::sequence::AsyncSequence;
use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use futures::lock::Mutex;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maps a proxy path to the file that actually serves it
pub type AccessFn = Arc<dyn Fn(&str) -> VfsFile + Send + Sync>;

/// Maps an underlying file back into the proxy namespace
///
/// The first argument is a handle on the proxy (the file the caller passed
/// in), so the result can be minted on the proxy instance.
pub type TransformFn = Arc<dyn Fn(&VfsFile, VfsFile) -> VfsFile + Send + Sync>;

/// One-time backend initializer
pub type InitFn = Arc<dyn Fn() -> LocalBoxFuture<'static, Result<()>> + Send + Sync>;

/// Builder for [`ProxyVfs`]
pub struct ProxyBuilder {
    name: String,
    access: AccessFn,
    transform: Option<TransformFn>,
    init: Option<InitFn>,
    read_only: bool,
}

impl ProxyBuilder {
    pub fn new(access: impl Fn(&str) -> VfsFile + Send + Sync + 'static) -> Self {
        Self {
            name: "proxy".to_string(),
            access: Arc::new(access),
            transform: None,
            init: None,
            read_only: false,
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the default transform, which keeps the underlying path
    #[must_use]
    pub fn transform(
        mut self,
        transform: impl Fn(&VfsFile, VfsFile) -> VfsFile + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Run `init` once before the first delegated call
    ///
    /// A failing init is reported to the caller that triggered it and retried
    /// by the next call.
    #[must_use]
    pub fn on_init<F, Fut>(mut self, init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.init = Some(Arc::new(move || init().boxed_local()));
        self
    }

    /// Reject every operation that would modify the underlying filesystem
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<ProxyVfs> {
        Arc::new(ProxyVfs {
            name: self.name,
            access: self.access,
            transform: self
                .transform
                .unwrap_or_else(|| Arc::new(|ctx: &VfsFile, out: VfsFile| ctx.with_path(out.path()))),
            initialized: AtomicBool::new(self.init.is_none()),
            init: self.init,
            init_lock: Mutex::new(()),
            read_only: self.read_only,
        })
    }
}

/// A Vfs that forwards every call to files chosen by its access function
pub struct ProxyVfs {
    name: String,
    access: AccessFn,
    transform: TransformFn,
    init: Option<InitFn>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    read_only: bool,
}

impl ProxyVfs {
    async fn ensure_init(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(init) = &self.init {
            tracing::debug!("initializing {}", self.name);
            init().await?;
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn access(&self, file: &VfsFile) -> Result<VfsFile> {
        self.ensure_init().await?;
        Ok((self.access)(file.path()))
    }

    fn check_writable(&self, operation: &str, file: &VfsFile) -> Result<()> {
        if self.read_only {
            return Err(VfsError::ReadOnly(format!("{operation} {}", file.path())));
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Vfs for ProxyVfs {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, file: &VfsFile, mode: VfsOpenMode) -> Result<AsyncStream> {
        if mode.is_write() {
            self.check_writable("open for writing", file)?;
        }
        self.access(file).await?.open(mode).await
    }

    async fn stat(&self, file: &VfsFile) -> Result<VfsStat> {
        let stat = self.access(file).await?.stat().await?;
        Ok(stat.with_file(file.clone()))
    }

    async fn list(&self, file: &VfsFile) -> Result<AsyncSequence<VfsFile>> {
        let entries = self.access(file).await?.list().await?;
        let ctx = file.clone();
        let transform = Arc::clone(&self.transform);
        Ok(entries.map(move |entry| transform(&ctx, entry)))
    }

    async fn mkdir(&self, file: &VfsFile) -> Result<bool> {
        self.check_writable("mkdir", file)?;
        self.access(file).await?.mkdir().await
    }

    async fn delete(&self, file: &VfsFile) -> Result<bool> {
        self.check_writable("delete", file)?;
        self.access(file).await?.delete().await
    }

    async fn rename(&self, src: &VfsFile, dst: &VfsFile) -> Result<bool> {
        self.check_writable("rename", src)?;
        let src = self.access(src).await?;
        let dst = self.access(dst).await?;
        ensure_same_vfs(&src, &dst)?;
        src.rename_to(&dst).await
    }

    async fn set_size(&self, file: &VfsFile, size: u64) -> Result<()> {
        self.check_writable("set_size", file)?;
        self.access(file).await?.set_size(size).await
    }

    async fn exec(
        &self,
        file: &VfsFile,
        cmd_and_args: &[String],
        handler: &mut dyn VfsProcessHandler,
    ) -> Result<i32> {
        self.access(file).await?.exec(cmd_and_args, handler).await
    }

    async fn watch(&self, file: &VfsFile, handler: WatchHandler) -> Result<WatchSubscription> {
        let target = self.access(file).await?;
        let ctx = file.clone();
        let transform = Arc::clone(&self.transform);
        target
            .watch(Arc::new(move |event: VfsFileEvent| {
                // Runs on whatever thread the source reports from.
                handler(VfsFileEvent {
                    kind: event.kind,
                    file: transform(&ctx, event.file),
                    other: event.other.map(|other| transform(&ctx, other)),
                });
            }))
            .await
    }
}

impl std::fmt::Debug for ProxyVfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyVfs")
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Same paths, served by `parent`
#[must_use]
pub fn decorator(parent: Arc<dyn Vfs>) -> Arc<ProxyVfs> {
    let name = format!("decorator({})", parent.name());
    ProxyBuilder::new(move |path| parent.file(path))
        .name(name)
        .build()
}

/// Chroot under `base`: `/a` resolves to `base/a`, and results are reported
/// with the `base` prefix removed
#[must_use]
pub fn jail(base: VfsFile) -> Arc<ProxyVfs> {
    let name = format!("jail({base})");
    let base_path = base.path().to_string();
    ProxyBuilder::new(move |inner| {
        base.with_path(&path::combine(base.path(), &path::normalize(inner)))
    })
    .name(name)
    .transform(move |ctx, out| {
        let inner = path::strip_base(out.path(), &base_path).unwrap_or_else(|| "/".to_string());
        ctx.with_path(&inner)
    })
    .build()
}

/// Read access to `parent`; every write fails with [`VfsError::ReadOnly`]
#[must_use]
pub fn read_only(parent: Arc<dyn Vfs>) -> Arc<ProxyVfs> {
    let name = format!("read_only({})", parent.name());
    ProxyBuilder::new(move |path| parent.file(path))
        .name(name)
        .read_only()
        .build()
}
