//! Filesystem backend implementations
//!
//! This module provides concrete implementations of the [`Vfs`](crate::vfs::Vfs)
//! trait. Only the local-disk backend ships with the crate; other backends
//! plug in through the same trait or are layered on top with
//! [`ProxyVfs`](crate::vfs::ProxyVfs).

#[cfg(target_os = "linux")]
pub mod inotify;
pub mod local;
pub mod process;

// Re-export main types for convenience
pub use local::{LocalVfs, LocalVfsOptions};
