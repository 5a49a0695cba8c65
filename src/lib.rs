//! avfs: an asynchronous I/O runtime with a composable virtual filesystem
//!
//! The crate is organized leaves first:
//!
//! - [`timer`] and [`event_loop`]: pluggable schedulers (a compio-backed loop
//!   for production, a virtual clock for tests) behind the [`Scheduler`]
//!   handle.
//! - [`completion`] and [`worker`]: turning one-shot callbacks and blocking
//!   calls into awaitable results.
//! - [`sequence`]: backpressured single-consumer streams.
//! - [`vfs`]: the filesystem capability trait, file handles and proxies.
//! - [`backends`]: the local-disk reference backend.
//!
//! # Examples
//!
//! ```rust,ignore
//! use avfs::{backends::LocalVfs, event_loop, vfs::VfsExt};
//!
//! let scheduler = event_loop::global()?;
//! let root = LocalVfs::new("/srv/data").root();
//! scheduler.run(move || async move {
//!     let text = root.child("motd").read_all().await?;
//!     println!("{}", String::from_utf8_lossy(&text));
//!     Ok::<_, avfs::VfsError>(())
//! });
//! ```

pub mod backends;
pub mod cli;
pub mod completion;
pub mod error;
pub mod event_loop;
pub mod sequence;
pub mod timer;
pub mod vfs;
pub mod worker;

pub use error::{Result, VfsError};
pub use event_loop::{EventLoop, Scheduler};
pub use timer::TimerHandle;
pub use vfs::{Vfs, VfsExt, VfsFile};
