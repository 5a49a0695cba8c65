//! Error types for the runtime and the virtual filesystem layer
//!
//! Every fallible operation in the library returns [`Result`]. Native failures
//! are wrapped with a human-readable context string; `NotFound` and
//! `AlreadyExists` are lifted out of `std::io::Error` so callers can match on
//! open-mode outcomes without inspecting error kinds.

use std::io;
use thiserror::Error;

/// Errors produced by the event loop, the completion bridge and Vfs backends
#[derive(Debug, Error)]
pub enum VfsError {
    /// The Vfs does not provide this capability
    #[error("unsupported operation: {operation}")]
    Unsupported {
        /// Name of the capability that was requested
        operation: &'static str,
    },

    /// The caller passed something the operation cannot accept
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Target path does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Target path already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A write was attempted through a read-only view
    #[error("read-only filesystem: {0}")]
    ReadOnly(String),

    /// Any other native I/O failure
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted
        context: String,
        /// The OS-level error
        #[source]
        source: io::Error,
    },

    /// Item emitted after the sequence was closed or its consumer went away
    #[error("async sequence is closed")]
    SequenceClosed,

    /// A completion was dropped before delivering a result
    #[error("completion was dropped before delivering a result")]
    Abandoned,

    /// Scheduler start-up or installation failure
    #[error("event loop error: {0}")]
    EventLoop(String),
}

impl VfsError {
    /// Shorthand for [`VfsError::Unsupported`]
    #[must_use]
    pub const fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }

    /// Wrap a native error, lifting `NotFound` and `AlreadyExists` into their own variants
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        let context = context.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound(context),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(context),
            _ => Self::Io { context, source },
        }
    }

    /// Check whether this error only signals a missing capability
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, VfsError>;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn test_io_kind_mapping() {
        let err = VfsError::io("open /a", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, VfsError::NotFound(ref ctx) if ctx == "open /a"));

        let err = VfsError::io("open /b", io::Error::from(io::ErrorKind::AlreadyExists));
        assert!(matches!(err, VfsError::AlreadyExists(_)));

        let err = VfsError::io("read /c", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, VfsError::Io { .. }));
        assert!(err.to_string().starts_with("read /c: "));
    }

    #[test]
    fn test_unsupported_display() {
        let err = VfsError::unsupported("mkdir");
        assert!(err.is_unsupported());
        assert_eq!(err.to_string(), "unsupported operation: mkdir");
    }
}
