//! Random-access byte streams returned by [`Vfs::open`](super::Vfs::open)
//!
//! Backends implement the positional [`VfsStreamBase`]; callers use
//! [`AsyncStream`], which adds a cursor on top so sequential reads and
//! writes look like ordinary stream I/O.

use crate::error::{Result, VfsError};
use async_trait::async_trait;
use std::io;

/// Positional I/O over an open backend resource
#[async_trait(?Send)]
pub trait VfsStreamBase {
    /// Read up to `len` bytes at `offset`; an empty result means end of file
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning how many bytes were taken
    async fn write_at(&mut self, _offset: u64, _data: Vec<u8>) -> Result<usize> {
        Err(VfsError::unsupported("write"))
    }

    /// Current length in bytes
    async fn length(&mut self) -> Result<u64>;

    /// Truncate or extend to `len` bytes
    async fn set_length(&mut self, _len: u64) -> Result<()> {
        Err(VfsError::unsupported("set_length"))
    }

    /// Release the underlying resource; further calls may fail
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Cursor over a [`VfsStreamBase`], starting at position 0
pub struct AsyncStream {
    base: Box<dyn VfsStreamBase>,
    position: u64,
}

impl AsyncStream {
    #[must_use]
    pub fn new(base: Box<dyn VfsStreamBase>) -> Self {
        Self { base, position: 0 }
    }

    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Move the cursor; positions past the end are allowed
    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    /// Read up to `len` bytes at the cursor and advance past them
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub async fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let data = self.base.read_at(self.position, len).await?;
        self.position += data.len() as u64;
        tracing::trace!("stream read {} bytes, now at {}", data.len(), self.position);
        Ok(data)
    }

    /// Read `len` bytes, or fewer only when end of file is reached first
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let chunk = self.read(len - out.len()).await?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Read everything from the cursor to the current end of file
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let remaining = self.length().await?.saturating_sub(self.position);
        let len = usize::try_from(remaining)
            .map_err(|_| VfsError::InvalidArgument(format!("{remaining} bytes do not fit in memory")))?;
        self.read_bytes(len).await
    }

    /// Write all of `data` at the cursor and advance past it
    ///
    /// # Errors
    ///
    /// Propagates backend write failures; a backend that accepts zero bytes
    /// is reported as [`io::ErrorKind::WriteZero`].
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let n = self
                .base
                .write_at(self.position, data[written..].to_vec())
                .await?;
            if n == 0 {
                return Err(VfsError::io(
                    "stream write",
                    io::Error::from(io::ErrorKind::WriteZero),
                ));
            }
            written += n;
            self.position += n as u64;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn length(&mut self) -> Result<u64> {
        self.base.length().await
    }

    /// Truncate or extend the stream; the cursor is left where it was
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn set_length(&mut self, len: u64) -> Result<()> {
        self.base.set_length(len).await
    }

    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn close(mut self) -> Result<()> {
        self.base.close().await
    }
}

impl std::fmt::Debug for AsyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncStream")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use futures::executor::block_on;

    /// Hands out at most `max_io` bytes per call to exercise the cursor loops
    struct Chunky {
        data: Vec<u8>,
        max_io: usize,
    }

    #[async_trait(?Send)]
    impl VfsStreamBase for Chunky {
        async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
            let start = (offset as usize).min(self.data.len());
            let end = (start + len.min(self.max_io)).min(self.data.len());
            Ok(self.data[start..end].to_vec())
        }

        async fn write_at(&mut self, offset: u64, data: Vec<u8>) -> Result<usize> {
            let n = data.len().min(self.max_io);
            let offset = offset as usize;
            if self.data.len() < offset + n {
                self.data.resize(offset + n, 0);
            }
            self.data[offset..offset + n].copy_from_slice(&data[..n]);
            Ok(n)
        }

        async fn length(&mut self) -> Result<u64> {
            Ok(self.data.len() as u64)
        }
    }

    struct ReadOnlyBytes(Vec<u8>);

    #[async_trait(?Send)]
    impl VfsStreamBase for ReadOnlyBytes {
        async fn read_at(&mut self, _offset: u64, _len: usize) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }

        async fn length(&mut self) -> Result<u64> {
            Ok(self.0.len() as u64)
        }
    }

    #[test]
    fn test_read_bytes_loops_over_short_reads() {
        let mut stream = AsyncStream::new(Box::new(Chunky {
            data: b"hello world".to_vec(),
            max_io: 3,
        }));
        block_on(async {
            assert_eq!(stream.read_bytes(5).await.unwrap(), b"hello");
            assert_eq!(stream.position(), 5);
            assert_eq!(stream.read_to_end().await.unwrap(), b" world");
            assert!(stream.read(4).await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_write_all_advances_cursor() {
        let mut stream = AsyncStream::new(Box::new(Chunky {
            data: Vec::new(),
            max_io: 2,
        }));
        block_on(async {
            stream.set_position(2);
            stream.write_all(b"abcde").await.unwrap();
            assert_eq!(stream.position(), 7);
            assert_eq!(stream.length().await.unwrap(), 7);
            stream.set_position(0);
            assert_eq!(stream.read_bytes(7).await.unwrap(), b"\0\0abcde");
        });
    }

    #[test]
    fn test_default_write_is_unsupported() {
        let mut stream = AsyncStream::new(Box::new(ReadOnlyBytes(b"x".to_vec())));
        block_on(async {
            let err = stream.write_all(b"y").await.unwrap_err();
            assert!(err.is_unsupported());
            assert!(stream.set_length(0).await.unwrap_err().is_unsupported());
            stream.close().await.unwrap();
        });
    }
}
