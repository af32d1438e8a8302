//! Byte streams handed out by file handles.
//!
//! Writers have an explicit async [`WriteStream::close`]: remote backends
//! finalize sessions there, and Rust has no async drop. Writers that own
//! remote state also finalize from `Drop` as a fallback, but callers should
//! always close.
//!
//! Random access comes in two strengths: [`RandomWrite`] can truncate,
//! [`GrowOnlyWrite`] can only extend. Backends advertise which one they offer
//! through distinct capabilities.

use std::io::SeekFrom;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::error::FsResult;

/// Default buffer for stream copies.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Sequential reader.
#[async_trait]
pub trait ReadStream: Send {
    /// Read up to `buf.len()` bytes. Returns 0 at end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize>;

    /// Read everything that is left.
    async fn read_to_end(&mut self) -> FsResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

/// Sequential writer.
#[async_trait]
pub trait WriteStream: Send {
    async fn write_all(&mut self, buf: &[u8]) -> FsResult<()>;

    /// Flush and release everything the writer holds. Idempotent.
    async fn close(&mut self) -> FsResult<()>;
}

/// Seekable reader.
#[async_trait]
pub trait RandomRead: ReadStream {
    async fn seek(&mut self, pos: u64) -> FsResult<()>;

    fn position(&self) -> u64;

    /// Total length of the underlying data.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Seekable writer that can extend a file but never shrink it.
#[async_trait]
pub trait GrowOnlyWrite: WriteStream {
    async fn seek(&mut self, pos: u64) -> FsResult<()>;

    fn position(&self) -> u64;
}

/// Seekable writer with truncation.
#[async_trait]
pub trait RandomWrite: GrowOnlyWrite {
    async fn set_len(&mut self, len: u64) -> FsResult<()>;
}

/// Copy `reader` into `writer` until end of stream. Does not close `writer`.
pub async fn copy_stream(
    reader: &mut (dyn ReadStream + '_),
    writer: &mut (dyn WriteStream + '_),
) -> FsResult<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

#[async_trait]
impl<T: ReadStream + ?Sized> ReadStream for Box<T> {
    async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        (**self).read(buf).await
    }
}

#[async_trait]
impl<T: WriteStream + ?Sized> WriteStream for Box<T> {
    async fn write_all(&mut self, buf: &[u8]) -> FsResult<()> {
        (**self).write_all(buf).await
    }

    async fn close(&mut self) -> FsResult<()> {
        (**self).close().await
    }
}

// ============================================================================
// Adapters
// ============================================================================

/// [`ReadStream`] over any tokio reader.
pub struct TokioReader<R> {
    inner: R,
}

impl<R> TokioReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ReadStream for TokioReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        Ok(self.inner.read(buf).await?)
    }
}

/// [`WriteStream`] over any tokio writer.
pub struct TokioWriter<W> {
    inner: W,
    closed: bool,
}

impl<W> TokioWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            closed: false,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> WriteStream for TokioWriter<W> {
    async fn write_all(&mut self, buf: &[u8]) -> FsResult<()> {
        Ok(self.inner.write_all(buf).await?)
    }

    async fn close(&mut self) -> FsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Seekable access to a local file, used by local-like backends.
pub struct FileStream {
    file: tokio::fs::File,
    pos: u64,
    len: u64,
    closed: bool,
}

impl FileStream {
    pub async fn new(file: tokio::fs::File) -> FsResult<Self> {
        let len = file.metadata().await?.len();
        Ok(Self {
            file,
            pos: 0,
            len,
            closed: false,
        })
    }
}

#[async_trait]
impl ReadStream for FileStream {
    async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let n = self.file.read(buf).await?;
        self.pos += n as u64;
        Ok(n)
    }
}

#[async_trait]
impl RandomRead for FileStream {
    async fn seek(&mut self, pos: u64) -> FsResult<()> {
        self.pos = self.file.seek(SeekFrom::Start(pos)).await?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn len(&self) -> u64 {
        self.len
    }
}

#[async_trait]
impl WriteStream for FileStream {
    async fn write_all(&mut self, buf: &[u8]) -> FsResult<()> {
        self.file.write_all(buf).await?;
        self.pos += buf.len() as u64;
        self.len = self.len.max(self.pos);
        Ok(())
    }

    async fn close(&mut self) -> FsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl GrowOnlyWrite for FileStream {
    async fn seek(&mut self, pos: u64) -> FsResult<()> {
        RandomRead::seek(self, pos).await
    }

    fn position(&self) -> u64 {
        self.pos
    }
}

#[async_trait]
impl RandomWrite for FileStream {
    async fn set_len(&mut self, len: u64) -> FsResult<()> {
        self.file.set_len(len).await?;
        self.len = len;
        Ok(())
    }
}

/// Seekable reader over bytes already in memory (archive entries).
pub struct MemoryReader {
    data: Bytes,
    pos: usize,
}

impl MemoryReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

#[async_trait]
impl ReadStream for MemoryReader {
    async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let remaining = &self.data[self.pos.min(self.data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[async_trait]
impl RandomRead for MemoryReader {
    async fn seek(&mut self, pos: u64) -> FsResult<()> {
        self.pos = usize::try_from(pos).unwrap_or(usize::MAX);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}
