//! Chunked disk transfer streams.
//!
//! A transfer owns the realm's connection guard from negotiation until it is
//! finalized, so no other caller can interleave with a half-finished upload
//! or download. Finalize runs exactly once: on EOF or `close()`, on the first
//! failed chunk, or from `Drop` as a last resort.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::OvirtConnection;
use super::api::TransferDirection;
use crate::error::{FsError, FsResult};
use crate::pool::{ConnectionGuard, RetryPolicy};
use crate::stream::{ReadStream, WriteStream};

/// A negotiated image transfer holding the connection lock.
pub struct TransferSession {
    guard: Option<ConnectionGuard<OvirtConnection>>,
    id: String,
    url: String,
    finished: bool,
}

impl TransferSession {
    /// Start a transfer and wait, bounded by `policy`, for its data URL.
    ///
    /// A transfer that never becomes ready is finalized before the error is
    /// returned.
    pub async fn open(
        mut guard: ConnectionGuard<OvirtConnection>,
        disk_id: &str,
        direction: TransferDirection,
        policy: &RetryPolicy,
    ) -> FsResult<Self> {
        let conn = guard.check_connection().await?;
        let started = conn
            .api
            .start_transfer(&conn.session, disk_id, direction)
            .await?;
        debug!(transfer = %started.id, disk = disk_id, %direction, "transfer started");

        let mut transfer = Self {
            guard: Some(guard),
            id: started.id,
            url: String::new(),
            finished: false,
        };
        match transfer.wait_ready(policy).await {
            Ok(url) => {
                transfer.url = url;
                Ok(transfer)
            }
            Err(e) => {
                let _ = transfer.finish().await;
                Err(e)
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn connection(&mut self) -> FsResult<&mut OvirtConnection> {
        match self.guard.as_mut() {
            Some(guard) => guard.session(),
            None => Err(FsError::backend(format!(
                "transfer {} already finalized",
                self.id
            ))),
        }
    }

    async fn wait_ready(&mut self, policy: &RetryPolicy) -> FsResult<String> {
        let id = self.id.clone();
        let conn: &OvirtConnection = self.connection()?;
        let (api, session, id) = (&conn.api, &conn.session, id.as_str());
        policy
            .poll_until(&format!("transfer {id} to leave initializing"), || async move {
                let transfer = api.transfer(session, id).await?;
                if transfer.phase.is_pending() {
                    return Ok(None);
                }
                if transfer.phase != super::api::TransferPhase::Transferring {
                    return Err(FsError::backend(format!(
                        "transfer {id} entered phase {}",
                        transfer.phase
                    )));
                }
                transfer
                    .data_url()
                    .map(|url| Some(url.to_string()))
                    .ok_or_else(|| FsError::backend(format!("transfer {id} has no data URL")))
            })
            .await
    }

    async fn read_range(&mut self, offset: u64, len: u64) -> FsResult<Bytes> {
        let url = self.url.clone();
        let conn = self.connection()?;
        conn.api.read_range(&conn.session, &url, offset, len).await
    }

    async fn write_range(&mut self, offset: u64, data: Bytes) -> FsResult<()> {
        let url = self.url.clone();
        let conn = self.connection()?;
        conn.api.write_range(&conn.session, &url, offset, data).await
    }

    /// Finalize the transfer and release the connection lock. Later calls
    /// are no-ops. Failures are logged and returned.
    pub async fn finish(&mut self) -> FsResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let Some(mut guard) = self.guard.take() else {
            return Ok(());
        };
        let result = match guard.session() {
            Ok(conn) => conn.api.finalize_transfer(&conn.session, &self.id).await,
            Err(e) => Err(e),
        };
        drop(guard);
        match &result {
            Ok(()) => info!(transfer = %self.id, "transfer finalized"),
            Err(e) => warn!(transfer = %self.id, error = %e, "finalizing transfer failed"),
        }
        result
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let Some(mut guard) = self.guard.take() else {
            return;
        };
        let id = std::mem::take(&mut self.id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(transfer = %id, "transfer dropped outside a runtime, left open");
            return;
        };
        warn!(transfer = %id, "transfer dropped without close, finalizing");
        runtime.spawn(async move {
            if let Ok(conn) = guard.session() {
                if let Err(e) = conn.api.finalize_transfer(&conn.session, &id).await {
                    warn!(transfer = %id, error = %e, "finalizing dropped transfer failed");
                }
            }
        });
    }
}

/// Sequential download of a disk image.
pub struct DiskReader {
    transfer: TransferSession,
    size: u64,
    pos: u64,
    chunk_size: u64,
    buffer: Bytes,
}

impl DiskReader {
    pub fn new(transfer: TransferSession, size: u64, chunk_size: usize) -> Self {
        Self {
            transfer,
            size,
            pos: 0,
            chunk_size: chunk_size.max(1) as u64,
            buffer: Bytes::new(),
        }
    }

    async fn fill(&mut self) -> FsResult<()> {
        let len = self.chunk_size.min(self.size - self.pos);
        let chunk = self.transfer.read_range(self.pos, len).await?;
        if chunk.is_empty() {
            return Err(FsError::backend(format!(
                "transfer {} returned no data at {}",
                self.transfer.id(),
                self.pos
            )));
        }
        self.pos += chunk.len() as u64;
        self.buffer = chunk;
        Ok(())
    }
}

#[async_trait]
impl ReadStream for DiskReader {
    async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.buffer.is_empty() {
            if self.pos >= self.size {
                self.transfer.finish().await?;
                return Ok(0);
            }
            if let Err(e) = self.fill().await {
                let _ = self.transfer.finish().await;
                return Err(e);
            }
        }
        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.advance(n);
        Ok(n)
    }
}

/// Chunked upload of a disk image.
pub struct DiskWriter {
    transfer: TransferSession,
    offset: u64,
    chunk_size: usize,
    pending: BytesMut,
    failure: Option<String>,
}

impl DiskWriter {
    pub fn new(transfer: TransferSession, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            transfer,
            offset: 0,
            chunk_size,
            pending: BytesMut::with_capacity(chunk_size),
            failure: None,
        }
    }

    /// Bytes acknowledged by the engine so far.
    pub fn written(&self) -> u64 {
        self.offset
    }

    async fn put(&mut self, data: Bytes) -> FsResult<()> {
        let len = data.len() as u64;
        if let Err(e) = self.transfer.write_range(self.offset, data).await {
            self.failure = Some(e.to_string());
            let _ = self.transfer.finish().await;
            return Err(e);
        }
        self.offset += len;
        Ok(())
    }

    fn check_failed(&self) -> FsResult<()> {
        match &self.failure {
            Some(reason) => Err(FsError::backend(format!(
                "transfer {} failed earlier: {reason}",
                self.transfer.id()
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WriteStream for DiskWriter {
    async fn write_all(&mut self, buf: &[u8]) -> FsResult<()> {
        self.check_failed()?;
        self.pending.extend_from_slice(buf);
        while self.pending.len() >= self.chunk_size {
            let chunk = self.pending.split_to(self.chunk_size).freeze();
            self.put(chunk).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> FsResult<()> {
        self.check_failed()?;
        if !self.pending.is_empty() {
            let rest = self.pending.split().freeze();
            self.put(rest).await?;
        }
        self.transfer.finish().await
    }
}
