//! Disk transfer cleanup against a scripted engine.
//!
//! The engine answers every data request with an HTTP failure after a
//! configurable number of successful chunks. Whatever fails, the transfer
//! must be finalized exactly once and the realm's connection lock released.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use polyfs_core::backends::ovirt::{
    Disk, DiskStatus, EngineSession, ImageTransfer, OvirtApi, StorageDomain, TransferDirection,
    TransferPhase,
};
use polyfs_core::backends::{OvirtFactory, ovirt};
use polyfs_core::config::{PoolConfig, TransferConfig};
use polyfs_core::{
    Address, BackendRegistry, ErrorKind, FileRef, FsError, FsResult, ReadStream, WriteStream,
};

// ============================================================================
// Scripted engine
// ============================================================================

#[derive(Debug)]
struct FlakyEngine {
    /// Data requests that succeed before every later one fails.
    good_chunks: usize,
    data_requests: AtomicUsize,
    finalized: AtomicUsize,
    cancelled: AtomicUsize,
    logouts: AtomicUsize,
}

impl FlakyEngine {
    fn new(good_chunks: usize) -> Arc<Self> {
        Arc::new(Self {
            good_chunks,
            data_requests: AtomicUsize::new(0),
            finalized: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
        })
    }

    fn data_request(&self, url: &str) -> FsResult<()> {
        if self.data_requests.fetch_add(1, Ordering::SeqCst) < self.good_chunks {
            Ok(())
        } else {
            Err(FsError::backend(format!(
                "{url} returned 503 Service Unavailable: imageio restarting"
            )))
        }
    }
}

#[async_trait]
impl OvirtApi for FlakyEngine {
    async fn login(&self, engine: &Address) -> FsResult<EngineSession> {
        Ok(EngineSession {
            engine: engine.root().without_credentials(),
            token: "t".into(),
        })
    }

    async fn logout(&self, _session: &EngineSession) -> FsResult<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self, _session: &EngineSession) -> FsResult<()> {
        Ok(())
    }

    async fn storage_domains(&self, _session: &EngineSession) -> FsResult<Vec<StorageDomain>> {
        Ok(vec![StorageDomain {
            id: "sd".into(),
            name: "data".into(),
            kind: "data".into(),
            available: None,
            used: None,
        }])
    }

    async fn disks(&self, _session: &EngineSession, _domain_id: &str) -> FsResult<Vec<Disk>> {
        Ok(vec![Disk {
            id: "disk-1".into(),
            name: "guest.img".into(),
            alias: None,
            status: DiskStatus::Ok,
            provisioned_size: Some(12),
            actual_size: Some(12),
        }])
    }

    async fn create_disk(
        &self,
        _session: &EngineSession,
        _domain_id: &str,
        name: &str,
        _size: u64,
    ) -> FsResult<Disk> {
        Err(FsError::backend(format!("unexpected create of {name}")))
    }

    async fn delete_disk(&self, _session: &EngineSession, _disk_id: &str) -> FsResult<()> {
        Ok(())
    }

    async fn start_transfer(
        &self,
        _session: &EngineSession,
        disk_id: &str,
        _direction: TransferDirection,
    ) -> FsResult<ImageTransfer> {
        Ok(ImageTransfer {
            id: format!("xfer-{disk_id}"),
            phase: TransferPhase::Transferring,
            transfer_url: Some("https://imageio.lab/images/xfer".into()),
            proxy_url: None,
        })
    }

    async fn transfer(&self, _session: &EngineSession, transfer_id: &str) -> FsResult<ImageTransfer> {
        Ok(ImageTransfer {
            id: transfer_id.into(),
            phase: TransferPhase::Transferring,
            transfer_url: Some("https://imageio.lab/images/xfer".into()),
            proxy_url: None,
        })
    }

    async fn finalize_transfer(&self, _session: &EngineSession, _id: &str) -> FsResult<()> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel_transfer(&self, _session: &EngineSession, _id: &str) -> FsResult<()> {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_range(
        &self,
        _session: &EngineSession,
        url: &str,
        _offset: u64,
        len: u64,
    ) -> FsResult<Bytes> {
        self.data_request(url)?;
        Ok(Bytes::from(vec![b'x'; len as usize]))
    }

    async fn write_range(
        &self,
        _session: &EngineSession,
        url: &str,
        _offset: u64,
        _data: Bytes,
    ) -> FsResult<()> {
        self.data_request(url)
    }
}

fn disk(engine: &Arc<FlakyEngine>) -> (FileRef, Arc<BackendRegistry>, Arc<ovirt::OvirtPool>) {
    let pool = ovirt::OvirtPool::new("ovirt", PoolConfig::default());
    let transfer = TransferConfig {
        chunk_size: 4,
        poll_interval: Duration::from_millis(10),
        max_poll_attempts: 3,
        backoff: 1.0,
    };
    let registry = BackendRegistry::new();
    registry.register(
        ovirt::SCHEME,
        Arc::new(OvirtFactory::new(engine.clone(), pool.clone(), transfer)),
    );
    let handle = registry
        .resolve_str("ovirt://admin:pw@engine.lab/data/guest.img")
        .unwrap();
    (handle, registry, pool)
}

/// The realm lock is free again: a fresh listing goes through at once.
async fn assert_unlocked(registry: &BackendRegistry) {
    let domain = registry.resolve_str("ovirt://admin:pw@engine.lab/data").unwrap();
    let listed = tokio::time::timeout(Duration::from_secs(5), domain.list())
        .await
        .expect("connection lock still held")
        .unwrap();
    assert_eq!(listed.len(), 1);
}

// ============================================================================
// Cleanup on failure
// ============================================================================

#[tokio::test]
async fn test_upload_failure_finalizes_once() {
    let engine = FlakyEngine::new(1);
    let (disk, registry, pool) = disk(&engine);

    let mut output = disk.output_stream().await.unwrap();
    output.write_all(b"abcd").await.unwrap();
    let err = output.write_all(b"efgh").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);
    assert!(err.to_string().contains("503"));
    assert_eq!(engine.finalized.load(Ordering::SeqCst), 1);

    // Later calls report the earlier failure without another cleanup.
    assert!(output.write_all(b"ij").await.is_err());
    assert!(output.close().await.is_err());
    drop(output);
    tokio::task::yield_now().await;

    assert_eq!(engine.finalized.load(Ordering::SeqCst), 1);
    assert_eq!(engine.cancelled.load(Ordering::SeqCst), 0);
    assert_unlocked(&registry).await;
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn test_upload_failure_on_close_finalizes_once() {
    let engine = FlakyEngine::new(0);
    let (disk, registry, _pool) = disk(&engine);

    let mut output = disk.output_stream().await.unwrap();
    // Smaller than a chunk: nothing is sent until close.
    output.write_all(b"ab").await.unwrap();
    assert_eq!(engine.data_requests.load(Ordering::SeqCst), 0);
    assert!(output.close().await.is_err());
    drop(output);

    assert_eq!(engine.finalized.load(Ordering::SeqCst), 1);
    assert_unlocked(&registry).await;
}

#[tokio::test]
async fn test_download_failure_finalizes_once() {
    let engine = FlakyEngine::new(1);
    let (disk, registry, _pool) = disk(&engine);

    let mut input = disk.input_stream().await.unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(input.read(&mut buf).await.unwrap(), 4);
    let err = input.read(&mut buf).await.unwrap_err();
    assert!(err.to_string().contains("503"));
    drop(input);
    tokio::task::yield_now().await;

    assert_eq!(engine.finalized.load(Ordering::SeqCst), 1);
    assert_unlocked(&registry).await;
}

#[tokio::test]
async fn test_successful_download_then_pool_close() {
    let engine = FlakyEngine::new(usize::MAX);
    let (disk, _registry, pool) = disk(&engine);

    let mut input = disk.input_stream().await.unwrap();
    assert_eq!(input.read_to_end().await.unwrap(), vec![b'x'; 12]);
    assert_eq!(engine.finalized.load(Ordering::SeqCst), 1);

    pool.close_all().await;
    assert_eq!(engine.logouts.load(Ordering::SeqCst), 1);
    assert!(pool.is_empty());
}
