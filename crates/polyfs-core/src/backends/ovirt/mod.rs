//! oVirt storage (`ovirt://engine[;certificate=/ca.pem;insecure=true]/domain/disk`).
//!
//! Three levels, all pool-backed:
//!
//! ```text
//! ovirt://engine/              system: lists data storage domains
//! ovirt://engine/data1         domain: lists disks, reports free/total space
//! ovirt://engine/data1/vm-root disk:   read/write via image transfers, delete
//! ```
//!
//! Every engine call happens under the realm's connection lock. Disk streams
//! keep that lock until their transfer is finalized.

pub mod api;
pub mod rest;
mod transfer;

pub use api::{
    Disk, DiskStatus, EngineSession, ImageTransfer, OvirtApi, StorageDomain, TransferDirection,
    TransferPhase,
};
pub use rest::RestApi;
pub use transfer::{DiskReader, DiskWriter, TransferSession};

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use polyfs_types::{Address, Capabilities, Capability, FileAttr, FileKind, UNKNOWN_SIZE};
use tracing::info;

use crate::config::TransferConfig;
use crate::error::{FsError, FsResult};
use crate::handle::{FileHandle, FileRef, HandleCore, share};
use crate::pool::{Connection, ConnectionPool, Connector};
use crate::registry::{FileFactory, ResolveContext};
use crate::stream::{ReadStream, WriteStream};

pub const SCHEME: &str = "ovirt";

pub const SYSTEM_CAPABILITIES: Capabilities = Capabilities::of(&[Capability::List]);
pub const DOMAIN_CAPABILITIES: Capabilities = Capabilities::of(&[
    Capability::List,
    Capability::GetFreeSpace,
    Capability::GetTotalSpace,
]);
pub const DISK_CAPABILITIES: Capabilities =
    Capabilities::of(&[Capability::Read, Capability::Write, Capability::Delete]);

pub type OvirtPool = ConnectionPool<OvirtConnection>;

/// A logged-in engine session.
#[derive(Debug)]
pub struct OvirtConnection {
    api: Arc<dyn OvirtApi>,
    session: EngineSession,
}

#[async_trait]
impl Connection for OvirtConnection {
    async fn keep_alive(&mut self) -> FsResult<()> {
        self.api.ping(&self.session).await
    }

    async fn disconnect(&mut self) -> FsResult<()> {
        self.api.logout(&self.session).await
    }
}

#[derive(Debug)]
pub struct OvirtConnector {
    api: Arc<dyn OvirtApi>,
}

impl OvirtConnector {
    pub fn new(api: Arc<dyn OvirtApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Connector<OvirtConnection> for OvirtConnector {
    async fn connect(&self, address: &Address) -> FsResult<OvirtConnection> {
        if address.credentials().is_none() {
            return Err(FsError::auth_required(address));
        }
        let session = self.api.login(address).await?;
        Ok(OvirtConnection {
            api: self.api.clone(),
            session,
        })
    }
}

struct Shared {
    pool: Arc<OvirtPool>,
    connector: Arc<dyn Connector<OvirtConnection>>,
    transfer: TransferConfig,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Factory for all three levels. Resolving never contacts the engine.
#[derive(Debug)]
pub struct OvirtFactory {
    shared: Arc<Shared>,
}

impl OvirtFactory {
    pub fn new(api: Arc<dyn OvirtApi>, pool: Arc<OvirtPool>, transfer: TransferConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                connector: Arc::new(OvirtConnector::new(api)),
                transfer,
            }),
        }
    }

    pub fn pool(&self) -> &Arc<OvirtPool> {
        &self.shared.pool
    }
}

impl FileFactory for OvirtFactory {
    fn create(
        &self,
        address: Address,
        parent: Option<FileRef>,
        ctx: &ResolveContext,
    ) -> FsResult<FileRef> {
        if address.host().is_empty() {
            return Err(FsError::invalid_target(format!("{address} names no engine")));
        }
        let (level, attr) = match address.segments().count() {
            0 => (Level::System, FileAttr::directory(None)),
            1 => (Level::Domain, FileAttr::directory(None)),
            2 => (Level::Disk, FileAttr::unknown(FileKind::File)),
            _ => {
                return Err(FsError::invalid_target(format!(
                    "{address} is deeper than engine/domain/disk"
                )));
            }
        };
        Ok(share(OvirtFile {
            core: HandleCore::new(address, attr, ctx, parent),
            shared: self.shared.clone(),
            level,
            domain_id: OnceLock::new(),
            disk_id: OnceLock::new(),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    System,
    Domain,
    Disk,
}

/// An engine, storage domain or disk.
#[derive(Debug)]
pub struct OvirtFile {
    core: HandleCore,
    shared: Arc<Shared>,
    level: Level,
    domain_id: OnceLock<String>,
    disk_id: OnceLock<String>,
}

fn disk_attr(disk: &Disk) -> FileAttr {
    let size = disk
        .provisioned_size
        .map_or(UNKNOWN_SIZE, |s| s as i64);
    FileAttr::file(size, None)
}

impl OvirtFile {
    fn domain_name(&self) -> FsResult<&str> {
        self.address()
            .segments()
            .next()
            .ok_or_else(|| FsError::invalid_target(format!("{} has no domain", self.address())))
    }

    fn child(&self, name: &str, attr: FileAttr, level: Level) -> Self {
        Self {
            core: HandleCore::new(
                self.address().child(name),
                attr,
                &self.core.context(),
                self.core.self_ref(),
            ),
            shared: self.shared.clone(),
            level,
            domain_id: OnceLock::new(),
            disk_id: OnceLock::new(),
        }
    }

    async fn lock(&self) -> FsResult<crate::pool::ConnectionGuard<OvirtConnection>> {
        self.shared
            .pool
            .lock(self.address(), &self.shared.connector)
            .await
    }

    async fn find_domain(&self, conn: &OvirtConnection) -> FsResult<Option<StorageDomain>> {
        let name = self.domain_name()?;
        let found = conn
            .api
            .storage_domains(&conn.session)
            .await?
            .into_iter()
            .find(|d| d.is_data() && d.name == name);
        if let Some(domain) = &found {
            let _ = self.domain_id.set(domain.id.clone());
        }
        Ok(found)
    }

    async fn domain_id(&self, conn: &OvirtConnection) -> FsResult<String> {
        if let Some(id) = self.domain_id.get() {
            return Ok(id.clone());
        }
        let name = self.domain_name()?;
        self.find_domain(conn)
            .await?
            .map(|d| d.id)
            .ok_or_else(|| FsError::not_found(self.address().root().child(name).to_string()))
    }

    async fn find_disk(&self, conn: &OvirtConnection) -> FsResult<Option<Disk>> {
        let domain_id = self.domain_id(conn).await?;
        let name = self.name();
        let known = self.disk_id.get();
        let found = conn
            .api
            .disks(&conn.session, &domain_id)
            .await?
            .into_iter()
            .find(|d| match known {
                Some(id) => &d.id == id,
                None => d.label() == name,
            });
        if let Some(disk) = &found {
            let _ = self.disk_id.set(disk.id.clone());
        }
        Ok(found)
    }

    async fn require_disk(&self, conn: &OvirtConnection) -> FsResult<Disk> {
        self.find_disk(conn)
            .await?
            .ok_or_else(|| FsError::not_found(self.address().to_string()))
    }

    /// Create the disk from the address's `size` property and wait for it to
    /// become usable.
    async fn create_disk(&self, conn: &OvirtConnection) -> FsResult<Disk> {
        let size: u64 = self
            .address()
            .property("size")
            .ok_or_else(|| {
                FsError::not_found(format!(
                    "{} (add a size property to create it)",
                    self.address()
                ))
            })?
            .parse()
            .map_err(|e| FsError::invalid_target(format!("bad size property: {e}")))?;
        let domain_id = self.domain_id(conn).await?;
        let created = conn
            .api
            .create_disk(&conn.session, &domain_id, self.name(), size)
            .await?;
        info!(disk = %self.address(), id = %created.id, size, "created disk");

        let (api, session, domain_id, id) = (&conn.api, &conn.session, &domain_id, &created.id);
        let ready = self
            .shared
            .transfer
            .poll_policy()
            .poll_until(&format!("disk {id} to become ready"), || async move {
                let disks = api.disks(session, domain_id).await?;
                Ok(disks
                    .into_iter()
                    .find(|d| &d.id == id && d.status == DiskStatus::Ok))
            })
            .await?;
        let _ = self.disk_id.set(ready.id.clone());
        Ok(ready)
    }

    fn only(&self, level: Level, capability: Capability) -> FsResult<()> {
        if self.level == level {
            Ok(())
        } else {
            Err(FsError::unsupported(capability, self.address()))
        }
    }

    async fn domain_space(&self) -> FsResult<(Option<u64>, Option<u64>)> {
        let mut guard = self.lock().await?;
        let conn = guard.check_connection().await?;
        let domain = self
            .find_domain(conn)
            .await?
            .ok_or_else(|| FsError::not_found(self.address().to_string()))?;
        Ok((domain.available, domain.used))
    }
}

#[async_trait]
impl FileHandle for OvirtFile {
    fn core(&self) -> &HandleCore {
        &self.core
    }

    fn capabilities(&self) -> Capabilities {
        match self.level {
            Level::System => SYSTEM_CAPABILITIES,
            Level::Domain => DOMAIN_CAPABILITIES,
            Level::Disk => DISK_CAPABILITIES,
        }
    }

    async fn refresh(&self) -> FsResult<FileAttr> {
        let attr = match self.level {
            Level::System => FileAttr::directory(None),
            Level::Domain => {
                let mut guard = self.lock().await?;
                let conn = guard.check_connection().await?;
                match self.find_domain(conn).await? {
                    Some(_) => FileAttr::directory(None),
                    None => FileAttr::missing(FileKind::Directory),
                }
            }
            Level::Disk => {
                let mut guard = self.lock().await?;
                let conn = guard.check_connection().await?;
                match self.find_disk(conn).await? {
                    Some(disk) => disk_attr(&disk),
                    None => FileAttr::missing(FileKind::File),
                }
            }
        };
        self.core.set_attr(attr.clone());
        Ok(attr)
    }

    async fn list(&self) -> FsResult<Vec<FileRef>> {
        if self.level == Level::Disk {
            return Err(FsError::unsupported(Capability::List, self.address()));
        }
        let mut guard = self.lock().await?;
        let conn = guard.check_connection().await?;
        let children = match self.level {
            Level::System => conn
                .api
                .storage_domains(&conn.session)
                .await?
                .into_iter()
                .filter(StorageDomain::is_data)
                .map(|domain| {
                    let child = self.child(&domain.name, FileAttr::directory(None), Level::Domain);
                    let _ = child.domain_id.set(domain.id);
                    share(child)
                })
                .collect(),
            Level::Domain => {
                let domain_id = self.domain_id(conn).await?;
                conn.api
                    .disks(&conn.session, &domain_id)
                    .await?
                    .into_iter()
                    .map(|disk| {
                        let child = self.child(disk.label(), disk_attr(&disk), Level::Disk);
                        let _ = child.domain_id.set(domain_id.clone());
                        let _ = child.disk_id.set(disk.id);
                        share(child)
                    })
                    .collect()
            }
            Level::Disk => Vec::new(),
        };
        Ok(children)
    }

    async fn input_stream(&self) -> FsResult<Box<dyn ReadStream>> {
        self.only(Level::Disk, Capability::Read)?;
        let mut guard = self.lock().await?;
        let conn = guard.check_connection().await?;
        let disk = self.require_disk(conn).await?;
        let size = disk.provisioned_size.ok_or_else(|| {
            FsError::backend(format!("engine reports no size for {}", self.address()))
        })?;
        let config = &self.shared.transfer;
        let transfer = TransferSession::open(
            guard,
            &disk.id,
            TransferDirection::Download,
            &config.poll_policy(),
        )
        .await?;
        Ok(Box::new(DiskReader::new(transfer, size, config.chunk_size)))
    }

    async fn output_stream(&self) -> FsResult<Box<dyn WriteStream>> {
        self.only(Level::Disk, Capability::Write)?;
        let mut guard = self.lock().await?;
        let conn = guard.check_connection().await?;
        let disk = match self.find_disk(conn).await? {
            Some(disk) => disk,
            None => self.create_disk(conn).await?,
        };
        let config = &self.shared.transfer;
        let transfer = TransferSession::open(
            guard,
            &disk.id,
            TransferDirection::Upload,
            &config.poll_policy(),
        )
        .await?;
        Ok(Box::new(DiskWriter::new(transfer, config.chunk_size)))
    }

    async fn delete(&self) -> FsResult<()> {
        self.only(Level::Disk, Capability::Delete)?;
        let mut guard = self.lock().await?;
        let conn = guard.check_connection().await?;
        let disk = self.require_disk(conn).await?;
        if disk.status != DiskStatus::Ok {
            return Err(FsError::backend(format!(
                "{} is {}, not ok; refusing to delete",
                self.address(),
                disk.status
            )));
        }
        conn.api.delete_disk(&conn.session, &disk.id).await?;
        info!(disk = %self.address(), id = %disk.id, "deleted disk");
        self.core.set_attr(FileAttr::missing(FileKind::File));
        Ok(())
    }

    async fn free_space(&self) -> FsResult<u64> {
        self.only(Level::Domain, Capability::GetFreeSpace)?;
        let (available, _) = self.domain_space().await?;
        available.ok_or_else(|| FsError::backend(format!("no free space reported for {}", self.address())))
    }

    async fn total_space(&self) -> FsResult<u64> {
        self.only(Level::Domain, Capability::GetTotalSpace)?;
        match self.domain_space().await? {
            (Some(available), Some(used)) => available.checked_add(used).ok_or_else(|| {
                FsError::backend(format!(
                    "capacity of {} overflows: {available} available + {used} used",
                    self.address()
                ))
            }),
            _ => Err(FsError::backend(format!(
                "no capacity reported for {}",
                self.address()
            ))),
        }
    }
}

#[cfg(test)]
mod mock {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted engine with one data domain (`data1`) and one ISO domain.
    #[derive(Debug)]
    pub struct MockEngine {
        pub disks: Mutex<Vec<Disk>>,
        pub image: Mutex<Vec<u8>>,
        pub logins: AtomicUsize,
        pub finalized: AtomicUsize,
        pub deleted: Mutex<Vec<String>>,
        pub writes: Mutex<Vec<(u64, usize)>>,
        /// Status polls answered with `initializing` before `transferring`.
        pub initializing_polls: AtomicUsize,
        pub never_ready: bool,
        pub fail_writes: bool,
        /// `(available, used)` reported for every domain.
        pub space: (Option<u64>, Option<u64>),
    }

    impl Default for MockEngine {
        fn default() -> Self {
            Self {
                disks: Mutex::new(vec![
                    disk("d1", "vm-root", DiskStatus::Ok, 10),
                    disk("d2", "busy", DiskStatus::Locked, 20),
                ]),
                image: Mutex::new(b"0123456789".to_vec()),
                logins: AtomicUsize::new(0),
                finalized: AtomicUsize::new(0),
                deleted: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
                initializing_polls: AtomicUsize::new(2),
                never_ready: false,
                fail_writes: false,
                space: (Some(1000), Some(24)),
            }
        }
    }

    pub fn disk(id: &str, name: &str, status: DiskStatus, size: u64) -> Disk {
        Disk {
            id: id.into(),
            name: name.into(),
            alias: None,
            status,
            provisioned_size: Some(size),
            actual_size: None,
        }
    }

    fn domain(id: &str, name: &str, kind: &str, space: (Option<u64>, Option<u64>)) -> StorageDomain {
        StorageDomain {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            available: space.0,
            used: space.1,
        }
    }

    #[async_trait]
    impl OvirtApi for MockEngine {
        async fn login(&self, engine: &Address) -> FsResult<EngineSession> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            Ok(EngineSession {
                engine: engine.root().without_credentials(),
                token: "token".into(),
            })
        }

        async fn logout(&self, _session: &EngineSession) -> FsResult<()> {
            Ok(())
        }

        async fn ping(&self, _session: &EngineSession) -> FsResult<()> {
            Ok(())
        }

        async fn storage_domains(&self, _s: &EngineSession) -> FsResult<Vec<StorageDomain>> {
            Ok(vec![
                domain("sd1", "data1", "data", self.space),
                domain("sd2", "isos", "iso", self.space),
            ])
        }

        async fn disks(&self, _s: &EngineSession, domain_id: &str) -> FsResult<Vec<Disk>> {
            assert_eq!(domain_id, "sd1");
            Ok(self.disks.lock().clone())
        }

        async fn create_disk(
            &self,
            _s: &EngineSession,
            _domain_id: &str,
            name: &str,
            size: u64,
        ) -> FsResult<Disk> {
            let created = disk("new", name, DiskStatus::Locked, size);
            let mut ready = created.clone();
            ready.status = DiskStatus::Ok;
            self.disks.lock().push(ready);
            Ok(created)
        }

        async fn delete_disk(&self, _s: &EngineSession, disk_id: &str) -> FsResult<()> {
            self.deleted.lock().push(disk_id.to_string());
            self.disks.lock().retain(|d| d.id != disk_id);
            Ok(())
        }

        async fn start_transfer(
            &self,
            _s: &EngineSession,
            disk_id: &str,
            _direction: TransferDirection,
        ) -> FsResult<ImageTransfer> {
            Ok(ImageTransfer {
                id: format!("t-{disk_id}"),
                phase: TransferPhase::Initializing,
                transfer_url: None,
                proxy_url: None,
            })
        }

        async fn transfer(&self, _s: &EngineSession, transfer_id: &str) -> FsResult<ImageTransfer> {
            let pending = self.never_ready
                || self
                    .initializing_polls
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            Ok(ImageTransfer {
                id: transfer_id.to_string(),
                phase: if pending {
                    TransferPhase::Initializing
                } else {
                    TransferPhase::Transferring
                },
                transfer_url: (!pending).then(|| format!("https://io/{transfer_id}")),
                proxy_url: None,
            })
        }

        async fn finalize_transfer(&self, _s: &EngineSession, _id: &str) -> FsResult<()> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cancel_transfer(&self, _s: &EngineSession, _id: &str) -> FsResult<()> {
            Ok(())
        }

        async fn read_range(
            &self,
            _s: &EngineSession,
            _url: &str,
            offset: u64,
            len: u64,
        ) -> FsResult<Bytes> {
            let image = self.image.lock();
            let start = (offset as usize).min(image.len());
            let end = (start + len as usize).min(image.len());
            Ok(Bytes::copy_from_slice(&image[start..end]))
        }

        async fn write_range(
            &self,
            _s: &EngineSession,
            url: &str,
            offset: u64,
            data: Bytes,
        ) -> FsResult<()> {
            if self.fail_writes {
                return Err(FsError::backend(format!("{url} returned 500 Internal Server Error")));
            }
            self.writes.lock().push((offset, data.len()));
            Ok(())
        }
    }
}
