//! Engine-facing collaborator for the oVirt backend.
//!
//! [`OvirtApi`] is the seam between the handle hierarchy and the engine. The
//! default implementation is [`super::rest::RestApi`]; tests substitute a
//! scripted one.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use polyfs_types::Address;
use serde::{Deserialize, Deserializer};

use crate::error::FsResult;

/// An authenticated engine session.
#[derive(Clone, PartialEq, Eq)]
pub struct EngineSession {
    /// Engine root, credentials stripped.
    pub engine: Address,
    pub token: String,
}

impl fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSession")
            .field("engine", &self.engine)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// The engine reports sizes as strings in JSON; accept both forms.
pub(crate) fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }
    match Option::<Raw>::deserialize(d)? {
        None => Ok(None),
        Some(Raw::Num(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageDomain {
    pub id: String,
    pub name: String,
    /// `data`, `iso`, `export`, ...
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub available: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub used: Option<u64>,
}

impl StorageDomain {
    /// Only data domains hold disks.
    pub fn is_data(&self) -> bool {
        self.kind == "data"
    }
}

/// Disk status as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum DiskStatus {
    Ok,
    Locked,
    Illegal,
    #[strum(default)]
    Other(String),
}

impl<'de> Deserialize<'de> for DiskStatus {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(raw.parse().unwrap_or(DiskStatus::Other(raw)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Disk {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    pub status: DiskStatus,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub provisioned_size: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub actual_size: Option<u64>,
}

impl Disk {
    /// Name shown in listings: the alias when set.
    pub fn label(&self) -> &str {
        self.alias
            .as_deref()
            .filter(|a| !a.is_empty())
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TransferDirection {
    Download,
    Upload,
}

/// Image transfer phases that matter to a client.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TransferPhase {
    Initializing,
    Resuming,
    Transferring,
    FinalizingSuccess,
    FinalizingFailure,
    FinishedSuccess,
    FinishedFailure,
    Cancelled,
    #[strum(default)]
    Other(String),
}

impl TransferPhase {
    /// Still negotiating; poll again.
    pub fn is_pending(&self) -> bool {
        matches!(self, TransferPhase::Initializing | TransferPhase::Resuming)
    }
}

impl<'de> Deserialize<'de> for TransferPhase {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(raw.parse().unwrap_or(TransferPhase::Other(raw)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageTransfer {
    pub id: String,
    pub phase: TransferPhase,
    /// Direct data-path URL, present once the transfer is ready.
    #[serde(default)]
    pub transfer_url: Option<String>,
    /// Proxy data-path URL, used when the direct one is absent.
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl ImageTransfer {
    pub fn data_url(&self) -> Option<&str> {
        self.transfer_url
            .as_deref()
            .or(self.proxy_url.as_deref())
    }
}

/// Engine operations the backend needs.
///
/// Every call except `login` runs under the realm's connection lock.
#[async_trait]
pub trait OvirtApi: Send + Sync + fmt::Debug {
    /// Exchange the address credentials for a session token.
    async fn login(&self, engine: &Address) -> FsResult<EngineSession>;

    async fn logout(&self, session: &EngineSession) -> FsResult<()>;

    /// Cheap authenticated request.
    async fn ping(&self, session: &EngineSession) -> FsResult<()>;

    async fn storage_domains(&self, session: &EngineSession) -> FsResult<Vec<StorageDomain>>;

    async fn disks(&self, session: &EngineSession, domain_id: &str) -> FsResult<Vec<Disk>>;

    async fn create_disk(
        &self,
        session: &EngineSession,
        domain_id: &str,
        name: &str,
        size: u64,
    ) -> FsResult<Disk>;

    async fn delete_disk(&self, session: &EngineSession, disk_id: &str) -> FsResult<()>;

    async fn start_transfer(
        &self,
        session: &EngineSession,
        disk_id: &str,
        direction: TransferDirection,
    ) -> FsResult<ImageTransfer>;

    async fn transfer(&self, session: &EngineSession, transfer_id: &str)
    -> FsResult<ImageTransfer>;

    async fn finalize_transfer(&self, session: &EngineSession, transfer_id: &str) -> FsResult<()>;

    async fn cancel_transfer(&self, session: &EngineSession, transfer_id: &str) -> FsResult<()>;

    /// Ranged GET of `len` bytes at `offset` from a transfer URL.
    async fn read_range(
        &self,
        session: &EngineSession,
        url: &str,
        offset: u64,
        len: u64,
    ) -> FsResult<Bytes>;

    /// Ranged PUT of `data` at `offset` to a transfer URL.
    async fn write_range(
        &self,
        session: &EngineSession,
        url: &str,
        offset: u64,
        data: Bytes,
    ) -> FsResult<()>;
}
