//! NFS backend (`nfs://server[;version=3;transport=tcp;export=/x]/path`).
//!
//! Stateless: every operation builds an [`NfsPath`] and hands it to an
//! [`NfsClient`]. The default client, [`MountedNfsClient`], serves exports
//! that are already mounted on the host, mapping `server:/export` to a local
//! mount point from the `[nfs]` config section.
//!
//! NFS offers no owner or group lookup here, never reports symlinks, and its
//! seekable writes can extend a file but never truncate it.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use polyfs_types::{Address, Capabilities, Capability, FileAttr, FileKind};
use tracing::trace;

use super::local;
use crate::config::NfsMount;
use crate::error::{FsError, FsResult};
use crate::handle::{
    FileHandle, FileRef, HandleCore, check_same_backend_target, container_capabilities,
    require_container, share,
};
use crate::registry::{FileFactory, ResolveContext};
use crate::stream::{FileStream, GrowOnlyWrite, RandomRead, ReadStream, TokioWriter, WriteStream};

pub const SCHEME: &str = "nfs";

pub const NFS_CAPABILITIES: Capabilities = Capabilities::of(&[
    Capability::Read,
    Capability::Write,
    Capability::Append,
    Capability::RandomRead,
    Capability::GrowOnlyRandomWrite,
    Capability::List,
    Capability::Mkdir,
    Capability::Delete,
    Capability::Rename,
    Capability::ChangeDate,
    Capability::ChangePermissions,
    Capability::GetFreeSpace,
    Capability::GetTotalSpace,
]);

/// Transport named by the `transport` property.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum NfsTransport {
    Tcp,
    Udp,
}

/// Everything an NFS call needs, derived from an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsPath {
    pub server: String,
    /// Export pinned by the `export` property, if any.
    pub export: Option<String>,
    /// Absolute path on the server.
    pub path: String,
    /// Pinned protocol version; `None` accepts whatever the mount uses.
    pub version: Option<u8>,
    /// Pinned transport; `None` accepts whatever the mount uses.
    pub transport: Option<NfsTransport>,
}

impl NfsPath {
    pub fn from_address(address: &Address) -> FsResult<Self> {
        if address.host().is_empty() {
            return Err(FsError::invalid_target(format!("{address} names no server")));
        }
        let version = match address.property("version") {
            None => None,
            Some(v) => match v.parse::<u8>() {
                Ok(n @ 2..=4) => Some(n),
                _ => {
                    return Err(FsError::invalid_target(format!(
                        "unsupported NFS version {v:?} in {address}"
                    )));
                }
            },
        };
        let transport = match address.property("transport") {
            None => None,
            Some(t) => Some(t.parse().map_err(|_| {
                FsError::invalid_target(format!("unknown NFS transport {t:?} in {address}"))
            })?),
        };
        Ok(Self {
            server: address.host().to_string(),
            export: address.property("export").map(str::to_string),
            path: address.path().to_string(),
            version,
            transport,
        })
    }
}

impl fmt::Display for NfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server, self.path)
    }
}

/// NFS operations the backend needs.
#[async_trait]
pub trait NfsClient: Send + Sync + fmt::Debug {
    /// Attributes; a missing entry yields `exists == false`, not an error.
    async fn stat(&self, path: &NfsPath) -> FsResult<FileAttr>;

    async fn read_dir(&self, path: &NfsPath) -> FsResult<Vec<(String, FileAttr)>>;

    async fn open_read(&self, path: &NfsPath) -> FsResult<Box<dyn RandomRead>>;

    /// Sequential writer, truncating unless `append`.
    async fn open_write(&self, path: &NfsPath, append: bool) -> FsResult<Box<dyn WriteStream>>;

    /// Seekable writer that never truncates.
    async fn open_grow_only(&self, path: &NfsPath) -> FsResult<Box<dyn GrowOnlyWrite>>;

    async fn mkdir(&self, path: &NfsPath) -> FsResult<()>;

    async fn remove(&self, path: &NfsPath) -> FsResult<()>;

    async fn rename(&self, from: &NfsPath, to: &NfsPath) -> FsResult<()>;

    async fn set_modified(&self, path: &NfsPath, modified: SystemTime) -> FsResult<()>;

    async fn set_permissions(&self, path: &NfsPath, permissions: u32) -> FsResult<()>;

    /// (free, total) bytes of the export.
    async fn space(&self, path: &NfsPath) -> FsResult<(u64, u64)>;
}

/// Serves exports mounted on this host.
#[derive(Debug, Clone, Default)]
pub struct MountedNfsClient {
    mounts: Vec<NfsMount>,
}

impl MountedNfsClient {
    pub fn new(mounts: Vec<NfsMount>) -> Self {
        Self { mounts }
    }

    /// Local path for `path`: the longest configured export of the same
    /// server that contains it (or exactly the pinned export). A version or
    /// transport pinned by the address must agree with the mount's, when the
    /// mount declares one.
    pub fn local_path(&self, path: &NfsPath) -> FsResult<PathBuf> {
        let within = |export: &str| -> Option<String> {
            let export = export.trim_end_matches('/');
            if export.is_empty() {
                return Some(path.path.clone());
            }
            match path.path.strip_prefix(export) {
                Some("") => Some("/".to_string()),
                Some(rest) if rest.starts_with('/') => Some(rest.to_string()),
                _ => None,
            }
        };

        let best = self
            .mounts
            .iter()
            .filter(|m| m.server.eq_ignore_ascii_case(&path.server))
            .filter(|m| path.export.as_deref().is_none_or(|pinned| pinned == m.export))
            .filter(|m| agrees(path.version, m.version))
            .filter(|m| agrees(path.transport, m.transport))
            .filter_map(|m| within(&m.export).map(|rest| (m, rest)))
            .max_by_key(|(m, _)| m.export.len());

        let Some((mount, rest)) = best else {
            return Err(FsError::backend(format!(
                "no local mount serves nfs export for {path}"
            )));
        };
        let host_path = mount.mount_point.join(rest.trim_start_matches('/'));
        trace!(nfs = %path, local = %host_path.display(), "mapped nfs path");
        Ok(host_path)
    }
}

/// True unless both sides name a value and the values differ.
fn agrees<T: PartialEq>(pinned: Option<T>, mounted: Option<T>) -> bool {
    match (pinned, mounted) {
        (Some(p), Some(m)) => p == m,
        _ => true,
    }
}

#[async_trait]
impl NfsClient for MountedNfsClient {
    /// Follows symlinks, as the server does for a client.
    async fn stat(&self, path: &NfsPath) -> FsResult<FileAttr> {
        let host_path = self.local_path(path)?;
        match tokio::fs::metadata(&host_path).await {
            Ok(meta) => Ok(local::metadata_to_attr(&meta, false)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(FileAttr::missing(FileKind::File))
            }
            Err(e) => Err(local::io_error(&host_path, e)),
        }
    }

    async fn read_dir(&self, path: &NfsPath) -> FsResult<Vec<(String, FileAttr)>> {
        local::read_dir_attrs(&self.local_path(path)?, false).await
    }

    async fn open_read(&self, path: &NfsPath) -> FsResult<Box<dyn RandomRead>> {
        let file = local::open_read(&self.local_path(path)?).await?;
        Ok(Box::new(FileStream::new(file).await?))
    }

    async fn open_write(&self, path: &NfsPath, append: bool) -> FsResult<Box<dyn WriteStream>> {
        let file = local::open_write(&self.local_path(path)?, append, !append).await?;
        Ok(Box::new(TokioWriter::new(file)))
    }

    async fn open_grow_only(&self, path: &NfsPath) -> FsResult<Box<dyn GrowOnlyWrite>> {
        let file = local::open_write(&self.local_path(path)?, false, false).await?;
        Ok(Box::new(FileStream::new(file).await?))
    }

    async fn mkdir(&self, path: &NfsPath) -> FsResult<()> {
        let host_path = self.local_path(path)?;
        tokio::fs::create_dir(&host_path)
            .await
            .map_err(|e| local::io_error(&host_path, e))
    }

    async fn remove(&self, path: &NfsPath) -> FsResult<()> {
        let host_path = self.local_path(path)?;
        let meta = tokio::fs::symlink_metadata(&host_path)
            .await
            .map_err(|e| local::io_error(&host_path, e))?;
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir(&host_path).await
        } else {
            tokio::fs::remove_file(&host_path).await
        };
        removed.map_err(|e| local::io_error(&host_path, e))
    }

    async fn rename(&self, from: &NfsPath, to: &NfsPath) -> FsResult<()> {
        let from = self.local_path(from)?;
        let to = self.local_path(to)?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| local::io_error(&from, e))
    }

    async fn set_modified(&self, path: &NfsPath, modified: SystemTime) -> FsResult<()> {
        local::set_modified(&self.local_path(path)?, modified).await
    }

    async fn set_permissions(&self, path: &NfsPath, permissions: u32) -> FsResult<()> {
        local::set_mode(&self.local_path(path)?, permissions).await
    }

    async fn space(&self, path: &NfsPath) -> FsResult<(u64, u64)> {
        local::space(&self.local_path(path)?).await
    }
}

/// Factory for `nfs://` handles.
#[derive(Debug)]
pub struct NfsFactory {
    client: Arc<dyn NfsClient>,
}

impl NfsFactory {
    pub fn new(client: Arc<dyn NfsClient>) -> Self {
        Self { client }
    }
}

impl FileFactory for NfsFactory {
    /// Builds the handle without contacting the server; attributes stay
    /// unknown until `refresh()` or a parent listing supplies them.
    fn create(
        &self,
        address: Address,
        parent: Option<FileRef>,
        ctx: &ResolveContext,
    ) -> FsResult<FileRef> {
        let nfs = NfsPath::from_address(&address)?;
        let attr = FileAttr::unknown(FileKind::Unknown);
        Ok(share(NfsFile {
            core: HandleCore::new(address, attr, ctx, parent),
            client: self.client.clone(),
            nfs,
        }))
    }
}

/// A file or directory on an NFS export.
#[derive(Debug)]
pub struct NfsFile {
    core: HandleCore,
    client: Arc<dyn NfsClient>,
    nfs: NfsPath,
}

impl NfsFile {
    pub fn nfs_path(&self) -> &NfsPath {
        &self.nfs
    }
}

/// Symlinks are reported as whatever they point to.
fn without_symlink(mut attr: FileAttr) -> FileAttr {
    if attr.kind == FileKind::Symlink {
        attr.kind = FileKind::File;
    }
    attr.owner = None;
    attr.group = None;
    attr
}

#[async_trait]
impl FileHandle for NfsFile {
    fn core(&self) -> &HandleCore {
        &self.core
    }

    fn capabilities(&self) -> Capabilities {
        container_capabilities(NFS_CAPABILITIES, &self.core.attr())
    }

    fn is_symlink(&self) -> bool {
        false
    }

    async fn refresh(&self) -> FsResult<FileAttr> {
        let attr = without_symlink(self.client.stat(&self.nfs).await?);
        self.core.set_attr(attr.clone());
        Ok(attr)
    }

    async fn list(&self) -> FsResult<Vec<FileRef>> {
        require_container(self.address(), &self.refresh().await?)?;
        let ctx = self.core.context();
        let me = self.core.self_ref();
        let entries = self.client.read_dir(&self.nfs).await?;
        let mut children = Vec::with_capacity(entries.len());
        for (name, attr) in entries {
            let address = self.address().child(&name);
            let nfs = NfsPath::from_address(&address)?;
            children.push(share(NfsFile {
                core: HandleCore::new(address, without_symlink(attr), &ctx, me.clone()),
                client: self.client.clone(),
                nfs,
            }));
        }
        Ok(children)
    }

    async fn input_stream(&self) -> FsResult<Box<dyn ReadStream>> {
        Ok(Box::new(self.client.open_read(&self.nfs).await?))
    }

    async fn random_input(&self) -> FsResult<Box<dyn RandomRead>> {
        self.client.open_read(&self.nfs).await
    }

    async fn output_stream(&self) -> FsResult<Box<dyn WriteStream>> {
        self.client.open_write(&self.nfs, false).await
    }

    async fn append_stream(&self) -> FsResult<Box<dyn WriteStream>> {
        self.client.open_write(&self.nfs, true).await
    }

    async fn grow_only_output(&self) -> FsResult<Box<dyn GrowOnlyWrite>> {
        self.client.open_grow_only(&self.nfs).await
    }

    async fn mkdir(&self) -> FsResult<()> {
        self.client.mkdir(&self.nfs).await?;
        self.core.set_attr(FileAttr::directory(None));
        Ok(())
    }

    async fn delete(&self) -> FsResult<()> {
        self.client.remove(&self.nfs).await?;
        self.core.set_attr(FileAttr::missing(self.attr().kind));
        Ok(())
    }

    async fn rename_to(&self, target: &dyn FileHandle) -> FsResult<()> {
        check_same_backend_target(self, target, Capability::Rename)?;
        let to = NfsPath::from_address(target.address())?;
        self.client.rename(&self.nfs, &to).await
    }

    async fn change_date(&self, modified: SystemTime) -> FsResult<()> {
        self.client.set_modified(&self.nfs, modified).await?;
        self.refresh().await?;
        Ok(())
    }

    async fn change_permissions(&self, permissions: u32) -> FsResult<()> {
        self.client.set_permissions(&self.nfs, permissions).await?;
        self.refresh().await?;
        Ok(())
    }

    async fn free_space(&self) -> FsResult<u64> {
        self.client.space(&self.nfs).await.map(|(free, _)| free)
    }

    async fn total_space(&self) -> FsResult<u64> {
        self.client.space(&self.nfs).await.map(|(_, total)| total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn client(mount_point: &Path) -> MountedNfsClient {
        MountedNfsClient::new(vec![
            NfsMount {
                server: "filer".into(),
                export: "/exports".into(),
                mount_point: PathBuf::from("/nowhere"),
                version: None,
                transport: Some(NfsTransport::Tcp),
            },
            NfsMount {
                server: "filer".into(),
                export: "/exports/home".into(),
                mount_point: mount_point.to_path_buf(),
                version: Some(4),
                transport: None,
            },
        ])
    }

    fn nfs(addr: &str) -> NfsPath {
        NfsPath::from_address(&Address::parse(addr).unwrap()).unwrap()
    }

    #[test]
    fn test_properties() {
        let p = nfs("nfs://filer;version=4;transport=UDP/exports/home/a");
        assert_eq!(p.version, Some(4));
        assert_eq!(p.transport, Some(NfsTransport::Udp));
        assert_eq!(nfs("nfs://filer/x").version, None);
        let bad = NfsPath::from_address(&Address::parse("nfs://filer;version=9/x").unwrap());
        assert!(bad.is_err());
        assert!(NfsPath::from_address(&Address::parse("nfs:///x").unwrap()).is_err());
    }

    #[test]
    fn test_longest_export_wins() {
        let c = client(Path::new("/mnt/home"));
        assert_eq!(
            c.local_path(&nfs("nfs://FILER/exports/home/amy/notes.txt")).unwrap(),
            PathBuf::from("/mnt/home/amy/notes.txt")
        );
        assert_eq!(
            c.local_path(&nfs("nfs://filer/exports/other")).unwrap(),
            PathBuf::from("/nowhere/other")
        );
        assert_eq!(
            c.local_path(&nfs("nfs://filer;export=%2Fexports/exports/home/x")).unwrap(),
            PathBuf::from("/nowhere/home/x")
        );
        assert!(c.local_path(&nfs("nfs://elsewhere/exports/home")).is_err());
        // The home export is mounted as v4; a v3 address falls back to the
        // parent export, and nothing serves UDP.
        assert_eq!(
            c.local_path(&nfs("nfs://filer;version=3/exports/home/x")).unwrap(),
            PathBuf::from("/nowhere/home/x")
        );
        assert_eq!(
            c.local_path(&nfs("nfs://filer;version=4/exports/home/x")).unwrap(),
            PathBuf::from("/mnt/home/x")
        );
        assert!(c.local_path(&nfs("nfs://filer;transport=udp/exports/other")).is_err());
        assert!(c.local_path(&nfs("nfs://filer/exportsX")).is_err());
    }

    #[tokio::test]
    async fn test_grow_only_cannot_truncate() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "hello world").unwrap();
        let registry = crate::registry::BackendRegistry::new();
        registry.register(
            SCHEME,
            Arc::new(NfsFactory::new(Arc::new(client(dir.path())))),
        );

        let file = registry
            .resolve_str("nfs://filer/exports/home/f.txt")
            .unwrap();
        assert!(!file.supports(Capability::RandomWrite));
        assert!(file.random_output().await.err().unwrap().is_unsupported());
        assert!(file.owner().unwrap_err().is_unsupported());

        let mut out = file.grow_only_output().await.unwrap();
        out.seek(11).await.unwrap();
        out.write_all(b"!").await.unwrap();
        out.close().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "hello world!"
        );

        let attr = file.refresh().await.unwrap();
        assert_eq!(attr.size, 12);
        assert!(!file.is_symlink());
    }

    #[tokio::test]
    async fn test_list_file_is_unsupported() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/a.txt"), "a").unwrap();
        let registry = crate::registry::BackendRegistry::new();
        registry.register(
            SCHEME,
            Arc::new(NfsFactory::new(Arc::new(client(dir.path())))),
        );

        let docs = registry
            .resolve_str("nfs://filer/exports/home/docs")
            .unwrap();
        let children = docs.list().await.unwrap();
        assert_eq!(children.len(), 1);
        assert!(docs.supports(Capability::List));

        let file = &children[0];
        assert!(!file.supports(Capability::List));
        assert!(file.list().await.unwrap_err().is_unsupported());
    }
}
