//! Container registry images (`docker://registry/repo:tag`, `oci://...`).
//!
//! Listing an image locks the realm's helper session, inspects the image,
//! copies it into a fresh temp directory and closes the session. Each layer
//! becomes a handle that reads the raw blob and lists the tar members inside
//! it. The temp directory lives until the last handle into it is dropped.
//!
//! Address properties: `tls-verify=false`, `proxy=http://...`, and
//! `type=<transport>` to pick a non-docker helper transport.

mod layer;
mod skopeo;

pub use layer::{LayerBlob, TarEntry};
pub use skopeo::{ImageInfo, LayerInfo, SkopeoConnector, SkopeoSession, image_reference};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use polyfs_types::{Address, Capabilities, Capability, FileAttr, FileKind};
use tempfile::TempDir;
use tracing::{info, warn};

use crate::error::{FsError, FsResult};
use crate::handle::{
    FileHandle, FileRef, HandleCore, container_capabilities, require_container, share,
};
use crate::pool::{ConnectionPool, Connector};
use crate::registry::{FileFactory, ResolveContext};
use crate::stream::{MemoryReader, ReadStream, TokioReader};

pub const DOCKER_SCHEME: &str = "docker";
pub const OCI_SCHEME: &str = "oci";

pub const IMAGE_CAPABILITIES: Capabilities = Capabilities::of(&[Capability::List]);
pub const LAYER_CAPABILITIES: Capabilities =
    Capabilities::of(&[Capability::Read, Capability::List]);

pub type RegistryPool = ConnectionPool<SkopeoSession>;

/// Factory for image handles. Resolving never runs the helper.
#[derive(Debug)]
pub struct RegistryFactory {
    pool: Arc<RegistryPool>,
    connector: Arc<dyn Connector<SkopeoSession>>,
    temp_root: Option<PathBuf>,
}

impl RegistryFactory {
    pub fn new(
        pool: Arc<RegistryPool>,
        connector: Arc<dyn Connector<SkopeoSession>>,
        temp_root: Option<PathBuf>,
    ) -> Self {
        Self {
            pool,
            connector,
            temp_root,
        }
    }

    pub fn pool(&self) -> &Arc<RegistryPool> {
        &self.pool
    }
}

impl FileFactory for RegistryFactory {
    fn create(
        &self,
        address: Address,
        parent: Option<FileRef>,
        ctx: &ResolveContext,
    ) -> FsResult<FileRef> {
        if address.is_root() {
            return Err(FsError::invalid_target(format!(
                "{address} does not name an image"
            )));
        }
        Ok(share(RegistryImage {
            core: HandleCore::new(address, FileAttr::directory(None), ctx, parent),
            pool: self.pool.clone(),
            connector: self.connector.clone(),
            temp_root: self.temp_root.clone(),
        }))
    }
}

/// A whole image; its children are its layers.
#[derive(Debug)]
pub struct RegistryImage {
    core: HandleCore,
    pool: Arc<RegistryPool>,
    connector: Arc<dyn Connector<SkopeoSession>>,
    temp_root: Option<PathBuf>,
}

impl RegistryImage {
    fn temp_dir(&self) -> FsResult<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("polyfs-image-");
        let dir = match &self.temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        Ok(dir?)
    }

    /// Inspect and download under one lock, always closing the session.
    async fn fetch(&self) -> FsResult<(ImageInfo, Arc<TempDir>)> {
        let image = self.address();
        let mut guard = self.pool.lock(image, &self.connector).await?;
        let outcome = async {
            let session = guard.check_connection().await?;
            let info = session.inspect(image).await?;
            let dir = self.temp_dir()?;
            session.copy_to_dir(image, dir.path()).await?;
            Ok::<_, FsError>((info, Arc::new(dir)))
        }
        .await;
        if let Err(e) = guard.close().await {
            warn!(image = %image, error = %e, "closing registry session failed");
        }
        outcome
    }
}

#[async_trait]
impl FileHandle for RegistryImage {
    fn core(&self) -> &HandleCore {
        &self.core
    }

    fn capabilities(&self) -> Capabilities {
        IMAGE_CAPABILITIES
    }

    /// Images are the top of their hierarchy.
    fn parent_address(&self) -> Option<Address> {
        None
    }

    async fn list(&self) -> FsResult<Vec<FileRef>> {
        let (info, dir) = self.fetch().await?;
        let created = info.created.map(SystemTime::from);
        let ctx = self.core.context();
        let me = self.core.self_ref();

        let mut layers = Vec::new();
        for layer in info.layer_list() {
            let blob_path = dir.path().join(layer.blob_name());
            let size = match layer.size {
                Some(size) => size,
                None => tokio::fs::metadata(&blob_path)
                    .await
                    .map(|m| m.len() as i64)
                    .unwrap_or(polyfs_types::UNKNOWN_SIZE),
            };
            layers.push(share(LayerFile {
                core: HandleCore::new(
                    self.address().child(layer.blob_name()),
                    FileAttr::file(size, created),
                    &ctx,
                    me.clone(),
                ),
                blob: Arc::new(LayerBlob::new(blob_path, dir.clone())),
                inner: "/".to_string(),
            }));
        }
        info!(image = %self.address(), layers = layers.len(), "listed image");
        Ok(layers)
    }
}

/// A layer blob, or a member inside one (`inner != "/"`).
#[derive(Debug)]
pub struct LayerFile {
    core: HandleCore,
    blob: Arc<LayerBlob>,
    inner: String,
}

impl LayerFile {
    fn is_blob(&self) -> bool {
        self.inner == "/"
    }

    fn member_attr(entry: &TarEntry) -> FileAttr {
        let attr = if entry.is_dir {
            FileAttr::directory(entry.modified)
        } else {
            FileAttr::file(entry.size as i64, entry.modified)
        };
        match entry.mode {
            Some(mode) => attr.with_permissions(mode),
            None => attr,
        }
    }
}

#[async_trait]
impl FileHandle for LayerFile {
    fn core(&self) -> &HandleCore {
        &self.core
    }

    fn capabilities(&self) -> Capabilities {
        if self.is_blob() {
            LAYER_CAPABILITIES
        } else {
            container_capabilities(LAYER_CAPABILITIES, &self.core.attr())
        }
    }

    async fn refresh(&self) -> FsResult<FileAttr> {
        if self.is_blob() {
            return Ok(self.core.attr());
        }
        let attr = match self.blob.entries().await?.get(&self.inner) {
            Some(entry) => Self::member_attr(entry),
            None => FileAttr::missing(FileKind::File),
        };
        self.core.set_attr(attr.clone());
        Ok(attr)
    }

    async fn list(&self) -> FsResult<Vec<FileRef>> {
        if !self.is_blob() {
            let attr = self.refresh().await?;
            if !attr.exists {
                return Err(FsError::not_found(self.address().to_string()));
            }
            require_container(self.address(), &attr)?;
        }
        let ctx = self.core.context();
        let me = self.core.self_ref();
        let children = self
            .blob
            .children(&self.inner)
            .await?
            .into_iter()
            .map(|entry| {
                let name = entry.path.rsplit('/').next().unwrap_or_default();
                share(LayerFile {
                    core: HandleCore::new(
                        self.address().child(name),
                        Self::member_attr(&entry),
                        &ctx,
                        me.clone(),
                    ),
                    blob: self.blob.clone(),
                    inner: entry.path.clone(),
                })
            })
            .collect();
        Ok(children)
    }

    /// The blob reads raw (still compressed); members read decompressed.
    async fn input_stream(&self) -> FsResult<Box<dyn ReadStream>> {
        if self.is_blob() {
            let file = crate::backends::local::open_read(self.blob.path()).await?;
            return Ok(Box::new(TokioReader::new(file)));
        }
        let data = self.blob.read(&self.inner).await?;
        Ok(Box::new(MemoryReader::new(data)))
    }
}
