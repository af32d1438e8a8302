//! ISO9660 image backend (`iso:///path/to/image.iso/inner/path`).
//!
//! The first path segment ending in `.iso` names the image on the local
//! filesystem; the rest is the path inside it. The image is walked once per
//! archive and the catalog shared by every handle listed from it. Entries are
//! read as seekable sub-ranges of the image file.

mod walker;

pub use walker::{IsoEntry, Walk, walk};

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use polyfs_types::{Address, Capabilities, Capability, FileAttr, FileKind};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{FsError, FsResult};
use crate::handle::{
    FileHandle, FileRef, HandleCore, container_capabilities, require_container, share,
};
use crate::registry::{FileFactory, ResolveContext};
use crate::stream::{RandomRead, ReadStream};

pub const SCHEME: &str = "iso";

pub const ISO_CAPABILITIES: Capabilities =
    Capabilities::of(&[Capability::Read, Capability::RandomRead, Capability::List]);

/// Split an address path into (image path, path inside the image).
pub fn split_image_path(path: &str) -> Option<(String, String)> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let at = segments
        .iter()
        .position(|s| s.to_ascii_lowercase().ends_with(".iso"))?;
    let image = format!("/{}", segments[..=at].join("/"));
    let inner = format!("/{}", segments[at + 1..].join("/"));
    Some((image, inner))
}

/// Entries of one image, indexed by path and by parent directory.
#[derive(Debug, Default)]
pub struct Catalog {
    block_size: u64,
    entries: HashMap<String, IsoEntry>,
    children: HashMap<String, Vec<String>>,
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

impl Catalog {
    fn from_walk(walk: Walk) -> Self {
        let mut catalog = Catalog {
            block_size: walk.block_size,
            ..Default::default()
        };
        for entry in walk.entries {
            catalog
                .children
                .entry(parent_of(&entry.path).to_string())
                .or_default()
                .push(entry.path.clone());
            catalog.entries.insert(entry.path.clone(), entry);
        }
        catalog
    }

    pub fn get(&self, path: &str) -> Option<&IsoEntry> {
        self.entries.get(path)
    }

    pub fn children(&self, dir: &str) -> impl Iterator<Item = &IsoEntry> {
        self.children
            .get(dir)
            .into_iter()
            .flatten()
            .filter_map(|p| self.entries.get(p))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One image file and its lazily built catalog.
#[derive(Debug)]
pub struct IsoArchive {
    image: PathBuf,
    catalog: OnceCell<Arc<Catalog>>,
}

impl IsoArchive {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            catalog: OnceCell::new(),
        }
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    /// Walk the image on first use; later calls share the result.
    pub async fn catalog(&self) -> FsResult<Arc<Catalog>> {
        let catalog = self
            .catalog
            .get_or_try_init(|| async {
                let image = self.image.clone();
                let walk = tokio::task::spawn_blocking(move || {
                    let mut file = std::fs::File::open(&image)
                        .map_err(|e| super::local::io_error(&image, e))?;
                    walk(&mut file)
                })
                .await
                .map_err(|e| FsError::backend(format!("image walk task failed: {e}")))??;
                info!(image = %self.image.display(), entries = walk.entries.len(), "walked iso image");
                Ok::<_, FsError>(Arc::new(Catalog::from_walk(walk)))
            })
            .await?;
        Ok(catalog.clone())
    }
}

fn entry_attr(entry: &IsoEntry) -> FileAttr {
    if entry.is_dir {
        FileAttr::directory(entry.modified)
    } else {
        FileAttr::file(entry.size as i64, entry.modified)
    }
}

/// Factory for `iso://` handles. Archives stay shared while any handle
/// into them is alive.
#[derive(Debug, Default)]
pub struct IsoFactory {
    archives: DashMap<PathBuf, Weak<IsoArchive>>,
}

impl IsoFactory {
    fn archive(&self, image: PathBuf) -> Arc<IsoArchive> {
        let mut slot = self.archives.entry(image.clone()).or_default();
        if let Some(live) = slot.upgrade() {
            return live;
        }
        debug!(image = %image.display(), "opening iso archive");
        let archive = Arc::new(IsoArchive::new(image));
        *slot = Arc::downgrade(&archive);
        archive
    }
}

impl FileFactory for IsoFactory {
    fn create(
        &self,
        address: Address,
        parent: Option<FileRef>,
        ctx: &ResolveContext,
    ) -> FsResult<FileRef> {
        let (image, inner) = split_image_path(address.path()).ok_or_else(|| {
            FsError::invalid_target(format!("{address} does not name an .iso image"))
        })?;
        let attr = if inner == "/" {
            FileAttr::directory(None)
        } else {
            FileAttr::unknown(FileKind::Unknown)
        };
        Ok(share(IsoFile {
            core: HandleCore::new(address, attr, ctx, parent),
            archive: self.archive(PathBuf::from(image)),
            inner,
        }))
    }
}

/// The image root or an entry inside it.
#[derive(Debug)]
pub struct IsoFile {
    core: HandleCore,
    archive: Arc<IsoArchive>,
    inner: String,
}

impl IsoFile {
    pub fn archive(&self) -> &Arc<IsoArchive> {
        &self.archive
    }

    fn is_image_root(&self) -> bool {
        self.inner == "/"
    }

    async fn entry(&self) -> FsResult<IsoEntry> {
        let catalog = self.archive.catalog().await?;
        catalog
            .get(&self.inner)
            .cloned()
            .ok_or_else(|| FsError::not_found(self.address().to_string()))
    }

    async fn open_entry(&self) -> FsResult<RangeReader> {
        if self.is_image_root() {
            return Err(FsError::invalid_target(format!(
                "{} is a directory",
                self.address()
            )));
        }
        let entry = self.entry().await?;
        if entry.is_dir {
            return Err(FsError::invalid_target(format!(
                "{} is a directory",
                self.address()
            )));
        }
        let block_size = self.archive.catalog().await?.block_size;
        let file = tokio::fs::File::open(&self.archive.image)
            .await
            .map_err(|e| super::local::io_error(&self.archive.image, e))?;
        Ok(RangeReader::new(file, entry.offset(block_size), entry.size))
    }
}

#[async_trait]
impl FileHandle for IsoFile {
    fn core(&self) -> &HandleCore {
        &self.core
    }

    fn capabilities(&self) -> Capabilities {
        container_capabilities(ISO_CAPABILITIES, &self.core.attr())
    }

    /// The image root's parent is the directory holding the image file.
    fn parent_address(&self) -> Option<Address> {
        if self.is_image_root() {
            let dir = self.archive.image.parent()?;
            return Some(Address::local(&dir.to_string_lossy()));
        }
        self.address().parent()
    }

    async fn refresh(&self) -> FsResult<FileAttr> {
        let attr = if self.is_image_root() {
            self.archive.catalog().await?;
            FileAttr::directory(None)
        } else {
            match self.archive.catalog().await?.get(&self.inner) {
                Some(entry) => entry_attr(entry),
                None => FileAttr::missing(FileKind::File),
            }
        };
        self.core.set_attr(attr.clone());
        Ok(attr)
    }

    async fn list(&self) -> FsResult<Vec<FileRef>> {
        if !self.is_image_root() {
            let entry = self.entry().await?;
            require_container(self.address(), &entry_attr(&entry))?;
        }
        let catalog = self.archive.catalog().await?;
        let ctx = self.core.context();
        let me = self.core.self_ref();
        let children = catalog
            .children(&self.inner)
            .map(|entry| {
                let name = entry.path.rsplit('/').next().unwrap_or(&entry.path);
                share(IsoFile {
                    core: HandleCore::new(
                        self.address().child(name),
                        entry_attr(entry),
                        &ctx,
                        me.clone(),
                    ),
                    archive: self.archive.clone(),
                    inner: entry.path.clone(),
                })
            })
            .collect();
        Ok(children)
    }

    async fn input_stream(&self) -> FsResult<Box<dyn ReadStream>> {
        Ok(Box::new(self.open_entry().await?))
    }

    async fn random_input(&self) -> FsResult<Box<dyn RandomRead>> {
        Ok(Box::new(self.open_entry().await?))
    }
}

/// Seekable window onto a byte range of a file.
pub struct RangeReader {
    file: tokio::fs::File,
    start: u64,
    len: u64,
    pos: u64,
    synced: bool,
}

impl RangeReader {
    pub fn new(file: tokio::fs::File, start: u64, len: u64) -> Self {
        Self {
            file,
            start,
            len,
            pos: 0,
            synced: false,
        }
    }
}

#[async_trait]
impl ReadStream for RangeReader {
    async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        if !self.synced {
            self.file.seek(SeekFrom::Start(self.start + self.pos)).await?;
            self.synced = true;
        }
        let want = buf.len().min((self.len - self.pos) as usize);
        let n = self.file.read(&mut buf[..want]).await?;
        self.pos += n as u64;
        Ok(n)
    }
}

#[async_trait]
impl RandomRead for RangeReader {
    async fn seek(&mut self, pos: u64) -> FsResult<()> {
        self.pos = pos;
        self.synced = false;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn len(&self) -> u64 {
        self.len
    }
}
