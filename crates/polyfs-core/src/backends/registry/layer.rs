//! Image layer blobs: tar archives, optionally gzip-compressed.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use tempfile::TempDir;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{FsError, FsResult};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One member of a layer archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    /// Absolute path inside the layer (`/etc/hosts`).
    pub path: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub mode: Option<u32>,
    pub is_dir: bool,
}

/// A downloaded layer blob and its lazily scanned member list.
///
/// Holds the listing's temp directory alive for as long as any handle into
/// the layer exists.
#[derive(Debug)]
pub struct LayerBlob {
    path: PathBuf,
    _dir: Arc<TempDir>,
    entries: OnceCell<Arc<BTreeMap<String, TarEntry>>>,
}

impl LayerBlob {
    pub fn new(path: PathBuf, dir: Arc<TempDir>) -> Self {
        Self {
            path,
            _dir: dir,
            entries: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn entries(&self) -> FsResult<Arc<BTreeMap<String, TarEntry>>> {
        let entries = self
            .entries
            .get_or_try_init(|| async {
                let path = self.path.clone();
                let scanned = blocking(move || scan(&path)).await?;
                debug!(layer = %self.path.display(), members = scanned.len(), "scanned layer");
                Ok::<_, FsError>(Arc::new(scanned))
            })
            .await?;
        Ok(entries.clone())
    }

    /// Direct members of the directory `dir` (`/` for the layer root).
    pub async fn children(&self, dir: &str) -> FsResult<Vec<TarEntry>> {
        let entries = self.entries().await?;
        Ok(entries
            .values()
            .filter(|e| parent_of(&e.path) == dir)
            .cloned()
            .collect())
    }

    /// Contents of the member at `inner`.
    pub async fn read(&self, inner: &str) -> FsResult<Vec<u8>> {
        let path = self.path.clone();
        let inner = inner.to_string();
        blocking(move || read_member(&path, &inner)).await
    }
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> FsResult<T> + Send + 'static,
) -> FsResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FsError::backend(format!("layer task failed: {e}")))?
}

pub(crate) fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// `./usr/bin/` → `/usr/bin`; `None` for the archive root itself.
fn member_path(raw: &Path) -> Option<String> {
    let joined = raw
        .to_string_lossy()
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/");
    (!joined.is_empty()).then(|| format!("/{joined}"))
}

/// Open a blob, transparently gunzipping it.
fn open_layer(path: &Path) -> FsResult<Box<dyn Read>> {
    let file = File::open(path).map_err(|e| crate::backends::local::io_error(path, e))?;
    let mut reader = BufReader::new(file);
    let gzipped = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    Ok(if gzipped {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    })
}

fn layer_error(path: &Path, e: std::io::Error) -> FsError {
    FsError::backend(format!("unreadable layer {}: {e}", path.display()))
}

fn scan(path: &Path) -> FsResult<BTreeMap<String, TarEntry>> {
    let mut archive = tar::Archive::new(open_layer(path)?);
    let mut entries = BTreeMap::new();
    for member in archive.entries().map_err(|e| layer_error(path, e))? {
        let member = member.map_err(|e| layer_error(path, e))?;
        let header = member.header();
        let raw = member.path().map_err(|e| layer_error(path, e))?;
        let Some(name) = member_path(&raw) else {
            continue;
        };
        let is_dir = header.entry_type().is_dir();
        let entry = TarEntry {
            path: name.clone(),
            size: if is_dir { 0 } else { header.size().unwrap_or(0) },
            modified: header
                .mtime()
                .ok()
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
            mode: header.mode().ok().map(|m| m & 0o7777),
            is_dir,
        };
        // Archives may omit directory members; synthesize them.
        let mut dir = parent_of(&name);
        while dir != "/" && !entries.contains_key(dir) {
            entries.insert(
                dir.to_string(),
                TarEntry {
                    path: dir.to_string(),
                    size: 0,
                    modified: None,
                    mode: None,
                    is_dir: true,
                },
            );
            dir = parent_of(dir);
        }
        entries.insert(name, entry);
    }
    Ok(entries)
}

fn read_member(path: &Path, inner: &str) -> FsResult<Vec<u8>> {
    let mut archive = tar::Archive::new(open_layer(path)?);
    for member in archive.entries().map_err(|e| layer_error(path, e))? {
        let mut member = member.map_err(|e| layer_error(path, e))?;
        let raw = member.path().map_err(|e| layer_error(path, e))?;
        if member_path(&raw).as_deref() != Some(inner) {
            continue;
        }
        if member.header().entry_type().is_dir() {
            return Err(FsError::invalid_target(format!("{inner} is a directory")));
        }
        let mut data = Vec::new();
        member
            .read_to_end(&mut data)
            .map_err(|e| layer_error(path, e))?;
        return Ok(data);
    }
    Err(FsError::not_found(inner.to_string()))
}
