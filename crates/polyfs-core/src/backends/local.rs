//! Local filesystem backend (`file://`).
//!
//! The address path is the absolute host path. Every capability is
//! supported; owner, group and permissions come from the inode, space
//! figures from `statvfs`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use polyfs_types::{Address, Capabilities, Capability, FileAttr, FileKind};
use tokio::fs;
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::handle::{
    FileHandle, FileRef, HandleCore, check_same_backend_target, container_capabilities,
    require_container, share,
};
use crate::registry::{FileFactory, ResolveContext};
use crate::stream::{
    FileStream, GrowOnlyWrite, RandomRead, RandomWrite, ReadStream, TokioReader, TokioWriter,
    WriteStream,
};

pub const SCHEME: &str = "file";

/// Capabilities of a local directory; regular files and symlinks lack `List`.
pub const LOCAL_CAPABILITIES: Capabilities = Capabilities::of(&[
    Capability::Read,
    Capability::Write,
    Capability::Append,
    Capability::RandomRead,
    Capability::RandomWrite,
    Capability::GrowOnlyRandomWrite,
    Capability::List,
    Capability::Mkdir,
    Capability::Delete,
    Capability::Rename,
    Capability::CopyRemotely,
    Capability::ChangeDate,
    Capability::ChangePermissions,
    Capability::GetOwner,
    Capability::GetGroup,
    Capability::GetFreeSpace,
    Capability::GetTotalSpace,
]);

/// Address for a host path, made absolute and canonical when it exists.
///
/// Uses dunce so Windows paths stay free of `\\?\` prefixes.
pub fn local_address(path: &Path) -> FsResult<Address> {
    let absolute = match dunce::canonicalize(path) {
        Ok(p) => p,
        Err(_) if path.is_absolute() => path.to_path_buf(),
        Err(_) => std::env::current_dir()?.join(path),
    };
    Ok(Address::local(&absolute.to_string_lossy()))
}

/// Translate an I/O error on `path` into the layer's error type.
pub(crate) fn io_error(path: &Path, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::not_found(path.display().to_string()),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.display().to_string()),
        io::ErrorKind::NotADirectory => FsError::NotADirectory(path.display().to_string()),
        _ => FsError::Io(e),
    }
}

/// Convert std::fs::Metadata to FileAttr.
pub(crate) fn metadata_to_attr(meta: &std::fs::Metadata, with_owner: bool) -> FileAttr {
    let kind = if meta.file_type().is_symlink() {
        FileKind::Symlink
    } else if meta.is_dir() {
        FileKind::Directory
    } else {
        FileKind::File
    };
    let size = if kind.is_dir() { 0 } else { meta.len() as i64 };

    let mut attr = FileAttr {
        size,
        modified: meta.modified().ok(),
        ..FileAttr::unknown(kind)
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        attr.permissions = Some(meta.permissions().mode() & 0o7777);
        if with_owner {
            attr = attr.with_owner(meta.uid().to_string(), meta.gid().to_string());
        }
    }
    #[cfg(not(unix))]
    let _ = with_owner;

    attr
}

/// Stat without following symlinks. Absence is a result, not an error.
pub(crate) async fn stat_path(path: &Path, with_owner: bool) -> FsResult<FileAttr> {
    match fs::symlink_metadata(path).await {
        Ok(meta) => Ok(metadata_to_attr(&meta, with_owner)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(FileAttr::missing(FileKind::File)),
        Err(e) => Err(io_error(path, e)),
    }
}

/// Directory entries as (name, attributes).
pub(crate) async fn read_dir_attrs(
    path: &Path,
    with_owner: bool,
) -> FsResult<Vec<(String, FileAttr)>> {
    let mut dir = fs::read_dir(path).await.map_err(|e| io_error(path, e))?;
    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(path, e))? {
        let meta = entry.metadata().await.map_err(|e| io_error(path, e))?;
        entries.push((
            entry.file_name().to_string_lossy().into_owned(),
            metadata_to_attr(&meta, with_owner),
        ));
    }
    Ok(entries)
}

/// Free and total bytes of the filesystem holding `path`, off the runtime
/// threads.
pub(crate) async fn space(path: &Path) -> FsResult<(u64, u64)> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || statvfs_space(&path))
        .await
        .map_err(|e| FsError::backend(format!("statvfs task failed: {e}")))?
}

fn statvfs_space(path: &Path) -> FsResult<(u64, u64)> {
    #[cfg(unix)]
    {
        // Walk up to something that exists; a file about to be created
        // still has a filesystem.
        let mut existing = path;
        while !existing.exists() {
            existing = existing.parent().unwrap_or(Path::new("/"));
            if existing == Path::new("/") {
                break;
            }
        }
        let stat = rustix::fs::statvfs(existing).map_err(|e| FsError::Io(e.into()))?;
        let frsize = stat.f_frsize;
        Ok((stat.f_bavail * frsize, stat.f_blocks * frsize))
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Err(FsError::backend("filesystem statistics need a unix host"))
    }
}

pub(crate) async fn open_read(path: &Path) -> FsResult<fs::File> {
    fs::File::open(path).await.map_err(|e| io_error(path, e))
}

pub(crate) async fn open_write(path: &Path, append: bool, truncate: bool) -> FsResult<fs::File> {
    fs::OpenOptions::new()
        .read(!append)
        .write(true)
        .append(append)
        .create(true)
        .truncate(truncate)
        .open(path)
        .await
        .map_err(|e| io_error(path, e))
}

pub(crate) async fn set_modified(path: &Path, modified: SystemTime) -> FsResult<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::File::open(&path)
            .and_then(|f| f.set_modified(modified))
            .map_err(|e| io_error(&path, e))
    })
    .await
    .map_err(|e| FsError::backend(format!("set_modified task failed: {e}")))?
}

#[cfg(unix)]
pub(crate) async fn set_mode(path: &Path, permissions: u32) -> FsResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(permissions))
        .await
        .map_err(|e| io_error(path, e))
}

#[cfg(not(unix))]
pub(crate) async fn set_mode(path: &Path, _permissions: u32) -> FsResult<()> {
    Err(FsError::backend(format!(
        "cannot set unix permissions on {}",
        path.display()
    )))
}

/// Factory for `file://` handles.
///
/// [`FileFactory::create`] is synchronous, so the initial snapshot comes
/// from a single blocking `symlink_metadata` call. `refresh()` and every
/// later stat go through `tokio::fs`.
#[derive(Debug, Default)]
pub struct LocalFactory;

impl FileFactory for LocalFactory {
    fn create(
        &self,
        address: Address,
        parent: Option<FileRef>,
        ctx: &ResolveContext,
    ) -> FsResult<FileRef> {
        let path = PathBuf::from(address.path());
        let attr = match std::fs::symlink_metadata(&path) {
            Ok(meta) => metadata_to_attr(&meta, true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => FileAttr::missing(FileKind::File),
            Err(e) => return Err(io_error(&path, e)),
        };
        Ok(share(LocalFile {
            core: HandleCore::new(address, attr, ctx, parent),
            path,
        }))
    }
}

/// A file or directory on the host filesystem.
#[derive(Debug)]
pub struct LocalFile {
    core: HandleCore,
    path: PathBuf,
}

impl LocalFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn target_path(&self, target: &dyn FileHandle) -> PathBuf {
        PathBuf::from(target.address().path())
    }
}

#[async_trait]
impl FileHandle for LocalFile {
    fn core(&self) -> &HandleCore {
        &self.core
    }

    fn capabilities(&self) -> Capabilities {
        container_capabilities(LOCAL_CAPABILITIES, &self.core.attr())
    }

    async fn refresh(&self) -> FsResult<FileAttr> {
        let attr = stat_path(&self.path, true).await?;
        self.core.set_attr(attr.clone());
        Ok(attr)
    }

    async fn list(&self) -> FsResult<Vec<FileRef>> {
        require_container(self.address(), &self.refresh().await?)?;
        let ctx = self.core.context();
        let me = self.core.self_ref();
        let children = read_dir_attrs(&self.path, true)
            .await?
            .into_iter()
            .map(|(name, attr)| {
                let address = self.address().child(&name);
                share(LocalFile {
                    core: HandleCore::new(address, attr, &ctx, me.clone()),
                    path: self.path.join(&name),
                })
            })
            .collect();
        Ok(children)
    }

    async fn input_stream(&self) -> FsResult<Box<dyn ReadStream>> {
        Ok(Box::new(TokioReader::new(open_read(&self.path).await?)))
    }

    async fn output_stream(&self) -> FsResult<Box<dyn WriteStream>> {
        Ok(Box::new(TokioWriter::new(
            open_write(&self.path, false, true).await?,
        )))
    }

    async fn append_stream(&self) -> FsResult<Box<dyn WriteStream>> {
        Ok(Box::new(TokioWriter::new(
            open_write(&self.path, true, false).await?,
        )))
    }

    async fn random_input(&self) -> FsResult<Box<dyn RandomRead>> {
        Ok(Box::new(FileStream::new(open_read(&self.path).await?).await?))
    }

    async fn random_output(&self) -> FsResult<Box<dyn RandomWrite>> {
        let file = open_write(&self.path, false, false).await?;
        Ok(Box::new(FileStream::new(file).await?))
    }

    async fn grow_only_output(&self) -> FsResult<Box<dyn GrowOnlyWrite>> {
        let file = open_write(&self.path, false, false).await?;
        Ok(Box::new(FileStream::new(file).await?))
    }

    async fn mkdir(&self) -> FsResult<()> {
        fs::create_dir(&self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        self.refresh().await?;
        Ok(())
    }

    async fn delete(&self) -> FsResult<()> {
        let meta = fs::symlink_metadata(&self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        let removed = if meta.is_dir() {
            fs::remove_dir(&self.path).await
        } else {
            fs::remove_file(&self.path).await
        };
        removed.map_err(|e| io_error(&self.path, e))?;
        self.core.set_attr(FileAttr::missing(self.attr().kind));
        Ok(())
    }

    async fn rename_to(&self, target: &dyn FileHandle) -> FsResult<()> {
        check_same_backend_target(self, target, Capability::Rename)?;
        let to = self.target_path(target);
        debug!(from = %self.path.display(), to = %to.display(), "rename");
        fs::rename(&self.path, &to)
            .await
            .map_err(|e| io_error(&self.path, e))
    }

    async fn copy_remotely_to(&self, target: &dyn FileHandle) -> FsResult<()> {
        check_same_backend_target(self, target, Capability::CopyRemotely)?;
        if self.is_directory() {
            return Err(FsError::invalid_target(format!(
                "{} is a directory",
                self.address()
            )));
        }
        let to = self.target_path(target);
        fs::copy(&self.path, &to)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        Ok(())
    }

    async fn change_date(&self, modified: SystemTime) -> FsResult<()> {
        set_modified(&self.path, modified).await?;
        self.refresh().await?;
        Ok(())
    }

    async fn change_permissions(&self, permissions: u32) -> FsResult<()> {
        set_mode(&self.path, permissions).await?;
        self.refresh().await?;
        Ok(())
    }

    async fn free_space(&self) -> FsResult<u64> {
        space(&self.path).await.map(|(free, _)| free)
    }

    async fn total_space(&self) -> FsResult<u64> {
        space(&self.path).await.map(|(_, total)| total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BackendRegistry;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (Arc<BackendRegistry>, TempDir) {
        let registry = BackendRegistry::new();
        registry.register(SCHEME, Arc::new(LocalFactory));
        (registry, TempDir::new().unwrap())
    }

    fn resolve(registry: &BackendRegistry, path: &Path) -> FileRef {
        registry
            .resolve(&local_address(path).unwrap(), None)
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (registry, dir) = setup();
        let file = resolve(&registry, &dir.path().join("test.txt"));
        assert!(!file.exists().await);

        let mut out = file.output_stream().await.unwrap();
        out.write_all(b"hello world").await.unwrap();
        out.close().await.unwrap();

        let attr = file.refresh().await.unwrap();
        assert_eq!(attr.size, 11);
        assert!(file.owner().unwrap().is_some());

        let mut input = file.random_input().await.unwrap();
        input.seek(6).await.unwrap();
        assert_eq!(input.read_to_end().await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn test_append() {
        let (registry, dir) = setup();
        let path = dir.path().join("log.txt");
        std::fs::write(&path, "one\n").unwrap();
        let file = resolve(&registry, &path);

        let mut out = file.append_stream().await.unwrap();
        out.write_all(b"two\n").await.unwrap();
        out.close().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_mkdir_and_list() {
        let (registry, dir) = setup();
        let sub = resolve(&registry, &dir.path().join("subdir"));
        sub.mkdir().await.unwrap();
        assert!(sub.is_directory());
        std::fs::write(dir.path().join("root.txt"), "x").unwrap();

        let root = resolve(&registry, dir.path());
        let children = root.list().await.unwrap();
        let mut names: Vec<_> = children.iter().map(|c| c.name().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["root.txt", "subdir"]);

        // Children carry the listing handle as their parent.
        let parent = children[0].parent().await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&parent, &root));
    }

    #[tokio::test]
    async fn test_list_needs_a_directory() {
        let (registry, dir) = setup();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, "x").unwrap();
        let file = resolve(&registry, &path);

        assert!(!file.supports(Capability::List));
        let err = file.list().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);

        // Not yet created: listable in principle, fails as I/O.
        let ghost = resolve(&registry, &dir.path().join("later"));
        assert!(ghost.supports(Capability::List));
        assert_eq!(
            ghost.list().await.unwrap_err().kind(),
            crate::error::ErrorKind::IoFailure
        );

        // A file replacing a directory is caught on the next listing.
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let handle = resolve(&registry, &sub);
        assert!(handle.supports(Capability::List));
        std::fs::remove_dir(&sub).unwrap();
        std::fs::write(&sub, "now a file").unwrap();
        assert!(handle.list().await.unwrap_err().is_unsupported());
        assert!(!handle.supports(Capability::List));
    }

    #[tokio::test]
    async fn test_rename_and_descendant_rejected() {
        let (registry, dir) = setup();
        std::fs::write(dir.path().join("old.txt"), "content").unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();

        let old = resolve(&registry, &dir.path().join("old.txt"));
        let new = resolve(&registry, &dir.path().join("new.txt"));
        old.rename_to(new.as_ref()).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("new.txt")).unwrap(), "content");

        let d = resolve(&registry, &dir.path().join("d"));
        let inside = resolve(&registry, &dir.path().join("d/inner"));
        let err = d.rename_to(inside.as_ref()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidTarget);
    }

    #[tokio::test]
    async fn test_delete() {
        let (registry, dir) = setup();
        let path = dir.path().join("gone.txt");
        std::fs::write(&path, "x").unwrap();
        let file = resolve(&registry, &path);
        file.delete().await.unwrap();
        assert!(!path.exists());
        assert!(!file.attr().exists);
    }

    #[tokio::test]
    async fn test_random_write_truncates() {
        let (registry, dir) = setup();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, "hello world").unwrap();
        let file = resolve(&registry, &path);

        let mut out = file.random_output().await.unwrap();
        out.set_len(5).await.unwrap();
        out.close().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions_date_and_space() {
        let (registry, dir) = setup();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "x").unwrap();
        let file = resolve(&registry, &path);

        file.change_permissions(0o600).await.unwrap();
        assert_eq!(file.permissions(), Some(0o600));

        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000_000);
        file.change_date(when).await.unwrap();
        assert_eq!(file.modified(), Some(when));

        assert!(file.total_space().await.unwrap() >= file.free_space().await.unwrap());
    }

    #[tokio::test]
    async fn test_root_has_no_parent() {
        let (registry, _dir) = setup();
        let root = registry.resolve_str("file:///").unwrap();
        assert!(root.parent().await.unwrap().is_none());
        assert!(root.parent().await.unwrap().is_none());
    }
}
