//! Cross-handle operations built on the capability contract.
//!
//! These pick the cheapest strategy the handles allow: a same-backend
//! rename or server-side copy when both ends share a realm, otherwise a
//! streamed copy through the client. Directories are walked with an explicit
//! worklist.

use polyfs_types::Capability;
use tracing::{debug, warn};

use crate::error::{FsError, FsResult};
use crate::handle::{FileHandle, FileRef};
use crate::stream::copy_stream;

/// Outcome of a copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
}

fn same_realm_root(a: &dyn FileHandle, b: &dyn FileHandle) -> bool {
    a.address().root().realm_key() == b.address().root().realm_key()
}

/// Refuse targets that are the source or lie inside it.
fn check_target(source: &dyn FileHandle, target: &dyn FileHandle) -> FsResult<()> {
    let (from, to) = (source.address(), target.address());
    if same_realm_root(source, target) && (from.realm_eq(to) || from.is_ancestor_of(to)) {
        return Err(FsError::invalid_target(format!(
            "cannot copy {from} into {to}"
        )));
    }
    Ok(())
}

fn require(handle: &dyn FileHandle, capability: Capability) -> FsResult<()> {
    if handle.supports(capability) {
        Ok(())
    } else {
        Err(FsError::unsupported(capability, handle.address()))
    }
}

/// Resolve `name` under `dir` through the registry `dir` came from.
fn child_of(dir: &FileRef, name: &str) -> FsResult<FileRef> {
    dir.core()
        .context()
        .resolve(&dir.address().child(name), Some(dir.clone()))
}

/// Stream one file's bytes. The writer is closed on every path; a close
/// failure after a copy failure is logged, not returned.
async fn stream_file(source: &dyn FileHandle, target: &dyn FileHandle) -> FsResult<u64> {
    require(source, Capability::Read)?;
    require(target, Capability::Write)?;
    let mut input = source.input_stream().await?;
    let mut output = target.output_stream().await?;
    match copy_stream(input.as_mut(), output.as_mut()).await {
        Ok(bytes) => {
            output.close().await?;
            Ok(bytes)
        }
        Err(e) => {
            if let Err(close) = output.close().await {
                warn!(target = %target.address(), error = %close, "closing failed copy target");
            }
            Err(e)
        }
    }
}

/// Try a server-side copy of one file. `Ok(None)` means the handles cannot
/// do it and the caller should stream instead. The byte count is the
/// target's size after the copy, or the source's current size when the
/// target cannot report one.
async fn copy_remotely(source: &dyn FileHandle, target: &dyn FileHandle) -> FsResult<Option<u64>> {
    if !same_realm_root(source, target) || !source.supports(Capability::CopyRemotely) {
        return Ok(None);
    }
    match source.copy_remotely_to(target).await {
        Ok(()) => {}
        Err(e) if e.is_unsupported() => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut size = target.refresh().await?.size;
    if size < 0 {
        size = source.refresh().await?.size;
    }
    Ok(Some(size.max(0) as u64))
}

/// Copy a file or directory tree to `target`.
///
/// Directories are recreated on the target side. Each file is copied
/// server-side when both ends share a realm and the source offers
/// `CopyRemotely`, and streamed through the client otherwise.
pub async fn copy_file(source: &FileRef, target: &FileRef) -> FsResult<CopyStats> {
    check_target(source.as_ref(), target.as_ref())?;
    if !source.refresh().await?.exists {
        return Err(FsError::not_found(source.address().to_string()));
    }

    let mut stats = CopyStats::default();
    let mut worklist = vec![(source.clone(), target.clone())];
    while let Some((from, to)) = worklist.pop() {
        if from.is_directory() {
            require(from.as_ref(), Capability::List)?;
            if !to.exists().await {
                require(to.as_ref(), Capability::Mkdir)?;
                to.mkdir().await?;
            }
            stats.directories += 1;
            for child in from.list().await? {
                let target_child = child_of(&to, child.name())?;
                worklist.push((child, target_child));
            }
            continue;
        }
        let bytes = match copy_remotely(from.as_ref(), to.as_ref()).await? {
            Some(bytes) => bytes,
            None => stream_file(from.as_ref(), to.as_ref()).await?,
        };
        stats.bytes += bytes;
        stats.files += 1;
    }
    debug!(from = %source.address(), to = %target.address(), ?stats, "copy finished");
    Ok(stats)
}

/// Delete a file or a whole directory tree, children first.
pub async fn delete_tree(root: &FileRef) -> FsResult<()> {
    require(root.as_ref(), Capability::Delete)?;
    let mut pending = vec![(root.clone(), false)];
    while let Some((handle, expanded)) = pending.pop() {
        if handle.is_directory() && !expanded {
            pending.push((handle.clone(), true));
            for child in handle.list().await? {
                pending.push((child, false));
            }
        } else {
            handle.delete().await?;
        }
    }
    Ok(())
}

/// Move `source` to `target`.
///
/// Tries a same-backend rename first and falls back to copy-then-delete
/// when the backend cannot rename across the two addresses.
pub async fn move_file(source: &FileRef, target: &FileRef) -> FsResult<()> {
    check_target(source.as_ref(), target.as_ref())?;
    if source.supports(Capability::Rename) && same_realm_root(source.as_ref(), target.as_ref()) {
        match source.rename_to(target.as_ref()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_unsupported() => {
                debug!(from = %source.address(), error = %e, "rename unavailable, copying");
            }
            Err(e) => return Err(e),
        }
    }
    require(source.as_ref(), Capability::Delete)?;
    copy_file(source, target).await?;
    delete_tree(source).await
}
