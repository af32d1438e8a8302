//! File attribute snapshots.
//!
//! Backends fill in what they know; everything else stays unknown (`-1`
//! size, `None` elsewhere). Handles keep one of these as their last-known
//! state so listings can be sorted without a round trip per entry.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Size reported when a backend cannot tell.
pub const UNKNOWN_SIZE: i64 = -1;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory or other container (archive root, storage domain, image).
    Directory,
    /// Symbolic link.
    Symlink,
    /// Not determined yet; handles resolved without I/O start here.
    Unknown,
}

impl FileKind {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileKind::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileKind::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileKind::Symlink)
    }

    /// True for a kind known not to hold children.
    pub fn is_leaf(&self) -> bool {
        matches!(self, FileKind::File | FileKind::Symlink)
    }
}

/// File attributes (metadata).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttr {
    /// File type.
    pub kind: FileKind,
    /// Size in bytes, [`UNKNOWN_SIZE`] when unavailable.
    pub size: i64,
    /// Last modification time.
    pub modified: Option<SystemTime>,
    /// Unix permission bits (e.g., 0o644).
    pub permissions: Option<u32>,
    /// Owner name or numeric id.
    pub owner: Option<String>,
    /// Group name or numeric id.
    pub group: Option<String>,
    /// False once a backend has confirmed the entry is absent.
    pub exists: bool,
}

impl FileAttr {
    /// Attributes for a handle nothing is known about yet.
    pub fn unknown(kind: FileKind) -> Self {
        Self {
            kind,
            size: UNKNOWN_SIZE,
            modified: None,
            permissions: None,
            owner: None,
            group: None,
            exists: true,
        }
    }

    /// Create attributes for a regular file.
    pub fn file(size: i64, modified: Option<SystemTime>) -> Self {
        Self {
            size,
            modified,
            ..Self::unknown(FileKind::File)
        }
    }

    /// Create attributes for a directory.
    pub fn directory(modified: Option<SystemTime>) -> Self {
        Self {
            size: 0,
            modified,
            ..Self::unknown(FileKind::Directory)
        }
    }

    /// Attributes of something confirmed not to exist.
    pub fn missing(kind: FileKind) -> Self {
        Self {
            exists: false,
            ..Self::unknown(kind)
        }
    }

    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>, group: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self.group = Some(group.into());
        self
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}
