//! Capability-typed virtual file layer.
//!
//! Files on the local disk, mounted NFS exports, ISO images, container
//! registries and oVirt storage domains are all reached through one
//! [`FileHandle`] contract. Each handle reports which operations it supports
//! and fails the rest with [`FsError::Unsupported`].
//!
//! # Architecture
//!
//! ```text
//! Vfs
//!  ├── BackendRegistry ── scheme ──► FileFactory ──► FileRef (Arc<dyn FileHandle>)
//!  │        └── CredentialStore
//!  └── ConnectionPool<C> per stateful backend
//!           └── realm ──► ConnectionHandle ──► ConnectionGuard (lock held)
//! ```
//!
//! Resolving an address never does I/O. Remote sessions are opened lazily
//! and shared per realm, one caller at a time.

pub mod backends;
pub mod command;
pub mod config;
pub mod credentials;
pub mod error;
pub mod handle;
pub mod ops;
pub mod ordering;
pub mod pool;
pub mod registry;
pub mod stream;
pub mod vfs;

pub use config::{ConfigError, VfsConfig};
pub use credentials::{CredentialStore, MemoryCredentialStore, NoCredentials};
pub use error::{ErrorKind, FsError, FsResult};
pub use handle::{
    FileHandle, FileRef, HandleCore, container_capabilities, require_container, share,
};
pub use ops::{CopyStats, copy_file, delete_tree, move_file};
pub use ordering::{FileComparator, SortCriterion, SortSpec, sort_handles};
pub use pool::{Connection, ConnectionGuard, ConnectionPool, Connector, PoolMaintenance, RetryPolicy};
pub use registry::{BackendRegistry, FileFactory, ResolveContext};
pub use stream::{ReadStream, WriteStream, copy_stream};
pub use vfs::Vfs;

pub use polyfs_types::{Address, Capabilities, Capability, FileAttr, FileKind};
