//! Shared value types for polyfs.
//!
//! This crate has **no internal polyfs dependencies**. It is the leaf the
//! file-handle layer builds on.
//!
//! # Key Types
//!
//! |-------------------|-----------------------------------------------------|
//! | Type              | Purpose                                             |
//! |-------------------|-----------------------------------------------------|
//! | [`Address`]       | Parsed `scheme://user@host:port;props/path`         |
//! | [`RealmKey`]      | Credential-free identity used for pooling and auth  |
//! | [`Credentials`]   | Login + optional password                           |
//! | [`Capability`]    | One operation a file handle may support             |
//! | [`Capabilities`]  | Set of capabilities a handle reports                |
//! | [`FileAttr`]      | Snapshot of size, date, kind, permissions, owner    |
//! |-------------------|-----------------------------------------------------|

pub mod address;
pub mod attr;
pub mod capability;

pub use address::{Address, AddressError, Credentials, RealmKey};
pub use attr::{FileAttr, FileKind, UNKNOWN_SIZE};
pub use capability::{Capabilities, Capability};
