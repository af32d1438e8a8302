//! Backend implementations.
//!
//! Each backend exposes a `SCHEME` constant, a [`crate::registry::FileFactory`]
//! and its handle types. Pool-backed backends (registry, ovirt) also expose
//! the connection type their pool holds.

pub mod iso;
pub mod local;
pub mod nfs;
pub mod ovirt;
pub mod registry;

pub use iso::IsoFactory;
pub use local::{LocalFactory, local_address};
pub use nfs::{MountedNfsClient, NfsClient, NfsFactory};
pub use ovirt::{OvirtApi, OvirtFactory, RestApi};
pub use registry::RegistryFactory;
