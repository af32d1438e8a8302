//! The capability-typed file handle contract.
//!
//! Every backend implements [`FileHandle`]. Operations a backend does not
//! override fail with [`FsError::Unsupported`], and every backend's
//! [`FileHandle::capabilities`] must agree with what it overrides, so callers
//! can check before they try.
//!
//! Shared per-handle state (address, attribute snapshot, parent cache, weak
//! self reference) lives in [`HandleCore`], which each backend embeds.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;
use polyfs_types::{Address, Capabilities, Capability, FileAttr};
use tokio::sync::OnceCell;
use tracing::trace;

use crate::error::{FsError, FsResult};
use crate::registry::{BackendRegistry, ResolveContext};
use crate::stream::{GrowOnlyWrite, RandomRead, RandomWrite, ReadStream, WriteStream};

/// Shared, type-erased handle.
pub type FileRef = Arc<dyn FileHandle>;

/// Wrap a freshly built handle and bind its weak self reference.
///
/// Every backend constructs handles through this so `list()` can hand its
/// children a ready-made parent.
pub fn share<H: FileHandle + 'static>(handle: H) -> FileRef {
    let shared: FileRef = Arc::new(handle);
    let _ = shared.core().me.set(Arc::downgrade(&shared));
    shared
}

/// `caps` without [`Capability::List`] once `attr` shows an existing file or
/// symlink. An unknown kind keeps `List`.
pub fn container_capabilities(caps: Capabilities, attr: &FileAttr) -> Capabilities {
    if attr.exists && attr.kind.is_leaf() {
        caps.without(Capability::List)
    } else {
        caps
    }
}

/// Refuse to list a handle whose fresh attributes show a non-container.
pub fn require_container(address: &Address, attr: &FileAttr) -> FsResult<()> {
    if attr.exists && attr.kind.is_leaf() {
        return Err(FsError::unsupported(Capability::List, address));
    }
    Ok(())
}

/// State every handle carries.
pub struct HandleCore {
    address: Address,
    attr: RwLock<FileAttr>,
    parent: OnceCell<Option<FileRef>>,
    registry: Weak<BackendRegistry>,
    me: OnceLock<Weak<dyn FileHandle>>,
}

impl fmt::Debug for HandleCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleCore")
            .field("address", &self.address)
            .field("parent_resolved", &self.parent.initialized())
            .finish_non_exhaustive()
    }
}

impl HandleCore {
    /// Core for a handle resolved through a registry.
    ///
    /// A `parent` supplied here is cached immediately and never recomputed.
    pub fn new(
        address: Address,
        attr: FileAttr,
        ctx: &ResolveContext,
        parent: Option<FileRef>,
    ) -> Self {
        Self {
            address,
            attr: RwLock::new(attr),
            parent: match parent {
                Some(p) => OnceCell::new_with(Some(Some(p))),
                None => OnceCell::new(),
            },
            registry: ctx.registry(),
            me: OnceLock::new(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Last-known attributes.
    pub fn attr(&self) -> FileAttr {
        self.attr.read().clone()
    }

    pub fn set_attr(&self, attr: FileAttr) {
        *self.attr.write() = attr;
    }

    /// Strong reference to the handle owning this core, if built via [`share`].
    pub fn self_ref(&self) -> Option<FileRef> {
        self.me.get().and_then(Weak::upgrade)
    }

    /// A context that resolves through the same registry as this handle.
    pub fn context(&self) -> ResolveContext {
        ResolveContext::new(self.registry.clone())
    }

    /// True once the parent has been computed (or was supplied).
    pub fn parent_resolved(&self) -> bool {
        self.parent.initialized()
    }

    /// Resolve the parent at most once; later calls return the cached outcome,
    /// including a cached "no parent".
    pub async fn parent(&self, parent_address: Option<Address>) -> FsResult<Option<FileRef>> {
        let resolved = self
            .parent
            .get_or_try_init(|| async {
                let Some(parent_address) = parent_address else {
                    return Ok(None);
                };
                let registry = self.registry.upgrade().ok_or_else(|| {
                    FsError::backend(format!("no registry to resolve parent of {}", self.address))
                })?;
                trace!(address = %self.address, parent = %parent_address, "resolving parent");
                registry.resolve(&parent_address, None).map(Some)
            })
            .await?;
        Ok(resolved.clone())
    }
}

/// Capability-typed file handle.
///
/// Query methods read the attribute snapshot and never touch the network;
/// [`FileHandle::refresh`] re-reads it from the backend.
#[async_trait]
pub trait FileHandle: Send + Sync + fmt::Debug {
    fn core(&self) -> &HandleCore;

    /// Operations this handle supports.
    fn capabilities(&self) -> Capabilities;

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(capability)
    }

    fn address(&self) -> &Address {
        self.core().address()
    }

    /// Last path segment, empty for a root.
    fn name(&self) -> &str {
        self.address().file_name().unwrap_or("")
    }

    fn extension(&self) -> Option<&str> {
        self.address().extension()
    }

    fn attr(&self) -> FileAttr {
        self.core().attr()
    }

    fn is_directory(&self) -> bool {
        self.attr().is_dir()
    }

    fn is_symlink(&self) -> bool {
        self.attr().is_symlink()
    }

    /// Size in bytes, `-1` if unknown.
    fn size(&self) -> i64 {
        self.attr().size
    }

    fn modified(&self) -> Option<SystemTime> {
        self.attr().modified
    }

    fn permissions(&self) -> Option<u32> {
        self.attr().permissions
    }

    fn owner(&self) -> FsResult<Option<String>> {
        if !self.supports(Capability::GetOwner) {
            return Err(FsError::unsupported(Capability::GetOwner, self.address()));
        }
        Ok(self.attr().owner)
    }

    fn group(&self) -> FsResult<Option<String>> {
        if !self.supports(Capability::GetGroup) {
            return Err(FsError::unsupported(Capability::GetGroup, self.address()));
        }
        Ok(self.attr().group)
    }

    /// Address `parent()` resolves. Container entries override this when
    /// their logical parent differs from the path parent.
    fn parent_address(&self) -> Option<Address> {
        self.address().parent()
    }

    /// Parent handle, resolved at most once and cached.
    async fn parent(&self) -> FsResult<Option<FileRef>> {
        self.core().parent(self.parent_address()).await
    }

    /// Re-read attributes from the backend and update the snapshot.
    async fn refresh(&self) -> FsResult<FileAttr> {
        Ok(self.attr())
    }

    async fn exists(&self) -> bool {
        self.refresh().await.map(|a| a.exists).unwrap_or(false)
    }

    async fn list(&self) -> FsResult<Vec<FileRef>> {
        Err(FsError::unsupported(Capability::List, self.address()))
    }

    async fn input_stream(&self) -> FsResult<Box<dyn ReadStream>> {
        Err(FsError::unsupported(Capability::Read, self.address()))
    }

    async fn output_stream(&self) -> FsResult<Box<dyn WriteStream>> {
        Err(FsError::unsupported(Capability::Write, self.address()))
    }

    async fn append_stream(&self) -> FsResult<Box<dyn WriteStream>> {
        Err(FsError::unsupported(Capability::Append, self.address()))
    }

    async fn random_input(&self) -> FsResult<Box<dyn RandomRead>> {
        Err(FsError::unsupported(Capability::RandomRead, self.address()))
    }

    async fn random_output(&self) -> FsResult<Box<dyn RandomWrite>> {
        Err(FsError::unsupported(Capability::RandomWrite, self.address()))
    }

    async fn grow_only_output(&self) -> FsResult<Box<dyn GrowOnlyWrite>> {
        Err(FsError::unsupported(
            Capability::GrowOnlyRandomWrite,
            self.address(),
        ))
    }

    async fn mkdir(&self) -> FsResult<()> {
        Err(FsError::unsupported(Capability::Mkdir, self.address()))
    }

    async fn delete(&self) -> FsResult<()> {
        Err(FsError::unsupported(Capability::Delete, self.address()))
    }

    async fn rename_to(&self, _target: &dyn FileHandle) -> FsResult<()> {
        Err(FsError::unsupported(Capability::Rename, self.address()))
    }

    async fn copy_remotely_to(&self, _target: &dyn FileHandle) -> FsResult<()> {
        Err(FsError::unsupported(Capability::CopyRemotely, self.address()))
    }

    async fn change_date(&self, _modified: SystemTime) -> FsResult<()> {
        Err(FsError::unsupported(Capability::ChangeDate, self.address()))
    }

    async fn change_permissions(&self, _permissions: u32) -> FsResult<()> {
        Err(FsError::unsupported(
            Capability::ChangePermissions,
            self.address(),
        ))
    }

    async fn free_space(&self) -> FsResult<u64> {
        Err(FsError::unsupported(Capability::GetFreeSpace, self.address()))
    }

    async fn total_space(&self) -> FsResult<u64> {
        Err(FsError::unsupported(Capability::GetTotalSpace, self.address()))
    }
}

/// Precondition check shared by same-backend rename and copy.
///
/// The target must live in the same backend realm (same scheme, host, port)
/// and must not be the source itself or one of its descendants.
pub fn check_same_backend_target(
    source: &dyn FileHandle,
    target: &dyn FileHandle,
    operation: Capability,
) -> FsResult<()> {
    let from = source.address();
    let to = target.address();
    if from.root().realm_key() != to.root().realm_key() {
        return Err(FsError::unsupported(operation, from));
    }
    if from.realm_eq(to) {
        return Err(FsError::invalid_target(format!("{from} is the source itself")));
    }
    if from.is_ancestor_of(to) {
        return Err(FsError::invalid_target(format!(
            "{to} is inside {from}"
        )));
    }
    Ok(())
}
