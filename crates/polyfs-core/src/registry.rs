//! Scheme → backend factory routing.
//!
//! Resolution never opens a connection: factories build handles from the
//! address alone, and pool-backed handles connect on first use.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use polyfs_types::Address;
use tracing::{debug, trace};

use crate::credentials::{CredentialStore, NoCredentials};
use crate::error::{FsError, FsResult};
use crate::handle::FileRef;

/// Builds handles for one scheme.
pub trait FileFactory: Send + Sync + fmt::Debug {
    /// Build a handle. `parent`, when given, is cached by the handle and never
    /// recomputed. Must not perform network I/O.
    fn create(
        &self,
        address: Address,
        parent: Option<FileRef>,
        ctx: &ResolveContext,
    ) -> FsResult<FileRef>;
}

/// What a factory needs to let its handles resolve further addresses
/// (parents, children in other schemes) later on.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    registry: Weak<BackendRegistry>,
}

impl ResolveContext {
    pub fn new(registry: Weak<BackendRegistry>) -> Self {
        Self { registry }
    }

    /// Context with no registry behind it. Parents of handles built with it
    /// cannot be resolved.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> Weak<BackendRegistry> {
        self.registry.clone()
    }

    /// Resolve through the registry this context came from.
    pub fn resolve(&self, address: &Address, parent: Option<FileRef>) -> FsResult<FileRef> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| FsError::backend(format!("registry gone while resolving {address}")))?;
        registry.resolve(address, parent)
    }
}

/// Maps schemes to factories.
pub struct BackendRegistry {
    factories: RwLock<HashMap<String, Arc<dyn FileFactory>>>,
    credentials: Arc<dyn CredentialStore>,
    me: Weak<BackendRegistry>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

impl BackendRegistry {
    /// Empty registry with no credential source.
    pub fn new() -> Arc<Self> {
        Self::with_credentials(Arc::new(NoCredentials))
    }

    pub fn with_credentials(credentials: Arc<dyn CredentialStore>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            factories: RwLock::new(HashMap::new()),
            credentials,
            me: me.clone(),
        })
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Register a factory. Replaces any factory already registered for the
    /// scheme; registering the same pair twice is a no-op.
    pub fn register(&self, scheme: &str, factory: Arc<dyn FileFactory>) {
        let scheme = scheme.to_ascii_lowercase();
        debug!(scheme = %scheme, "registering backend");
        self.factories.write().insert(scheme, factory);
    }

    /// Remove `factory` from `scheme`, but only if it is still the one
    /// registered. Returns whether anything was removed.
    pub fn unregister(&self, scheme: &str, factory: &Arc<dyn FileFactory>) -> bool {
        let scheme = scheme.to_ascii_lowercase();
        let mut factories = self.factories.write();
        match factories.get(&scheme) {
            Some(current) if Arc::ptr_eq(current, factory) => {
                factories.remove(&scheme);
                debug!(scheme = %scheme, "unregistered backend");
                true
            }
            _ => false,
        }
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }

    pub fn is_registered(&self, scheme: &str) -> bool {
        self.factories
            .read()
            .contains_key(&scheme.to_ascii_lowercase())
    }

    fn factory(&self, scheme: &str) -> FsResult<Arc<dyn FileFactory>> {
        self.factories
            .read()
            .get(scheme)
            .cloned()
            .ok_or_else(|| FsError::UnknownScheme(scheme.to_string()))
    }

    /// Build a handle for `address`. Missing credentials are filled from the
    /// credential store.
    pub fn resolve(&self, address: &Address, parent: Option<FileRef>) -> FsResult<FileRef> {
        let factory = self.factory(address.scheme())?;
        let address = match address.credentials() {
            Some(_) => address.clone(),
            None => match self.credentials.lookup(address) {
                Some(creds) => {
                    trace!(address = %address, "filled credentials from store");
                    address.clone().with_credentials(Some(creds))
                }
                None => address.clone(),
            },
        };
        let ctx = ResolveContext::new(self.me.clone());
        factory.create(address, parent, &ctx)
    }

    /// Parse and resolve.
    pub fn resolve_str(&self, input: &str) -> FsResult<FileRef> {
        let address = Address::parse(input)?;
        self.resolve(&address, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{FileHandle, HandleCore, share};
    use polyfs_types::{Capabilities, FileAttr, FileKind};

    #[derive(Debug)]
    struct Dummy {
        core: HandleCore,
    }

    impl FileHandle for Dummy {
        fn core(&self) -> &HandleCore {
            &self.core
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::NONE
        }
    }

    #[derive(Debug)]
    struct DummyFactory;

    impl FileFactory for DummyFactory {
        fn create(
            &self,
            address: Address,
            parent: Option<FileRef>,
            ctx: &ResolveContext,
        ) -> FsResult<FileRef> {
            let attr = FileAttr::unknown(FileKind::File);
            Ok(share(Dummy {
                core: HandleCore::new(address, attr, ctx, parent),
            }))
        }
    }

    #[test]
    fn test_unknown_scheme() {
        let registry = BackendRegistry::new();
        let err = registry.resolve_str("gopher://host/x").unwrap_err();
        assert!(matches!(err, FsError::UnknownScheme(s) if s == "gopher"));
    }

    #[test]
    fn test_register_last_writer_wins_and_exact_unregister() {
        let registry = BackendRegistry::new();
        let first: Arc<dyn FileFactory> = Arc::new(DummyFactory);
        let second: Arc<dyn FileFactory> = Arc::new(DummyFactory);

        registry.register("mem", first.clone());
        registry.register("MEM", second.clone());
        assert_eq!(registry.schemes(), vec!["mem".to_string()]);

        // Stale factory does not remove the current one.
        assert!(!registry.unregister("mem", &first));
        assert!(registry.is_registered("mem"));

        assert!(registry.unregister("mem", &second));
        assert!(!registry.unregister("mem", &second));
        assert!(!registry.is_registered("mem"));
    }

    #[test]
    fn test_resolve_fills_credentials() {
        use crate::credentials::MemoryCredentialStore;
        use polyfs_types::Credentials;

        let store = Arc::new(MemoryCredentialStore::new());
        store.store(
            &Address::parse("mem://box/").unwrap(),
            Credentials::new("alice", Some("s3cret".into())),
        );
        let registry = BackendRegistry::with_credentials(store);
        registry.register("mem", Arc::new(DummyFactory));

        let handle = registry.resolve_str("mem://box/a/b").unwrap();
        assert_eq!(handle.address().credentials().unwrap().login(), "alice");

        let explicit = registry.resolve_str("mem://bob@box/a").unwrap();
        assert_eq!(explicit.address().credentials().unwrap().login(), "bob");
    }
}
