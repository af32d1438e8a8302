//! Credential lookup by realm.
//!
//! The registry asks the store for credentials whenever an address arrives
//! without any. Prompting, keychains and persistence are the embedder's
//! business; [`MemoryCredentialStore`] covers tests and the CLI.

use std::fmt;

use dashmap::DashMap;
use polyfs_types::{Address, Credentials, RealmKey};
use tracing::debug;

/// "Do you have credentials for this realm?"
pub trait CredentialStore: Send + Sync + fmt::Debug {
    /// Credentials for the address's realm, searching from the address up to
    /// its root so a login saved for `ovirt://engine/` covers every disk.
    fn lookup(&self, address: &Address) -> Option<Credentials>;

    /// Remember credentials that worked.
    fn store(&self, address: &Address, credentials: Credentials);

    /// Forget credentials, typically after an authentication rejection.
    fn forget(&self, address: &Address);
}

/// Credential store that never knows anything.
#[derive(Debug, Default)]
pub struct NoCredentials;

impl CredentialStore for NoCredentials {
    fn lookup(&self, _address: &Address) -> Option<Credentials> {
        None
    }

    fn store(&self, _address: &Address, _credentials: Credentials) {}

    fn forget(&self, _address: &Address) {}
}

/// In-memory store keyed by realm root.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: DashMap<RealmKey, Credentials>,
}

impl fmt::Debug for MemoryCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCredentialStore")
            .field("realms", &self.entries.len())
            .finish()
    }
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn lookup(&self, address: &Address) -> Option<Credentials> {
        let mut cursor = Some(address.clone());
        while let Some(addr) = cursor {
            if let Some(found) = self.entries.get(&addr.realm_key()) {
                return Some(found.clone());
            }
            cursor = addr.parent();
        }
        None
    }

    fn store(&self, address: &Address, credentials: Credentials) {
        debug!(realm = %address.root().realm_key(), "storing credentials");
        self.entries.insert(address.root().realm_key(), credentials);
    }

    fn forget(&self, address: &Address) {
        self.entries.remove(&address.root().realm_key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_to_root() {
        let store = MemoryCredentialStore::new();
        let engine = Address::parse("ovirt://engine/").unwrap();
        store.store(&engine, Credentials::new("admin@internal", Some("pw".into())));

        let disk = Address::parse("ovirt://ENGINE/data1/disk-a").unwrap();
        let found = store.lookup(&disk).unwrap();
        assert_eq!(found.login(), "admin@internal");

        let other = Address::parse("ovirt://other/data1").unwrap();
        assert!(store.lookup(&other).is_none());

        store.forget(&disk);
        assert!(store.lookup(&disk).is_none());
    }
}
