//! The assembled layer: registry, pools and configuration in one place.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use polyfs_types::Address;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backends::iso::{self, IsoFactory};
use crate::backends::local::{self, LocalFactory};
use crate::backends::nfs::{self, MountedNfsClient, NfsFactory};
use crate::backends::ovirt::{self, OvirtFactory, RestApi};
use crate::backends::registry::{self, RegistryFactory, SkopeoConnector};
use crate::command::ProcessRunner;
use crate::config::VfsConfig;
use crate::credentials::{CredentialStore, MemoryCredentialStore};
use crate::error::FsResult;
use crate::handle::FileRef;
use crate::ordering::{FileComparator, SortCriterion};
use crate::pool::{ConnectionPool, PoolMaintenance};
use crate::registry::BackendRegistry;

/// Registry plus the pools its backends draw from.
pub struct Vfs {
    registry: Arc<BackendRegistry>,
    config: VfsConfig,
    pools: Vec<Arc<dyn PoolMaintenance>>,
}

impl fmt::Debug for Vfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pools: Vec<&str> = self.pools.iter().map(|p| p.name()).collect();
        f.debug_struct("Vfs")
            .field("registry", &self.registry)
            .field("pools", &pools)
            .finish()
    }
}

impl Vfs {
    /// Empty layer; register backends with [`Vfs::registry`].
    pub fn new(config: VfsConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            registry: BackendRegistry::with_credentials(credentials),
            config,
            pools: Vec::new(),
        }
    }

    /// Layer with every built-in backend registered and an in-memory
    /// credential store.
    pub fn with_default_backends(config: VfsConfig) -> Self {
        let mut vfs = Self::new(config, Arc::new(MemoryCredentialStore::new()));
        let config = vfs.config.clone();
        let registry = vfs.registry.clone();

        registry.register(local::SCHEME, Arc::new(LocalFactory));
        registry.register(
            nfs::SCHEME,
            Arc::new(NfsFactory::new(Arc::new(MountedNfsClient::new(
                config.nfs.mounts.clone(),
            )))),
        );
        registry.register(iso::SCHEME, Arc::new(IsoFactory::default()));

        let registry_pool = ConnectionPool::new("registry", config.registry_pool());
        let images = Arc::new(RegistryFactory::new(
            registry_pool.clone(),
            Arc::new(SkopeoConnector::new(
                Arc::new(ProcessRunner),
                config.registry.program.clone(),
            )),
            config.registry.temp_dir.clone(),
        ));
        registry.register(registry::DOCKER_SCHEME, images.clone());
        registry.register(registry::OCI_SCHEME, images);
        vfs.add_pool(registry_pool);

        let ovirt_pool = ConnectionPool::new("ovirt", config.pool.clone());
        registry.register(
            ovirt::SCHEME,
            Arc::new(OvirtFactory::new(
                Arc::new(RestApi::new(config.ovirt.request_timeout)),
                ovirt_pool.clone(),
                config.transfer.clone(),
            )),
        );
        vfs.add_pool(ovirt_pool);

        debug!(schemes = ?registry.schemes(), "backends registered");
        vfs
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        self.registry.credentials()
    }

    /// Track a pool for housekeeping and shutdown.
    pub fn add_pool(&mut self, pool: Arc<dyn PoolMaintenance>) {
        self.pools.push(pool);
    }

    pub fn pools(&self) -> &[Arc<dyn PoolMaintenance>] {
        &self.pools
    }

    pub fn resolve(&self, address: &Address) -> FsResult<FileRef> {
        self.registry.resolve(address, None)
    }

    pub fn resolve_str(&self, input: &str) -> FsResult<FileRef> {
        self.registry.resolve_str(input)
    }

    /// One reaper task per pool, ticking at the configured interval.
    pub fn spawn_housekeeping(&self) -> Vec<JoinHandle<()>> {
        self.pools
            .iter()
            .map(|pool| pool.clone().start_reaper())
            .collect()
    }

    /// Close every pooled session, all pools at once.
    pub async fn close_all(&self) {
        join_all(self.pools.iter().map(|pool| pool.close_all())).await;
    }

    /// Comparator for listings, using the configured locale and directory
    /// policy.
    pub fn comparator(&self, criterion: SortCriterion, ascending: bool) -> FsResult<FileComparator> {
        FileComparator::from_config(criterion, ascending, &self.config.ordering)
    }
}
