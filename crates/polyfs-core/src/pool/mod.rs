//! Pooled, serialised access to stateful remote sessions.
//!
//! Expensive sessions (an oVirt SSO login, a registry helper session) are
//! shared by every handle of the same realm. Each realm gets one
//! [`ConnectionHandle`] whose session slot is behind an async mutex: holding a
//! [`ConnectionGuard`] is holding the lock, and dropping it releases the lock
//! on every exit path.
//!
//! # Architecture
//!
//! ```text
//! ConnectionPool<C>
//!     │
//!     ├── realm ovirt://engine-a/ ──► ConnectionHandle ──► Mutex<Option<C>>
//!     │                                   state, last_used, uses
//!     │
//!     └── realm ovirt://engine-b/ ──► ConnectionHandle ──► Mutex<Option<C>>
//! ```
//!
//! # States
//!
//! `Disconnected → Connecting → Connected ⇄ Locked → Closed`. A failed
//! connect closes the handle and discards it: callers already queued on its
//! lock get `None` and retry onto the realm's replacement handle, so a realm
//! never has two lock holders. Closed handles (failed connect, explicit close
//! or idle eviction) are removed from the pool.

mod retry;

pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use polyfs_types::{Address, RealmKey};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{FsError, FsResult};

/// Bound on `lock()` retries when the handle is closed under us.
const MAX_LOCK_RETRIES: usize = 8;

/// A live remote session.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Cheap liveness check issued before reusing the session.
    async fn keep_alive(&mut self) -> FsResult<()>;

    /// Tear the session down.
    async fn disconnect(&mut self) -> FsResult<()> {
        Ok(())
    }
}

/// Opens sessions for a backend.
#[async_trait]
pub trait Connector<C: Connection>: Send + Sync + fmt::Debug {
    async fn connect(&self, address: &Address) -> FsResult<C>;
}

/// Lifecycle state of a [`ConnectionHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Locked,
    Closed,
}

struct Meta {
    state: ConnectionState,
    last_used: Instant,
    uses: u64,
}

/// One realm's session slot plus its bookkeeping.
pub struct ConnectionHandle<C: Connection> {
    key: RealmKey,
    address: Address,
    connector: Arc<dyn Connector<C>>,
    slot: Arc<tokio::sync::Mutex<Option<C>>>,
    meta: Mutex<Meta>,
    pool: Weak<ConnectionPool<C>>,
}

impl<C: Connection> fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.meta.lock();
        f.debug_struct("ConnectionHandle")
            .field("key", &self.key)
            .field("state", &meta.state)
            .field("uses", &meta.uses)
            .finish()
    }
}

impl<C: Connection> ConnectionHandle<C> {
    pub fn key(&self) -> &RealmKey {
        &self.key
    }

    /// Address the handle was created for; carries the credentials used to
    /// connect.
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.meta.lock().state
    }

    /// Number of times the handle has been locked.
    pub fn uses(&self) -> u64 {
        self.meta.lock().uses
    }

    pub fn last_used(&self) -> Instant {
        self.meta.lock().last_used
    }

    pub fn is_locked(&self) -> bool {
        self.state() == ConnectionState::Locked
    }

    fn set_state(&self, state: ConnectionState) {
        self.meta.lock().state = state;
    }

    /// Wait for exclusive use of the session. `None` if the handle was closed
    /// while waiting.
    pub async fn lock(self: &Arc<Self>) -> Option<ConnectionGuard<C>> {
        let slot = self.slot.clone().lock_owned().await;
        {
            let mut meta = self.meta.lock();
            if meta.state == ConnectionState::Closed {
                return None;
            }
            meta.state = ConnectionState::Locked;
            meta.uses += 1;
        }
        Some(ConnectionGuard {
            handle: self.clone(),
            slot,
        })
    }
}

/// Exclusive access to a realm's session. Unlocks on drop.
pub struct ConnectionGuard<C: Connection> {
    handle: Arc<ConnectionHandle<C>>,
    slot: OwnedMutexGuard<Option<C>>,
}

impl<C: Connection> fmt::Debug for ConnectionGuard<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("key", &self.handle.key)
            .field("connected", &self.slot.is_some())
            .finish()
    }
}

impl<C: Connection> ConnectionGuard<C> {
    pub fn handle(&self) -> &Arc<ConnectionHandle<C>> {
        &self.handle
    }

    pub fn is_connected(&self) -> bool {
        self.slot.is_some()
    }

    /// Make sure the session is usable and return it.
    ///
    /// Connects if there is no session. Otherwise checks it with
    /// `keep_alive` and reconnects once if the check fails. A failed connect
    /// closes the handle and discards it from the pool.
    pub async fn check_connection(&mut self) -> FsResult<&mut C> {
        let alive = match self.slot.as_mut() {
            Some(session) => match session.keep_alive().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(realm = %self.handle.key, error = %e, "keep-alive failed, reconnecting");
                    false
                }
            },
            None => false,
        };

        if !alive {
            if let Some(mut stale) = self.slot.take() {
                if let Err(e) = stale.disconnect().await {
                    debug!(realm = %self.handle.key, error = %e, "disconnecting stale session");
                }
            }
            self.handle.set_state(ConnectionState::Connecting);
            match self.handle.connector.connect(&self.handle.address).await {
                Ok(session) => {
                    info!(realm = %self.handle.key, "connected");
                    *self.slot = Some(session);
                    self.handle.set_state(ConnectionState::Locked);
                }
                Err(e) => {
                    warn!(realm = %self.handle.key, error = %e, "connect failed");
                    self.handle.set_state(ConnectionState::Closed);
                    if let Some(pool) = self.handle.pool.upgrade() {
                        pool.remove(&self.handle);
                    }
                    return Err(e);
                }
            }
        }

        self.slot
            .as_mut()
            .ok_or_else(|| FsError::backend(format!("no session for {}", self.handle.key)))
    }

    /// Session without probing. Fails if not connected.
    pub fn session(&mut self) -> FsResult<&mut C> {
        let key = &self.handle.key;
        self.slot
            .as_mut()
            .ok_or_else(|| FsError::backend(format!("not connected to {key}")))
    }

    /// Disconnect the session and remove the handle from its pool.
    pub async fn close(mut self) -> FsResult<()> {
        let result = match self.slot.take() {
            Some(mut session) => session.disconnect().await,
            None => Ok(()),
        };
        self.handle.set_state(ConnectionState::Closed);
        if let Some(pool) = self.handle.pool.upgrade() {
            pool.remove(&self.handle);
        }
        debug!(realm = %self.handle.key, "connection closed");
        result
    }
}

impl<C: Connection> Drop for ConnectionGuard<C> {
    fn drop(&mut self) {
        let mut meta = self.handle.meta.lock();
        meta.last_used = Instant::now();
        if meta.state != ConnectionState::Closed {
            meta.state = if self.slot.is_some() {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
        }
    }
}

/// Housekeeping view of a pool, independent of its session type.
#[async_trait]
pub trait PoolMaintenance: Send + Sync {
    fn name(&self) -> &str;

    /// Close handles idle longer than the configured timeout.
    async fn evict_idle(&self) -> usize;

    async fn close_all(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start this pool's reaper; it stops once the pool is dropped.
    fn start_reaper(self: Arc<Self>) -> JoinHandle<()>;
}

/// Realm-keyed pool of [`ConnectionHandle`]s.
pub struct ConnectionPool<C: Connection> {
    name: String,
    config: PoolConfig,
    handles: Mutex<HashMap<RealmKey, Arc<ConnectionHandle<C>>>>,
    me: Weak<ConnectionPool<C>>,
}

impl<C: Connection> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("handles", &self.handles.lock().len())
            .finish()
    }
}

impl<C: Connection> ConnectionPool<C> {
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name: name.into(),
            config,
            handles: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pool key: the realm root, with the login when so configured.
    pub fn key_for(&self, address: &Address) -> RealmKey {
        let root = address.root();
        if self.config.credentials_in_key {
            root.realm_key_with_login()
        } else {
            root.realm_key()
        }
    }

    /// Existing handle for the address's realm, or a new one when
    /// `create_if_absent`.
    pub fn acquire(
        &self,
        address: &Address,
        connector: &Arc<dyn Connector<C>>,
        create_if_absent: bool,
    ) -> Option<Arc<ConnectionHandle<C>>> {
        let key = self.key_for(address);
        let mut handles = self.handles.lock();
        if let Some(existing) = handles.get(&key) {
            return Some(existing.clone());
        }
        if !create_if_absent {
            return None;
        }
        debug!(pool = %self.name, realm = %key, "new connection handle");
        let handle = Arc::new(ConnectionHandle {
            key: key.clone(),
            address: address.clone(),
            connector: connector.clone(),
            slot: Arc::new(tokio::sync::Mutex::new(None)),
            meta: Mutex::new(Meta {
                state: ConnectionState::Disconnected,
                last_used: Instant::now(),
                uses: 0,
            }),
            pool: self.me.clone(),
        });
        handles.insert(key, handle.clone());
        Some(handle)
    }

    /// Acquire-or-create the realm's handle and lock it.
    pub async fn lock(
        &self,
        address: &Address,
        connector: &Arc<dyn Connector<C>>,
    ) -> FsResult<ConnectionGuard<C>> {
        for _ in 0..MAX_LOCK_RETRIES {
            let Some(handle) = self.acquire(address, connector, true) else {
                break;
            };
            if let Some(guard) = handle.lock().await {
                return Ok(guard);
            }
            debug!(pool = %self.name, realm = %handle.key, "handle closed while waiting, retrying");
        }
        Err(FsError::backend(format!(
            "could not lock a connection for {address}"
        )))
    }

    /// Drop `handle` from the map if it is still the registered one.
    fn remove(&self, handle: &Arc<ConnectionHandle<C>>) {
        let mut handles = self.handles.lock();
        if handles
            .get(&handle.key)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            handles.remove(&handle.key);
        }
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<ConnectionHandle<C>>> {
        self.handles.lock().values().cloned().collect()
    }

    /// Close every unlocked handle idle for at least the idle timeout.
    /// Locked handles are skipped. Returns how many were closed.
    pub async fn evict_idle(&self) -> usize {
        let mut evicted = 0;
        for handle in self.snapshot() {
            let Ok(mut slot) = handle.slot.clone().try_lock_owned() else {
                continue;
            };
            {
                let mut meta = handle.meta.lock();
                if meta.state == ConnectionState::Closed
                    || meta.last_used.elapsed() < self.config.idle_timeout
                {
                    continue;
                }
                meta.state = ConnectionState::Closed;
            }
            if let Some(mut session) = slot.take() {
                if let Err(e) = session.disconnect().await {
                    warn!(pool = %self.name, realm = %handle.key, error = %e, "disconnect on eviction failed");
                }
            }
            self.remove(&handle);
            info!(pool = %self.name, realm = %handle.key, "evicted idle connection");
            evicted += 1;
        }
        evicted
    }

    /// Wait for and close every handle.
    pub async fn close_all(&self) {
        for handle in self.snapshot() {
            if let Some(guard) = handle.lock().await {
                if let Err(e) = guard.close().await {
                    warn!(pool = %self.name, realm = %handle.key, error = %e, "close failed");
                }
            }
        }
    }

    /// Periodically evict idle handles until the pool is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let period = self.config.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.evict_idle().await;
            }
        })
    }
}

#[async_trait]
impl<C: Connection> PoolMaintenance for ConnectionPool<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evict_idle(&self) -> usize {
        ConnectionPool::evict_idle(self).await
    }

    async fn close_all(&self) {
        ConnectionPool::close_all(self).await
    }

    fn len(&self) -> usize {
        ConnectionPool::len(self)
    }

    fn start_reaper(self: Arc<Self>) -> JoinHandle<()> {
        self.spawn_reaper()
    }
}
