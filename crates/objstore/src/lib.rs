//! Client interface to a shared object store.
//!
//! An object in the store is a blob of data bytes plus an "omap": a sorted
//! key/value map maintained alongside the data. Reads and writes are batched
//! into operations which the store applies atomically, and every object
//! carries a version token which increments on each applied write. A write
//! operation may assert the version it expects, turning the read/write pair
//! into an optimistic compare-and-swap.
//!
//! The production store (a RADOS cluster or similar) lives behind the
//! [`Cluster`] and [`ObjectStore`] traits. The in-process [`mem`] store
//! implements the same contract for tests and embedders.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

pub mod mem;
mod ops;

pub use ops::{CreateMode, ReadOp, ReadResult, WriteOp};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("'{0}' already exists")]
    AlreadyExists(String),
    #[error("object version mismatch (asserted {asserted}, object at {actual})")]
    VersionMismatch { asserted: u64, actual: u64 },
    #[error("watch cookie {0} is not registered")]
    BadCookie(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A change notification delivered to a watch.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Identifies this notification for [`ObjectStore::notify_ack`].
    pub notify_id: u64,
    /// Identity of the notifying client.
    pub notifier: u64,
    pub payload: Bytes,
}

/// A registered watch on a single object.
///
/// Notifications are buffered until received. Dropping the handle does not
/// unregister the watch; call [`ObjectStore::unwatch`] with the cookie.
pub struct WatchHandle {
    cookie: u64,
    rx: tokio::sync::mpsc::UnboundedReceiver<Notification>,
}

impl WatchHandle {
    pub fn new(cookie: u64, rx: tokio::sync::mpsc::UnboundedReceiver<Notification>) -> Self {
        Self { cookie, rx }
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Receive the next notification. Returns None once the watch is
    /// unregistered or expired by the store.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

/// One pool/namespace of the store, scoping object ids.
///
/// Mirrors an io-context handle: all operations address objects by id within
/// the namespace the handle was opened on.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Atomically apply a batched read, returning the object's version token
    /// alongside the results.
    async fn read(&self, oid: &str, op: ReadOp) -> Result<ReadResult>;

    /// Atomically apply a batched write. Fails with [`Error::VersionMismatch`]
    /// when the op asserts a version the object has moved past, applying
    /// nothing.
    async fn write(&self, oid: &str, op: WriteOp) -> Result<()>;

    /// Register a watch on `oid`. The store may expire the watch after
    /// `timeout` of unresponsiveness; the caller re-registers.
    async fn watch(&self, oid: &str, timeout: Duration) -> Result<WatchHandle>;

    async fn unwatch(&self, cookie: u64) -> Result<()>;

    /// Publish a notification to every watch of `oid`. Best-effort: delivery
    /// is not awaited beyond `timeout` and failures surface only here.
    async fn notify(&self, oid: &str, payload: Bytes, timeout: Duration) -> Result<()>;

    /// Acknowledge a received notification, unblocking the notifier.
    async fn notify_ack(&self, oid: &str, notify_id: u64, cookie: u64) -> Result<()>;
}

/// A connection to the store as a whole: pool management and io-context
/// creation.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Create a pool. Surfaces [`Error::AlreadyExists`] when present; callers
    /// that want ensure-exists semantics tolerate it.
    async fn create_pool(&self, pool: &str) -> Result<()>;

    /// Open an io context on `pool` under `namespace`.
    async fn open(&self, pool: &str, namespace: Option<&str>) -> Result<Arc<dyn ObjectStore>>;
}
