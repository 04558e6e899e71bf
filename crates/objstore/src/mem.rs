//! In-process implementation of the store contract.
//!
//! Backs tests and embedders that don't link a real store client. Objects
//! live in a per-pool map guarded by one mutex; write ops apply atomically
//! under that lock, and watch fan-out rides unbounded channels so `notify`
//! never blocks on a slow watcher.

use crate::{
    CreateMode, Error, Notification, ObjectStore, ReadOp, ReadResult, Result, WatchHandle, WriteOp,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct Object {
    data: Bytes,
    omap: BTreeMap<String, Bytes>,
    version: u64,
}

struct Watcher {
    ns: String,
    oid: String,
    tx: mpsc::UnboundedSender<Notification>,
}

#[derive(Default)]
struct PoolState {
    // Keyed by (namespace, oid).
    objects: HashMap<(String, String), Object>,
    watchers: HashMap<u64, Watcher>,
    // (notify_id, cookie) pairs, in acknowledgement order.
    acks: Vec<(u64, u64)>,
}

struct Pool {
    state: Mutex<PoolState>,
    next_cookie: AtomicU64,
    next_notify: AtomicU64,
}

impl Pool {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState::default()),
            next_cookie: AtomicU64::new(1),
            next_notify: AtomicU64::new(1),
        })
    }
}

/// An in-process [`crate::Cluster`].
pub struct MemCluster {
    pools: Mutex<HashMap<String, Arc<Pool>>>,
}

impl MemCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pools: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait::async_trait]
impl crate::Cluster for MemCluster {
    async fn create_pool(&self, pool: &str) -> Result<()> {
        let mut pools = self.pools.lock().unwrap();
        if pools.contains_key(pool) {
            return Err(Error::AlreadyExists(pool.to_owned()));
        }
        pools.insert(pool.to_owned(), Pool::new());
        Ok(())
    }

    async fn open(&self, pool: &str, namespace: Option<&str>) -> Result<Arc<dyn ObjectStore>> {
        let pools = self.pools.lock().unwrap();
        let inner = pools
            .get(pool)
            .ok_or_else(|| Error::NotFound(pool.to_owned()))?
            .clone();
        Ok(Arc::new(MemStore {
            pool: inner,
            ns: namespace.unwrap_or_default().to_owned(),
        }))
    }
}

/// An io context over one pool/namespace of a [`MemCluster`].
pub struct MemStore {
    pool: Arc<Pool>,
    ns: String,
}

impl MemStore {
    /// A standalone store over a private single-pool cluster.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pool: Pool::new(),
            ns: String::new(),
        })
    }

    /// Acknowledgements received so far, as (notify_id, cookie) pairs.
    pub fn ack_log(&self) -> Vec<(u64, u64)> {
        self.pool.state.lock().unwrap().acks.clone()
    }

    fn key(&self, oid: &str) -> (String, String) {
        (self.ns.clone(), oid.to_owned())
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemStore {
    async fn read(&self, oid: &str, op: ReadOp) -> Result<ReadResult> {
        let state = self.pool.state.lock().unwrap();
        let obj = state
            .objects
            .get(&self.key(oid))
            .ok_or_else(|| Error::NotFound(oid.to_owned()))?;

        let mut out = ReadResult {
            version: obj.version,
            ..ReadResult::default()
        };

        if let Some((off, len)) = op.read {
            let off = (off as usize).min(obj.data.len());
            let end = off.saturating_add(len).min(obj.data.len());
            out.data = Some(obj.data.slice(off..end));
        }

        if let Some((after, max)) = &op.get_keys {
            bounded_scan(&obj.omap, after, *max, &mut out, |_| Bytes::new());
        }
        if let Some((after, max)) = &op.get_vals {
            bounded_scan(&obj.omap, after, *max, &mut out, Clone::clone);
        }
        for key in &op.get_vals_by_keys {
            if let Some(val) = obj.omap.get(key) {
                out.omap.insert(key.clone(), val.clone());
            }
        }

        Ok(out)
    }

    async fn write(&self, oid: &str, op: WriteOp) -> Result<()> {
        let mut state = self.pool.state.lock().unwrap();
        let key = self.key(oid);
        let exists = state.objects.contains_key(&key);

        // Validate the whole op before mutating anything: either every
        // action applies or none does.
        if let Some(asserted) = op.assert_version {
            match state.objects.get(&key) {
                None => return Err(Error::NotFound(oid.to_owned())),
                Some(obj) if obj.version != asserted => {
                    return Err(Error::VersionMismatch {
                        asserted,
                        actual: obj.version,
                    });
                }
                Some(_) => {}
            }
        }
        if exists && op.create == Some(CreateMode::Exclusive) {
            return Err(Error::AlreadyExists(oid.to_owned()));
        }
        if !exists && op.remove {
            return Err(Error::NotFound(oid.to_owned()));
        }

        if op.remove {
            state.objects.remove(&key);
            return Ok(());
        }

        // Absent objects are created implicitly by any write.
        let obj = state.objects.entry(key).or_default();
        if let Some(data) = op.write_full {
            obj.data = data;
        }
        if op.omap_clear {
            obj.omap.clear();
        }
        for (k, v) in op.omap_set {
            obj.omap.insert(k, v);
        }
        for k in &op.omap_rm_keys {
            obj.omap.remove(k);
        }
        obj.version += 1;
        Ok(())
    }

    async fn watch(&self, oid: &str, _timeout: Duration) -> Result<WatchHandle> {
        let mut state = self.pool.state.lock().unwrap();
        if !state.objects.contains_key(&self.key(oid)) {
            return Err(Error::NotFound(oid.to_owned()));
        }
        let cookie = self.pool.next_cookie.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.insert(
            cookie,
            Watcher {
                ns: self.ns.clone(),
                oid: oid.to_owned(),
                tx,
            },
        );
        Ok(WatchHandle::new(cookie, rx))
    }

    async fn unwatch(&self, cookie: u64) -> Result<()> {
        let mut state = self.pool.state.lock().unwrap();
        state
            .watchers
            .remove(&cookie)
            .map(|_| ())
            .ok_or(Error::BadCookie(cookie))
    }

    async fn notify(&self, oid: &str, payload: Bytes, _timeout: Duration) -> Result<()> {
        let state = self.pool.state.lock().unwrap();
        if !state.objects.contains_key(&self.key(oid)) {
            return Err(Error::NotFound(oid.to_owned()));
        }
        let notify_id = self.pool.next_notify.fetch_add(1, Ordering::Relaxed);
        for watcher in state.watchers.values() {
            if watcher.ns == self.ns && watcher.oid == oid {
                // A watcher whose receiver is gone is simply skipped; it will
                // be reaped by unwatch.
                let _ = watcher.tx.send(Notification {
                    notify_id,
                    notifier: 0,
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn notify_ack(&self, _oid: &str, notify_id: u64, cookie: u64) -> Result<()> {
        let mut state = self.pool.state.lock().unwrap();
        if !state.watchers.contains_key(&cookie) {
            return Err(Error::BadCookie(cookie));
        }
        state.acks.push((notify_id, cookie));
        Ok(())
    }
}

fn bounded_scan(
    omap: &BTreeMap<String, Bytes>,
    after: &str,
    max: u32,
    out: &mut ReadResult,
    value: impl Fn(&Bytes) -> Bytes,
) {
    let mut taken = 0u32;
    for (k, v) in omap.range::<String, _>((Bound::Excluded(after.to_owned()), Bound::Unbounded)) {
        if taken == max {
            out.more = true;
            break;
        }
        out.omap.insert(k.clone(), value(v));
        taken += 1;
    }
}
