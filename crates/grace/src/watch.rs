//! Delivery of grace-object change notifications to the local node.
//!
//! Peers notify the shared object after every successful mutation. The
//! dispatcher owns the registered watch and a background task which, per
//! notification, acknowledges first (so the notifier never waits on local
//! work) and only then wakes local consumers: the sink (reaper wake-up) and
//! any tasks blocked on the change counter.

use crate::Result;
use objstore::{ObjectStore, WatchHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Suggested store-side watch timeout.
pub const WATCH_TIMEOUT: Duration = Duration::from_secs(30);

// Pause before re-registering a torn-down watch.
const REWATCH_DELAY: Duration = Duration::from_secs(1);

/// Receives a synchronous wake-up per notification. Implementations must
/// only post work to their own queues; the dispatch task is not the place
/// for reclaim work.
pub trait WatchSink: Send + Sync {
    fn object_changed(&self);
}

/// A no-op sink for consumers that only use the change counter.
pub struct NullSink;

impl WatchSink for NullSink {
    fn object_changed(&self) {}
}

/// Owns the watch registration on the shared grace object.
pub struct WatchDispatcher {
    store: Arc<dyn ObjectStore>,
    cookie: Arc<AtomicU64>,
    changes: watch::Receiver<u64>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchDispatcher {
    /// Register a watch on `oid` and begin dispatching.
    pub async fn register(
        store: Arc<dyn ObjectStore>,
        oid: &str,
        sink: Arc<dyn WatchSink>,
    ) -> Result<Self> {
        let handle = store.watch(oid, WATCH_TIMEOUT).await?;
        let cookie = Arc::new(AtomicU64::new(handle.cookie()));
        let (tx, rx) = watch::channel(0u64);
        let task = tokio::spawn(dispatch(
            store.clone(),
            oid.to_owned(),
            handle,
            cookie.clone(),
            tx,
            sink,
        ));
        Ok(Self {
            store,
            cookie,
            changes: rx,
            task,
        })
    }

    /// A receiver whose value bumps once per delivered notification. Await
    /// `changed()` to block until the next peer mutation.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.clone()
    }

    /// Cookie of the currently registered watch.
    pub fn cookie(&self) -> u64 {
        self.cookie.load(Ordering::Relaxed)
    }

    /// Stop dispatching and unregister the watch.
    pub async fn shutdown(self) {
        self.task.abort();
        let cookie = self.cookie.load(Ordering::Relaxed);
        if let Err(err) = self.store.unwatch(cookie).await {
            tracing::warn!(cookie, error = %err, "failed to unwatch grace object");
        }
    }
}

async fn dispatch(
    store: Arc<dyn ObjectStore>,
    oid: String,
    mut handle: WatchHandle,
    cookie: Arc<AtomicU64>,
    changes: watch::Sender<u64>,
    sink: Arc<dyn WatchSink>,
) {
    loop {
        match handle.recv().await {
            Some(note) => {
                // Ack first; failures are logged, never propagated.
                if let Err(err) = store
                    .notify_ack(&oid, note.notify_id, handle.cookie())
                    .await
                {
                    tracing::warn!(oid = %oid, error = %err, "notify ack failed");
                }
                sink.object_changed();
                changes.send_modify(|n| *n += 1);
            }
            None => {
                // The store expired or tore down the watch; re-register.
                match store.watch(&oid, WATCH_TIMEOUT).await {
                    Ok(fresh) => {
                        cookie.store(fresh.cookie(), Ordering::Relaxed);
                        handle = fresh;
                        tracing::info!(oid = %oid, "re-registered grace watch");
                    }
                    Err(err) => {
                        tracing::warn!(oid = %oid, error = %err, "grace watch re-registration failed");
                        tokio::time::sleep(REWATCH_DELAY).await;
                    }
                }
            }
        }
    }
}
