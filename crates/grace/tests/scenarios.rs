//! End-to-end coordination scenarios over the in-process store, including
//! the version-skew harness that interleaves the read and write halves of a
//! verb with a competing writer.

use bytes::Bytes;
use grace::{Coordinator, Epochs, Error};
use objstore::mem::MemStore;
use objstore::{ObjectStore, ReadOp, ReadResult, WatchHandle, WriteOp};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Delegates to an inner store, applying one queued write immediately after
/// each read: the interference lands between a verb's read and write halves,
/// exactly where a racing peer's CAS would.
struct SkewStore {
    inner: Arc<MemStore>,
    skews: tokio::sync::Mutex<VecDeque<(String, WriteOp)>>,
    reads: AtomicUsize,
}

impl SkewStore {
    fn new(inner: Arc<MemStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            skews: tokio::sync::Mutex::new(VecDeque::new()),
            reads: AtomicUsize::new(0),
        })
    }

    async fn push_skew(&self, oid: &str, op: WriteOp) {
        self.skews.lock().await.push_back((oid.to_owned(), op));
    }
}

#[async_trait::async_trait]
impl ObjectStore for SkewStore {
    async fn read(&self, oid: &str, op: ReadOp) -> objstore::Result<ReadResult> {
        let result = self.inner.read(oid, op).await?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some((target, skew)) = self.skews.lock().await.pop_front() {
            self.inner.write(&target, skew).await?;
        }
        Ok(result)
    }

    async fn write(&self, oid: &str, op: WriteOp) -> objstore::Result<()> {
        self.inner.write(oid, op).await
    }

    async fn watch(&self, oid: &str, timeout: Duration) -> objstore::Result<WatchHandle> {
        self.inner.watch(oid, timeout).await
    }

    async fn unwatch(&self, cookie: u64) -> objstore::Result<()> {
        self.inner.unwatch(cookie).await
    }

    async fn notify(&self, oid: &str, payload: Bytes, timeout: Duration) -> objstore::Result<()> {
        self.inner.notify(oid, payload, timeout).await
    }

    async fn notify_ack(&self, oid: &str, notify_id: u64, cookie: u64) -> objstore::Result<()> {
        self.inner.notify_ack(oid, notify_id, cookie).await
    }
}

#[tokio::test]
async fn test_fresh_object() {
    let c = Coordinator::new(MemStore::new(), "grace");
    c.create().await.unwrap();

    assert_eq!(c.epochs().await.unwrap(), Epochs { cur: 1, rec: 0 });
    let dump = c.dump().await.unwrap();
    assert_eq!(dump.to_string(), "cur=1 rec=0\n\n");
    assert!(dump.members.is_empty());
}

#[tokio::test]
async fn test_start_join_done_cycle() {
    let c = Coordinator::new(MemStore::new(), "grace");
    c.create().await.unwrap();

    // "A" starts a cluster-wide grace period.
    let epochs = c.start(&["A"]).await.unwrap();
    assert_eq!(epochs, Epochs { cur: 2, rec: 1 });

    // "B" joins it without forcing.
    let epochs = c.join("B", false).await.unwrap();
    assert_eq!(epochs, Epochs { cur: 2, rec: 1 });
    let dump = c.dump().await.unwrap();
    assert_eq!(dump.members.keys().collect::<Vec<_>>(), vec!["A", "B"]);

    // "A" finishes reclaim; grace stays in force for "B".
    let epochs = c.done("A").await.unwrap();
    assert_eq!(epochs, Epochs { cur: 2, rec: 1 });

    // "B" finishes; the final lift clears rec in the same write.
    let epochs = c.done("B").await.unwrap();
    assert_eq!(epochs, Epochs { cur: 2, rec: 0 });
    assert!(c.dump().await.unwrap().members.is_empty());
}

#[tokio::test]
async fn test_corrupt_header_surfaces_everywhere() {
    let store = MemStore::new();
    let c = Coordinator::new(store.clone(), "grace");
    c.create().await.unwrap();
    c.start(&["A"]).await.unwrap();

    // Truncate the header to 15 bytes behind the coordinator's back.
    store
        .write(
            "grace",
            WriteOp::new().write_full(Bytes::from_static(&[0u8; 15])),
        )
        .await
        .unwrap();

    assert!(matches!(c.epochs().await, Err(Error::Corrupt(_))));
    assert!(matches!(c.dump().await, Err(Error::Corrupt(_))));
    assert!(matches!(c.join("B", true).await, Err(Error::Corrupt(_))));
    assert!(matches!(c.done("A").await, Err(Error::Corrupt(_))));

    // Nothing was cleared by the failing verbs.
    let got = store
        .read("grace", ReadOp::new().read(0, 64).omap_get_keys("", 16))
        .await
        .unwrap();
    assert_eq!(got.data.unwrap().len(), 15);
    assert_eq!(got.omap.len(), 1);
}

#[tokio::test]
async fn test_version_skew_single_epoch_advance() {
    let inner = MemStore::new();
    let skewed = SkewStore::new(inner.clone());
    let c = Coordinator::new(skewed.clone(), "grace");
    c.create().await.unwrap();

    // Queue the committed effect of a competing start(["B"]) from the same
    // (cur=1, rec=0) state this coordinator is about to read.
    skewed
        .push_skew(
            "grace",
            WriteOp::new()
                .write_full(Epochs { cur: 2, rec: 1 }.encode())
                .omap_set([("B", Bytes::new())]),
        )
        .await;

    let before = skewed.reads.load(Ordering::SeqCst);
    let epochs = c.start(&["A"]).await.unwrap();

    // The loser observed the winner's epoch instead of advancing again.
    assert_eq!(epochs, Epochs { cur: 2, rec: 1 });
    assert!(skewed.reads.load(Ordering::SeqCst) >= before + 2, "no retry happened");

    let dump = c.dump().await.unwrap();
    assert_eq!(dump.epochs, Epochs { cur: 2, rec: 1 });
    assert_eq!(dump.members.keys().collect::<Vec<_>>(), vec!["A", "B"]);
}

#[tokio::test]
async fn test_version_skew_lift_retries() {
    let inner = MemStore::new();
    let skewed = SkewStore::new(inner.clone());
    let c = Coordinator::new(skewed.clone(), "grace");
    c.create().await.unwrap();
    c.start(&["A", "B"]).await.unwrap();

    // A competing done("B") lands between lift's read and write.
    skewed
        .push_skew("grace", WriteOp::new().omap_rm_keys(["B"]))
        .await;

    // After the retry, "A" is the sole remaining member, so this lift also
    // clears rec.
    let epochs = c.done("A").await.unwrap();
    assert_eq!(epochs, Epochs { cur: 2, rec: 0 });
    assert!(c.dump().await.unwrap().members.is_empty());
}

#[tokio::test]
async fn test_bounded_retry_surfaces_the_mismatch() {
    let inner = MemStore::new();
    let skewed = SkewStore::new(inner.clone());
    let c = Coordinator::new(skewed.clone(), "grace")
        .with_retry(grace::RetryPolicy::with_attempts(1));
    c.create().await.unwrap();

    // One interfering write, one permitted attempt: the caller sees the
    // version mismatch instead of an internal retry.
    skewed
        .push_skew(
            "grace",
            WriteOp::new().omap_set([("interloper", Bytes::new())]),
        )
        .await;

    let err = c.start(&["A"]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Store(objstore::Error::VersionMismatch { .. })
    ));
}

#[tokio::test]
async fn test_cohort_above_bound_is_corrupt() {
    let c = Coordinator::new(MemStore::new(), "grace");
    c.create().await.unwrap();

    let nodeids: Vec<String> = (0..1025).map(|i| format!("node-{i:04}")).collect();
    let refs: Vec<&str> = nodeids.iter().map(String::as_str).collect();
    c.start(&refs).await.unwrap();

    assert!(matches!(c.dump().await, Err(Error::Corrupt(_))));
    assert!(matches!(c.lift(&refs).await, Err(Error::Corrupt(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_join_done_serializes() {
    let store = MemStore::new();
    let c = Coordinator::new(store.clone(), "grace");
    c.create().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let c = c.clone();
        tasks.push(tokio::spawn(async move {
            let nodeid = format!("node-{i}");
            let joined = c.join(&nodeid, true).await.unwrap();
            assert!(joined.in_grace());
            assert!(joined.rec < joined.cur);
            c.done(&nodeid).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Whatever the interleaving, the end state is some serial execution's:
    // everyone joined and left, the last lift cleared rec, and the epoch
    // advanced at least once and at most once per grace period begun.
    let dump = c.dump().await.unwrap();
    assert!(dump.members.is_empty());
    assert_eq!(dump.epochs.rec, 0);
    assert!(dump.epochs.cur >= 2);
    assert!(dump.epochs.cur <= 17);
}
