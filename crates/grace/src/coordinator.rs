use crate::{Epochs, Error, Result, RetryPolicy, HEADER_LEN, MAX_ITEMS};
use bytes::Bytes;
use objstore::{CreateMode, ObjectStore, ReadOp, WriteOp};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// Omap value marking a member as locally enforcing. Readers must treat any
// non-empty value as enforcing.
const ENFORCING_FLAG: &[u8] = b"E";

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(3);

/// The grace-period coordinator: every verb is a read-modify-write cycle on
/// the shared grace object, guarded by its version token and retried per the
/// configured [`RetryPolicy`] when a peer wins the race.
///
/// The coordinator is stateless; clone it freely. Mutating verbs finish with
/// a best-effort notify so watching peers re-examine the object.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn ObjectStore>,
    oid: String,
    retry: RetryPolicy,
}

/// Administrative snapshot of the grace object, as read by [`Coordinator::dump`].
#[derive(Debug)]
pub struct GraceDump {
    pub epochs: Epochs,
    /// Member nodeid mapped to whether it is locally enforcing.
    pub members: BTreeMap<String, bool>,
}

impl std::fmt::Display for GraceDump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.epochs)?;
        let mut first = true;
        for (nodeid, enforcing) in &self.members {
            let sep = if first { "" } else { " " };
            let flag = if *enforcing { "(E)" } else { "" };
            write!(f, "{sep}{nodeid}{flag}")?;
            first = false;
        }
        writeln!(f)
    }
}

impl Coordinator {
    pub fn new(store: Arc<dyn ObjectStore>, oid: impl Into<String>) -> Self {
        Self {
            store,
            oid: oid.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn oid(&self) -> &str {
        &self.oid
    }

    /// Create the grace object exclusively with `cur = 1`, `rec = 0` and an
    /// empty omap. Surfaces `AlreadyExists` for an existing object; callers
    /// treat that as success.
    pub async fn create(&self) -> Result<()> {
        let op = WriteOp::new()
            .create(CreateMode::Exclusive)
            .write_full(Epochs::initial().encode());
        self.store.write(&self.oid, op).await?;
        Ok(())
    }

    /// Read the current epoch header.
    pub async fn epochs(&self) -> Result<Epochs> {
        let got = self
            .store
            .read(&self.oid, ReadOp::new().read(0, HEADER_LEN))
            .await?;
        Epochs::decode(got.data.as_deref().unwrap_or_default())
    }

    /// Read the header and full member omap for administrative display.
    pub async fn dump(&self) -> Result<GraceDump> {
        let got = self
            .store
            .read(
                &self.oid,
                ReadOp::new().read(0, HEADER_LEN).omap_get_vals("", MAX_ITEMS),
            )
            .await?;
        if got.more {
            return Err(Error::Corrupt("member omap exceeds the item bound"));
        }
        let epochs = Epochs::decode(got.data.as_deref().unwrap_or_default())?;
        let members = got
            .omap
            .into_iter()
            .map(|(nodeid, val)| (nodeid, !val.is_empty()))
            .collect();
        Ok(GraceDump { epochs, members })
    }

    /// Force a cluster-wide grace period for the given nodes, beginning a
    /// new epoch if one is not already in force.
    pub async fn start(&self, nodeids: &[&str]) -> Result<Epochs> {
        self.start_inner(nodeids, true).await
    }

    /// Join an ongoing grace period without forcing one. With `start` set
    /// (used on startup reclaim and on clean shutdown) a new grace period is
    /// begun if none is in force.
    pub async fn join(&self, nodeid: &str, start: bool) -> Result<Epochs> {
        self.start_inner(&[nodeid], start).await
    }

    async fn start_inner(&self, nodeids: &[&str], start: bool) -> Result<Epochs> {
        let mut attempt = 0u32;
        loop {
            let got = self
                .store
                .read(&self.oid, ReadOp::new().read(0, HEADER_LEN))
                .await?;
            let mut epochs = Epochs::decode(got.data.as_deref().unwrap_or_default())?;

            // Only begin a new grace period when asked to force one.
            if !epochs.in_grace() && !start {
                return Ok(epochs);
            }

            let mut op = WriteOp::new().assert_version(got.version);
            if !epochs.in_grace() {
                epochs = epochs.advanced();
                op = op.write_full(epochs.encode());
            }
            op = op.omap_set(nodeids.iter().map(|n| (n.to_string(), Bytes::new())));

            match self.store.write(&self.oid, op).await {
                Ok(()) => {
                    self.notify().await;
                    return Ok(epochs);
                }
                Err(err) => self.next_attempt(err, &mut attempt).await?,
            }
        }
    }

    /// Remove the given nodes from the grace cohort. The removal that
    /// empties the cohort also clears `rec`, fully lifting the grace period,
    /// in the same guarded write.
    pub async fn lift(&self, nodeids: &[&str]) -> Result<Epochs> {
        let mut attempt = 0u32;
        loop {
            let got = self
                .store
                .read(
                    &self.oid,
                    ReadOp::new().read(0, HEADER_LEN).omap_get_keys("", MAX_ITEMS),
                )
                .await?;
            if got.more {
                return Err(Error::Corrupt("member omap exceeds the item bound"));
            }
            let mut epochs = Epochs::decode(got.data.as_deref().unwrap_or_default())?;

            // Out of grace there must be no members; either way there is
            // nothing to alter.
            if !epochs.in_grace() {
                if !got.omap.is_empty() {
                    return Err(Error::Corrupt("members present outside any grace period"));
                }
                return Ok(epochs);
            }

            let matched: Vec<&str> = nodeids
                .iter()
                .copied()
                .filter(|nodeid| got.omap.contains_key(*nodeid))
                .collect();
            if matched.is_empty() {
                return Ok(epochs);
            }

            let mut op = WriteOp::new()
                .assert_version(got.version)
                .omap_rm_keys(matched.iter().copied());
            if matched.len() == got.omap.len() {
                epochs.rec = 0;
                op = op.write_full(epochs.encode());
            }

            match self.store.write(&self.oid, op).await {
                Ok(()) => {
                    self.notify().await;
                    return Ok(epochs);
                }
                Err(err) => self.next_attempt(err, &mut attempt).await?,
            }
        }
    }

    /// Lift for a single node, called once its local reclaim completes.
    pub async fn done(&self, nodeid: &str) -> Result<Epochs> {
        self.lift(&[nodeid]).await
    }

    /// Mark the node as locally enforcing the grace period. A no-op for
    /// non-members; membership is never created here.
    pub async fn enforcing_on(&self, nodeid: &str) -> Result<Epochs> {
        self.set_flag(nodeid, ENFORCING_FLAG).await
    }

    /// Clear the node's enforcement flag. A no-op for non-members.
    pub async fn enforcing_off(&self, nodeid: &str) -> Result<Epochs> {
        self.set_flag(nodeid, b"").await
    }

    async fn set_flag(&self, nodeid: &str, value: &'static [u8]) -> Result<Epochs> {
        let mut attempt = 0u32;
        loop {
            let got = self
                .store
                .read(
                    &self.oid,
                    ReadOp::new()
                        .read(0, HEADER_LEN)
                        .omap_get_vals_by_keys([nodeid]),
                )
                .await?;
            let epochs = Epochs::decode(got.data.as_deref().unwrap_or_default())?;

            match got.omap.get(nodeid) {
                None => return Ok(epochs),
                Some(current) if current.as_ref() == value => return Ok(epochs),
                Some(_) => {}
            }

            let op = WriteOp::new()
                .assert_version(got.version)
                .omap_set([(nodeid, Bytes::from_static(value))]);

            match self.store.write(&self.oid, op).await {
                Ok(()) => {
                    self.notify().await;
                    return Ok(epochs);
                }
                Err(err) => self.next_attempt(err, &mut attempt).await?,
            }
        }
    }

    /// True when the node is a member and its omap value marks it enforcing.
    pub async fn enforcing_check(&self, nodeid: &str) -> Result<bool> {
        let got = self
            .store
            .read(&self.oid, ReadOp::new().omap_get_vals_by_keys([nodeid]))
            .await?;
        Ok(got.omap.get(nodeid).is_some_and(|val| !val.is_empty()))
    }

    /// True when the node is part of the current grace cohort.
    pub async fn member(&self, nodeid: &str) -> Result<bool> {
        let got = self
            .store
            .read(&self.oid, ReadOp::new().omap_get_vals_by_keys([nodeid]))
            .await?;
        Ok(got.omap.contains_key(nodeid))
    }

    // Classify a write failure: version mismatches retry per policy, all
    // else surfaces.
    async fn next_attempt(&self, err: objstore::Error, attempt: &mut u32) -> Result<()> {
        let objstore::Error::VersionMismatch { .. } = err else {
            return Err(err.into());
        };
        *attempt += 1;
        let Some(delay) = self.retry.backoff_for(*attempt) else {
            return Err(err.into());
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn notify(&self) {
        if let Err(err) = self
            .store
            .notify(&self.oid, Bytes::new(), NOTIFY_TIMEOUT)
            .await
        {
            tracing::warn!(oid = %self.oid, error = %err, "grace notify failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstore::mem::MemStore;

    async fn coordinator() -> Coordinator {
        let c = Coordinator::new(MemStore::new(), crate::DEFAULT_OID);
        c.create().await.unwrap();
        c
    }

    #[tokio::test]
    async fn test_create_then_epochs() {
        let c = coordinator().await;
        assert_eq!(c.epochs().await.unwrap(), Epochs { cur: 1, rec: 0 });

        // Recreating surfaces AlreadyExists, which callers treat as success,
        // and leaves the object untouched.
        assert!(matches!(
            c.create().await,
            Err(Error::Store(objstore::Error::AlreadyExists(_)))
        ));
        assert_eq!(c.epochs().await.unwrap(), Epochs { cur: 1, rec: 0 });
    }

    #[tokio::test]
    async fn test_start_advances_epoch_once() {
        let c = coordinator().await;

        let epochs = c.start(&["a", "b"]).await.unwrap();
        assert_eq!(epochs, Epochs { cur: 2, rec: 1 });

        // A second start while in grace extends the cohort without another
        // epoch advance.
        let epochs = c.start(&["c"]).await.unwrap();
        assert_eq!(epochs, Epochs { cur: 2, rec: 1 });

        let dump = c.dump().await.unwrap();
        assert_eq!(dump.members.len(), 3);
        assert!(dump.members.values().all(|enforcing| !enforcing));
    }

    #[tokio::test]
    async fn test_join_does_not_force() {
        let c = coordinator().await;

        // No grace in force and no start flag: nothing changes.
        let epochs = c.join("a", false).await.unwrap();
        assert_eq!(epochs, Epochs { cur: 1, rec: 0 });
        assert!(!c.member("a").await.unwrap());

        // With the start flag a fresh grace period begins.
        let epochs = c.join("a", true).await.unwrap();
        assert_eq!(epochs, Epochs { cur: 2, rec: 1 });
        assert!(c.member("a").await.unwrap());

        // Another node can now join without the flag.
        let epochs = c.join("b", false).await.unwrap();
        assert_eq!(epochs, Epochs { cur: 2, rec: 1 });
        assert!(c.member("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_lift_last_member_clears_rec() {
        let c = coordinator().await;
        c.start(&["a", "b"]).await.unwrap();

        let epochs = c.done("a").await.unwrap();
        assert_eq!(epochs, Epochs { cur: 2, rec: 1 });
        assert!(!c.member("a").await.unwrap());

        let epochs = c.done("b").await.unwrap();
        assert_eq!(epochs, Epochs { cur: 2, rec: 0 });
        assert!(c.dump().await.unwrap().members.is_empty());

        // Lift is idempotent once out of grace.
        let epochs = c.done("b").await.unwrap();
        assert_eq!(epochs, Epochs { cur: 2, rec: 0 });
    }

    #[tokio::test]
    async fn test_lift_unknown_node_is_noop() {
        let c = coordinator().await;
        c.start(&["a"]).await.unwrap();

        let epochs = c.lift(&["ghost"]).await.unwrap();
        assert_eq!(epochs, Epochs { cur: 2, rec: 1 });
        assert!(c.member("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_members_outside_grace_is_corrupt() {
        let store = MemStore::new();
        let c = Coordinator::new(store.clone(), "grace");
        c.create().await.unwrap();

        // Damage the object: a member entry with rec still zero.
        store
            .write(
                "grace",
                WriteOp::new().omap_set([("zombie", Bytes::new())]),
            )
            .await
            .unwrap();

        assert!(matches!(c.lift(&["zombie"]).await, Err(Error::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_enforcing_flag_lifecycle() {
        let c = coordinator().await;

        // Not a member: enforcing_on must not create membership.
        c.enforcing_on("a").await.unwrap();
        assert!(!c.member("a").await.unwrap());
        assert!(!c.enforcing_check("a").await.unwrap());

        c.start(&["a", "b"]).await.unwrap();
        c.enforcing_on("a").await.unwrap();
        assert!(c.enforcing_check("a").await.unwrap());
        assert!(!c.enforcing_check("b").await.unwrap());

        // Setting the flag twice is fine.
        c.enforcing_on("a").await.unwrap();
        assert!(c.enforcing_check("a").await.unwrap());

        // A peer joining doesn't disturb our flag.
        c.join("c", false).await.unwrap();
        assert!(c.enforcing_check("a").await.unwrap());

        c.enforcing_off("a").await.unwrap();
        assert!(!c.enforcing_check("a").await.unwrap());
        assert!(c.member("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_dump_rendering() {
        let c = coordinator().await;
        assert_eq!(c.dump().await.unwrap().to_string(), "cur=1 rec=0\n\n");

        c.start(&["nfs-a", "nfs-b"]).await.unwrap();
        c.enforcing_on("nfs-b").await.unwrap();
        insta::assert_snapshot!(c.dump().await.unwrap().to_string(), @r###"
        cur=2 rec=1
        nfs-a nfs-b(E)
        "###);
    }

    #[tokio::test]
    async fn test_epochs_on_missing_object() {
        let c = Coordinator::new(MemStore::new(), "grace");
        assert!(matches!(
            c.epochs().await,
            Err(Error::Store(objstore::Error::NotFound(_)))
        ));
    }
}
