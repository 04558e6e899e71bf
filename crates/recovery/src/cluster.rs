//! The clustered recovery backend.
//!
//! One handle per process, created by [`ClusterRecovery::init`]; every piece
//! of state the C lineage kept in globals (node identifier, recovery-db
//! object names, the watch registration) lives in the handle.

use crate::hooks::{
    ClientRecordCodec, ConfirmedClients, GraceEvent, LocalGraceMachine, PopArgs, TakeoverHint,
};
use crate::{Error, RecoveryBackend, Result, CLUSTERMAP_OID, MAX_CLUSTER_MEMBERS};
use bytes::Bytes;
use grace::{Coordinator, WatchDispatcher, WatchSink};
use objstore::{Cluster, CreateMode, ObjectStore, ReadOp, WriteOp};
use std::sync::{Arc, Mutex};

// Page size for recovery-database traversal.
const TRAVERSE_CHUNK: u32 = 256;

// Entries per write-op while streaming a client snapshot into a fresh
// recovery database.
const SNAPSHOT_CHUNK: usize = 1024;

/// Deterministic recovery-database object name: epoch as 16 lowercase hex
/// digits, then the node identifier. Only this scheme is emitted or read;
/// the numeric-nodeid-first lineage is not interoperable.
pub fn recovery_db_oid(epoch: u64, nodeid: &str) -> String {
    format!("rec-{epoch:016x}:{nodeid}")
}

/// Connection and identity parameters for [`ClusterRecovery::init`].
///
/// Store credentials (user id, configuration path) belong to the external
/// store client that produced the [`Cluster`] handle.
#[derive(Debug, Clone)]
pub struct Params {
    /// Administrator-assigned node identifier; the host name when absent.
    pub nodeid: Option<String>,
    pub pool: String,
    pub namespace: Option<String>,
    pub grace_oid: String,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            nodeid: None,
            pool: "nfs-grace".to_owned(),
            namespace: None,
            grace_oid: grace::DEFAULT_OID.to_owned(),
        }
    }
}

struct LocalWakeSink {
    local: Arc<dyn LocalGraceMachine>,
}

impl WatchSink for LocalWakeSink {
    fn object_changed(&self) {
        self.local.notify_grace_waiters();
        self.local.wake_reaper();
    }
}

/// The per-node recovery backend over the shared grace object.
pub struct ClusterRecovery {
    nodeid: String,
    store: Arc<dyn ObjectStore>,
    coordinator: Coordinator,
    dispatcher: Mutex<Option<WatchDispatcher>>,
    recov_oid: Mutex<String>,
    recov_old_oid: Mutex<String>,
    codec: Arc<dyn ClientRecordCodec>,
    clients: Arc<dyn ConfirmedClients>,
    local: Arc<dyn LocalGraceMachine>,
}

impl std::fmt::Debug for ClusterRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRecovery")
            .field("nodeid", &self.nodeid)
            .finish_non_exhaustive()
    }
}

impl ClusterRecovery {
    /// Resolve the node identity, open the store, verify cluster
    /// membership, and register the grace watch. Fails with
    /// [`Error::NotMember`] for nodes outside the cohort; everything
    /// acquired up to the failure is released on return.
    pub async fn init(
        cluster: Arc<dyn Cluster>,
        params: Params,
        codec: Arc<dyn ClientRecordCodec>,
        clients: Arc<dyn ConfirmedClients>,
        local: Arc<dyn LocalGraceMachine>,
    ) -> Result<Arc<Self>> {
        let nodeid = match params.nodeid {
            Some(nodeid) => nodeid,
            None => resolve_hostname()?,
        };

        let store = cluster
            .open(&params.pool, params.namespace.as_deref())
            .await?;
        let coordinator = Coordinator::new(store.clone(), params.grace_oid);

        if !coordinator.member(&nodeid).await? {
            tracing::warn!(%nodeid, "cluster membership check failed");
            return Err(Error::NotMember(nodeid));
        }

        let sink = Arc::new(LocalWakeSink {
            local: local.clone(),
        });
        let dispatcher = WatchDispatcher::register(store.clone(), coordinator.oid(), sink).await?;

        Ok(Arc::new(Self {
            nodeid,
            store,
            coordinator,
            dispatcher: Mutex::new(Some(dispatcher)),
            recov_oid: Mutex::new(String::new()),
            recov_old_oid: Mutex::new(String::new()),
            codec,
            clients,
            local,
        }))
    }

    pub fn nodeid(&self) -> &str {
        &self.nodeid
    }

    /// Object name of the current recovery database, once `read_clids` or
    /// `maybe_start_grace` has established one. The client-record verbs
    /// write here.
    pub fn current_db(&self) -> String {
        self.recov_oid.lock().unwrap().clone()
    }

    /// Object name of the previous-epoch recovery database; empty once
    /// `end_grace` has removed it.
    pub fn old_db(&self) -> String {
        self.recov_old_oid.lock().unwrap().clone()
    }

    async fn traverse(&self, oid: &str, hooks: &mut PopArgs<'_>) -> Result<()> {
        let mut after = String::new();
        loop {
            let got = self
                .store
                .read(oid, ReadOp::new().omap_get_vals(&after, TRAVERSE_CHUNK))
                .await?;
            for (key, val) in &got.omap {
                self.codec.pop_entry(key, val, hooks);
            }
            match got.omap.keys().next_back() {
                Some(last) if got.more => after = last.clone(),
                _ => return Ok(()),
            }
        }
    }

    async fn write_clid_entry(&self, verb: &str, op: WriteOp) {
        let oid = self.current_db();
        if oid.is_empty() {
            tracing::warn!(verb, "no current recovery database");
            return;
        }
        if let Err(err) = self.store.write(&oid, op).await {
            tracing::warn!(verb, oid = %oid, error = %err, "recovery db update failed");
        }
    }
}

#[async_trait::async_trait]
impl RecoveryBackend for ClusterRecovery {
    async fn read_clids(
        &self,
        takeover: Option<&TakeoverHint>,
        hooks: &mut PopArgs<'_>,
    ) -> Result<()> {
        if let Some(hint) = takeover {
            tracing::warn!(
                nodeid = %hint.nodeid,
                "clustered recovery backend does not support takeover",
            );
            return Ok(());
        }

        // Start or join a grace period. The start flag holds the invariant
        // that a node which just crashed is represented in the cohort it
        // reclaims under.
        let epochs = self.coordinator.join(&self.nodeid, true).await?;

        let recov_oid = recovery_db_oid(epochs.cur, &self.nodeid);
        self.store
            .write(
                &recov_oid,
                WriteOp::new().create(CreateMode::Idempotent).omap_clear(),
            )
            .await?;
        *self.recov_oid.lock().unwrap() = recov_oid;

        if !epochs.in_grace() {
            // No reclaim allowed; the current db was simply reset.
            self.recov_old_oid.lock().unwrap().clear();
            return Ok(());
        }

        let old_oid = recovery_db_oid(epochs.rec, &self.nodeid);
        *self.recov_old_oid.lock().unwrap() = old_oid.clone();

        if let Err(err) = self.traverse(&old_oid, hooks).await {
            tracing::warn!(oid = %old_oid, error = %err, "failed to traverse recovery db");
        }
        Ok(())
    }

    async fn end_grace(&self) {
        let old_oid = self.old_db();
        if old_oid.is_empty() {
            return;
        }

        if let Err(err) = self.coordinator.enforcing_off(&self.nodeid).await {
            tracing::warn!(nodeid = %self.nodeid, error = %err, "failed to clear enforcing flag");
        }

        if let Err(err) = self.store.write(&old_oid, WriteOp::new().remove()).await {
            tracing::warn!(oid = %old_oid, error = %err, "failed to remove old recovery db");
        }

        self.recov_old_oid.lock().unwrap().clear();
    }

    async fn add_clid(&self, key: &str, val: Bytes) {
        self.write_clid_entry("add_clid", WriteOp::new().omap_set([(key, val)]))
            .await;
    }

    async fn rm_clid(&self, key: &str) {
        self.write_clid_entry("rm_clid", WriteOp::new().omap_rm_keys([key]))
            .await;
    }

    async fn add_revoke_fh(&self, key: &str, val: Bytes) {
        self.write_clid_entry("add_revoke_fh", WriteOp::new().omap_set([(key, val)]))
            .await;
    }

    async fn maybe_start_grace(&self) {
        let epochs = match self.coordinator.epochs().await {
            Ok(epochs) => epochs,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read grace epochs");
                return;
            }
        };
        if !epochs.in_grace() {
            return;
        }

        // A peer began a new grace generation. Rebuild the current db with
        // every confirmed client, then enter grace locally.
        let recov_oid = recovery_db_oid(epochs.cur, &self.nodeid);
        let old_oid = recovery_db_oid(epochs.rec, &self.nodeid);

        let mut entries: Vec<(String, Bytes)> = Vec::new();
        self.clients.for_each(&mut |key, val| entries.push((key, val)));
        if entries.len() > SNAPSHOT_CHUNK {
            tracing::info!(
                clients = entries.len(),
                "streaming client snapshot in chunks"
            );
        }

        // The first chunk rides the create-and-clear op; the rest append.
        let mut remaining = entries;
        let mut first = true;
        loop {
            let take = remaining.len().min(SNAPSHOT_CHUNK);
            let chunk: Vec<_> = remaining.drain(..take).collect();
            let mut op = WriteOp::new();
            if first {
                op = op.create(CreateMode::Idempotent).omap_clear();
            }
            op = op.omap_set(chunk);
            if let Err(err) = self.store.write(&recov_oid, op).await {
                tracing::warn!(oid = %recov_oid, error = %err, "failed to write recovery db");
                return;
            }
            first = false;
            if remaining.is_empty() {
                break;
            }
        }

        *self.recov_oid.lock().unwrap() = recov_oid;
        *self.recov_old_oid.lock().unwrap() = old_oid;

        self.local.start_grace(GraceEvent::JustGrace);
    }

    async fn try_lift_grace(&self) -> bool {
        match self.coordinator.done(&self.nodeid).await {
            // Non-zero rec means grace is still in force somewhere.
            Ok(epochs) => !epochs.in_grace(),
            Err(err) => {
                tracing::warn!(error = %err, "attempt to lift grace failed");
                false
            }
        }
    }

    async fn set_enforcing(&self) {
        if let Err(err) = self.coordinator.enforcing_on(&self.nodeid).await {
            tracing::warn!(nodeid = %self.nodeid, error = %err, "failed to set enforcing");
        }
    }

    async fn grace_enforcing(&self) -> bool {
        match self.coordinator.enforcing_check(&self.nodeid).await {
            Ok(enforcing) => enforcing,
            Err(err) => {
                tracing::warn!(error = %err, "enforcing check failed");
                false
            }
        }
    }

    async fn is_member(&self) -> bool {
        match self.coordinator.member(&self.nodeid).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(nodeid = %self.nodeid, "no longer a cluster member");
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "membership check failed");
                false
            }
        }
    }

    async fn get_replicas(&self) -> Result<Vec<Bytes>> {
        let got = self
            .store
            .read(
                CLUSTERMAP_OID,
                ReadOp::new().omap_get_vals("", MAX_CLUSTER_MEMBERS),
            )
            .await?;

        // A zero-length address tells the client "the address you dialed";
        // emit it for ourselves, peers get their recorded addresses.
        let addrs = got
            .omap
            .into_iter()
            .map(|(nodeid, addr)| {
                if nodeid == self.nodeid {
                    Bytes::new()
                } else {
                    addr
                }
            })
            .collect();
        Ok(addrs)
    }

    async fn shutdown(&self) {
        // Request grace before the session dies so a prompt restart finds
        // this node in the cohort.
        if let Err(err) = self.coordinator.join(&self.nodeid, true).await {
            tracing::warn!(error = %err, "failed to request grace on shutdown");
        }

        let dispatcher = self.dispatcher.lock().unwrap().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.shutdown().await;
        }
    }
}

fn resolve_hostname() -> Result<String> {
    let name = hostname::get().map_err(Error::Hostname)?;
    name.into_string().map_err(|_| {
        Error::Hostname(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "host name is not valid unicode",
        ))
    })
}
