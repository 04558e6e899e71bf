//! Per-node recovery backend for clustered grace-period coordination.
//!
//! The surrounding NFS server drives one [`RecoveryBackend`] through a fixed
//! verb surface: join-and-reclaim on startup, enforcement transitions while
//! the grace period runs, lift on completion, and a preemptive grace request
//! on clean shutdown. [`ClusterRecovery`] realizes the surface against the
//! shared grace object and per-node recovery databases; everything the
//! backend does not own — client-record encoding, the confirmed-client
//! table, the in-process grace machine — enters through the traits in
//! [`hooks`].

use std::sync::Arc;

pub mod hooks;

mod cluster;

pub use cluster::{recovery_db_oid, ClusterRecovery, Params};
pub use hooks::{
    ClientRecordCodec, ConfirmedClients, GraceEvent, LocalGraceMachine, OpaqueCodec, PopArgs,
    TakeoverHint,
};

use bytes::Bytes;

/// Name of the shared cluster-map object.
pub const CLUSTERMAP_OID: &str = "clustermap";

/// Most replicas [`RecoveryBackend::get_replicas`] will report. The Linux
/// client caps the servers it tracks well below this.
pub const MAX_CLUSTER_MEMBERS: u32 = 16;

/// Registry name of the clustered backend.
pub const CLUSTER_BACKEND: &str = "cluster";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("node '{0}' is not a member of the recovery cluster")]
    NotMember(String),
    #[error("failed to resolve local host name")]
    Hostname(#[source] std::io::Error),
    #[error("no recovery backend is registered as '{0}'")]
    UnknownBackend(String),
    #[error(transparent)]
    Grace(#[from] grace::Error),
    #[error(transparent)]
    Store(#[from] objstore::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The verb surface the surrounding server drives.
///
/// Failures of verbs returning `()` or `bool` are logged and absorbed: a
/// node that cannot reach the store simply stays in grace, which clients
/// observe as extended reclaim-only service.
#[async_trait::async_trait]
pub trait RecoveryBackend: Send + Sync {
    /// Join (or start, on crash recovery) the cluster grace period and
    /// replay the previous epoch's recovery database through the hooks.
    async fn read_clids(
        &self,
        takeover: Option<&TakeoverHint>,
        hooks: &mut PopArgs<'_>,
    ) -> Result<()>;

    /// The local grace period fully lifted: clear enforcement and drop the
    /// previous recovery database.
    async fn end_grace(&self);

    /// Record a confirmed client in the current recovery database. Key and
    /// value encoding belong to the client-record module.
    async fn add_clid(&self, key: &str, val: Bytes);

    /// Remove a client from the current recovery database.
    async fn rm_clid(&self, key: &str);

    /// Record a revoked filehandle entry in the current recovery database.
    async fn add_revoke_fh(&self, key: &str, val: Bytes);

    /// Enter the grace period locally if a peer has started one
    /// cluster-wide.
    async fn maybe_start_grace(&self);

    /// Drop out of the grace cohort; true when the cluster-wide grace
    /// period is fully lifted.
    async fn try_lift_grace(&self) -> bool;

    /// Publish that this node is enforcing the grace period locally.
    async fn set_enforcing(&self);

    /// Whether this node's published state says it is enforcing.
    async fn grace_enforcing(&self) -> bool;

    /// Whether this node is still part of the grace cohort.
    async fn is_member(&self) -> bool;

    /// Addresses of the cluster's replicas from the cluster-map object; the
    /// local node is reported as a zero-length address.
    async fn get_replicas(&self) -> Result<Vec<Bytes>>;

    /// Preemptively request grace and release the watch before the process
    /// exits.
    async fn shutdown(&self);
}

/// Everything a backend needs from its surroundings.
pub struct BackendEnv {
    pub cluster: Arc<dyn objstore::Cluster>,
    pub params: Params,
    pub codec: Arc<dyn ClientRecordCodec>,
    pub clients: Arc<dyn ConfirmedClients>,
    pub local: Arc<dyn LocalGraceMachine>,
}

/// Resolve and initialize a recovery backend by registry name.
pub async fn create_backend(name: &str, env: BackendEnv) -> Result<Arc<dyn RecoveryBackend>> {
    match name {
        CLUSTER_BACKEND => {
            let backend = ClusterRecovery::init(
                env.cluster,
                env.params,
                env.codec,
                env.clients,
                env.local,
            )
            .await?;
            Ok(backend)
        }
        other => Err(Error::UnknownBackend(other.to_owned())),
    }
}
