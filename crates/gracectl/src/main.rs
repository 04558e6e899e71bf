//! gracectl: administrative tool for the shared grace database.
//!
//! The default invocation creates the grace object if needed and prints its
//! epochs and cohort. Listing node identifiers starts (or extends) a grace
//! period for them; with `--lift` it removes them from the cohort instead.
//! Exits 0 on success and 1 on any failure.

mod logging;

use anyhow::Context;
use clap::Parser;
use grace::{Coordinator, GraceDump};
use objstore::Cluster;
use std::sync::Arc;

const DEFAULT_POOL: &str = "nfs-grace";

#[derive(Debug, Parser)]
#[clap(author, name = "gracectl", version)]
struct Gracectl {
    #[clap(flatten)]
    log_args: logging::LogArgs,

    /// Pool holding the grace object.
    #[clap(long, default_value = DEFAULT_POOL, env = "GRACE_POOL")]
    pool: String,

    /// Namespace within the pool.
    #[clap(long, env = "GRACE_NAMESPACE")]
    namespace: Option<String>,

    /// Name of the grace object.
    #[clap(long, default_value = grace::DEFAULT_OID, env = "GRACE_OID")]
    oid: String,

    /// Lift the listed nodes out of the grace period instead of starting
    /// one for them.
    #[clap(short = 'l', long)]
    lift: bool,

    /// Numeric node identifiers to start or lift grace for.
    nodeids: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Gracectl::parse();
    logging::init_logging(&cli.log_args);

    // The in-process store stands in for the external cluster client, which
    // supplies its own `Cluster` when linked.
    let cluster = objstore::mem::MemCluster::new();

    let result = run(cluster, &cli).await;
    match result {
        Ok(dump) => {
            print!("{dump}");
            Ok(())
        }
        Err(err) => {
            tracing::error!(error = ?err, "command failed");
            Err(err)
        }
    }
}

async fn run(cluster: Arc<dyn Cluster>, args: &Gracectl) -> anyhow::Result<GraceDump> {
    validate_nodeids(&args.nodeids)?;

    // Ensure the pool exists; finding it already there is fine.
    match cluster.create_pool(&args.pool).await {
        Ok(()) | Err(objstore::Error::AlreadyExists(_)) => {}
        Err(err) => return Err(err).context("can't create pool"),
    }
    let store = cluster
        .open(&args.pool, args.namespace.as_deref())
        .await
        .context("can't connect to cluster")?;
    let coordinator = Coordinator::new(store, args.oid.as_str());

    match coordinator.create().await {
        Ok(()) | Err(grace::Error::Store(objstore::Error::AlreadyExists(_))) => {}
        Err(err) => return Err(err).context("can't create grace db"),
    }

    // No nodeids means don't change anything.
    if !args.nodeids.is_empty() {
        let nodeids: Vec<&str> = args.nodeids.iter().map(String::as_str).collect();
        if args.lift {
            coordinator.lift(&nodeids).await
        } else {
            coordinator.start(&nodeids).await
        }
        .context("can't alter grace")?;
    }

    coordinator.dump().await.context("can't dump grace db")
}

/// Node identifiers must be decimal integers below u32::MAX.
fn validate_nodeids(nodeids: &[String]) -> anyhow::Result<()> {
    for raw in nodeids {
        let numeric = !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit());
        let in_range = raw
            .parse::<u64>()
            .map(|val| val < u32::MAX as u64)
            .unwrap_or(false);
        if !numeric || !in_range {
            anyhow::bail!("bad nodeid: {raw}");
        }
    }
    Ok(())
}
