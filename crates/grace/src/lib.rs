//! Cluster-wide grace-period coordination over a shared object.
//!
//! All cooperating servers agree on a single well-known object holding two
//! epoch serial numbers as data and one omap key per node that currently
//! requires a grace period. The current epoch `cur` tags new recovery
//! records; the recoverable epoch `rec` names the generation reclaim is
//! allowed from, with `rec == 0` meaning no cluster-wide grace period is in
//! force. Nodes never lock the object: every mutation is a read of the
//! header and omap, a locally computed update, and a write guarded by the
//! object version observed at read time, retried on interference.
//!
//! [`Coordinator`] implements the verbs, [`WatchDispatcher`] delivers peer
//! change notifications, and [`Epochs`] carries the header.

mod coordinator;
mod epoch;
mod retry;
pub mod watch;

pub use coordinator::{Coordinator, GraceDump};
pub use epoch::{Epochs, HEADER_LEN};
pub use retry::{Backoff, RetryPolicy};
pub use watch::{NullSink, WatchDispatcher, WatchSink, WATCH_TIMEOUT};

/// Well-known name of the shared grace object.
pub const DEFAULT_OID: &str = "grace";

/// Most omap entries any verb will read in one operation. A cohort larger
/// than this is refused as corrupt rather than acted on partially.
pub const MAX_ITEMS: u32 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("grace object is corrupt: {0}")]
    Corrupt(&'static str),
    #[error(transparent)]
    Store(#[from] objstore::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
