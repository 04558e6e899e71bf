//! Seams to the collaborators the backend does not own.

use bytes::Bytes;

/// Hooks through which recovery-database entries reach the server's reclaim
/// machinery. The hooks copy what they need; entries must not be retained
/// past the call.
pub struct PopArgs<'a> {
    /// Invoked per recovered client record.
    pub add_clid_entry: &'a mut (dyn FnMut(&str, &[u8]) + Send),
    /// Invoked per recovered revoked-filehandle record.
    pub add_rfh_entry: &'a mut (dyn FnMut(&str, &[u8]) + Send),
}

/// The external client-record module: owns the per-key blob encoding of
/// recovery-database entries and classifies them during traversal.
pub trait ClientRecordCodec: Send + Sync {
    /// Decode one recovery-database entry, dispatching it to the matching
    /// hook.
    fn pop_entry(&self, key: &str, val: &[u8], hooks: &mut PopArgs<'_>);
}

/// A codec that treats every entry as a confirmed-client record and leaves
/// the blob opaque.
pub struct OpaqueCodec;

impl ClientRecordCodec for OpaqueCodec {
    fn pop_entry(&self, key: &str, val: &[u8], hooks: &mut PopArgs<'_>) {
        (hooks.add_clid_entry)(key, val);
    }
}

/// The in-process table of confirmed clients, traversed when a peer-started
/// grace period forces this node to reseed its recovery database.
pub trait ConfirmedClients: Send + Sync {
    /// Invoke `emit` once per confirmed client with its encoded recovery
    /// key and value. The traversal runs under the table's own read lock;
    /// `emit` receives owned copies.
    fn for_each(&self, emit: &mut dyn FnMut(String, Bytes));
}

/// The node-local grace-period machinery: the state machine the serving
/// path consults, and the reaper that retires expired clients.
pub trait LocalGraceMachine: Send + Sync {
    /// Enter the node-local grace period.
    fn start_grace(&self, event: GraceEvent);

    /// Wake the reclaim reaper to re-examine the shared object.
    fn wake_reaper(&self);

    /// Wake callers blocked waiting for a grace-period transition.
    fn notify_grace_waiters(&self);
}

/// Why the local grace period is starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceEvent {
    /// Enter grace for our own clients only, reclaiming no peer state.
    JustGrace,
}

/// A request to reclaim another node's client set. The clustered backend
/// does not support takeover and rejects the hint.
#[derive(Debug, Clone)]
pub struct TakeoverHint {
    /// Node whose state would be taken over.
    pub nodeid: String,
}
