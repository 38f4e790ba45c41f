//! Sync Module - peer-to-peer replication.
//!
//! Clock bookkeeping, the overlay membership layer and the per-peer
//! push/pull anti-entropy protocols.
//!
//! ```text
//! Ring change ──► ConnectionManager ──► dial DiasPeerSet targets
//!                                            │
//!                        ┌───────────────────┴──────────────────┐
//!                   dialer session                        listener session
//!                   PullProtocol ◄──── DataMessage ────── PushProtocol
//!                                ───── Presentation ────►
//! ```

pub mod clock_store;
pub mod debounce;
pub mod dias;
pub mod manager;
pub mod pull;
pub mod push;
pub mod replication;
pub mod ring;
pub mod session;
pub mod wait_timers;

pub use clock_store::ClockStore;
pub use debounce::Debounce;
pub use dias::dias_peer_set;
pub use manager::{ConnectionManager, ConnectionState, MembershipEvent, SessionFactory};
pub use pull::PullProtocol;
pub use push::PushProtocol;
pub use replication::{ReplicationEvent, ReplicationTracker};
pub use ring::{Ring, RingEntry};
pub use session::{Role, run_session};
pub use wait_timers::WaitTimers;

use crate::config::ReplicationOptions;
use crate::error::{ReplicationError, ReplicationResult};
use crate::keys::Keys;
use crate::telemetry::PeerNames;
use meshsync_proto::{Envelope, ReplicaId, Shared, SyncMessage};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Direct children of a collaboration, by name.
pub type Children = Arc<RwLock<BTreeMap<String, Arc<dyn Shared>>>>;

/// One collaboration of a tree, as seen by the sessions that replicate it.
#[derive(Clone)]
pub struct CollabNode {
    /// Collaboration path, `root` or `root/child`.
    pub path: String,
    pub local: ReplicaId,
    pub shared: Arc<dyn Shared>,
    pub children: Children,
    /// Scoped to `path`.
    pub clocks: ClockStore,
    pub replication: ReplicationTracker,
    pub keys: Option<Arc<dyn Keys>>,
    pub options: Arc<ReplicationOptions>,
}

impl CollabNode {
    /// Build the context of one protocol instance talking to `remote`.
    pub fn context(&self, remote: ReplicaId, outbox: Outbox) -> ProtocolContext {
        let names: PeerNames = [&self.local, &remote].into_iter().collect();
        ProtocolContext {
            path: self.path.clone(),
            local: self.local.clone(),
            remote,
            shared: Arc::clone(&self.shared),
            children: Arc::clone(&self.children),
            clocks: self.clocks.clone(),
            replication: self.replication.clone(),
            keys: self.keys.clone(),
            options: Arc::clone(&self.options),
            outbox,
            names,
        }
    }
}

/// Everything a push or pull protocol instance works with.
pub struct ProtocolContext {
    pub path: String,
    pub local: ReplicaId,
    pub remote: ReplicaId,
    pub shared: Arc<dyn Shared>,
    pub children: Children,
    pub clocks: ClockStore,
    pub replication: ReplicationTracker,
    pub keys: Option<Arc<dyn Keys>>,
    pub options: Arc<ReplicationOptions>,
    pub outbox: Outbox,
    /// For clock logging only.
    pub names: PeerNames,
}

impl ProtocolContext {
    pub fn keys(&self) -> Option<&dyn Keys> {
        self.keys.as_deref()
    }

    pub fn child(&self, name: &str) -> Option<Arc<dyn Shared>> {
        self.children.read().get(name).cloned()
    }

    /// Snapshot of the direct children.
    pub fn children(&self) -> Vec<(String, Arc<dyn Shared>)> {
        self.children
            .read()
            .iter()
            .map(|(name, shared)| (name.clone(), Arc::clone(shared)))
            .collect()
    }
}

/// Write half of a session, addressed to one collaboration.
#[derive(Debug, Clone)]
pub struct Outbox {
    path: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outbox {
    pub fn new(path: impl Into<String>, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            path: path.into(),
            tx,
        }
    }

    pub fn send(&self, message: SyncMessage) -> ReplicationResult {
        self.tx
            .send(Envelope::new(self.path.clone(), message))
            .map_err(|_| ReplicationError::ChannelClosed)
    }
}
