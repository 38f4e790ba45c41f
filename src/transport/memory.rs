//! In-process transport.
//!
//! Every node of a [`MemoryNetwork`] gets a [`MemoryTransport`]; dials are
//! served with `tokio::io::duplex` pipes. Nodes can be made unreachable and
//! dial attempts are counted per target.

use super::{Connection, Handlers, InboundHandler, PeerStream, Transport};
use crate::error::DialError;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use meshsync_proto::ReplicaId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct NetworkInner {
    nodes: DashMap<ReplicaId, Arc<Handlers>>,
    unreachable: DashSet<ReplicaId>,
    dials: DashMap<ReplicaId, u64>,
    dial_delay: Mutex<Option<Duration>>,
}

/// A set of in-process nodes that can dial each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the transport for node `id`.
    pub fn transport(&self, id: impl Into<ReplicaId>) -> Arc<MemoryTransport> {
        let local = id.into();
        let handlers = Arc::new(Handlers::default());
        self.inner.nodes.insert(local.clone(), Arc::clone(&handlers));
        Arc::new(MemoryTransport {
            local,
            network: self.clone(),
            handlers,
        })
    }

    /// Make dials to `id` fail (or succeed again).
    pub fn set_reachable(&self, id: &ReplicaId, reachable: bool) {
        if reachable {
            self.inner.unreachable.remove(id);
        } else {
            self.inner.unreachable.insert(id.clone());
        }
    }

    /// Number of dial attempts made towards `id`.
    pub fn dial_count(&self, id: &ReplicaId) -> u64 {
        self.inner.dials.get(id).map_or(0, |c| *c)
    }

    /// Delay every dial by `delay`, simulating a slow network.
    pub fn set_dial_delay(&self, delay: Option<Duration>) {
        *self.inner.dial_delay.lock() = delay;
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    local: ReplicaId,
    network: MemoryNetwork,
    handlers: Arc<Handlers>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> &ReplicaId {
        &self.local
    }

    async fn connect(&self, peer: &ReplicaId, protocol: &str) -> Result<Connection, DialError> {
        let network = &self.network.inner;
        *network.dials.entry(peer.clone()).or_insert(0) += 1;

        let delay = *network.dial_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if network.unreachable.contains(peer) {
            return Err(DialError::Unreachable(peer.clone()));
        }
        let Some(remote) = network.nodes.get(peer).map(|h| Arc::clone(h.value())) else {
            return Err(DialError::Unreachable(peer.clone()));
        };
        let Some(handler) = remote.get(protocol) else {
            return Err(DialError::ProtocolNotHandled {
                peer: peer.clone(),
                protocol: protocol.to_string(),
            });
        };

        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let conn = Connection::new(peer.clone(), protocol, PeerStream::Memory(ours));
        self.handlers.track(peer, protocol, conn.closed.clone());
        handler(Connection::new(
            self.local.clone(),
            protocol,
            PeerStream::Memory(theirs),
        ));
        Ok(conn)
    }

    fn disconnect(&self, peer: &ReplicaId, protocol: &str) {
        self.handlers.disconnect(peer, protocol);
    }

    fn handle(&self, protocol: &str, handler: InboundHandler) {
        self.handlers.set(protocol, handler);
    }

    fn unhandle(&self, protocol: &str) {
        self.handlers.remove(protocol);
    }
}
