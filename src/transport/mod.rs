//! Connection layer consumed by the replication engine.
//!
//! A [`Transport`] dials peers for a named protocol and hands inbound
//! connections to the handler registered for that protocol. Every
//! [`Connection`] carries a `closed` token that fires once, on EOF, on error
//! or on explicit disconnect.

pub mod memory;
pub mod stream;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use stream::{ByteCounters, Metered, PeerStream};
pub use tcp::TcpTransport;

use crate::error::DialError;
use async_trait::async_trait;
use dashmap::DashMap;
use meshsync_proto::ReplicaId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Callback invoked for every inbound connection of a protocol.
pub type InboundHandler = Arc<dyn Fn(Connection) + Send + Sync>;

/// An established connection to a peer, for one protocol.
#[derive(Debug)]
pub struct Connection {
    /// The peer on the other end.
    pub remote: ReplicaId,
    /// Protocol negotiated for this connection.
    pub protocol: String,
    pub stream: PeerStream,
    /// Cancelled once when the connection ends, whichever side ends it.
    pub closed: CancellationToken,
}

impl Connection {
    pub fn new(remote: ReplicaId, protocol: impl Into<String>, stream: PeerStream) -> Self {
        Self {
            remote,
            protocol: protocol.into(),
            stream,
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_id(&self) -> &ReplicaId;

    /// Open a connection to `peer` speaking `protocol`.
    async fn connect(&self, peer: &ReplicaId, protocol: &str) -> Result<Connection, DialError>;

    /// Close every outbound connection to `peer` for `protocol`.
    fn disconnect(&self, peer: &ReplicaId, protocol: &str);

    /// Route inbound connections for `protocol` to `handler`.
    fn handle(&self, protocol: &str, handler: InboundHandler);

    fn unhandle(&self, protocol: &str);
}

/// Protocol handlers and outbound close tokens, shared by the transports.
#[derive(Default)]
pub(crate) struct Handlers {
    handlers: DashMap<String, InboundHandler>,
    outbound: DashMap<(ReplicaId, String), CancellationToken>,
}

impl Handlers {
    pub(crate) fn set(&self, protocol: &str, handler: InboundHandler) {
        self.handlers.insert(protocol.to_string(), handler);
    }

    pub(crate) fn remove(&self, protocol: &str) {
        self.handlers.remove(protocol);
    }

    pub(crate) fn get(&self, protocol: &str) -> Option<InboundHandler> {
        self.handlers.get(protocol).map(|h| Arc::clone(h.value()))
    }

    /// Remember an outbound connection so `disconnect` can close it.
    pub(crate) fn track(&self, peer: &ReplicaId, protocol: &str, closed: CancellationToken) {
        let previous = self
            .outbound
            .insert((peer.clone(), protocol.to_string()), closed);
        // A newer dial supersedes the old connection.
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub(crate) fn disconnect(&self, peer: &ReplicaId, protocol: &str) {
        if let Some((_, closed)) = self.outbound.remove(&(peer.clone(), protocol.to_string())) {
            closed.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_handlers_registry() {
        let handlers = Handlers::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        handlers.set(
            "/p/1",
            Arc::new(move |_conn: Connection| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(handlers.get("/p/1").is_some());
        assert!(handlers.get("/p/2").is_none());
        handlers.remove("/p/1");
        assert!(handlers.get("/p/1").is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disconnect_cancels_tracked_connection() {
        let handlers = Handlers::default();
        let peer = ReplicaId::new("b");
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        handlers.track(&peer, "/p/1", first.clone());
        handlers.track(&peer, "/p/1", second.clone());
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        handlers.disconnect(&peer, "/p/1");
        assert!(second.is_cancelled());
    }
}
