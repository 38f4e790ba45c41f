//! Per-peer replication bookkeeping.
//!
//! Records what was sent to and received from each peer, and which peers are
//! pinners. Purely observational: correctness lives in the clocks.

use dashmap::{DashMap, DashSet};
use meshsync_proto::{ReplicaId, VectorClock};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Replication progress for one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerReplication {
    /// Clock of the push in flight.
    pub sending: VectorClock,
    /// Clock the peer is known to hold.
    pub sent: VectorClock,
    /// Clock of the data being applied.
    pub receiving: VectorClock,
    /// Clock of the last data applied.
    pub received: VectorClock,
}

/// Events emitted by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    Sending {
        peer: ReplicaId,
        clock: VectorClock,
        is_pinner: bool,
    },
    Sent {
        peer: ReplicaId,
        clock: VectorClock,
        is_pinner: bool,
    },
    Receiving {
        peer: ReplicaId,
        clock: VectorClock,
    },
    Received {
        peer: ReplicaId,
        clock: VectorClock,
    },
    PinnerAdded(ReplicaId),
    PinnerRemoved(ReplicaId),
}

struct TrackerInner {
    peers: DashMap<ReplicaId, PeerReplication>,
    pinners: DashSet<ReplicaId>,
    events: broadcast::Sender<ReplicationEvent>,
}

/// Shared by every session of a collaboration tree.
#[derive(Clone)]
pub struct ReplicationTracker {
    inner: Arc<TrackerInner>,
}

impl Default for ReplicationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(TrackerInner {
                peers: DashMap::new(),
                pinners: DashSet::new(),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: ReplicationEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn update(&self, peer: &ReplicaId, f: impl FnOnce(&mut PeerReplication)) {
        f(&mut self.inner.peers.entry(peer.clone()).or_default());
    }

    pub fn sending(&self, peer: &ReplicaId, clock: &VectorClock, is_pinner: bool) {
        self.update(peer, |p| p.sending = clock.clone());
        self.emit(ReplicationEvent::Sending {
            peer: peer.clone(),
            clock: clock.clone(),
            is_pinner,
        });
    }

    pub fn sent(&self, peer: &ReplicaId, clock: &VectorClock, is_pinner: bool) {
        self.update(peer, |p| p.sent.merge(clock));
        self.emit(ReplicationEvent::Sent {
            peer: peer.clone(),
            clock: clock.clone(),
            is_pinner,
        });
    }

    pub fn receiving(&self, peer: &ReplicaId, clock: &VectorClock) {
        self.update(peer, |p| p.receiving = clock.clone());
        self.emit(ReplicationEvent::Receiving {
            peer: peer.clone(),
            clock: clock.clone(),
        });
    }

    pub fn received(&self, peer: &ReplicaId, clock: &VectorClock) {
        self.update(peer, |p| p.received.merge(clock));
        self.emit(ReplicationEvent::Received {
            peer: peer.clone(),
            clock: clock.clone(),
        });
    }

    pub fn add_pinner(&self, peer: &ReplicaId) {
        if self.inner.pinners.insert(peer.clone()) {
            self.emit(ReplicationEvent::PinnerAdded(peer.clone()));
        }
    }

    pub fn remove_pinner(&self, peer: &ReplicaId) {
        if self.inner.pinners.remove(peer).is_some() {
            self.emit(ReplicationEvent::PinnerRemoved(peer.clone()));
        }
    }

    pub fn is_pinner(&self, peer: &ReplicaId) -> bool {
        self.inner.pinners.contains(peer)
    }

    pub fn pinners(&self) -> Vec<ReplicaId> {
        let mut pinners: Vec<_> = self.inner.pinners.iter().map(|p| p.key().clone()).collect();
        pinners.sort();
        pinners
    }

    pub fn state_for(&self, peer: &ReplicaId) -> Option<PeerReplication> {
        self.inner.peers.get(peer).map(|p| p.clone())
    }

    /// Entries of the last push the peer has not confirmed yet.
    pub fn pending_send(&self, peer: &ReplicaId) -> VectorClock {
        self.inner
            .peers
            .get(peer)
            .map(|p| VectorClock::diff(&p.sent, &p.sending))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_pending_send() {
        let tracker = ReplicationTracker::new();
        let peer = ReplicaId::new("b");

        tracker.sending(&peer, &clock(&[("a", 3)]), false);
        assert_eq!(tracker.pending_send(&peer), clock(&[("a", 3)]));

        tracker.sent(&peer, &clock(&[("a", 2)]), false);
        assert_eq!(tracker.pending_send(&peer), clock(&[("a", 3)]));

        tracker.sent(&peer, &clock(&[("a", 3)]), false);
        assert!(tracker.pending_send(&peer).is_empty());
        assert!(tracker.pending_send(&ReplicaId::new("unknown")).is_empty());
    }

    #[test]
    fn test_received_merges() {
        let tracker = ReplicationTracker::new();
        let peer = ReplicaId::new("b");
        tracker.receiving(&peer, &clock(&[("b", 1)]));
        tracker.received(&peer, &clock(&[("b", 1)]));
        tracker.received(&peer, &clock(&[("c", 2)]));

        let state = tracker.state_for(&peer).unwrap();
        assert_eq!(state.receiving, clock(&[("b", 1)]));
        assert_eq!(state.received, clock(&[("b", 1), ("c", 2)]));
    }

    #[tokio::test]
    async fn test_pinner_events_fire_once() {
        let tracker = ReplicationTracker::new();
        let mut events = tracker.subscribe();
        let peer = ReplicaId::new("p");

        tracker.add_pinner(&peer);
        tracker.add_pinner(&peer);
        assert!(tracker.is_pinner(&peer));
        tracker.remove_pinner(&peer);
        tracker.remove_pinner(&peer);

        assert_eq!(events.recv().await.unwrap(), ReplicationEvent::PinnerAdded(peer.clone()));
        assert_eq!(events.recv().await.unwrap(), ReplicationEvent::PinnerRemoved(peer));
        assert!(events.try_recv().is_err());
        assert!(tracker.pinners().is_empty());
    }
}
