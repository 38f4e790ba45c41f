//! Neighbor selection for the structured overlay.
//!
//! A peer connects to its ring successor plus the first peers at or after
//! the points 1/5, 1/4, 1/3 and 1/2 of the keyspace ahead of its own key.
//! The result depends only on ring contents, so peers agree on the overlay
//! without coordinating, and the diameter stays small as the ring grows.

use super::ring::{Ring, RingEntry};
use meshsync_proto::ReplicaId;
use std::collections::BTreeSet;

/// Keyspace fractions ahead of the local key, as divisors.
const FINGERS: [u64; 4] = [5, 4, 3, 2];

/// Upper bound on the size of a Dias peer set.
pub const MAX_DIAS_PEERS: usize = FINGERS.len() + 1;

/// Target neighbors of `local` on the current ring.
pub fn dias_peer_set(local: &ReplicaId, ring: &Ring) -> BTreeSet<ReplicaId> {
    select(&ring.entry_for(local), &ring.snapshot())
}

/// Pure selection over a sorted ring snapshot.
///
/// `local` need not be part of `entries`; it is never selected.
pub fn select(local: &RingEntry, entries: &[RingEntry]) -> BTreeSet<ReplicaId> {
    let mut peers = BTreeSet::new();
    if entries.is_empty() {
        return peers;
    }

    let wrap = |idx: usize| if idx == entries.len() { 0 } else { idx };

    let successor = wrap(entries.partition_point(|e| e <= local));
    peers.insert(entries[successor].id.clone());

    for divisor in FINGERS {
        let point = local.key.wrapping_add(u64::MAX / divisor);
        let idx = wrap(entries.partition_point(|e| e.key < point));
        peers.insert(entries[idx].id.clone());
    }

    peers.remove(&local.id);
    peers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(n: usize) -> (Ring, Vec<ReplicaId>) {
        let ring = Ring::new(2);
        let ids: Vec<_> = (0..n).map(|i| ReplicaId::new(format!("node-{i}"))).collect();
        for id in &ids {
            ring.add(id);
        }
        (ring, ids)
    }

    #[test]
    fn test_empty_and_alone() {
        let ring = Ring::new(2);
        let me = ReplicaId::new("me");
        assert!(dias_peer_set(&me, &ring).is_empty());
        ring.add(&me);
        assert!(dias_peer_set(&me, &ring).is_empty());
    }

    #[test]
    fn test_two_peers_pick_each_other() {
        let (ring, ids) = ring_of(2);
        assert_eq!(dias_peer_set(&ids[0], &ring), BTreeSet::from([ids[1].clone()]));
        assert_eq!(dias_peer_set(&ids[1], &ring), BTreeSet::from([ids[0].clone()]));
    }

    #[test]
    fn test_bounded_and_excludes_self() {
        let (ring, ids) = ring_of(64);
        for id in &ids {
            let set = dias_peer_set(id, &ring);
            assert!(!set.is_empty());
            assert!(set.len() <= MAX_DIAS_PEERS);
            assert!(!set.contains(id));
        }
    }

    #[test]
    fn test_successor_is_always_selected() {
        let (ring, ids) = ring_of(16);
        for id in &ids {
            let successor = ring.successor(&ring.entry_for(id)).unwrap();
            assert!(dias_peer_set(id, &ring).contains(&successor.id));
        }
    }

    #[test]
    fn test_every_peer_is_someone_elses_target() {
        let (ring, ids) = ring_of(12);
        for target in &ids {
            let reachable = ids
                .iter()
                .filter(|id| *id != target)
                .any(|id| dias_peer_set(id, &ring).contains(target));
            assert!(reachable, "{target} is isolated");
        }
    }

    #[test]
    fn test_removed_peer_leaves_every_target_set() {
        let (ring, ids) = ring_of(12);
        let gone = &ids[5];
        ring.remove(gone);
        for id in ids.iter().filter(|id| *id != gone) {
            assert!(!dias_peer_set(id, &ring).contains(gone));
        }
    }

    #[test]
    fn test_deterministic() {
        let (ring_a, ids) = ring_of(20);
        let ring_b = Ring::new(2);
        for id in ids.iter().rev() {
            ring_b.add(id);
        }
        for id in &ids {
            assert_eq!(dias_peer_set(id, &ring_a), dias_peer_set(id, &ring_b));
        }
    }
}
