//! Best-known clock per replica.
//!
//! One table per process, shared by every collaboration of a tree. Each
//! collaboration sees it through a scope so clocks of different documents
//! never mix.

use dashmap::DashMap;
use meshsync_proto::{ReplicaId, VectorClock};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClockKey {
    scope: Arc<str>,
    replica: ReplicaId,
}

#[derive(Debug, Clone, Default)]
struct ClockEntry {
    clock: VectorClock,
    /// Clocks from a pinner replace instead of merge.
    is_pinner: bool,
}

/// Scoped handle on the shared clock table.
#[derive(Debug, Clone)]
pub struct ClockStore {
    entries: Arc<DashMap<ClockKey, ClockEntry>>,
    scope: Arc<str>,
    local: ReplicaId,
}

impl ClockStore {
    pub fn new(local: ReplicaId, scope: &str) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            scope: Arc::from(scope),
            local,
        }
    }

    /// Same table, viewed under another scope.
    pub fn scoped(&self, scope: &str) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            scope: Arc::from(scope),
            local: self.local.clone(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn local(&self) -> &ReplicaId {
        &self.local
    }

    fn key(&self, id: &ReplicaId) -> ClockKey {
        ClockKey {
            scope: Arc::clone(&self.scope),
            replica: id.clone(),
        }
    }

    /// Last known clock of `id`; empty when unknown.
    pub fn get_for(&self, id: &ReplicaId) -> VectorClock {
        self.entries
            .get(&self.key(id))
            .map(|e| e.clock.clone())
            .unwrap_or_default()
    }

    /// Store a clock for `id` and return what is now stored.
    ///
    /// With `merge == false` and `id` known as a pinner the clock replaces
    /// the stored one; otherwise the two are merged pointwise. Passing
    /// `is_pinner == true` marks `id` as a pinner before the update.
    pub fn set_for(
        &self,
        id: &ReplicaId,
        clock: &VectorClock,
        merge: bool,
        is_pinner: bool,
    ) -> VectorClock {
        let mut entry = self.entries.entry(self.key(id)).or_default();
        entry.is_pinner |= is_pinner;
        if !merge && entry.is_pinner {
            entry.clock = clock.clone();
        } else {
            entry.clock.merge(clock);
        }
        entry.clock.clone()
    }

    /// Merge a clock into the stored one for `id`.
    pub fn merge_for(&self, id: &ReplicaId, clock: &VectorClock) -> VectorClock {
        self.set_for(id, clock, true, false)
    }

    pub fn mark_pinner(&self, id: &ReplicaId, is_pinner: bool) {
        self.entries.entry(self.key(id)).or_default().is_pinner = is_pinner;
    }

    pub fn is_pinner(&self, id: &ReplicaId) -> bool {
        self.entries.get(&self.key(id)).is_some_and(|e| e.is_pinner)
    }

    /// Forget what is known about a peer whose session ended.
    ///
    /// The local replica's own entry is never removed.
    pub fn take_down(&self, id: &ReplicaId) {
        if *id == self.local {
            return;
        }
        self.entries.remove(&self.key(id));
    }

    /// Number of replicas known under this scope.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.key().scope == self.scope)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries.iter().copied().collect()
    }

    fn store() -> ClockStore {
        ClockStore::new(ReplicaId::new("local"), "doc")
    }

    #[test]
    fn test_set_for_merges_by_default() {
        let store = store();
        let peer = ReplicaId::new("c");
        store.set_for(&peer, &clock(&[("a", 3), ("b", 1)]), false, false);
        let stored = store.set_for(&peer, &clock(&[("a", 2), ("b", 2)]), false, false);
        assert_eq!(stored, clock(&[("a", 3), ("b", 2)]));
        assert_eq!(store.get_for(&peer), stored);
    }

    #[test]
    fn test_pinner_clock_replaces() {
        let store = store();
        let peer = ReplicaId::new("c");
        store.merge_for(&peer, &clock(&[("a", 2), ("b", 2)]));
        store.merge_for(&peer, &clock(&[("a", 4)]));

        let stored = store.set_for(&peer, &clock(&[("a", 3), ("b", 2)]), false, true);
        assert_eq!(stored, clock(&[("a", 3), ("b", 2)]));
        assert!(store.is_pinner(&peer));

        // merge_for still merges even for a pinner
        let stored = store.merge_for(&peer, &clock(&[("a", 5)]));
        assert_eq!(stored, clock(&[("a", 5), ("b", 2)]));
    }

    #[test]
    fn test_take_down_keeps_local() {
        let store = store();
        let local = ReplicaId::new("local");
        let peer = ReplicaId::new("p");
        store.merge_for(&local, &clock(&[("local", 1)]));
        store.merge_for(&peer, &clock(&[("p", 1)]));

        store.take_down(&peer);
        store.take_down(&local);
        assert!(store.get_for(&peer).is_empty());
        assert_eq!(store.get_for(&local), clock(&[("local", 1)]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_scopes_are_isolated() {
        let root = store();
        let sub = root.scoped("doc/comments");
        let peer = ReplicaId::new("p");

        root.merge_for(&peer, &clock(&[("p", 1)]));
        sub.merge_for(&peer, &clock(&[("p", 7)]));
        assert_eq!(root.get_for(&peer).get(&peer), 1);
        assert_eq!(sub.get_for(&peer).get(&peer), 7);
        assert_eq!(sub.scope(), "doc/comments");
    }
}
