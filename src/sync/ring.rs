//! Ring of known peers for the structured overlay.
//!
//! Peers are ordered by a short prefix of the SHA-256 of their id, so every
//! node derives the same ring from the same membership. Changes bump a
//! generation counter on a watch channel; consumers coalesce them.

use meshsync_proto::ReplicaId;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::ops::Bound;
use tokio::sync::watch;

/// A peer and its position on the ring.
///
/// Ordered by key, ties broken by id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingEntry {
    pub key: u64,
    pub id: ReplicaId,
}

/// Ring key of `id`: its first `key_bytes` SHA-256 bytes, left-aligned.
pub fn ring_key(id: &ReplicaId, key_bytes: usize) -> u64 {
    let digest = Sha256::digest(id.as_str().as_bytes());
    let n = key_bytes.clamp(1, 8);
    let mut buf = [0u8; 8];
    buf[..n].copy_from_slice(&digest[..n]);
    u64::from_be_bytes(buf)
}

/// Ordered set of peers keyed by hash prefix.
#[derive(Debug)]
pub struct Ring {
    key_bytes: usize,
    entries: RwLock<BTreeSet<RingEntry>>,
    changed: watch::Sender<u64>,
}

impl Ring {
    pub fn new(key_bytes: usize) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            key_bytes,
            entries: RwLock::new(BTreeSet::new()),
            changed,
        }
    }

    pub fn key_for(&self, id: &ReplicaId) -> u64 {
        ring_key(id, self.key_bytes)
    }

    pub fn entry_for(&self, id: &ReplicaId) -> RingEntry {
        RingEntry {
            key: self.key_for(id),
            id: id.clone(),
        }
    }

    /// Add a peer. Returns `false` if it was already present.
    pub fn add(&self, id: &ReplicaId) -> bool {
        let added = self.entries.write().insert(self.entry_for(id));
        if added {
            self.notify();
        }
        added
    }

    /// Remove a peer. Returns `false` if it was not present.
    pub fn remove(&self, id: &ReplicaId) -> bool {
        let removed = self.entries.write().remove(&self.entry_for(id));
        if removed {
            self.notify();
        }
        removed
    }

    pub fn has(&self, id: &ReplicaId) -> bool {
        self.entries.read().contains(&self.entry_for(id))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Entries in key order, copied out of the lock.
    pub fn snapshot(&self) -> Vec<RingEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// Next entry after `entry`, wrapping around. `None` on an empty ring.
    pub fn successor(&self, entry: &RingEntry) -> Option<RingEntry> {
        let entries = self.entries.read();
        entries
            .range((Bound::Excluded(entry), Bound::Unbounded))
            .next()
            .or_else(|| entries.iter().next())
            .cloned()
    }

    /// Previous entry before `entry`, wrapping around.
    pub fn predecessor(&self, entry: &RingEntry) -> Option<RingEntry> {
        let entries = self.entries.read();
        entries
            .range((Bound::Unbounded, Bound::Excluded(entry)))
            .next_back()
            .or_else(|| entries.iter().next_back())
            .cloned()
    }

    /// Receiver whose value changes on every add or remove.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn notify(&self) {
        self.changed.send_modify(|generation| *generation += 1);
    }
}
