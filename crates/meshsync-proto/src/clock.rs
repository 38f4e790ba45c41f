//! Vector clocks for causal bookkeeping.
//!
//! A [`VectorClock`] maps each [`ReplicaId`] to the number of operations
//! authored by that replica which the holder has seen. Absent entries read
//! as zero. All operations here are pure; nothing is mutated except through
//! the explicit `&mut self` methods.

use crate::id::ReplicaId;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A vector clock for tracking causal dependencies.
///
/// Counters never decrease for a key the clock already contains.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    /// Create a new empty vector clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current counter for a replica.
    #[must_use]
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.entries.get(replica).copied().unwrap_or(0)
    }

    /// Increment the counter for a replica.
    pub fn increment(&mut self, replica: &ReplicaId) {
        let entry = self.entries.entry(replica.clone()).or_insert(0);
        *entry = entry.saturating_add(1);
    }

    /// Raise the counter for a replica to at least `value`.
    pub fn advance(&mut self, replica: &ReplicaId, value: u64) {
        let entry = self.entries.entry(replica.clone()).or_insert(0);
        *entry = (*entry).max(value);
    }

    /// Number of replicas with an explicit entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the clock carries no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in replica order.
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.entries.iter().map(|(k, v)| (k, *v))
    }

    /// Sum of all counters.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.entries.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Update to include all events from another clock (pointwise maximum).
    pub fn merge(&mut self, other: &Self) {
        for (replica, &counter) in &other.entries {
            let entry = self.entries.entry(replica.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Pointwise maximum of two clocks, leaving both untouched.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Pointwise sum of two clocks.
    ///
    /// Combines a delta's previous clock with its author clock into the clock
    /// that results from applying the delta. This is not a merge.
    #[must_use]
    pub fn sum_all(a: &Self, b: &Self) -> Self {
        let mut out = a.clone();
        for (replica, &counter) in &b.entries {
            let entry = out.entries.entry(replica.clone()).or_insert(0);
            *entry = entry.saturating_add(counter);
        }
        out
    }

    /// Entries of `current` that moved past `sent`.
    #[must_use]
    pub fn diff(sent: &Self, current: &Self) -> Self {
        let entries = current
            .entries
            .iter()
            .filter(|(replica, &counter)| counter > sent.get(replica))
            .map(|(replica, &counter)| (replica.clone(), counter))
            .collect();
        Self { entries }
    }

    /// True iff `second` has seen everything `first` has.
    #[must_use]
    pub fn does_second_have_first(first: &Self, second: &Self) -> bool {
        first
            .entries
            .iter()
            .all(|(replica, &counter)| second.get(replica) >= counter)
    }

    /// True iff this clock has seen everything `other` has.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        Self::does_second_have_first(other, self)
    }

    /// Causal comparison.
    ///
    /// Returns:
    /// - `Less`: This clock happened-before other.
    /// - `Equal`: Clocks are identical.
    /// - `Greater`: Other clock happened-before this.
    /// - `None`: Concurrent (neither dominates).
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        let mut self_greater = false;
        let mut other_greater = false;

        for replica in self.entries.keys().chain(other.entries.keys()) {
            let self_val = self.get(replica);
            let other_val = other.get(replica);

            if self_val > other_val {
                self_greater = true;
            } else if other_val > self_val {
                other_greater = true;
            }
        }

        match (self_greater, other_greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (true, true) => None,
        }
    }

    /// Check if this clock happened-before another.
    #[must_use]
    pub fn happened_before(&self, other: &Self) -> bool {
        matches!(self.compare(other), Some(Ordering::Less))
    }

    /// Equal on the union of keys, treating missing entries as zero.
    #[must_use]
    pub fn is_identical(&self, other: &Self) -> bool {
        matches!(self.compare(other), Some(Ordering::Equal))
    }
}

impl FromIterator<(ReplicaId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (ReplicaId, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<(&'a str, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (&'a str, u64)>>(iter: I) -> Self {
        iter.into_iter()
            .map(|(replica, counter)| (ReplicaId::new(replica), counter))
            .collect()
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (replica, counter)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{replica}:{counter}")?;
        }
        f.write_str("}")
    }
}
