//! Delta records: the unit of replication.

use crate::clock::VectorClock;
use bytes::Bytes;

/// What a delta carries: the target collaboration, the CRDT type, and the
/// opaque state (possibly signed and encrypted).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeltaPayload {
    /// Name of the collaboration the state belongs to.
    pub target_name: String,
    /// CRDT type name, e.g. `append-log`.
    pub type_name: String,
    /// Serialized CRDT state. Opaque to the replication engine.
    pub state: Bytes,
}

/// A delta (or full-state snapshot) with its causal context.
///
/// Applying the record moves the holder to
/// `VectorClock::sum_all(previous_clock, author_clock)`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeltaRecord {
    /// Clock of the author before the delta was produced.
    pub previous_clock: VectorClock,
    /// Increments contributed by the delta.
    pub author_clock: VectorClock,
    /// The delta payload.
    pub payload: DeltaPayload,
}

impl DeltaRecord {
    /// Build a record.
    pub fn new(
        previous_clock: VectorClock,
        author_clock: VectorClock,
        target_name: impl Into<String>,
        type_name: impl Into<String>,
        state: impl Into<Bytes>,
    ) -> Self {
        Self {
            previous_clock,
            author_clock,
            payload: DeltaPayload {
                target_name: target_name.into(),
                type_name: type_name.into(),
                state: state.into(),
            },
        }
    }

    /// The clock a replica holds after applying this record.
    #[must_use]
    pub fn resulting_clock(&self) -> VectorClock {
        VectorClock::sum_all(&self.previous_clock, &self.author_clock)
    }

    /// Replace the state bytes, keeping clocks and names.
    #[must_use]
    pub fn with_state(mut self, state: Bytes) -> Self {
        self.payload.state = state;
        self
    }
}

/// A collaboration state inside a full-state push.
///
/// `name == None` is the state of the collaboration being replicated;
/// `Some(name)` is the state of one of its sub-collaborations.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NamedState {
    /// Sub-collaboration name, or `None` for the root.
    pub name: Option<String>,
    /// The state expressed as a delta record.
    pub record: DeltaRecord,
}
