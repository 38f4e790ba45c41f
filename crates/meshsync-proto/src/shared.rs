//! The CRDT collaborator consumed by the replication engine.

use crate::clock::VectorClock;
use crate::delta::DeltaRecord;
use crate::error::ProtoError;
use async_trait::async_trait;
use tokio::sync::watch;

/// A replicated document.
///
/// The engine reasons only about the clocks attached to records; the state
/// bytes are opaque to it. Implementations must be safe to call from many
/// sessions at once.
#[async_trait]
pub trait Shared: Send + Sync + 'static {
    /// CRDT type name carried in every record this document produces.
    fn type_name(&self) -> &str;

    /// Current local clock.
    fn clock(&self) -> VectorClock;

    /// Deltas not yet covered by `since`, in causal order.
    ///
    /// Finite and restartable: every call recomputes from current state.
    fn deltas(&self, since: &VectorClock) -> Vec<DeltaRecord>;

    /// Apply a delta (`is_delta`) or a full-state snapshot.
    ///
    /// Returns `Ok(true)` when the record carried new information. Applying a
    /// record already known is a no-op returning `Ok(false)`.
    async fn apply(
        &self,
        record: DeltaRecord,
        is_delta: bool,
        is_sub: bool,
    ) -> Result<bool, ProtoError>;

    /// The full current state expressed as one record.
    fn state_as_delta(&self) -> Option<DeltaRecord>;

    /// Receiver that observes a new value every time the local clock advances.
    fn subscribe_clock(&self) -> watch::Receiver<VectorClock>;
}
