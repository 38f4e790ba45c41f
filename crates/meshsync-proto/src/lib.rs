//! # meshsync-proto
//!
//! The shared vocabulary of meshsync replication: replica identifiers,
//! vector clocks, delta records, the wire messages exchanged by the push and
//! pull protocols, and the frame codec that carries them.
//!
//! The `Shared` trait is the seam between the replication engine and the
//! CRDT document it replicates. The engine never looks inside a delta's
//! state; it only reasons about the clocks attached to it.
//!
//! ```text
//!   pull side (dialer)                         push side (listener)
//!   ──────────────────                         ────────────────────
//!   Presentation { clock, is_pinner }  ─────▶
//!                                      ◀─────  DataMessage { peer_info }
//!                                      ◀─────  DataMessage { delta }
//!                                      ◀─────  DataMessage { new_states }
//!   Presentation { start_lazy }        ─────▶
//!                                      ◀─────  DataMessage { new_states: clock only }
//!   Presentation { start_eager }       ─────▶
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod clock;
pub mod codec;
pub mod delta;
pub mod error;
pub mod id;
pub mod message;
pub mod shared;

pub use clock::VectorClock;
pub use codec::FrameCodec;
pub use delta::{DeltaPayload, DeltaRecord, NamedState};
pub use error::ProtoError;
pub use id::ReplicaId;
pub use message::{DataMessage, Envelope, Hello, NewStates, PeerInfo, Presentation, SyncMessage};
pub use shared::Shared;
