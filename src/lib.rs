//! meshsync - peer-to-peer delta-CRDT replication.
//!
//! Every collaboration keeps a ring of known replicas, connects to a small
//! bounded subset of it and exchanges deltas with those peers through a
//! push/pull anti-entropy protocol keyed by vector clocks.

pub mod collaboration;
pub mod config;
pub mod error;
pub mod http;
pub mod keys;
pub mod metrics;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use collaboration::{Collaboration, CollaborationBuilder};
pub use config::{Config, ReplicationOptions};
pub use error::{ReplicationError, ReplicationResult};
pub use meshsync_proto::{ReplicaId, Shared, VectorClock};
