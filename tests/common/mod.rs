//! Integration test common infrastructure.
//!
//! Builds meshes of append-log collaborations on a [`MemoryNetwork`], every
//! ring seeded with every peer.

pub mod mesh;

#[allow(unused_imports)]
pub use mesh::{TestMesh, TestPeer};
