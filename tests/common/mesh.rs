//! Mesh of in-process peers.

use meshsync::transport::MemoryNetwork;
use meshsync::{Collaboration, ReplicaId, ReplicationOptions, Shared};
use meshsync_crdt::AppendLog;
use std::sync::Arc;

pub const COLLABORATION: &str = "doc";

/// One peer of a [`TestMesh`].
pub struct TestPeer {
    pub id: ReplicaId,
    pub log: Arc<AppendLog>,
    pub collab: Collaboration,
}

impl TestPeer {
    pub fn new(network: &MemoryNetwork, id: &str, options: ReplicationOptions) -> Self {
        let id = ReplicaId::new(id);
        let log = Arc::new(AppendLog::new(id.clone(), COLLABORATION));
        let collab = Collaboration::builder(COLLABORATION, log.clone(), network.transport(id.clone()))
            .options(options)
            .build();
        Self { id, log, collab }
    }
}

#[allow(dead_code)]
pub struct TestMesh {
    pub network: MemoryNetwork,
    pub peers: Vec<TestPeer>,
}

#[allow(dead_code)]
impl TestMesh {
    /// `count` peers named `peer-0`, `peer-1`, ... knowing each other.
    pub fn new(count: usize, options: ReplicationOptions) -> Self {
        let network = MemoryNetwork::new();
        let peers: Vec<TestPeer> = (0..count)
            .map(|i| TestPeer::new(&network, &format!("peer-{i}"), options.clone()))
            .collect();
        let mesh = Self { network, peers };
        mesh.introduce_all();
        mesh
    }

    /// Peers with per-peer options, by name.
    pub fn with_peers(peers: &[(&str, ReplicationOptions)]) -> Self {
        let network = MemoryNetwork::new();
        let peers = peers
            .iter()
            .map(|(id, options)| TestPeer::new(&network, id, options.clone()))
            .collect();
        let mesh = Self { network, peers };
        mesh.introduce_all();
        mesh
    }

    fn introduce_all(&self) {
        for peer in &self.peers {
            for other in &self.peers {
                peer.collab.ring().add(&other.id);
            }
        }
    }

    pub fn peer(&self, id: &str) -> &TestPeer {
        self.peers
            .iter()
            .find(|p| p.id.as_str() == id)
            .unwrap_or_else(|| panic!("no peer {id}"))
    }

    pub fn start(&self) {
        for peer in &self.peers {
            peer.collab.start();
        }
    }

    pub async fn stop(&self) {
        for peer in &self.peers {
            peer.collab.stop().await;
        }
    }

    /// True when every log holds the same entries under the same clock.
    pub fn converged(&self) -> bool {
        let Some(first) = self.peers.first() else {
            return true;
        };
        let value = first.log.value();
        let clock = first.log.clock();
        self.peers
            .iter()
            .all(|p| p.log.value() == value && p.log.clock() == clock)
    }
}
