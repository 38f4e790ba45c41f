//! Collaborations: the per-document replication engine.
//!
//! A root collaboration owns the ring and the connection manager for its
//! protocol. Children created with [`Collaboration::sub`] share the root's
//! clock table, tracker and connections; their messages are multiplexed on
//! the root's sessions by collaboration path.

use crate::config::ReplicationOptions;
use crate::keys::Keys;
use crate::sync::{
    Children, ClockStore, CollabNode, ConnectionManager, ReplicationTracker, Ring, Role,
    SessionFactory, run_session,
};
use crate::transport::{Connection, Transport};
use meshsync_proto::{ReplicaId, Shared, VectorClock};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Protocol name for a collaboration.
pub fn protocol_name(collaboration: &str) -> String {
    format!("/meshsync/{collaboration}/1.0.0")
}

struct RootShared {
    ring: Arc<Ring>,
    manager: ConnectionManager,
    stop: Mutex<CancellationToken>,
}

impl RootShared {
    fn stop_token(&self) -> CancellationToken {
        self.stop.lock().clone()
    }
}

struct CollabInner {
    node: CollabNode,
    root: Arc<RootShared>,
    subs: RwLock<Vec<Collaboration>>,
}

/// Handle on one collaboration of a tree. Cheap to clone.
#[derive(Clone)]
pub struct Collaboration {
    inner: Arc<CollabInner>,
}

/// Builder for a root collaboration.
pub struct CollaborationBuilder {
    name: String,
    shared: Arc<dyn Shared>,
    transport: Arc<dyn Transport>,
    options: ReplicationOptions,
    keys: Option<Arc<dyn Keys>>,
}

impl CollaborationBuilder {
    pub fn new(name: impl Into<String>, shared: Arc<dyn Shared>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            shared,
            transport,
            options: ReplicationOptions::default(),
            keys: None,
        }
    }

    pub fn options(mut self, options: ReplicationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn keys(mut self, keys: Arc<dyn Keys>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn build(self) -> Collaboration {
        let local = self.transport.local_id().clone();
        let options = Arc::new(self.options);
        let ring = Arc::new(Ring::new(options.ring_key_bytes));

        let inner = Arc::new_cyclic(|weak: &Weak<CollabInner>| {
            let sessions = Arc::new(TreeSessions { root: weak.clone() });
            let manager = ConnectionManager::new(
                protocol_name(&self.name),
                self.transport,
                Arc::clone(&ring),
                Arc::clone(&options),
                sessions,
            );
            CollabInner {
                node: CollabNode {
                    path: self.name.clone(),
                    local: local.clone(),
                    shared: self.shared,
                    children: Children::default(),
                    clocks: ClockStore::new(local, &self.name),
                    replication: ReplicationTracker::new(),
                    keys: self.keys,
                    options,
                },
                root: Arc::new(RootShared {
                    ring,
                    manager,
                    stop: Mutex::new(CancellationToken::new()),
                }),
                subs: RwLock::new(Vec::new()),
            }
        });
        Collaboration { inner }
    }
}

/// Starts sessions for the whole tree on the root's connections.
struct TreeSessions {
    root: Weak<CollabInner>,
}

impl TreeSessions {
    fn spawn(&self, conn: Connection, role: Role) {
        let Some(inner) = self.root.upgrade() else {
            debug!(peer = %conn.remote, "Collaboration gone, dropping connection");
            conn.closed.cancel();
            return;
        };
        let root = Collaboration { inner };
        let nodes = root.tree();
        let stop = root.inner.root.stop_token();
        tokio::spawn(async move {
            // Errors are logged by the session.
            let _ = run_session(conn, role, nodes, stop).await;
        });
    }
}

impl SessionFactory for TreeSessions {
    fn dialed(&self, conn: Connection) {
        self.spawn(conn, Role::Dialer);
    }

    fn accepted(&self, conn: Connection) {
        self.spawn(conn, Role::Listener);
    }
}

impl Collaboration {
    pub fn builder(
        name: impl Into<String>,
        shared: Arc<dyn Shared>,
        transport: Arc<dyn Transport>,
    ) -> CollaborationBuilder {
        CollaborationBuilder::new(name, shared, transport)
    }

    /// Start replicating: accept and open connections, and track the local
    /// clock of every collaboration in the tree.
    pub fn start(&self) {
        let root = &self.inner.root;
        let stop = {
            let mut stop = root.stop.lock();
            if stop.is_cancelled() {
                *stop = CancellationToken::new();
            }
            stop.clone()
        };

        for node in self.tree() {
            spawn_clock_watcher(node, stop.clone());
        }
        root.ring.add(self.local());
        root.manager.start();
        info!(collaboration = %self.path(), local = %self.local(), "Collaboration started");
    }

    /// End every session of the tree and stop the connection manager.
    pub async fn stop(&self) {
        self.inner.root.stop_token().cancel();
        self.inner.root.manager.stop().await;
        info!(collaboration = %self.path(), "Collaboration stopped");
    }

    /// Create a child collaboration replicated over this tree's connections.
    ///
    /// Children should be created before [`start`](Self::start); sessions
    /// already running do not pick up new children.
    pub fn sub(&self, name: &str, shared: Arc<dyn Shared>) -> Collaboration {
        let parent = &self.inner.node;
        let path = format!("{}/{}", parent.path, name);
        let child = Collaboration {
            inner: Arc::new(CollabInner {
                node: CollabNode {
                    path: path.clone(),
                    local: parent.local.clone(),
                    shared: Arc::clone(&shared),
                    children: Children::default(),
                    clocks: parent.clocks.scoped(&path),
                    replication: parent.replication.clone(),
                    keys: parent.keys.clone(),
                    options: Arc::clone(&parent.options),
                },
                root: Arc::clone(&self.inner.root),
                subs: RwLock::new(Vec::new()),
            }),
        };
        parent.children.write().insert(name.to_string(), shared);
        self.inner.subs.write().push(child.clone());
        child
    }

    /// This collaboration and every descendant, parents first.
    pub fn tree(&self) -> Vec<CollabNode> {
        let mut nodes = vec![self.inner.node.clone()];
        for sub in self.inner.subs.read().iter() {
            nodes.extend(sub.tree());
        }
        nodes
    }

    pub fn path(&self) -> &str {
        &self.inner.node.path
    }

    pub fn local(&self) -> &ReplicaId {
        &self.inner.node.local
    }

    pub fn shared(&self) -> &Arc<dyn Shared> {
        &self.inner.node.shared
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.inner.root.ring
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.root.manager
    }

    pub fn replication(&self) -> &ReplicationTracker {
        &self.inner.node.replication
    }

    pub fn clocks(&self) -> &ClockStore {
        &self.inner.node.clocks
    }

    /// Best-known clock of `peer` for this collaboration.
    pub fn vector_clock(&self, peer: &ReplicaId) -> VectorClock {
        self.inner.node.clocks.get_for(peer)
    }
}

/// Keep the local entry of the clock table in step with the document.
fn spawn_clock_watcher(node: CollabNode, stop: CancellationToken) {
    let mut clock_rx = node.shared.subscribe_clock();
    let initial = clock_rx.borrow_and_update().clone();
    node.clocks.set_for(&node.local, &initial, false, false);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                changed = clock_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let clock = clock_rx.borrow_and_update().clone();
                    node.clocks.set_for(&node.local, &clock, false, false);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use meshsync_crdt::AppendLog;
    use std::time::Duration;

    fn collaboration(network: &MemoryNetwork, id: &str) -> (Collaboration, Arc<AppendLog>) {
        let log = Arc::new(AppendLog::new(ReplicaId::new(id), "doc"));
        let collab = Collaboration::builder("doc", log.clone(), network.transport(id)).build();
        (collab, log)
    }

    #[test]
    fn test_protocol_name() {
        assert_eq!(protocol_name("doc"), "/meshsync/doc/1.0.0");
    }

    #[tokio::test]
    async fn test_tree_paths_and_scoped_clocks() {
        let network = MemoryNetwork::new();
        let (root, _log) = collaboration(&network, "a");
        let comments = root.sub("comments", Arc::new(AppendLog::new(ReplicaId::new("a"), "c")));
        comments.sub("votes", Arc::new(AppendLog::new(ReplicaId::new("a"), "v")));

        let paths: Vec<_> = root.tree().into_iter().map(|n| n.path).collect();
        assert_eq!(paths, vec!["doc", "doc/comments", "doc/comments/votes"]);
        assert_eq!(comments.clocks().scope(), "doc/comments");
        assert!(Arc::ptr_eq(comments.ring(), root.ring()));
        assert!(root.inner.node.children.read().contains_key("comments"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_clock_is_tracked() {
        let network = MemoryNetwork::new();
        let (collab, log) = collaboration(&network, "a");
        log.push("before start").unwrap();
        collab.start();
        assert_eq!(collab.vector_clock(&ReplicaId::new("a")), log.clock());

        log.push("after start").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(collab.vector_clock(&ReplicaId::new("a")), log.clock());
        collab.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_peers_replicate_root_and_child() {
        let network = MemoryNetwork::new();
        let (a, log_a) = collaboration(&network, "a");
        let (b, log_b) = collaboration(&network, "b");
        let child_a = Arc::new(AppendLog::new(ReplicaId::new("a"), "doc/notes"));
        let child_b = Arc::new(AppendLog::new(ReplicaId::new("b"), "doc/notes"));
        a.sub("notes", child_a.clone());
        b.sub("notes", child_b.clone());

        log_a.push("from a").unwrap();
        child_a.push("note from a").unwrap();
        log_b.push("from b").unwrap();

        a.ring().add(&ReplicaId::new("b"));
        b.ring().add(&ReplicaId::new("a"));
        a.start();
        b.start();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(log_a.value(), log_b.value());
        assert_eq!(log_a.len(), 2);
        assert_eq!(child_b.value(), vec!["note from a"]);
        assert_eq!(a.manager().outbound_connected_peers(), vec![ReplicaId::new("b")]);

        a.stop().await;
        b.stop().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(b.manager().outbound_connection_count(), 0);
        assert_eq!(a.manager().inbound_connection_count(), 0);
    }
}
