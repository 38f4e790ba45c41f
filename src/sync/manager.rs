//! Connection lifecycle for the overlay.
//!
//! Reconciles outbound connections against the Dias peer set of the local
//! node. A pass runs after a debounced ring change and periodically as a
//! safety net. Peers that keep failing to dial are evicted from the ring.

use super::debounce::Debounce;
use super::dias::dias_peer_set;
use super::ring::Ring;
use crate::config::ReplicationOptions;
use crate::metrics;
use crate::telemetry::spans;
use crate::transport::{Connection, Transport};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use meshsync_proto::ReplicaId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Starts sessions on connections the manager opens or accepts.
pub trait SessionFactory: Send + Sync + 'static {
    /// A dial succeeded.
    fn dialed(&self, conn: Connection);

    /// A peer connected to us.
    fn accepted(&self, conn: Connection);
}

/// Membership events for the discovery layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Connected(ReplicaId),
    Disconnected(ReplicaId),
    /// The peer failed too many dials and was removed from the ring.
    ShouldEvict(ReplicaId),
    InboundConnected(ReplicaId),
    InboundClosed(ReplicaId),
}

/// Where the manager stands with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Dialing,
    ConnectedInbound,
    ConnectedOutbound,
    Absent,
}

struct Tracked {
    closed: CancellationToken,
    generation: u64,
}

struct ManagerInner {
    local: ReplicaId,
    protocol: String,
    transport: Arc<dyn Transport>,
    ring: Arc<Ring>,
    options: Arc<ReplicationOptions>,
    sessions: Arc<dyn SessionFactory>,
    outbound: DashMap<ReplicaId, Tracked>,
    inbound: DashMap<ReplicaId, Tracked>,
    /// In-flight dials, by the generation that started them.
    dials: DashMap<ReplicaId, u64>,
    generation: AtomicU64,
    unreachable: DashMap<ReplicaId, u32>,
    events: broadcast::Sender<MembershipEvent>,
    stopped: AtomicBool,
    loop_token: Mutex<Option<CancellationToken>>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        protocol: impl Into<String>,
        transport: Arc<dyn Transport>,
        ring: Arc<Ring>,
        options: Arc<ReplicationOptions>,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                local: transport.local_id().clone(),
                protocol: protocol.into(),
                transport,
                ring,
                options,
                sessions,
                outbound: DashMap::new(),
                inbound: DashMap::new(),
                dials: DashMap::new(),
                generation: AtomicU64::new(0),
                unreachable: DashMap::new(),
                events,
                stopped: AtomicBool::new(false),
                loop_token: Mutex::new(None),
            }),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: MembershipEvent) {
        let _ = self.inner.events.send(event);
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Accept inbound connections and start reconciling.
    pub fn start(&self) {
        let inner = &self.inner;
        inner.stopped.store(false, Ordering::SeqCst);

        let weak = Arc::downgrade(&self.inner);
        inner.transport.handle(
            &inner.protocol,
            Arc::new(move |conn: Connection| {
                if let Some(inner) = weak.upgrade() {
                    ConnectionManager { inner }.on_inbound(conn);
                }
            }),
        );

        let token = CancellationToken::new();
        if let Some(previous) = inner.loop_token.lock().replace(token.clone()) {
            previous.cancel();
        }
        tokio::spawn(reconcile_loop(
            Arc::downgrade(&self.inner),
            inner.ring.subscribe(),
            Debounce::new(inner.options.debounce_reset_connections()),
            inner.options.reset_connection_interval(),
            token,
        ));
        info!(local = %inner.local, protocol = %inner.protocol, "Connection manager started");
    }

    /// Stop reconciling, refuse inbound connections and hang up on every
    /// outbound peer.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.stopped.store(true, Ordering::SeqCst);
        if let Some(token) = inner.loop_token.lock().take() {
            token.cancel();
        }
        inner.transport.unhandle(&inner.protocol);
        self.reset_connections().await;
        info!(local = %inner.local, "Connection manager stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// One reconciliation pass.
    ///
    /// Dials missing targets, hangs up on peers no longer targeted and
    /// cancels dials to them. Resolves once this pass's dials completed.
    pub async fn reset_connections(&self) {
        let span = spans::reconcile(&self.inner.protocol, self.inner.local.as_str());
        self.reconcile().instrument(span).await;
    }

    async fn reconcile(&self) {
        let inner = &self.inner;
        let target = if self.is_stopped() {
            BTreeSet::new()
        } else {
            dias_peer_set(&inner.local, &inner.ring)
        };
        debug!(targets = target.len(), "Reconciling connections");

        inner.dials.retain(|peer, _| target.contains(peer));

        let stale: Vec<ReplicaId> = inner
            .outbound
            .iter()
            .filter(|entry| !target.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for peer in stale {
            self.hang_up(&peer);
        }

        let mut claimed = Vec::new();
        for peer in target {
            if inner.outbound.contains_key(&peer) {
                continue;
            }
            if let Entry::Vacant(slot) = inner.dials.entry(peer.clone()) {
                let generation = self.next_generation();
                slot.insert(generation);
                claimed.push((peer, generation));
            }
        }
        join_all(
            claimed
                .into_iter()
                .map(|(peer, generation)| self.dial(peer, generation)),
        )
        .await;
    }

    async fn dial(&self, peer: ReplicaId, generation: u64) {
        let inner = &self.inner;
        debug!(peer = %peer, "Dialing");
        let result = inner.transport.connect(&peer, &inner.protocol).await;
        let wanted = inner
            .dials
            .remove_if(&peer, |_, g| *g == generation)
            .is_some();

        match result {
            Ok(conn) if !wanted => {
                debug!(peer = %peer, "Dial completed after cancellation, dropping");
                metrics::record_dial("cancelled");
                conn.closed.cancel();
            }
            Ok(conn) => {
                metrics::record_dial("ok");
                self.on_outbound(conn, generation);
            }
            Err(e) => {
                metrics::record_dial("failed");
                warn!(peer = %peer, error = %e, code = e.error_code(), "Dial failed");
                if wanted {
                    self.peer_unreachable(&peer);
                }
            }
        }
    }

    fn on_outbound(&self, conn: Connection, generation: u64) {
        let inner = &self.inner;
        let peer = conn.remote.clone();
        let closed = conn.closed.clone();

        inner.unreachable.remove(&peer);
        inner.outbound.insert(
            peer.clone(),
            Tracked {
                closed: closed.clone(),
                generation,
            },
        );
        metrics::set_outbound_peers(inner.outbound.len());
        info!(peer = %peer, "Connected");
        self.emit(MembershipEvent::Connected(peer.clone()));

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            closed.cancelled().await;
            let Some(inner) = weak.upgrade() else { return };
            inner
                .outbound
                .remove_if(&peer, |_, tracked| tracked.generation == generation);
            metrics::set_outbound_peers(inner.outbound.len());
            // The peer stays in the ring; only repeated dial failures evict it.
            // Observers never see a disconnect inside the pass that caused it.
            tokio::task::yield_now().await;
            info!(peer = %peer, "Disconnected");
            let _ = inner.events.send(MembershipEvent::Disconnected(peer));
        });

        inner.sessions.dialed(conn);
    }

    fn on_inbound(&self, conn: Connection) {
        let inner = &self.inner;
        let peer = conn.remote.clone();
        let closed = conn.closed.clone();
        let generation = self.next_generation();

        inner.inbound.insert(
            peer.clone(),
            Tracked {
                closed: closed.clone(),
                generation,
            },
        );
        inner.ring.add(&peer);
        metrics::set_inbound_peers(inner.inbound.len());
        debug!(peer = %peer, "Inbound connection");
        self.emit(MembershipEvent::InboundConnected(peer.clone()));

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            closed.cancelled().await;
            let Some(inner) = weak.upgrade() else { return };
            inner
                .inbound
                .remove_if(&peer, |_, tracked| tracked.generation == generation);
            metrics::set_inbound_peers(inner.inbound.len());
            tokio::task::yield_now().await;
            let _ = inner.events.send(MembershipEvent::InboundClosed(peer));
        });

        inner.sessions.accepted(conn);
    }

    fn hang_up(&self, peer: &ReplicaId) {
        let inner = &self.inner;
        debug!(peer = %peer, "Hanging up");
        inner.dials.remove(peer);
        inner.transport.disconnect(peer, &inner.protocol);
        if let Some((_, tracked)) = inner.outbound.remove(peer) {
            tracked.closed.cancel();
        }
        inner.unreachable.remove(peer);
        metrics::set_outbound_peers(inner.outbound.len());
    }

    fn peer_unreachable(&self, peer: &ReplicaId) {
        let inner = &self.inner;
        let failures = {
            let mut count = inner.unreachable.entry(peer.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if failures < inner.options.max_unreachable_before_eviction {
            return;
        }

        inner.unreachable.remove(peer);
        inner.ring.remove(peer);
        metrics::record_eviction();
        warn!(peer = %peer, failures, "Evicting unreachable peer");
        self.emit(MembershipEvent::ShouldEvict(peer.clone()));
    }

    pub fn unreachable_count(&self, peer: &ReplicaId) -> u32 {
        self.inner.unreachable.get(peer).map_or(0, |c| *c)
    }

    pub fn outbound_connection_count(&self) -> usize {
        self.inner.outbound.len()
    }

    pub fn outbound_connected_peers(&self) -> Vec<ReplicaId> {
        sorted_keys(&self.inner.outbound)
    }

    pub fn inbound_connection_count(&self) -> usize {
        self.inner.inbound.len()
    }

    pub fn inbound_connected_peers(&self) -> Vec<ReplicaId> {
        sorted_keys(&self.inner.inbound)
    }

    pub fn connection_state(&self, peer: &ReplicaId) -> ConnectionState {
        let inner = &self.inner;
        if inner.outbound.contains_key(peer) {
            ConnectionState::ConnectedOutbound
        } else if inner.inbound.contains_key(peer) {
            ConnectionState::ConnectedInbound
        } else if inner.dials.contains_key(peer) {
            ConnectionState::Dialing
        } else {
            ConnectionState::Absent
        }
    }
}

fn sorted_keys(map: &DashMap<ReplicaId, Tracked>) -> Vec<ReplicaId> {
    let mut keys: Vec<_> = map.iter().map(|entry| entry.key().clone()).collect();
    keys.sort();
    keys
}

async fn reconcile_loop(
    manager: Weak<ManagerInner>,
    mut ring_rx: tokio::sync::watch::Receiver<u64>,
    mut debounce: Debounce,
    period: std::time::Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            changed = ring_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                debounce.trigger();
                continue;
            }
            _ = debounce.wait() => {}
            _ = interval.tick() => {}
        }

        let Some(inner) = manager.upgrade() else { break };
        let manager = ConnectionManager { inner };
        // Passes overlap so a removal can cancel a dial still in flight.
        tokio::spawn(async move { manager.reset_connections().await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Hands every connection to the test instead of running a session.
    struct Capture {
        dialed: mpsc::UnboundedSender<Connection>,
        accepted: mpsc::UnboundedSender<Connection>,
    }

    impl SessionFactory for Capture {
        fn dialed(&self, conn: Connection) {
            let _ = self.dialed.send(conn);
        }

        fn accepted(&self, conn: Connection) {
            let _ = self.accepted.send(conn);
        }
    }

    struct Node {
        manager: ConnectionManager,
        ring: Arc<Ring>,
        dialed: mpsc::UnboundedReceiver<Connection>,
        accepted: mpsc::UnboundedReceiver<Connection>,
    }

    fn options(max_unreachable: u32) -> Arc<ReplicationOptions> {
        Arc::new(ReplicationOptions {
            max_unreachable_before_eviction: max_unreachable,
            ..ReplicationOptions::default()
        })
    }

    fn node(network: &MemoryNetwork, id: &str, options: Arc<ReplicationOptions>) -> Node {
        let (dialed_tx, dialed) = mpsc::unbounded_channel();
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        let ring = Arc::new(Ring::new(options.ring_key_bytes));
        let manager = ConnectionManager::new(
            "/test/1",
            network.transport(id),
            Arc::clone(&ring),
            options,
            Arc::new(Capture {
                dialed: dialed_tx,
                accepted: accepted_tx,
            }),
        );
        Node {
            manager,
            ring,
            dialed,
            accepted,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_to_target_and_reports_events() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, "a", options(10));
        let mut b = node(&network, "b", options(10));
        let mut events = a.manager.subscribe();
        b.manager.start();

        let peer_b = ReplicaId::new("b");
        a.ring.add(&peer_b);
        a.manager.reset_connections().await;

        assert_eq!(a.manager.connection_state(&peer_b), ConnectionState::ConnectedOutbound);
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Connected(peer_b.clone()));
        let outbound = a.dialed.recv().await.unwrap();
        let inbound = b.accepted.recv().await.unwrap();
        assert_eq!(inbound.remote, ReplicaId::new("a"));
        assert!(b.ring.has(&ReplicaId::new("a")));
        assert_eq!(b.manager.inbound_connected_peers(), vec![ReplicaId::new("a")]);
        assert_eq!(
            b.manager.connection_state(&ReplicaId::new("a")),
            ConnectionState::ConnectedInbound
        );

        outbound.closed.cancel();
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Disconnected(peer_b.clone()));
        assert_eq!(a.manager.outbound_connection_count(), 0);

        inbound.closed.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(b.manager.inbound_connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_peer_stays_in_ring_and_is_redialed() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, "a", options(10));
        let b = node(&network, "b", options(10));
        b.manager.start();
        let peer_b = ReplicaId::new("b");
        let mut events = a.manager.subscribe();

        a.ring.add(&peer_b);
        a.manager.reset_connections().await;
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Connected(peer_b.clone()));
        a.dialed.recv().await.unwrap().closed.cancel();
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Disconnected(peer_b.clone()));
        assert!(a.ring.has(&peer_b));

        a.manager.reset_connections().await;
        assert_eq!(a.manager.connection_state(&peer_b), ConnectionState::ConnectedOutbound);
        assert_eq!(network.dial_count(&peer_b), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_after_repeated_failures() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", options(3));
        let _b = node(&network, "b", options(3));
        let peer_b = ReplicaId::new("b");
        network.set_reachable(&peer_b, false);
        let mut events = a.manager.subscribe();

        a.ring.add(&peer_b);
        for _ in 0..2 {
            a.manager.reset_connections().await;
        }
        assert_eq!(a.manager.unreachable_count(&peer_b), 2);
        assert!(a.ring.has(&peer_b));

        a.manager.reset_connections().await;
        assert!(!a.ring.has(&peer_b));
        assert_eq!(a.manager.unreachable_count(&peer_b), 0);
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::ShouldEvict(peer_b.clone()));

        // Evicted peers are no longer targeted.
        for _ in 0..3 {
            a.manager.reset_connections().await;
        }
        assert_eq!(network.dial_count(&peer_b), 3);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_unreachable_counter() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, "a", options(3));
        let b = node(&network, "b", options(3));
        b.manager.start();
        let peer_b = ReplicaId::new("b");
        a.ring.add(&peer_b);

        network.set_reachable(&peer_b, false);
        a.manager.reset_connections().await;
        a.manager.reset_connections().await;
        assert_eq!(a.manager.unreachable_count(&peer_b), 2);

        network.set_reachable(&peer_b, true);
        a.manager.reset_connections().await;
        assert_eq!(a.manager.unreachable_count(&peer_b), 0);
        let conn = a.dialed.recv().await.unwrap();

        conn.closed.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        network.set_reachable(&peer_b, false);
        a.manager.reset_connections().await;
        a.manager.reset_connections().await;
        assert_eq!(a.manager.unreachable_count(&peer_b), 2);
        assert!(a.ring.has(&peer_b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_target_cancels_dial_in_flight() {
        let network = MemoryNetwork::new();
        network.set_dial_delay(Some(Duration::from_millis(500)));
        let mut a = node(&network, "a", options(10));
        let b = node(&network, "b", options(10));
        b.manager.start();
        let peer_b = ReplicaId::new("b");
        a.ring.add(&peer_b);

        let dialing = {
            let manager = a.manager.clone();
            tokio::spawn(async move { manager.reset_connections().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.manager.connection_state(&peer_b), ConnectionState::Dialing);

        a.ring.remove(&peer_b);
        a.manager.reset_connections().await;
        dialing.await.unwrap();

        assert_eq!(a.manager.connection_state(&peer_b), ConnectionState::Absent);
        assert!(a.dialed.try_recv().is_err());
        assert_eq!(a.manager.unreachable_count(&peer_b), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_change_triggers_debounced_pass() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, "a", options(10));
        let b = node(&network, "b", options(10));
        b.manager.start();
        a.manager.start();
        // Let the immediate first pass run on the empty ring.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let start = tokio::time::Instant::now();
        a.ring.add(&ReplicaId::new("b"));
        let conn = tokio::time::timeout(Duration::from_secs(5), a.dialed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.remote, ReplicaId::new("b"));
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(network.dial_count(&ReplicaId::new("b")), 1);
        a.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_hangs_up_everyone() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, "a", options(10));
        let b = node(&network, "b", options(10));
        b.manager.start();
        a.ring.add(&ReplicaId::new("b"));
        a.manager.start();
        a.manager.reset_connections().await;
        let conn = a.dialed.recv().await.unwrap();

        a.manager.stop().await;
        assert!(conn.closed.is_cancelled());
        assert_eq!(a.manager.outbound_connection_count(), 0);
        assert!(a.manager.is_stopped());
    }
}
