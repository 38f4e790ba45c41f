//! Unreachable peers are evicted from the ring, once.

mod common;

use common::TestMesh;
use meshsync::ReplicationOptions;
use meshsync::sync::{ConnectionState, MembershipEvent};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

fn options() -> ReplicationOptions {
    ReplicationOptions {
        max_unreachable_before_eviction: 3,
        reset_connection_interval_ms: 1_000,
        ..ReplicationOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_peer_is_evicted_once() {
    let mesh = TestMesh::new(2, options());
    let a = mesh.peer("peer-0");
    let b = mesh.peer("peer-1");
    mesh.network.set_reachable(&b.id, false);

    let mut events = a.collab.manager().subscribe();
    a.collab.start();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let mut evictions = 0;
    loop {
        let event = match events.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        };
        match event {
            MembershipEvent::ShouldEvict(peer) => {
                assert_eq!(peer, b.id);
                evictions += 1;
            }
            MembershipEvent::Connected(peer) => panic!("unexpected connect to {peer}"),
            _ => {}
        }
    }
    assert_eq!(evictions, 1);
    assert_eq!(mesh.network.dial_count(&b.id), 3);
    assert!(!a.collab.ring().has(&b.id));
    assert_eq!(a.collab.manager().connection_state(&b.id), ConnectionState::Absent);
    a.collab.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_recovered_peer_resets_counter() {
    let mesh = TestMesh::new(2, options());
    let a = mesh.peer("peer-0");
    let b = mesh.peer("peer-1");
    mesh.network.set_reachable(&b.id, false);

    b.collab.start();
    a.collab.start();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(a.collab.manager().unreachable_count(&b.id) >= 1);
    assert!(a.collab.ring().has(&b.id));

    mesh.network.set_reachable(&b.id, true);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(a.collab.manager().unreachable_count(&b.id), 0);
    assert_eq!(
        a.collab.manager().connection_state(&b.id),
        ConnectionState::ConnectedOutbound
    );
    assert!(a.collab.ring().has(&b.id));
    mesh.stop().await;
}
