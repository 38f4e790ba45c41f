//! A lazy pull side asks for eager mode when announced data never arrives.

mod common;

use common::TestMesh;
use meshsync::sync::ReplicationEvent;
use meshsync::{ReplicationOptions, Shared};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test(start_paused = true)]
async fn test_clock_announcement_escalates_to_eager() {
    let mesh = TestMesh::with_peers(&[
        ("alice", ReplicationOptions::default()),
        (
            "archive",
            ReplicationOptions {
                replicate_only: true,
                ..ReplicationOptions::default()
            },
        ),
    ]);
    let alice = mesh.peer("alice");
    let archive = mesh.peer("archive");
    mesh.start();
    tokio::time::sleep(Duration::from_secs(10)).await;

    // Alice pulls lazily from a pinner: the push only announces its clock.
    let mut events = alice.collab.replication().subscribe();
    archive.log.push("archived").unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(alice.log.is_empty());
    assert_eq!(alice.collab.vector_clock(&archive.id), archive.log.clock());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(alice.log.value(), vec!["archived"]);

    let mut received = false;
    loop {
        let event = match events.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        };
        if let ReplicationEvent::Received { peer, .. } = event {
            received |= peer == archive.id;
        }
    }
    assert!(received);
    mesh.stop().await;
}
