//! One replication session over one connection.
//!
//! Multiplexes every collaboration of a tree over a single framed stream.
//! Each collaboration gets its own protocol task with an inbox of depth one,
//! so messages for one peer are processed strictly one at a time and in
//! arrival order.

use super::pull::PullProtocol;
use super::push::PushProtocol;
use super::{CollabNode, Outbox};
use crate::error::{ReplicationError, ReplicationResult};
use crate::metrics;
use crate::telemetry::spans;
use crate::transport::{ByteCounters, Connection, Metered, PeerStream};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use meshsync_proto::{Envelope, FrameCodec, ReplicaId, SyncMessage};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

type FrameSink = SplitSink<Framed<Metered<PeerStream>, FrameCodec<Envelope>>, Envelope>;

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dialed: run the pull protocol.
    Dialer,
    /// We accepted: run the push protocol.
    Listener,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dialer => "dialer",
            Self::Listener => "listener",
        }
    }
}

/// Run a session until the connection closes, `stop` fires or a protocol
/// fails. The connection's `closed` token is cancelled on return.
///
/// Expected network errors are logged and reported as a clean end.
pub async fn run_session(
    conn: Connection,
    role: Role,
    nodes: Vec<CollabNode>,
    stop: CancellationToken,
) -> ReplicationResult {
    let collaboration = nodes.first().map(|n| n.path.clone()).unwrap_or_default();
    let span = spans::session(&collaboration, conn.remote.as_str(), role.as_str());
    let closed = conn.closed.clone();

    let result = async move {
        info!("Session started");
        let result = drive(conn, role, nodes, stop).await;
        match &result {
            Ok(()) => info!("Session ended"),
            Err(e) if e.is_expected_network_error() => {
                warn!(error = %e, "Session ended by network error");
            }
            Err(e) => {
                error!(error = %e, code = e.error_code(), "Session failed");
                metrics::record_session_error(e.error_code());
            }
        }
        result
    }
    .instrument(span)
    .await;

    closed.cancel();
    match result {
        Err(e) if e.is_expected_network_error() => Ok(()),
        other => other,
    }
}

async fn drive(
    conn: Connection,
    role: Role,
    nodes: Vec<CollabNode>,
    stop: CancellationToken,
) -> ReplicationResult {
    let Connection {
        remote,
        stream,
        closed,
        ..
    } = conn;

    let metered = Metered::new(stream);
    let counters = metered.counters();
    let (sink, mut frames) = Framed::new(metered, FrameCodec::<Envelope>::new()).split();

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Envelope>();
    let cancel = stop.child_token();
    let mut routes: HashMap<String, mpsc::Sender<SyncMessage>> = HashMap::new();
    let mut protocols = JoinSet::new();

    for node in nodes {
        let (tx, rx) = mpsc::channel(1);
        routes.insert(node.path.clone(), tx);
        let ctx = node.context(remote.clone(), Outbox::new(node.path.clone(), out_tx.clone()));
        match role {
            Role::Dialer => protocols.spawn(PullProtocol::new(ctx).run(rx, cancel.clone())),
            Role::Listener => protocols.spawn(PushProtocol::new(ctx).run(rx, cancel.clone())),
        };
    }
    drop(out_tx);

    let mut writer = tokio::spawn(write_loop(sink, out_rx));

    let result = loop {
        let step = tokio::select! {
            _ = closed.cancelled() => break Ok(()),
            _ = stop.cancelled() => break Ok(()),
            written = &mut writer => {
                break match written {
                    Ok(result) => result,
                    Err(e) => Err(ReplicationError::Internal(e.to_string())),
                };
            }
            Some(joined) = protocols.join_next() => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(ReplicationError::Internal(e.to_string())),
            },
            frame = frames.next() => match frame {
                Some(Ok(envelope)) => {
                    route(&routes, &remote, envelope).await;
                    Ok(())
                }
                Some(Err(e)) => Err(e.into()),
                None => break Ok(()),
            },
        };
        record_traffic(&remote, &counters);
        if let Err(e) = step {
            break Err(e);
        }
    };

    cancel.cancel();
    while protocols.join_next().await.is_some() {}
    writer.abort();
    record_traffic(&remote, &counters);
    result
}

async fn route(
    routes: &HashMap<String, mpsc::Sender<SyncMessage>>,
    remote: &ReplicaId,
    envelope: Envelope,
) {
    metrics::record_message_received(envelope.message.kind());
    debug!(
        peer = %remote,
        collaboration = %envelope.collaboration,
        kind = envelope.message.kind(),
        "Received"
    );
    match routes.get(&envelope.collaboration) {
        Some(tx) => {
            if tx.send(envelope.message).await.is_err() {
                debug!(collaboration = %envelope.collaboration, "Protocol already ended");
            }
        }
        None => debug!(collaboration = %envelope.collaboration, "Message for unknown collaboration"),
    }
}

/// Drain the outbox into the stream until every protocol has dropped its
/// sender.
async fn write_loop(mut sink: FrameSink, mut out_rx: mpsc::UnboundedReceiver<Envelope>) -> ReplicationResult {
    while let Some(envelope) = out_rx.recv().await {
        let kind = envelope.message.kind();
        sink.send(envelope).await?;
        metrics::record_message_sent(kind);
    }
    sink.close().await?;
    Ok(())
}

fn record_traffic(remote: &ReplicaId, counters: &ByteCounters) {
    let (sent, received) = counters.take();
    metrics::record_bytes_sent(remote.as_str(), sent);
    metrics::record_bytes_received(remote.as_str(), received);
}
