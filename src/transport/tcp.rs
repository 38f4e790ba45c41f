//! TCP transport.
//!
//! Each connection opens with a length-prefixed `Hello { from, protocol }`
//! frame from the dialer, answered by a single byte: `1` when the listener
//! handles the protocol, `0` otherwise.

use super::{Connection, Handlers, InboundHandler, PeerStream, Transport};
use crate::error::DialError;
use async_trait::async_trait;
use dashmap::DashMap;
use meshsync_proto::codec::{from_slice, to_vec};
use meshsync_proto::{Hello, ProtoError, ReplicaId};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HELLO_LEN: usize = 64 * 1024;
const ACCEPTED: u8 = 1;
const REJECTED: u8 = 0;

/// TCP listener plus an address book of known peers.
pub struct TcpTransport {
    local: ReplicaId,
    local_addr: SocketAddr,
    addresses: DashMap<ReplicaId, SocketAddr>,
    handlers: Arc<Handlers>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    /// Bind the listener and start accepting connections.
    pub async fn bind(local: ReplicaId, addr: SocketAddr) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let handlers = Arc::new(Handlers::default());
        let shutdown = CancellationToken::new();

        info!(address = %local_addr, id = %local, "Replication listener started");
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&handlers),
            shutdown.clone(),
        ));

        Ok(Arc::new(Self {
            local,
            local_addr,
            addresses: DashMap::new(),
            handlers,
            shutdown,
        }))
    }

    pub fn add_address(&self, peer: ReplicaId, addr: SocketAddr) {
        self.addresses.insert(peer, addr);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, handlers: Arc<Handlers>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Replication listener stopping");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(peer = %peer_addr, "Inbound replication connection");
                        let handlers = Arc::clone(&handlers);
                        tokio::spawn(async move {
                            match tokio::time::timeout(HELLO_TIMEOUT, accept_one(stream, &handlers)).await {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => warn!(peer = %peer_addr, error = %e, "Inbound handshake failed"),
                                Err(_) => warn!(peer = %peer_addr, "Inbound handshake timeout"),
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                }
            }
        }
    }
}

async fn accept_one(mut stream: TcpStream, handlers: &Handlers) -> Result<(), ProtoError> {
    stream.set_nodelay(true)?;
    let hello = read_hello(&mut stream).await?;
    let Some(handler) = handlers.get(&hello.protocol) else {
        debug!(peer = %hello.from, protocol = %hello.protocol, "Protocol not handled");
        stream.write_u8(REJECTED).await?;
        return Ok(());
    };
    stream.write_u8(ACCEPTED).await?;
    handler(Connection::new(
        hello.from,
        hello.protocol,
        PeerStream::Tcp(stream),
    ));
    Ok(())
}

async fn read_hello(stream: &mut TcpStream) -> Result<Hello, ProtoError> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_HELLO_LEN {
        return Err(ProtoError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("hello frame of {len} bytes"),
        )));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    from_slice(&buf)
}

async fn write_hello(stream: &mut TcpStream, hello: &Hello) -> Result<(), ProtoError> {
    let body = to_vec(hello)?;
    let len = u32::try_from(body.len()).map_err(|_| {
        ProtoError::Io(io::Error::new(io::ErrorKind::InvalidInput, "hello too large"))
    })?;
    stream.write_u32(len).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_id(&self) -> &ReplicaId {
        &self.local
    }

    async fn connect(&self, peer: &ReplicaId, protocol: &str) -> Result<Connection, DialError> {
        let Some(addr) = self.addresses.get(peer).map(|a| *a) else {
            return Err(DialError::UnknownPeer(peer.clone()));
        };

        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let hello = Hello {
            from: self.local.clone(),
            protocol: protocol.to_string(),
        };
        let answer = tokio::time::timeout(HELLO_TIMEOUT, async {
            write_hello(&mut stream, &hello).await?;
            Ok::<_, ProtoError>(stream.read_u8().await?)
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timeout"))??;

        if answer != ACCEPTED {
            return Err(DialError::ProtocolNotHandled {
                peer: peer.clone(),
                protocol: protocol.to_string(),
            });
        }

        let conn = Connection::new(peer.clone(), protocol, PeerStream::Tcp(stream));
        self.handlers.track(peer, protocol, conn.closed.clone());
        Ok(conn)
    }

    fn disconnect(&self, peer: &ReplicaId, protocol: &str) {
        self.handlers.disconnect(peer, protocol);
    }

    fn handle(&self, protocol: &str, handler: InboundHandler) {
        self.handlers.set(protocol, handler);
    }

    fn unhandle(&self, protocol: &str) {
        self.handlers.remove(protocol);
    }
}
