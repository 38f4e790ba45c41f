//! Unified error handling for meshsync.
//!
//! One enum per concern, each with a static `error_code()` for metric
//! labels. `ReplicationError::is_expected_network_error` decides which
//! session failures are ordinary churn and which deserve an error log.

use meshsync_proto::{ProtoError, ReplicaId};
use std::io;
use thiserror::Error;

// ============================================================================
// Replication Errors (session and protocol processing)
// ============================================================================

/// Errors that end a replication session.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A full-state push did not carry the state of the collaboration itself.
    #[error("expected root state in full-state push")]
    MissingRootState,

    #[error("unexpected {0} message for this side of the protocol")]
    UnexpectedMessage(&'static str),

    /// The session's outbound queue is gone.
    #[error("session channel closed")]
    ChannelClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Proto(e) => e.error_code(),
            Self::Crypto(e) => e.error_code(),
            Self::Transport(e) => e.error_code(),
            Self::MissingRootState => "missing_root_state",
            Self::UnexpectedMessage(_) => "unexpected_message",
            Self::ChannelClosed => "channel_closed",
            Self::Internal(_) => "internal_error",
        }
    }

    /// True for errors caused by the peer going away rather than by a bug or
    /// a bad message. These end the session quietly.
    pub fn is_expected_network_error(&self) -> bool {
        match self {
            Self::Proto(ProtoError::Io(e)) => is_expected_io_error(e),
            Self::Transport(TransportError::Io(e)) => is_expected_io_error(e),
            Self::Transport(TransportError::Closed) | Self::ChannelClosed => true,
            _ => false,
        }
    }
}

fn is_expected_io_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

// ============================================================================
// Transport Errors
// ============================================================================

/// Failure to open a connection to a peer.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("peer {0} is unreachable")]
    Unreachable(ReplicaId),

    #[error("no address known for peer {0}")]
    UnknownPeer(ReplicaId),

    #[error("peer {peer} does not handle protocol {protocol}")]
    ProtocolNotHandled { peer: ReplicaId, protocol: String },

    #[error("dial io error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] ProtoError),
}

impl DialError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::UnknownPeer(_) => "unknown_peer",
            Self::ProtocolNotHandled { .. } => "protocol_not_handled",
            Self::Io(_) => "io",
            Self::Handshake(_) => "handshake",
        }
    }
}

/// Failure of an established connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed")]
    Closed,
}

impl TransportError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "transport_io",
            Self::Closed => "transport_closed",
        }
    }
}

// ============================================================================
// Crypto Errors
// ============================================================================

/// Signing, verification and sealing failures.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("delta has invalid signature")]
    InvalidSignature,

    #[error("failed to decrypt payload")]
    Decrypt,

    #[error("failed to encrypt payload")]
    Encrypt,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("sealed payload malformed: {0}")]
    Malformed(#[from] ProtoError),
}

impl CryptoError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid_signature",
            Self::Decrypt => "decrypt",
            Self::Encrypt => "encrypt",
            Self::InvalidKey(_) => "invalid_key",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Result type for protocol processing.
pub type ReplicationResult<T = ()> = Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_network_errors() {
        let reset = ReplicationError::Proto(ProtoError::Io(io::Error::from(
            io::ErrorKind::ConnectionReset,
        )));
        assert!(reset.is_expected_network_error());

        let eof = ReplicationError::Transport(TransportError::Io(io::Error::from(
            io::ErrorKind::UnexpectedEof,
        )));
        assert!(eof.is_expected_network_error());

        assert!(ReplicationError::ChannelClosed.is_expected_network_error());
        assert!(ReplicationError::Transport(TransportError::Closed).is_expected_network_error());
    }

    #[test]
    fn test_unexpected_errors() {
        assert!(!ReplicationError::MissingRootState.is_expected_network_error());
        assert!(
            !ReplicationError::Crypto(CryptoError::InvalidSignature).is_expected_network_error()
        );

        let denied = ReplicationError::Proto(ProtoError::Io(io::Error::from(
            io::ErrorKind::PermissionDenied,
        )));
        assert!(!denied.is_expected_network_error());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ReplicationError::MissingRootState.error_code(), "missing_root_state");
        assert_eq!(
            ReplicationError::Crypto(CryptoError::InvalidSignature).error_code(),
            "invalid_signature"
        );
        assert_eq!(
            DialError::Unreachable(ReplicaId::new("a")).error_code(),
            "unreachable"
        );
    }
}
