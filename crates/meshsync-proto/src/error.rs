//! Error types for the meshsync protocol library.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtoError`].
pub type Result<T, E = ProtoError> = std::result::Result<T, E>;

/// Protocol-level errors: framing, encoding and decoding.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtoError {
    /// I/O error during reading or writing a frame.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A value could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A frame did not hold a valid message.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// A CRDT state payload was not understood by the collaborator.
    #[error("invalid state for {type_name}: {reason}")]
    InvalidState {
        /// The CRDT type that rejected the payload.
        type_name: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ProtoError {
    /// Static label for metrics and logs.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Encode(_) => "encode",
            Self::Decode(_) => "decode",
            Self::InvalidState { .. } => "invalid_state",
        }
    }
}
