//! MessagePack values in length-delimited frames.

use crate::error::ProtoError;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame accepted on the wire.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Serialize a value to MessagePack with named fields.
pub fn to_vec<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProtoError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Deserialize a MessagePack value.
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtoError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Frame codec for any serde type `T`.
///
/// Each frame is a big-endian `u32` length followed by the MessagePack body.
pub struct FrameCodec<T> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FrameCodec<T> {
    /// Create a codec with the default frame limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    /// Create a codec with a custom frame limit.
    #[must_use]
    pub fn with_max_frame_len(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for FrameCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("max_frame_length", &self.inner.max_frame_length())
            .finish()
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = ProtoError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = to_vec(&item)?;
        self.inner.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}
