//! Length-delimited CBOR framing.
//!
//! Every message travels as a 4-byte big-endian length followed by its CBOR
//! encoding. [`MessageCodec`] plugs into `tokio_util::codec::Framed` so both
//! ends of a connection get a typed `Sink`/`Stream`.

use crate::error::FrameError;
use crate::messages::{from_cbor, to_cbor, UploadRequest, UploadResponse};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame accepted on the wire.
///
/// Leaves room for the CBOR envelope around a full chunk and for large
/// metadata messages.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Codec that decodes `In` messages and encodes `Out` messages.
pub struct MessageCodec<In, Out> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn(Out) -> In>,
}

/// Codec used by clients: sends requests, receives responses.
pub type ClientCodec = MessageCodec<UploadResponse, UploadRequest>;

/// Codec used by the service: receives requests, sends responses.
pub type ServerCodec = MessageCodec<UploadRequest, UploadResponse>;

impl<In, Out> MessageCodec<In, Out> {
    /// Creates a codec with the default frame limit.
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    /// Creates a codec with a custom frame limit.
    pub fn with_max_frame_len(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for MessageCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> fmt::Debug for MessageCodec<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCodec")
            .field("max_frame_len", &self.inner.max_frame_length())
            .finish()
    }
}

impl<In: DeserializeOwned, Out> Decoder for MessageCodec<In, Out> {
    type Item = In;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, FrameError> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(from_cbor(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<In, Out: Serialize> Encoder<Out> for MessageCodec<In, Out> {
    type Error = FrameError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload = to_cbor(&item)?;
        self.inner.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}
