//! Length-prefixed bincode framing for the session stream.
//!
//! Each frame is a 4-byte big-endian length followed by a bincode payload.
//! A frame that is well delimited but fails to decode is surfaced as an
//! `Err(SyncError::MalformedPayload)` item rather than a stream error, so a
//! single bad message does not tear down the connection.

use crate::error::SyncError;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub struct MessageCodec<In, Out> {
    frames: LengthDelimitedCodec,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> MessageCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
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

impl<In: DeserializeOwned, Out> Decoder for MessageCodec<In, Out> {
    type Item = Result<In, SyncError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(
                bincode::deserialize::<In>(&frame)
                    .map_err(|e| SyncError::malformed(e.to_string())),
            )),
            None => Ok(None),
        }
    }
}

impl<In, Out: Serialize> Encoder<Out> for MessageCodec<In, Out> {
    type Error = CodecError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&item)?;
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

/// Codec used by the hub: reads client messages, writes server messages.
pub type ServerCodec = MessageCodec<crate::protocol::ClientMessage, crate::protocol::ServerMessage>;

/// Codec used by clients: reads server messages, writes client messages.
pub type ClientCodec = MessageCodec<crate::protocol::ServerMessage, crate::protocol::ClientMessage>;
