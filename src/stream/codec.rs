//! CDC framing: a 4-byte big-endian length prefix around one JSON
//! document.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::message::{CdcRequest, CdcResponse};

/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CdcCodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Length-delimited JSON codec decoding `In` and encoding `Out`.
#[derive(Debug)]
pub struct CdcCodec<In, Out> {
    frames: LengthDelimitedCodec,
    _marker: PhantomData<fn(Out) -> In>,
}

/// What a client speaks.
pub type ClientCodec = CdcCodec<CdcResponse, CdcRequest>;

/// What a server speaks. Used by test servers.
pub type ServerCodec = CdcCodec<CdcRequest, CdcResponse>;

impl<In, Out> CdcCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for CdcCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: DeserializeOwned, Out> Decoder for CdcCodec<In, Out> {
    type Item = In;
    type Error = CdcCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, CdcCodecError> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<In, Out: Serialize> Encoder<Out> for CdcCodec<In, Out> {
    type Error = CdcCodecError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), CdcCodecError> {
        let json = serde_json::to_vec(&item)?;
        self.frames.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::message::{RequestBody, ResponseResult};
    use bytes::BufMut;

    #[test]
    fn test_client_request_reaches_server_codec() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::new();
        let request = CdcRequest::new(
            "1",
            RequestBody::StopStreaming {
                streaming_id: "s1".into(),
            },
        );
        client.encode(request.clone(), &mut buf).unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
        assert_eq!(server.decode(&mut buf).unwrap(), Some(request));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut server = ServerCodec::new();
        let mut client = ClientCodec::new();
        let mut buf = BytesMut::new();
        server
            .encode(CdcResponse::succeed("1", Some(ResponseResult::Login)), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(buf.len() - 3);
        assert!(client.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert!(client.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_garbage_json_is_codec_error() {
        let mut client = ClientCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_slice(b"nope!");
        assert!(matches!(client.decode(&mut buf), Err(CdcCodecError::Json(_))));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut client = ClientCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LENGTH + 1) as u32);
        assert!(matches!(client.decode(&mut buf), Err(CdcCodecError::Io(_))));
    }
}
