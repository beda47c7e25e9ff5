// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Length-prefixed framing for one-call-per-stream RPC.
//!
//! Wire layout of a frame:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: frame kind
//! - N bytes: protobuf payload
//!
//! A client writes exactly one [`FrameKind::Request`] frame and finishes its
//! send half; the server answers with exactly one [`FrameKind::Response`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single payload. Larger values travel out of band.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix plus kind tag.
pub const HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameKind {
    Request = 1,
    Response = 2,
}

impl TryFrom<u16> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, FrameError> {
        match value {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Response),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    TooLarge(usize),

    #[error("unknown frame kind: {0}")]
    UnknownKind(u16),

    #[error("expected {expected:?} frame, got {actual:?}")]
    UnexpectedKind {
        expected: FrameKind,
        actual: FrameKind,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("stream closed before a full frame arrived")]
    Truncated,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn request<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::encode_message(FrameKind::Request, msg)
    }

    pub fn response<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::encode_message(FrameKind::Response, msg)
    }

    fn encode_message<M: Message>(kind: FrameKind, msg: &M) -> Result<Self, FrameError> {
        let len = msg.encoded_len();
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(len));
        }
        Ok(Self {
            kind,
            payload: Bytes::from(msg.encode_to_vec()),
        })
    }

    /// Decode the payload, insisting on the given frame kind.
    pub fn decode_as<M: Message + Default>(&self, expected: FrameKind) -> Result<M, FrameError> {
        if self.kind != expected {
            return Err(FrameError::UnexpectedKind {
                expected,
                actual: self.kind,
            });
        }
        Ok(M::decode(self.payload.clone())?)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.kind as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated);
        }
        let length = bytes.get_u32() as usize;
        let kind = FrameKind::try_from(bytes.get_u16())?;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if bytes.len() < length {
            return Err(FrameError::Truncated);
        }
        Ok(Self {
            kind,
            payload: bytes.split_to(length),
        })
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.to_bytes()).await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    if let Err(e) = reader.read_exact(&mut header).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::Truncated,
            _ => e.into(),
        });
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let kind = FrameKind::try_from(u16::from_be_bytes([header[4], header[5]]))?;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => FrameError::Truncated,
        _ => e.into(),
    })?;

    Ok(Frame {
        kind,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_proto::{ClientHeartbeatRequest, RpcRequest, rpc_request::Request};

    fn heartbeat(id: &str) -> RpcRequest {
        RpcRequest {
            credentials: None,
            request: Some(Request::ClientHeartbeat(ClientHeartbeatRequest {
                client_id: id.to_string(),
            })),
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::request(&heartbeat("cl-1")).unwrap();
        let bytes = frame.to_bytes();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, frame.payload.len());
        assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]), 1);
        assert_eq!(bytes.len(), HEADER_SIZE + len);
    }

    #[test]
    fn test_decode_checks_kind() {
        let frame = Frame::request(&heartbeat("cl-1")).unwrap();
        let err = frame
            .decode_as::<RpcRequest>(FrameKind::Response)
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::UnexpectedKind {
                expected: FrameKind::Response,
                actual: FrameKind::Request
            }
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u32(0);
        raw.put_u16(9);
        let err = Frame::from_bytes(raw.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::UnknownKind(9)));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u32((MAX_FRAME_SIZE + 1) as u32);
        raw.put_u16(1);
        let err = Frame::from_bytes(raw.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[tokio::test]
    async fn test_read_frame_from_partial_stream() {
        let frame = Frame::request(&heartbeat("cl-1")).unwrap();
        let bytes = frame.to_bytes();
        let mut reader = &bytes[..bytes.len() - 1];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
    }

    #[tokio::test]
    async fn test_read_frame_from_empty_stream() {
        let mut reader: &[u8] = &[];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::Truncated)
        ));
    }
}
