// SPDX-License-Identifier: Apache-2.0

//! Framed wire protocol spoken between engines.
//!
//! Wire format (11 bytes of overhead per frame):
//! ```text
//! [u16 BE: schema_version][u8: frame_type][u32 BE: header_len][u32 BE: payload_len][header bytes][payload bytes]
//! ```
//!
//! Headers and payloads are MessagePack. RPC arguments serialize as tuples;
//! every response payload is a `Result<Vec<u8>, Error>` envelope where the
//! `Ok` bytes hold the MessagePack encoding of the RPC's typed result.

use bytes::{Buf, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, IoSlice};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;

use crate::error::{Error, Result};

/// Current schema version.
const SCHEMA_VERSION_V1: u16 = 1;

/// Maximum frame size (64 MB). Bulk chunks and eager payloads both ride in
/// frames, so this bounds a single transfer-manager chunk as well.
const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Frame preamble size (version + type + 2 lengths).
const PREAMBLE_SIZE: usize = 2 + 1 + 4 + 4; // 11 bytes

/// Kinds of frames exchanged on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// First frame on every connection; carries the dialer's advertised
    /// address so the peer can answer "the caller's endpoint".
    Hello,
    /// An RPC request addressed to a provider (or to the engine itself).
    Request,
    /// The response to a previously issued request.
    Response,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::Hello => 0,
            FrameType::Request => 1,
            FrameType::Response => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FrameType::Hello),
            1 => Some(FrameType::Request),
            2 => Some(FrameType::Response),
            _ => None,
        }
    }
}

/// Header of a [`FrameType::Hello`] frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloHeader {
    /// The dialer's advertised (listening) address.
    pub address: String,
}

/// Header of a [`FrameType::Request`] frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Correlates the response; unique per issuing side of a connection.
    pub request_id: u64,
    /// Routing key: a provider id, or [`crate::engine::ENGINE_PROVIDER_ID`]
    /// for engine-level operations.
    pub provider_id: u16,
    /// Operation name, e.g. `"create"` or `"bulk_read"`.
    pub op: String,
}

/// Header of a [`FrameType::Response`] frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub request_id: u64,
}

/// Encode a value as MessagePack.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| Error::Internal(format!("failed to encode message: {e}")))
}

/// Decode a MessagePack value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| Error::Internal(format!("failed to decode message: {e}")))
}

/// Stateful frame decoder.
///
/// Maintains state across calls so partially received frames resume where
/// they left off. Decodes into `(FrameType, header: Bytes, payload: Bytes)`
/// where header and payload are zero-copy slices of the receive buffer.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    state: DecodeState,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    AwaitingPreamble,
    AwaitingData {
        frame_type: FrameType,
        header_len: u32,
        payload_len: u32,
    },
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingPreamble,
        }
    }

    fn build_preamble(
        frame_type: FrameType,
        header_len: u32,
        payload_len: u32,
    ) -> io::Result<[u8; PREAMBLE_SIZE]> {
        Self::validate_lengths(header_len, payload_len)?;

        let mut preamble = [0u8; PREAMBLE_SIZE];
        preamble[0..2].copy_from_slice(&SCHEMA_VERSION_V1.to_be_bytes());
        preamble[2] = frame_type.as_u8();
        preamble[3..7].copy_from_slice(&header_len.to_be_bytes());
        preamble[7..11].copy_from_slice(&payload_len.to_be_bytes());
        Ok(preamble)
    }

    /// Encode and write one frame.
    pub async fn encode_frame<W: AsyncWrite + Unpin>(
        writer: &mut W,
        frame_type: FrameType,
        header: &[u8],
        payload: &[u8],
    ) -> io::Result<()> {
        let preamble =
            Self::build_preamble(frame_type, header.len() as u32, payload.len() as u32)?;

        let bufs = [
            IoSlice::new(&preamble),
            IoSlice::new(header),
            IoSlice::new(payload),
        ];
        let total_len = preamble.len() + header.len() + payload.len();

        // write_vectored may be partial; fall back to a flat write if so.
        let written = writer.write_vectored(&bufs).await?;
        if written != total_len {
            let mut flat = Vec::with_capacity(total_len);
            flat.extend_from_slice(&preamble);
            flat.extend_from_slice(header);
            flat.extend_from_slice(payload);
            writer.write_all(&flat[written..]).await?;
        }
        Ok(())
    }

    fn validate_lengths(header_len: u32, payload_len: u32) -> io::Result<()> {
        let total_len = header_len
            .checked_add(payload_len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame size overflow"))?;
        if total_len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame size {total_len} exceeds maximum {MAX_FRAME_SIZE}"),
            ));
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = (FrameType, Bytes, Bytes);
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        loop {
            match self.state {
                DecodeState::AwaitingPreamble => {
                    if src.len() < PREAMBLE_SIZE {
                        return Ok(None);
                    }

                    let schema_version = u16::from_be_bytes([src[0], src[1]]);
                    if schema_version != SCHEMA_VERSION_V1 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!(
                                "unsupported schema version: {schema_version} (expected {SCHEMA_VERSION_V1})"
                            ),
                        ));
                    }

                    let frame_type = FrameType::from_u8(src[2]).ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("invalid frame type: {}", src[2]),
                        )
                    })?;

                    let header_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]);
                    let payload_len = u32::from_be_bytes([src[7], src[8], src[9], src[10]]);
                    Self::validate_lengths(header_len, payload_len)?;

                    src.advance(PREAMBLE_SIZE);
                    self.state = DecodeState::AwaitingData {
                        frame_type,
                        header_len,
                        payload_len,
                    };
                }

                DecodeState::AwaitingData {
                    frame_type,
                    header_len,
                    payload_len,
                } => {
                    let total_data_len = (header_len + payload_len) as usize;
                    if src.len() < total_data_len {
                        return Ok(None);
                    }

                    let header = src.split_to(header_len as usize).freeze();
                    let payload = src.split_to(payload_len as usize).freeze();
                    self.state = DecodeState::AwaitingPreamble;
                    return Ok(Some((frame_type, header, payload)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encode_frame_to_bytes(
        frame_type: FrameType,
        header: &[u8],
        payload: &[u8],
    ) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        FrameCodec::encode_frame(&mut buf, frame_type, header, payload).await?;
        Ok(buf)
    }

    #[tokio::test]
    async fn test_roundtrip_all_frame_types() {
        for frame_type in [FrameType::Hello, FrameType::Request, FrameType::Response] {
            let mut codec = FrameCodec::new();
            let framed = encode_frame_to_bytes(frame_type, b"header", b"payload")
                .await
                .unwrap();
            let mut buf = BytesMut::from(&framed[..]);

            let (decoded_type, header, payload) = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded_type, frame_type);
            assert_eq!(&header[..], b"header");
            assert_eq!(&payload[..], b"payload");
            assert!(buf.is_empty());
        }
    }

    #[tokio::test]
    async fn test_decode_partial_frame() {
        let mut codec = FrameCodec::new();
        let framed = encode_frame_to_bytes(FrameType::Request, b"test-header", b"test-payload")
            .await
            .unwrap();

        // Partial preamble: no frame yet.
        let mut buf = BytesMut::from(&framed[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Full preamble, no data yet.
        buf.extend_from_slice(&framed[5..PREAMBLE_SIZE]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Rest of the frame.
        buf.extend_from_slice(&framed[PREAMBLE_SIZE..]);
        let (frame_type, header, payload) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame_type, FrameType::Request);
        assert_eq!(&header[..], b"test-header");
        assert_eq!(&payload[..], b"test-payload");
    }

    #[tokio::test]
    async fn test_decode_multiple_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(
            &encode_frame_to_bytes(FrameType::Request, b"h1", b"p1")
                .await
                .unwrap(),
        );
        buf.extend_from_slice(
            &encode_frame_to_bytes(FrameType::Response, b"h2", b"p2")
                .await
                .unwrap(),
        );

        let (t1, h1, p1) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((t1, &h1[..], &p1[..]), (FrameType::Request, &b"h1"[..], &b"p1"[..]));
        let (t2, h2, p2) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((t2, &h2[..], &p2[..]), (FrameType::Response, &b"h2"[..], &b"p2"[..]));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_invalid_schema_version() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&999u16.to_be_bytes());
        buf.extend_from_slice(&[FrameType::Request.as_u8()]);
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(&4u32.to_be_bytes());

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.to_string().contains("unsupported schema version"));
    }

    #[test]
    fn test_decode_invalid_frame_type() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&SCHEMA_VERSION_V1.to_be_bytes());
        buf.extend_from_slice(&[255u8]);
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(&4u32.to_be_bytes());

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.to_string().contains("invalid frame type"));
    }

    #[test]
    fn test_decode_frame_too_large() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&SCHEMA_VERSION_V1.to_be_bytes());
        buf.extend_from_slice(&[FrameType::Request.as_u8()]);
        buf.extend_from_slice(&(MAX_FRAME_SIZE / 2 + 1).to_be_bytes());
        buf.extend_from_slice(&(MAX_FRAME_SIZE / 2 + 1).to_be_bytes());

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_encode_rejects_oversized_frame() {
        let payload = vec![0u8; (MAX_FRAME_SIZE + 1) as usize];
        let mut sink = Vec::new();
        let result = FrameCodec::encode_frame(&mut sink, FrameType::Request, b"", &payload).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let header = RequestHeader {
            request_id: 7,
            provider_id: 42,
            op: "create".into(),
        };
        let bytes = encode(&header).unwrap();
        let back: RequestHeader = decode(&bytes).unwrap();
        assert_eq!(back.request_id, 7);
        assert_eq!(back.provider_id, 42);
        assert_eq!(back.op, "create");
    }

    #[test]
    fn test_response_envelope_carries_errors() {
        let envelope: std::result::Result<Vec<u8>, Error> =
            Err(Error::NotFound("target x not found".into()));
        let bytes = encode(&envelope).unwrap();
        let back: std::result::Result<Vec<u8>, Error> = decode(&bytes).unwrap();
        assert_eq!(back, envelope);
    }
}
