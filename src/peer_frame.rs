// Fanlight - Fast and light request router for multi-datacenter replicated key-value rings over minimal line protocol, and memory footprint
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::convert::TryFrom;

use bytes::{BufMut, Bytes, BytesMut};

use nom::bytes::streaming::take;
use nom::combinator::map_res;
use nom::number::streaming::{le_u32, le_u64, le_u8};
use nom::IResult;

use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FanlightError, FanlightResult};

pub const FRAME_VERSION: u8 = 1;

/// Payload carries sealed bytes.
pub const FLAG_SEALED: u8 = 0x01;

/// Inter-node frames larger than this are rejected outright.
pub const MAX_FRAME_PAYLOAD: usize = 4 * 1024 * 1024;

#[derive(Debug, PartialEq)]
pub struct FrameVersion(u8);

/// Direction marker of a peer frame.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FrameKind {
    /// A request travelling towards the replica.
    Request = 0,

    /// A response echoing the request's frame id.
    Response = 1,
}

/// One framed inter-node message.
///
/// For requests the id is the sender's message id; for responses it echoes
/// the id of the request being answered. The payload is the raw line
/// protocol, sealed when the connection is secured.
#[derive(Debug)]
pub struct Frame {
    pub kind: FrameKind,

    pub sealed: bool,

    pub msg_id: u64,

    pub payload: Bytes,
}

impl TryFrom<u8> for FrameVersion {
    type Error = FanlightError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value != FRAME_VERSION {
            return Err(FanlightError::VersionMismatch {
                expected: FRAME_VERSION,
                received: value,
            });
        }

        Ok(Self(value))
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FanlightError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            x if x == FrameKind::Request as u8 => Ok(FrameKind::Request),
            x if x == FrameKind::Response as u8 => Ok(FrameKind::Response),
            x => Err(FanlightError::InvalidFrameKind(x)),
        }
    }
}

impl Frame {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Frame> {
        let (input, _version) = map_res(le_u8, FrameVersion::try_from)(input)?;
        let (input, kind) = map_res(le_u8, FrameKind::try_from)(input)?;
        let (input, flags) = le_u8(input)?;
        let (input, msg_id) = le_u64(input)?;
        let (input, len) = le_u32(input)?;
        let (input, payload) = take(len as usize)(input)?;

        Ok((
            input,
            Frame {
                kind,
                sealed: flags & FLAG_SEALED != 0,
                msg_id,
                payload: Bytes::copy_from_slice(payload),
            },
        ))
    }

    /// Serialize a frame around an already-sealed payload.
    /// The header length field is the post-seal length.
    pub fn write(kind: FrameKind, msg_id: u64, payload: &[u8], sealed: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(15 + payload.len());

        buf.put_u8(FRAME_VERSION);
        buf.put_u8(kind as u8);
        buf.put_u8(if sealed { FLAG_SEALED } else { 0 });
        buf.put_u64_le(msg_id);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(payload);

        buf.freeze()
    }
}

/// Payload protection contract for secured peer links.
///
/// The session-key negotiation and the block cipher behind it live outside
/// the router; `Plaintext` stands in when a link is not secured.
pub trait Cipher {
    fn seal(&self, payload: Bytes) -> FanlightResult<Bytes>;

    fn open(&self, payload: Bytes) -> FanlightResult<Bytes>;
}

pub struct Plaintext;

impl Cipher for Plaintext {
    fn seal(&self, payload: Bytes) -> FanlightResult<Bytes> {
        Ok(payload)
    }

    fn open(&self, payload: Bytes) -> FanlightResult<Bytes> {
        Ok(payload)
    }
}

pub struct PeerFrameCodec;

impl Decoder for PeerFrameCodec {
    type Item = Frame;
    type Error = FanlightError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        // Cheap length sanity before waiting on a bogus huge frame.
        if src.len() >= 15 {
            let len = u32::from_le_bytes([src[11], src[12], src[13], src[14]]) as usize;

            if len > MAX_FRAME_PAYLOAD {
                return Err(FanlightError::OversizedPayload(MAX_FRAME_PAYLOAD));
            }
        }

        let (consumed, frame) = match Frame::parse(&src[..]) {
            Ok((rest, frame)) => (src.len() - rest.len(), frame),
            Err(nom::Err::Incomplete(_)) => return Ok(None),
            Err(_) => return Err(FanlightError::MalformedFrame),
        };

        let _ = src.split_to(consumed);

        Ok(Some(frame))
    }
}

impl Encoder<Bytes> for PeerFrameCodec {
    type Error = FanlightError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);

        Ok(())
    }
}

mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    #[rustfmt::skip]
    fn parse_valid_request_frame() {
        let payload: &[u8] = &[
            FRAME_VERSION, 0x00, 0x00,
            0x2a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // id 42
            0x08, 0x00, 0x00, 0x00, // length 8
            0x67, 0x65, 0x74, 0x20, 0x6b, 0x31, 0x0d, 0x0a, // get k1
        ];

        let (rest, frame) = Frame::parse(payload).unwrap();

        assert!(rest.is_empty());
        assert_eq!(frame.kind, FrameKind::Request);
        assert_eq!(frame.msg_id, 42);
        assert!(!frame.sealed);
        assert_eq!(frame.payload, Bytes::from_static(b"get k1\r\n"));
    }

    #[test]
    #[rustfmt::skip]
    fn parse_invalid_version_frame() {
        let payload: &[u8] = &[
            0x64, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
        ];

        assert_ne!(payload[0], FRAME_VERSION);
        assert!(Frame::parse(payload).is_err());
    }

    #[test]
    #[rustfmt::skip]
    fn parse_invalid_kind_frame() {
        let payload: &[u8] = &[
            FRAME_VERSION, 0x64, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
        ];

        assert!(Frame::parse(payload).is_err());
    }

    #[test]
    fn write_then_parse_sealed_response() {
        let bytes = Frame::write(FrameKind::Response, 7, b"STORED\r\n", true);

        let (_, frame) = Frame::parse(&bytes).unwrap();

        assert_eq!(frame.kind, FrameKind::Response);
        assert_eq!(frame.msg_id, 7);
        assert!(frame.sealed);
        assert_eq!(frame.payload, Bytes::from_static(b"STORED\r\n"));
    }

    #[test]
    fn decode_waits_for_payload() {
        let mut codec = PeerFrameCodec;
        let bytes = Frame::write(FrameKind::Request, 1, b"get k1\r\n", false);

        let mut buf = BytesMut::from(&bytes[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[10..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }
}
