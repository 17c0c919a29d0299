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

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use nom::branch::alt;
use nom::bytes::streaming::{tag, take, take_while, take_while1};
use nom::character::streaming::digit1;
use nom::combinator::{map, map_res, opt};
use nom::error::{make_error, ErrorKind};
use nom::multi::many1;
use nom::sequence::preceded;
use nom::{IResult, Offset};

use tokio_util::codec::{Decoder, Encoder};

use crate::error::FanlightError;

/// Values larger than this are rejected at the parser.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Client request variants of the line protocol.
///
/// `Consistency` is the per-connection consistency-control request; it is
/// answered locally and never forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Get,
    Set,
    Delete,
    Consistency,
    Quit,
    Empty,
}

/// A framed client request with key bounds into the raw bytes.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub kind: RequestKind,

    pub noreply: bool,

    /// The request exactly as received, forwarded verbatim.
    pub raw: Bytes,

    /// Key bounds within `raw`, one span per key.
    pub key_spans: Vec<(usize, usize)>,
}

/// A framed response from the storage backend (or echoed by a peer).
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub kind: ResponseKind,

    pub raw: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Zero or more VALUE blocks terminated by END.
    Values,

    Stored,
    Deleted,
    NotFound,

    /// Bare integer line, e.g. the consistency-toggle acknowledgement.
    Integer,

    Error,
}

struct RawRequest<'n> {
    kind: RequestKind,
    keys: Vec<&'n [u8]>,
    noreply: bool,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn key_token(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(|b| b != b' ' && b != b'\r' && b != b'\n')(input)
}

fn decimal(input: &[u8]) -> IResult<&[u8], u64> {
    map_res(map_res(digit1, std::str::from_utf8), |s: &str| {
        s.parse::<u64>()
    })(input)
}

fn get_request(input: &[u8]) -> IResult<&[u8], RawRequest> {
    let (input, _) = tag("get")(input)?;
    let (input, keys) = many1(preceded(tag(" "), key_token))(input)?;
    let (input, _) = tag("\r\n")(input)?;

    Ok((
        input,
        RawRequest {
            kind: RequestKind::Get,
            keys,
            noreply: false,
        },
    ))
}

fn set_request(input: &[u8]) -> IResult<&[u8], RawRequest> {
    let (input, _) = tag("set ")(input)?;
    let (input, key) = key_token(input)?;
    let (input, _) = tag(" ")(input)?;
    let (input, _flags) = decimal(input)?;
    let (input, _) = tag(" ")(input)?;
    let (input, _exptime) = decimal(input)?;
    let (input, _) = tag(" ")(input)?;
    let (input, len) = decimal(input)?;
    let (input, noreply) = opt(tag(" noreply"))(input)?;
    let (input, _) = tag("\r\n")(input)?;

    if len as usize > MAX_VALUE_SIZE {
        return Err(nom::Err::Failure(make_error(input, ErrorKind::LengthValue)));
    }

    let (input, _data) = take(len as usize)(input)?;
    let (input, _) = tag("\r\n")(input)?;

    Ok((
        input,
        RawRequest {
            kind: RequestKind::Set,
            keys: vec![key],
            noreply: noreply.is_some(),
        },
    ))
}

fn delete_request(input: &[u8]) -> IResult<&[u8], RawRequest> {
    let (input, _) = tag("delete ")(input)?;
    let (input, key) = key_token(input)?;
    let (input, noreply) = opt(tag(" noreply"))(input)?;
    let (input, _) = tag("\r\n")(input)?;

    Ok((
        input,
        RawRequest {
            kind: RequestKind::Delete,
            keys: vec![key],
            noreply: noreply.is_some(),
        },
    ))
}

fn consistency_request(input: &[u8]) -> IResult<&[u8], RawRequest> {
    let (input, _) = tag("consistency ")(input)?;
    let (input, target) = key_token(input)?;
    let (input, _) = tag("\r\n")(input)?;

    Ok((
        input,
        RawRequest {
            kind: RequestKind::Consistency,
            keys: vec![target],
            noreply: false,
        },
    ))
}

fn quit_request(input: &[u8]) -> IResult<&[u8], RawRequest> {
    let (input, _) = tag("quit\r\n")(input)?;

    Ok((
        input,
        RawRequest {
            kind: RequestKind::Quit,
            keys: Vec::new(),
            noreply: false,
        },
    ))
}

fn empty_request(input: &[u8]) -> IResult<&[u8], RawRequest> {
    let (input, _) = tag("\r\n")(input)?;

    Ok((
        input,
        RawRequest {
            kind: RequestKind::Empty,
            keys: Vec::new(),
            noreply: false,
        },
    ))
}

fn request(input: &[u8]) -> IResult<&[u8], RawRequest> {
    alt((
        get_request,
        set_request,
        delete_request,
        consistency_request,
        quit_request,
        empty_request,
    ))(input)
}

fn value_block(input: &[u8]) -> IResult<&[u8], ()> {
    let (input, _) = tag("VALUE ")(input)?;
    let (input, _key) = key_token(input)?;
    let (input, _) = tag(" ")(input)?;
    let (input, _flags) = decimal(input)?;
    let (input, _) = tag(" ")(input)?;
    let (input, len) = decimal(input)?;
    let (input, _) = tag("\r\n")(input)?;

    if len as usize > MAX_VALUE_SIZE {
        return Err(nom::Err::Failure(make_error(input, ErrorKind::LengthValue)));
    }

    let (input, _data) = take(len as usize)(input)?;
    let (input, _) = tag("\r\n")(input)?;

    Ok((input, ()))
}

fn values_response(input: &[u8]) -> IResult<&[u8], ResponseKind> {
    let (input, _) = many1(value_block)(input)?;
    let (input, _) = tag("END\r\n")(input)?;

    Ok((input, ResponseKind::Values))
}

fn server_error_response(input: &[u8]) -> IResult<&[u8], ResponseKind> {
    let (input, _) = tag("SERVER_ERROR")(input)?;
    let (input, _) = take_while(|b| b != b'\r')(input)?;
    let (input, _) = tag("\r\n")(input)?;

    Ok((input, ResponseKind::Error))
}

fn integer_response(input: &[u8]) -> IResult<&[u8], ResponseKind> {
    let (input, _) = digit1(input)?;
    let (input, _) = tag("\r\n")(input)?;

    Ok((input, ResponseKind::Integer))
}

fn response(input: &[u8]) -> IResult<&[u8], ResponseKind> {
    alt((
        values_response,
        map(tag("END\r\n"), |_| ResponseKind::Values),
        map(tag("STORED\r\n"), |_| ResponseKind::Stored),
        map(tag("DELETED\r\n"), |_| ResponseKind::Deleted),
        map(tag("NOT_FOUND\r\n"), |_| ResponseKind::NotFound),
        map(tag("ERROR\r\n"), |_| ResponseKind::Error),
        server_error_response,
        integer_response,
    ))(input)
}

/// Parse one request out of `src`, yielding the consumed length and key
/// bounds. `Ok(None)` means more bytes are needed.
fn decode_request(
    src: &[u8],
) -> Result<Option<(usize, RequestKind, bool, Vec<(usize, usize)>)>, FanlightError> {
    match request(src) {
        Ok((rest, raw)) => {
            let consumed = src.offset(rest);

            let spans = raw
                .keys
                .iter()
                .map(|key| {
                    let start = src.offset(key);

                    (start, start + key.len())
                })
                .collect();

            Ok(Some((consumed, raw.kind, raw.noreply, spans)))
        }
        Err(nom::Err::Incomplete(_)) => Ok(None),
        Err(_) => Err(FanlightError::MalformedRequest),
    }
}

impl ClientRequest {
    /// Parse a complete buffer, e.g. a peer frame payload.
    pub fn from_payload(payload: &Bytes) -> Result<ClientRequest, FanlightError> {
        match decode_request(&payload[..])? {
            Some((consumed, kind, noreply, key_spans)) if consumed == payload.len() => {
                Ok(ClientRequest {
                    kind,
                    noreply,
                    raw: payload.clone(),
                    key_spans,
                })
            }
            _ => Err(FanlightError::MalformedRequest),
        }
    }

    pub fn key(&self, idx: usize) -> &[u8] {
        let (start, end) = self.key_spans[idx];

        &self.raw[start..end]
    }

    pub fn first_key_span(&self) -> (usize, usize) {
        self.key_spans.first().copied().unwrap_or((0, 0))
    }
}

pub struct ClientCodec;

impl Decoder for ClientCodec {
    type Item = ClientRequest;
    type Error = FanlightError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let (consumed, kind, noreply, key_spans) = match decode_request(&src[..])? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };

        let raw = src.split_to(consumed).freeze();

        Ok(Some(ClientRequest {
            kind,
            noreply,
            raw,
            key_spans,
        }))
    }
}

impl Encoder<Bytes> for ClientCodec {
    type Error = FanlightError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);

        Ok(())
    }
}

pub struct BackendCodec;

impl Decoder for BackendCodec {
    type Item = BackendResponse;
    type Error = FanlightError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let (consumed, kind) = match response(&src[..]) {
            Ok((rest, kind)) => ((&src[..]).offset(rest), kind),
            Err(nom::Err::Incomplete(_)) => return Ok(None),
            Err(_) => return Err(FanlightError::MalformedResponse),
        };

        let raw = src.split_to(consumed).freeze();

        Ok(Some(BackendResponse { kind, raw }))
    }
}

impl Encoder<Bytes> for BackendCodec {
    type Error = FanlightError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);

        Ok(())
    }
}

/// Synthesized integer acknowledgement, e.g. for consistency toggles and
/// admin-mode deletes.
pub fn integer_ok() -> Bytes {
    Bytes::from_static(b"1\r\n")
}

/// Synthesized fatal response carrying a reason.
pub fn server_error(reason: &str) -> Bytes {
    let mut buf = BytesMut::new();

    buf.put_slice(b"SERVER_ERROR ");
    buf.put_slice(reason.as_bytes());
    buf.put_slice(b"\r\n");

    buf.freeze()
}

/// Synthesized response to a request the parser rejected.
pub fn protocol_error() -> Bytes {
    Bytes::from_static(b"ERROR\r\n")
}

/// A single-key sub-request for one key of a multi-key get.
/// Returns the request bytes and the key bounds within them.
pub fn fragment_get(key: &[u8]) -> (Bytes, (usize, usize)) {
    let mut buf = BytesMut::with_capacity(key.len() + 6);

    buf.put_slice(b"get ");
    buf.put_slice(key);
    buf.put_slice(b"\r\n");

    (buf.freeze(), (4, 4 + key.len()))
}

/// Stitch per-fragment get responses back into one answer: interior END
/// terminators are dropped, a single END closes the set.
pub fn coalesce_fragments(parts: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::new();

    for part in parts {
        if part.len() >= 5 && part.ends_with(b"END\r\n") {
            buf.extend_from_slice(&part[..part.len() - 5]);
        } else {
            buf.extend_from_slice(part);
        }
    }

    buf.extend_from_slice(b"END\r\n");

    buf.freeze()
}

mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn parse_single_key_get() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(&b"get k1\r\n"[..]);

        let req = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(req.kind, RequestKind::Get);
        assert_eq!(req.key(0), b"k1");
        assert!(!req.noreply);
        assert!(buf.is_empty());
    }

    #[test]
    fn parse_multi_key_get_spans() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(&b"get alpha beta gamma\r\n"[..]);

        let req = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(req.key_spans.len(), 3);
        assert_eq!(req.key(0), b"alpha");
        assert_eq!(req.key(1), b"beta");
        assert_eq!(req.key(2), b"gamma");
    }

    #[test]
    fn parse_set_across_chunks() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(&b"set k1 0 0 5\r\nhel"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"lo\r\n");

        let req = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(req.kind, RequestKind::Set);
        assert_eq!(req.key(0), b"k1");
        assert_eq!(req.raw, Bytes::from_static(b"set k1 0 0 5\r\nhello\r\n"));
    }

    #[test]
    fn parse_delete_noreply() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(&b"delete k1 noreply\r\n"[..]);

        let req = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(req.kind, RequestKind::Delete);
        assert!(req.noreply);
    }

    #[test]
    fn parse_consistency_and_quit() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(&b"consistency read\r\nquit\r\n\r\n"[..]);

        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req.kind, RequestKind::Consistency);
        assert_eq!(req.key(0), b"read");

        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req.kind, RequestKind::Quit);

        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req.kind, RequestKind::Empty);
    }

    #[test]
    fn reject_unknown_command() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(&b"munch k1\r\n"[..]);

        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn parse_values_response() {
        let mut codec = BackendCodec;
        let mut buf = BytesMut::from(&b"VALUE k1 0 2\r\nhi\r\nEND\r\n"[..]);

        let rsp = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(rsp.kind, ResponseKind::Values);
        assert_eq!(rsp.raw, Bytes::from_static(b"VALUE k1 0 2\r\nhi\r\nEND\r\n"));
    }

    #[test]
    fn parse_miss_and_stored() {
        let mut codec = BackendCodec;
        let mut buf = BytesMut::from(&b"END\r\nSTORED\r\n"[..]);

        let rsp = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(rsp.kind, ResponseKind::Values);
        assert_eq!(rsp.raw, Bytes::from_static(b"END\r\n"));

        let rsp = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(rsp.kind, ResponseKind::Stored);
    }

    #[test]
    fn parse_partial_values_waits() {
        let mut codec = BackendCodec;
        let mut buf = BytesMut::from(&b"VALUE k1 0 2\r\nhi\r\n"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"END\r\n");

        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn parse_server_error_line() {
        let mut codec = BackendCodec;
        let mut buf = BytesMut::from(&b"SERVER_ERROR out of memory\r\n"[..]);

        let rsp = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(rsp.kind, ResponseKind::Error);
    }

    #[test]
    fn stitch_fragment_responses() {
        let parts = vec![
            Bytes::from_static(b"VALUE a 0 1\r\nx\r\nEND\r\n"),
            Bytes::from_static(b"END\r\n"),
            Bytes::from_static(b"VALUE c 0 1\r\nz\r\nEND\r\n"),
        ];

        let merged = coalesce_fragments(&parts);

        assert_eq!(
            merged,
            Bytes::from_static(b"VALUE a 0 1\r\nx\r\nVALUE c 0 1\r\nz\r\nEND\r\n")
        );
    }
}
