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

use std::time::Instant;

use bytes::Bytes;

use serde::Deserialize;

use crate::connection::ConnId;
use crate::protocol::RequestKind;

pub type MsgId = u64;

/// The quorum selection rule below is only written for up to three replicas
/// per datacenter.
pub const MAX_REPLICAS_PER_DC: usize = 3;

/// Per-request replica coalescing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Answer from the first replica to respond.
    LocalOne,

    /// Answer once a majority of local-datacenter replicas agree.
    LocalQuorum,
}

/// How replica responses are folded into the single client answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ReadOne,
    ReadQuorum,
    WriteQuorum,
}

/// A request or response travelling through the router.
///
/// Messages live in the router's id-indexed table; queues and links hold
/// `MsgId`s rather than pointers, so a message can sit in several queues
/// at once (client out, outbound in, outbound out) without aliasing.
#[derive(Debug)]
pub struct Message {
    pub id: MsgId,

    /// Fan-out origin. Equals `id` unless this is a replica clone.
    pub parent_id: MsgId,

    pub request: bool,

    /// Shared by all fragments of a multi-key request, 0 otherwise.
    pub frag_id: u64,

    pub last_fragment: bool,

    /// The un-forwarded original a fragment was split from.
    pub frag_owner: Option<MsgId>,

    /// Fragment count, tracked on the owner only.
    pub nfrag: u32,

    pub done: bool,

    /// Fragment-chain completion cache, set once the whole chain is done.
    pub fdone: bool,

    pub error: bool,
    pub err: u8,

    /// Consume the eventual response without delivering it to any client.
    pub swallow: bool,

    pub noreply: bool,
    pub is_read: bool,

    /// Local-datacenter clone whose response still feeds the origin's
    /// quorum accounting despite `swallow`.
    pub quorum_member: bool,

    pub consistency: Consistency,
    pub strategy: Strategy,
    pub kind: RequestKind,

    /// Raw wire bytes. Immutable and refcounted, so replica clones share it.
    pub payload: Bytes,

    /// Key bounds within `payload`.
    pub key_start: usize,
    pub key_end: usize,

    pub mlen: usize,

    /// Mutual request<->response link, established by the coalescer.
    pub peer: Option<MsgId>,

    /// Accumulated replica responses, requests only, arrival order.
    pub responses: Vec<MsgId>,

    /// Replies that may still arrive from local-datacenter replicas.
    pub pending_responses: u8,

    /// Replies still needed before the strategy may answer.
    pub quorum_responses: u8,

    /// The client-facing connection this message answers to.
    pub owner: ConnId,

    /// The storage/peer connection currently carrying the request.
    pub outbound: Option<ConnId>,

    /// Peer-frame id to echo on the response, peer-inbound requests only.
    pub frame_id: Option<u64>,

    pub stime: Option<Instant>,
}

impl Message {
    pub fn request(
        id: MsgId,
        owner: ConnId,
        kind: RequestKind,
        payload: Bytes,
        key_span: (usize, usize),
        noreply: bool,
    ) -> Self {
        let mlen = payload.len();

        Self {
            id,
            parent_id: id,
            request: true,
            frag_id: 0,
            last_fragment: false,
            frag_owner: None,
            nfrag: 0,
            done: false,
            fdone: false,
            error: false,
            err: 0,
            swallow: false,
            noreply,
            is_read: kind == RequestKind::Get,
            quorum_member: false,
            consistency: Consistency::LocalQuorum,
            strategy: Strategy::ReadOne,
            kind,
            payload,
            key_start: key_span.0,
            key_end: key_span.1,
            mlen,
            peer: None,
            responses: Vec::new(),
            pending_responses: 0,
            quorum_responses: 0,
            owner,
            outbound: None,
            frame_id: None,
            stime: None,
        }
    }

    pub fn response(id: MsgId, owner: ConnId, payload: Bytes) -> Self {
        let mlen = payload.len();

        Self {
            id,
            parent_id: id,
            request: false,
            frag_id: 0,
            last_fragment: false,
            frag_owner: None,
            nfrag: 0,
            done: false,
            fdone: false,
            error: false,
            err: 0,
            swallow: false,
            noreply: false,
            is_read: false,
            quorum_member: false,
            consistency: Consistency::LocalQuorum,
            strategy: Strategy::ReadOne,
            kind: RequestKind::Empty,
            payload,
            key_start: 0,
            key_end: 0,
            mlen,
            peer: None,
            responses: Vec::new(),
            pending_responses: 0,
            quorum_responses: 0,
            owner,
            outbound: None,
            frame_id: None,
            stime: None,
        }
    }

    /// Copy for an additional replica target.
    ///
    /// The payload carries no peer-frame header (headers are written at
    /// send time), so the clone is safe to re-frame for any target.
    pub fn clone_for_replica(&self, id: MsgId) -> Self {
        let mut clone = Self::request(
            id,
            self.owner,
            self.kind,
            self.payload.clone(),
            (self.key_start, self.key_end),
            self.noreply,
        );

        clone.parent_id = self.id;
        clone.is_read = self.is_read;
        clone.consistency = self.consistency;
        clone.strategy = self.strategy;
        clone.frag_id = self.frag_id;

        clone
    }

    pub fn key(&self) -> &[u8] {
        &self.payload[self.key_start..self.key_end]
    }

    pub fn is_empty(&self) -> bool {
        self.mlen == 0
    }

    /// Deterministic checksum over the payload, used by the read-quorum
    /// strategy to compare replica answers.
    pub fn payload_crc32(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.payload);
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_preserves_origin_chain() {
        let req = Message::request(
            7,
            1,
            RequestKind::Get,
            Bytes::from_static(b"get k1\r\n"),
            (4, 6),
            false,
        );

        let clone = req.clone_for_replica(8);

        assert_eq!(clone.id, 8);
        assert_eq!(clone.parent_id, 7);
        assert!(clone.is_read);
        assert_eq!(clone.key(), b"k1");
        assert_eq!(clone.payload, req.payload);
    }

    #[test]
    fn crc_discriminates_payloads() {
        let a = Message::response(1, 1, Bytes::from_static(b"VALUE k 0 1\r\nx\r\nEND\r\n"));
        let b = Message::response(2, 1, Bytes::from_static(b"VALUE k 0 1\r\ny\r\nEND\r\n"));
        let c = Message::response(3, 1, Bytes::from_static(b"VALUE k 0 1\r\nx\r\nEND\r\n"));

        assert_ne!(a.payload_crc32(), b.payload_crc32());
        assert_eq!(a.payload_crc32(), c.payload_crc32());
    }
}
