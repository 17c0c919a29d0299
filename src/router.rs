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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use serde::Deserialize;

use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::connection::{ConnId, ConnRole, Connection, LinkState};
use crate::error::{FanlightError, FanlightResult};
use crate::message::{Consistency, Message, MsgId, Strategy, MAX_REPLICAS_PER_DC};
use crate::peer_frame::{Cipher, Frame, FrameKind, Plaintext};
use crate::protocol::{self, BackendResponse, ClientRequest, RequestKind};
use crate::stats::Stats;
use crate::topology::Topology;

/// Externally managed node availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Forward everything.
    Normal,

    /// Drop all requests.
    Standby,

    /// Drop reads, forward writes.
    WritesOnly,

    /// Drop reads, flush writes through.
    Resuming,
}

/// An outbound connection the event loop should establish.
#[derive(Debug)]
pub struct ConnectOp {
    pub conn: ConnId,
    pub addr: SocketAddr,
    pub role: ConnRole,
}

pub struct RouterOptions {
    pub storage_addr: SocketAddr,
    pub request_timeout: Duration,
    pub admin_mode: bool,
    pub secure: bool,
    pub max_messages: usize,
    pub node_state: NodeState,
    pub read_consistency: Consistency,
    pub write_consistency: Consistency,
}

impl RouterOptions {
    pub fn from_config(config: &Config) -> FanlightResult<Self> {
        Ok(Self {
            storage_addr: config.general.storage_address.parse()?,
            request_timeout: Duration::from_millis(config.general.request_timeout),
            admin_mode: config.general.admin_mode,
            secure: config.general.secure,
            max_messages: config.general.max_messages,
            node_state: config.general.node_state,
            read_consistency: config.consistency.read,
            write_consistency: config.consistency.write,
        })
    }
}

enum Outcome {
    Done,
    Again,
}

struct Target {
    /// Resolved peer: address plus whether it is this node. None when the
    /// rack had no peer for the key.
    peer: Option<(SocketAddr, bool)>,

    /// Reuse the original message instead of a clone.
    primary: bool,

    /// Local-datacenter replica whose response feeds the origin's quorum.
    quorum_member: bool,
}

/// The routing engine.
///
/// Owns every message and connection; mutated only from the event-loop
/// task, so all state transitions are serial. Socket work is reached
/// through per-connection channels, timers and connects through the op
/// queues drained by the event loop after each dispatch.
pub struct Router {
    topology: Topology,

    msgs: HashMap<MsgId, Message>,

    conns: HashMap<ConnId, Connection>,

    /// Established or in-flight outbound peer links by address.
    peer_conns: HashMap<SocketAddr, ConnId>,

    storage: ConnId,

    next_msg_id: MsgId,
    next_conn_id: ConnId,

    node_state: NodeState,
    admin_mode: bool,
    secure: bool,
    max_messages: usize,
    request_timeout: Duration,
    default_read: Consistency,
    default_write: Consistency,

    cipher: Box<dyn Cipher + Send>,

    pub stats: Stats,

    timer_ops: Vec<(MsgId, Duration)>,
    connect_ops: Vec<ConnectOp>,
}

impl Router {
    pub fn new(topology: Topology, options: RouterOptions) -> Self {
        let mut conns = HashMap::new();

        let storage = 1;
        let mut conn = Connection::new(storage, ConnRole::Storage, options.storage_addr);
        conn.state = LinkState::Disconnected;
        conns.insert(storage, conn);

        Self {
            topology,
            msgs: HashMap::new(),
            conns,
            peer_conns: HashMap::new(),
            storage,
            next_msg_id: 1,
            next_conn_id: 2,
            node_state: options.node_state,
            admin_mode: options.admin_mode,
            secure: options.secure,
            max_messages: options.max_messages,
            request_timeout: options.request_timeout,
            default_read: options.read_consistency,
            default_write: options.write_consistency,
            cipher: Box::new(Plaintext),
            stats: Stats::default(),
            timer_ops: Vec::new(),
            connect_ops: Vec::new(),
        }
    }

    pub fn storage_conn(&self) -> ConnId {
        self.storage
    }

    pub fn set_node_state(&mut self, state: NodeState) {
        info!("node state change (state = {:?})", state);
        self.node_state = state;
    }

    pub fn conn_addr(&self, cid: ConnId) -> Option<SocketAddr> {
        self.conns.get(&cid).map(|c| c.addr)
    }

    pub fn take_timer_ops(&mut self) -> Vec<(MsgId, Duration)> {
        std::mem::take(&mut self.timer_ops)
    }

    pub fn take_connect_ops(&mut self) -> Vec<ConnectOp> {
        std::mem::take(&mut self.connect_ops)
    }

    fn next_id(&mut self) -> MsgId {
        let id = self.next_msg_id;
        self.next_msg_id += 1;

        id
    }

    // ---- connection registration ----------------------------------------

    pub fn register_client(
        &mut self,
        addr: SocketAddr,
        outbox: mpsc::UnboundedSender<Bytes>,
        shutdown: watch::Sender<bool>,
    ) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;

        let mut conn = Connection::new(id, ConnRole::Client, addr);
        conn.read_consistency = self.default_read;
        conn.write_consistency = self.default_write;
        conn.attach(outbox, shutdown);

        self.conns.insert(id, conn);
        self.stats.client_connections += 1;

        debug!("client registered (addr = {}) (conn = {})", addr, id);

        id
    }

    pub fn register_peer_inbound(
        &mut self,
        addr: SocketAddr,
        outbox: mpsc::UnboundedSender<Bytes>,
        shutdown: watch::Sender<bool>,
    ) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;

        let mut conn = Connection::new(id, ConnRole::PeerInbound, addr);
        conn.secured = self.secure;
        conn.attach(outbox, shutdown);

        self.conns.insert(id, conn);

        debug!("peer registered (addr = {}) (conn = {})", addr, id);

        id
    }

    pub fn on_conn_connected(
        &mut self,
        cid: ConnId,
        outbox: mpsc::UnboundedSender<Bytes>,
        shutdown: watch::Sender<bool>,
    ) {
        match self.conns.get_mut(&cid) {
            Some(conn) => {
                conn.attach(outbox, shutdown);

                info!("connected (addr = {}) (conn = {})", conn.addr, cid);
            }
            None => return,
        }

        self.flush(cid);
    }

    pub fn on_conn_failed(&mut self, cid: ConnId) {
        if let Some(conn) = self.conns.get(&cid) {
            error!("connect failed (addr = {}) (conn = {})", conn.addr, cid);
        }

        self.close_outbound(
            cid,
            FanlightError::PeerUnavailable.code(),
            "connect failed",
        );
    }

    pub fn on_conn_closed(&mut self, cid: ConnId) {
        let role = match self.conns.get(&cid) {
            Some(conn) => conn.role,
            None => return,
        };

        match role {
            ConnRole::Client | ConnRole::PeerInbound => self.on_client_closed(cid),
            ConnRole::Storage | ConnRole::PeerOutbound => self.close_outbound(
                cid,
                FanlightError::PeerUnavailable.code(),
                "connection closed",
            ),
        }
    }

    // ---- client intake & filter ------------------------------------------

    pub fn on_client_request(&mut self, cid: ConnId, req: ClientRequest) {
        let eof = match self.conns.get(&cid) {
            Some(conn) => conn.eof,
            None => return,
        };

        if eof {
            debug!("dropping request on eof connection (conn = {})", cid);
            return;
        }

        match req.kind {
            RequestKind::Empty => {
                debug!("filter empty req from c {}", cid);
                return;
            }
            RequestKind::Quit => {
                debug!("filter quit req from c {}", cid);

                if let Some(conn) = self.conns.get_mut(&cid) {
                    conn.eof = true;

                    if !conn.active() {
                        self.finish_client(cid);
                    }
                }

                return;
            }
            _ => {}
        }

        if self.msgs.len() >= self.max_messages {
            warn!("message table full, rejecting request (conn = {})", cid);

            if let Some(conn) = self.conns.get(&cid) {
                if !req.noreply {
                    conn.send(protocol::server_error("server busy"));
                }
            }

            return;
        }

        if req.kind == RequestKind::Get && req.key_spans.len() > 1 {
            self.fragment_request(cid, &req);
            return;
        }

        let mid = self.next_id();
        let msg = Message::request(
            mid,
            cid,
            req.kind,
            req.raw.clone(),
            req.first_key_span(),
            req.noreply,
        );
        self.msgs.insert(mid, msg);

        if req.kind == RequestKind::Consistency {
            let target = req.key(0).to_vec();
            self.consistency_request(cid, mid, &target);
            return;
        }

        self.req_forward(cid, mid);
    }

    /// A client whose codec produced garbage: answer and close cleanly.
    pub fn on_client_error(&mut self, cid: ConnId) {
        self.stats.client_err += 1;

        if let Some(conn) = self.conns.get_mut(&cid) {
            conn.send(protocol::protocol_error());
            conn.eof = true;
            conn.err = Some(FanlightError::MalformedRequest.code());
        }

        self.finish_client(cid);
    }

    /// Abusive client: error out and disconnect.
    pub fn reject_client(&mut self, cid: ConnId, reason: &str) {
        if let Some(conn) = self.conns.get_mut(&cid) {
            conn.send(protocol::server_error(reason));
            conn.eof = true;
        }

        self.finish_client(cid);
    }

    pub fn on_client_eof(&mut self, cid: ConnId) {
        let active = match self.conns.get_mut(&cid) {
            Some(conn) => {
                conn.eof = true;
                conn.active()
            }
            None => return,
        };

        // Half-close: responses for outstanding requests still flow; the
        // connection winds down once drained.
        if !active {
            self.finish_client(cid);
        }
    }

    fn finish_client(&mut self, cid: ConnId) {
        if let Some(conn) = self.conns.get_mut(&cid) {
            conn.done = true;
            conn.shutdown();
        }
    }

    pub fn on_client_closed(&mut self, cid: ConnId) {
        let conn = match self.conns.remove(&cid) {
            Some(conn) => conn,
            None => return,
        };

        if conn.eof && conn.err.is_none() {
            self.stats.client_eof += 1;
        } else {
            self.stats.client_err += 1;
        }

        for mid in conn.omsg_q.iter().copied() {
            self.stats.client_dropped_requests += 1;

            let done = match self.msgs.get_mut(&mid) {
                Some(msg) => {
                    if msg.done {
                        true
                    } else {
                        // Left in place; the replica response will find it by
                        // queue head on its own connection and absorb it.
                        msg.swallow = true;

                        debug!(
                            "close c {} schedule swallow of req {} (len = {})",
                            cid, mid, msg.mlen
                        );

                        false
                    }
                }
                None => continue,
            };

            if done {
                debug!("close c {} discarding completed req {}", cid, mid);
                self.release_request(mid);
            }
        }

        debug!("client released (addr = {}) (conn = {})", conn.addr, cid);
    }

    // ---- fragmentation ---------------------------------------------------

    fn fragment_request(&mut self, cid: ConnId, req: &ClientRequest) {
        let nfrag = req.key_spans.len();

        if self.msgs.len() + nfrag + 1 > self.max_messages {
            warn!("message table full, rejecting multiget (conn = {})", cid);

            if let Some(conn) = self.conns.get(&cid) {
                conn.send(protocol::server_error("server busy"));
            }

            return;
        }

        let owner_id = self.next_id();
        let mut owner = Message::request(
            owner_id,
            cid,
            RequestKind::Get,
            req.raw.clone(),
            req.first_key_span(),
            false,
        );
        owner.frag_id = owner_id;
        owner.nfrag = nfrag as u32;
        self.msgs.insert(owner_id, owner);

        let mut fragments = Vec::with_capacity(nfrag);

        for idx in 0..nfrag {
            let (payload, span) = protocol::fragment_get(req.key(idx));

            let fid = self.next_id();
            let mut frag = Message::request(fid, cid, RequestKind::Get, payload, span, false);
            frag.frag_id = owner_id;
            frag.frag_owner = Some(owner_id);
            frag.last_fragment = idx == nfrag - 1;

            self.msgs.insert(fid, frag);
            fragments.push(fid);
        }

        debug!(
            "fragmented req into {} parts (conn = {}) (fid = {})",
            nfrag, cid, owner_id
        );

        for fid in fragments {
            self.req_forward(cid, fid);
        }
    }

    // ---- forwarding planner ----------------------------------------------

    fn req_forward(&mut self, cid: ConnId, mid: MsgId) {
        let (is_read, noreply) = match self.msgs.get(&mid) {
            Some(msg) => (msg.is_read, msg.noreply),
            None => return,
        };

        if is_read {
            self.stats.client_read_requests += 1;
        } else {
            self.stats.client_write_requests += 1;
        }

        // Index for response matching, then park in the client outq.
        let consistency = match self.conns.get_mut(&cid) {
            Some(conn) => {
                conn.outstanding.insert(mid);

                if !noreply {
                    conn.enqueue_outq(mid);
                }

                conn.consistency(is_read)
            }
            None => return,
        };

        let rkey = {
            let msg = self.msgs.get_mut(&mid).unwrap();
            msg.consistency = consistency;

            if !noreply {
                msg.stime = Some(Instant::now());
            }

            self.topology.routing_key(msg.key()).to_vec()
        };

        let kind = self.msgs.get(&mid).map(|m| m.kind);

        if self.admin_mode && kind == Some(RequestKind::Delete) {
            self.admin_local_forward(cid, mid, &rkey);
            return;
        }

        let all_racks = !is_read || consistency == Consistency::LocalQuorum;

        let plan = self.plan_targets(&rkey, all_racks);

        {
            let rack_cnt = self.topology.local_rack_count() as u8;
            let msg = self.msgs.get_mut(&mid).unwrap();

            if all_racks {
                msg.strategy = if is_read {
                    Strategy::ReadQuorum
                } else {
                    Strategy::WriteQuorum
                };
                msg.pending_responses = if consistency == Consistency::LocalOne {
                    1
                } else {
                    rack_cnt
                };
                msg.quorum_responses = if consistency == Consistency::LocalOne {
                    1
                } else {
                    rack_cnt / 2 + 1
                };
            } else {
                msg.strategy = Strategy::ReadOne;
                msg.pending_responses = 1;
                msg.quorum_responses = 1;
            }
        }

        for target in plan {
            if !self.msgs.contains_key(&mid) {
                // The origin already failed and was surfaced; further
                // replicas would answer to nobody.
                break;
            }

            let target_mid = if target.primary {
                mid
            } else {
                if self.msgs.len() >= self.max_messages {
                    warn!(
                        "no replica clone, message table full (req = {})",
                        mid
                    );

                    if target.quorum_member {
                        self.replica_lost(mid);
                    }

                    continue;
                }

                let nid = self.next_id();
                let mut clone = self.msgs.get(&mid).unwrap().clone_for_replica(nid);
                clone.swallow = true;
                clone.quorum_member = target.quorum_member;

                debug!("msg {} clone to rack msg {}", mid, nid);

                self.msgs.insert(nid, clone);

                nid
            };

            match target.peer {
                None => self.forward_error(
                    target_mid,
                    FanlightError::PeerUnavailable.code(),
                    "no peer for key",
                ),
                Some((_, true)) => self.local_forward(target_mid),
                Some((addr, false)) => self.peer_forward(target_mid, addr),
            }
        }
    }

    fn plan_targets(&self, rkey: &[u8], all_racks: bool) -> Vec<Target> {
        let mut plan = Vec::new();

        if all_racks {
            for dc in self.topology.datacenters() {
                if dc.local {
                    for rack in &dc.racks {
                        let primary = self.topology.is_local_rack(dc, rack);

                        plan.push(Target {
                            peer: self
                                .topology
                                .peer_for_key(rack, rkey)
                                .map(|p| (p.addr, p.local)),
                            primary,
                            quorum_member: true,
                        });
                    }
                } else {
                    // One replica per remote datacenter.
                    if let Some(rack) = self.topology.random_rack(dc) {
                        plan.push(Target {
                            peer: self
                                .topology
                                .peer_for_key(rack, rkey)
                                .map(|p| (p.addr, p.local)),
                            primary: false,
                            quorum_member: false,
                        });
                    }
                }
            }
        } else {
            let rack = self.topology.local_rack();

            plan.push(Target {
                peer: self
                    .topology
                    .peer_for_key(rack, rkey)
                    .map(|p| (p.addr, p.local)),
                primary: true,
                quorum_member: false,
            });
        }

        plan
    }

    fn consistency_request(&mut self, cid: ConnId, mid: MsgId, target: &[u8]) {
        let toggled = match self.conns.get_mut(&cid) {
            Some(conn) => {
                if target == b"read" {
                    let level = conn.toggle_read_consistency();
                    info!("read consistency toggled (conn = {}) (level = {:?})", cid, level);
                    true
                } else if target == b"write" {
                    let level = conn.toggle_write_consistency();
                    info!("write consistency toggled (conn = {}) (level = {:?})", cid, level);
                    true
                } else {
                    false
                }
            }
            None => return,
        };

        if toggled {
            self.send_integer_ok(cid, mid);
        } else {
            if let Some(conn) = self.conns.get_mut(&cid) {
                conn.outstanding.insert(mid);
                conn.enqueue_outq(mid);
            }

            if let Some(msg) = self.msgs.get_mut(&mid) {
                msg.stime = Some(Instant::now());
            }

            self.forward_error(
                mid,
                FanlightError::InvalidConsistencyTarget.code(),
                "invalid consistency target",
            );
        }
    }

    fn admin_local_forward(&mut self, cid: ConnId, mid: MsgId, rkey: &[u8]) {
        let rack = self.topology.local_rack();

        let peer = self
            .topology
            .peer_for_key(rack, rkey)
            .map(|p| (p.addr, p.local));

        match peer {
            None => self.forward_error(
                mid,
                FanlightError::PeerUnavailable.code(),
                "no peer for key",
            ),
            Some((_, true)) => {
                info!("admin delete acknowledged locally (req = {})", mid);
                self.send_integer_ok(cid, mid);
            }
            Some(_) => self.local_forward(mid),
        }
    }

    fn send_integer_ok(&mut self, cid: ConnId, mid: MsgId) {
        let noreply = match self.msgs.get(&mid) {
            Some(msg) => msg.noreply,
            None => return,
        };

        if noreply {
            self.release_request(mid);
            return;
        }

        if let Some(conn) = self.conns.get_mut(&cid) {
            conn.outstanding.insert(mid);

            if !conn.omsg_q.contains(&mid) {
                conn.enqueue_outq(mid);
            }
        }

        let rsp_id = self.next_id();
        self.msgs
            .insert(rsp_id, Message::response(rsp_id, cid, protocol::integer_ok()));

        {
            let msg = self.msgs.get_mut(&mid).unwrap();
            msg.done = true;

            if msg.stime.is_none() {
                msg.stime = Some(Instant::now());
            }
        }

        self.link(mid, rsp_id);
        self.finalize(cid, mid);
    }

    // ---- replica fan-out: per-target forwarding --------------------------

    /// Availability gate shared by the storage and peer paths.
    fn gate(&mut self, mid: MsgId) -> bool {
        let is_read = match self.msgs.get(&mid) {
            Some(msg) => msg.is_read,
            None => return false,
        };

        let reason = match self.node_state {
            NodeState::Normal => None,
            NodeState::Standby => Some("node in standby"),
            NodeState::WritesOnly | NodeState::Resuming if is_read => {
                Some("node not serving reads")
            }
            _ => None,
        };

        match reason {
            Some(reason) => {
                info!("dropping request per node state (req = {})", mid);
                self.forward_error(mid, FanlightError::NodeUnavailable(reason).code(), reason);

                false
            }
            None => true,
        }
    }

    fn local_forward(&mut self, mid: MsgId) {
        if !self.gate(mid) {
            return;
        }

        let storage = self.storage;

        self.ensure_connected(storage);
        self.enqueue_outbound(storage, mid);
        self.flush(storage);
    }

    fn peer_forward(&mut self, mid: MsgId, addr: SocketAddr) {
        if !self.gate(mid) {
            return;
        }

        let cid = match self.peer_conns.get(&addr) {
            Some(&cid) => cid,
            None => {
                let cid = self.next_conn_id;
                self.next_conn_id += 1;

                let mut conn = Connection::new(cid, ConnRole::PeerOutbound, addr);
                conn.secured = self.secure;

                self.conns.insert(cid, conn);
                self.peer_conns.insert(addr, cid);

                cid
            }
        };

        self.ensure_connected(cid);
        self.enqueue_outbound(cid, mid);
        self.flush(cid);
    }

    fn ensure_connected(&mut self, cid: ConnId) {
        let (state, addr, role) = match self.conns.get_mut(&cid) {
            Some(conn) => (conn.state, conn.addr, conn.role),
            None => return,
        };

        if state == LinkState::Disconnected {
            if let Some(conn) = self.conns.get_mut(&cid) {
                conn.state = LinkState::Connecting;
            }

            debug!("connecting (addr = {}) (conn = {})", addr, cid);

            self.connect_ops.push(ConnectOp {
                conn: cid,
                addr,
                role,
            });
        }
    }

    /// Queue a request for an outbound connection. The timeout clock starts
    /// here, whether or not the link is up yet.
    fn enqueue_outbound(&mut self, cid: ConnId, mid: MsgId) {
        let (noreply, mlen, is_read) = match self.msgs.get_mut(&mid) {
            Some(msg) => {
                msg.outbound = Some(cid);
                (msg.noreply, msg.mlen, msg.is_read)
            }
            None => return,
        };

        if let Some(conn) = self.conns.get_mut(&cid) {
            conn.enqueue_inq(mid);
        }

        self.stats.in_queue += 1;
        self.stats.in_queue_bytes += mlen as u64;

        if is_read {
            self.stats.read_requests += 1;
        } else {
            self.stats.write_requests += 1;
        }

        if !noreply {
            self.timer_ops.push((mid, self.request_timeout));
        }
    }

    /// Drain an outbound connection's in-queue onto its socket.
    fn flush(&mut self, cid: ConnId) {
        loop {
            let (mid, role, secured) = match self.conns.get_mut(&cid) {
                Some(conn) => {
                    if conn.state != LinkState::Connected {
                        return;
                    }

                    match conn.dequeue_inq() {
                        Some(mid) => (mid, conn.role, conn.secured),
                        None => return,
                    }
                }
                None => return,
            };

            let (payload, noreply, mlen) = match self.msgs.get(&mid) {
                Some(msg) => (msg.payload.clone(), msg.noreply, msg.mlen),
                None => continue,
            };

            self.stats.in_queue = self.stats.in_queue.saturating_sub(1);
            self.stats.in_queue_bytes = self.stats.in_queue_bytes.saturating_sub(mlen as u64);

            let bytes = match role {
                ConnRole::Storage => payload,
                ConnRole::PeerOutbound => {
                    let (body, sealed) = if secured {
                        match self.cipher.seal(payload) {
                            Ok(body) => (body, true),
                            Err(e) => {
                                error!("unable to seal request (req = {}): {}", mid, e);
                                self.forward_error(mid, e.code(), "seal failed");
                                continue;
                            }
                        }
                    } else {
                        (payload, false)
                    };

                    Frame::write(FrameKind::Request, mid, &body, sealed)
                }
                _ => continue,
            };

            let sent = match self.conns.get(&cid) {
                Some(conn) => conn.send(bytes),
                None => false,
            };

            if !sent {
                if let Some(conn) = self.conns.get_mut(&cid) {
                    conn.imsg_q.push_front(mid);
                }

                self.close_outbound(
                    cid,
                    FanlightError::PeerUnavailable.code(),
                    "socket task gone",
                );

                return;
            }

            if noreply {
                // Nothing will come back; the request ends here.
                self.release_request(mid);
            } else {
                if let Some(conn) = self.conns.get_mut(&cid) {
                    conn.enqueue_outq(mid);
                }

                self.stats.out_queue += 1;
                self.stats.out_queue_bytes += mlen as u64;
            }
        }
    }

    // ---- peer service ----------------------------------------------------

    pub fn on_peer_frame(&mut self, cid: ConnId, frame: Frame) {
        let role = match self.conns.get(&cid) {
            Some(conn) => conn.role,
            None => return,
        };

        match role {
            ConnRole::PeerOutbound => {
                if frame.kind != FrameKind::Response {
                    warn!("unexpected request frame on outbound link (conn = {})", cid);
                    return;
                }

                let payload = if frame.sealed {
                    match self.cipher.open(frame.payload) {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!("unable to open response payload (conn = {}): {}", cid, e);
                            self.close_outbound(cid, e.code(), "unreadable response");
                            return;
                        }
                    }
                } else {
                    frame.payload
                };

                if let Some(conn) = self.conns.get(&cid) {
                    if let Some(head) = conn.head_outq() {
                        if head != frame.msg_id {
                            info!(
                                "response id does not match queue head (conn = {}) (head = {}) (id = {})",
                                cid, head, frame.msg_id
                            );
                        }
                    }
                }

                self.on_outbound_rsp(cid, payload);
            }
            ConnRole::PeerInbound => {
                if frame.kind != FrameKind::Request {
                    warn!("unexpected response frame on inbound link (conn = {})", cid);
                    return;
                }

                let payload = if frame.sealed {
                    match self.cipher.open(frame.payload) {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!("unable to open request payload (conn = {}): {}", cid, e);
                            return;
                        }
                    }
                } else {
                    frame.payload
                };

                match ClientRequest::from_payload(&payload) {
                    Ok(req) => self.peer_request(cid, req, frame.msg_id),
                    Err(_) => {
                        debug!("malformed peer request (conn = {})", cid);
                        self.frame_back(cid, frame.msg_id, protocol::protocol_error());
                    }
                }
            }
            _ => warn!("frame on non-peer connection (conn = {})", cid),
        }
    }

    /// A replica request from another node: storage only, no re-fan-out.
    fn peer_request(&mut self, cid: ConnId, req: ClientRequest, frame_id: u64) {
        match req.kind {
            RequestKind::Get | RequestKind::Set | RequestKind::Delete => {}
            _ => {
                debug!("filter non-data peer req (conn = {})", cid);
                return;
            }
        }

        if self.msgs.len() >= self.max_messages {
            warn!("message table full, rejecting peer request (conn = {})", cid);
            self.frame_back(cid, frame_id, protocol::server_error("server busy"));
            return;
        }

        let mid = self.next_id();
        let mut msg = Message::request(
            mid,
            cid,
            req.kind,
            req.raw.clone(),
            req.first_key_span(),
            req.noreply,
        );
        msg.frame_id = Some(frame_id);
        msg.stime = Some(Instant::now());
        self.msgs.insert(mid, msg);

        if !req.noreply {
            if let Some(conn) = self.conns.get_mut(&cid) {
                conn.outstanding.insert(mid);
                conn.enqueue_outq(mid);
            }
        }

        self.local_forward(mid);
    }

    fn frame_back(&mut self, cid: ConnId, frame_id: u64, payload: Bytes) {
        let secured = match self.conns.get(&cid) {
            Some(conn) => conn.secured,
            None => return,
        };

        let (body, sealed) = if secured {
            match self.cipher.seal(payload) {
                Ok(body) => (body, true),
                Err(e) => {
                    error!("unable to seal response (conn = {}): {}", cid, e);
                    return;
                }
            }
        } else {
            (payload, false)
        };

        if let Some(conn) = self.conns.get(&cid) {
            conn.send(Frame::write(FrameKind::Response, frame_id, &body, sealed));
        }
    }

    // ---- response coalescer ----------------------------------------------

    pub fn on_backend_response(&mut self, cid: ConnId, rsp: BackendResponse) {
        self.on_outbound_rsp(cid, rsp.raw);
    }

    fn on_outbound_rsp(&mut self, cid: ConnId, raw: Bytes) {
        let (head, role) = match self.conns.get_mut(&cid) {
            Some(conn) => (conn.dequeue_outq_head(), conn.role),
            None => return,
        };

        let req_id = match head {
            Some(id) => id,
            None => {
                debug!("filter stray rsp on conn {} (len = {})", cid, raw.len());
                return;
            }
        };

        self.stats.out_queue = self.stats.out_queue.saturating_sub(1);

        if role == ConnRole::PeerOutbound {
            self.stats.peer_responses += 1;
            self.stats.peer_response_bytes += raw.len() as u64;
        }

        let (was_done, swallow, parent, quorum_member, owner, mlen) =
            match self.msgs.get_mut(&req_id) {
                Some(msg) => {
                    // Off this connection now. `done` stays with finalize:
                    // a quorum origin matched here may still be waiting on
                    // the other replicas.
                    msg.outbound = None;

                    (
                        msg.done,
                        msg.swallow,
                        msg.parent_id,
                        msg.quorum_member,
                        msg.owner,
                        msg.mlen,
                    )
                }
                None => {
                    // The request completed through other replicas and was
                    // already released; this answer has nowhere to go.
                    debug!("late rsp for released req {} on conn {}", req_id, cid);
                    return;
                }
            };

        self.stats.out_queue_bytes = self.stats.out_queue_bytes.saturating_sub(mlen as u64);

        let rsp_id = self.next_id();
        self.msgs.insert(rsp_id, Message::response(rsp_id, cid, raw));

        if swallow {
            debug!("swallow rsp {} of req {} on conn {}", rsp_id, req_id, cid);

            if quorum_member {
                self.feed_origin(parent, rsp_id);
            } else {
                self.release_response(rsp_id);
            }

            self.release_request(req_id);
            return;
        }

        if was_done {
            debug!("late rsp {} for done req {} on conn {}", rsp_id, req_id, cid);
            self.release_response(rsp_id);
            return;
        }

        self.client_handle_response(owner, req_id, rsp_id);
    }

    /// A swallowed local-DC replica answered: fold the response into the
    /// origin's accounting, if the origin still wants it.
    ///
    /// `done` is set only by finalize, so an origin whose primary reply
    /// already came back keeps accumulating here until its strategy
    /// settles.
    fn feed_origin(&mut self, origin_id: MsgId, rsp_id: MsgId) {
        let (live, owner) = match self.msgs.get(&origin_id) {
            Some(origin) if !origin.swallow && !origin.done => (true, origin.owner),
            _ => (false, 0),
        };

        if !live {
            self.release_response(rsp_id);
            return;
        }

        if let Outcome::Done = self.apply_strategy(origin_id, rsp_id) {
            self.finalize(owner, origin_id);
        }
    }

    fn client_handle_response(&mut self, cid: ConnId, req_id: MsgId, rsp_id: MsgId) {
        let target = match self.conns.get(&cid) {
            Some(conn) => {
                if conn.outstanding.contains(&req_id) {
                    Some(req_id)
                } else {
                    info!(
                        "conn {} no outstanding message with id {}, using queue head",
                        cid, req_id
                    );

                    conn.head_outq()
                }
            }
            None => None,
        };

        let target = match target {
            Some(target)
                if self
                    .msgs
                    .get(&target)
                    .map(|m| m.request)
                    .unwrap_or(false) =>
            {
                target
            }
            _ => {
                self.release_response(rsp_id);
                return;
            }
        };

        if let Outcome::Done = self.apply_strategy(target, rsp_id) {
            self.finalize(cid, target);
        }
    }

    fn apply_strategy(&mut self, req_id: MsgId, rsp_id: MsgId) -> Outcome {
        let strategy = match self.msgs.get(&req_id) {
            Some(msg) => msg.strategy,
            None => {
                self.release_response(rsp_id);
                return Outcome::Again;
            }
        };

        match strategy {
            Strategy::ReadOne => {
                let linked = self.msgs.get(&req_id).map(|m| m.peer.is_some()) == Some(true);

                if linked {
                    warn!(
                        "received more than one response for read_one req {}",
                        req_id
                    );
                    self.release_response(rsp_id);

                    Outcome::Again
                } else {
                    self.link(req_id, rsp_id);

                    Outcome::Done
                }
            }
            Strategy::WriteQuorum => self.write_quorum(req_id, rsp_id),
            Strategy::ReadQuorum => self.read_quorum(req_id, rsp_id),
        }
    }

    /// The first acknowledgement becomes the answer; the rest only count.
    fn write_quorum(&mut self, req_id: MsgId, rsp_id: MsgId) -> Outcome {
        let linked = self.msgs.get(&req_id).map(|m| m.peer.is_some()) == Some(true);

        if linked {
            info!("putting extra ack {} for req {}", rsp_id, req_id);
            self.release_response(rsp_id);
        } else {
            info!("accept ack {} for req {}", rsp_id, req_id);
            self.link(req_id, rsp_id);
        }

        let (needed, possible) = {
            let msg = self.msgs.get_mut(&req_id).unwrap();
            msg.pending_responses = msg.pending_responses.saturating_sub(1);
            msg.quorum_responses = msg.quorum_responses.saturating_sub(1);

            (msg.quorum_responses, msg.pending_responses)
        };

        if needed == 0 {
            info!("req {} received all needed acks", req_id);
            return Outcome::Done;
        }

        if needed > possible {
            warn!(
                "write quorum unreachable for req {}, answering with the acks at hand",
                req_id
            );
            return Outcome::Done;
        }

        info!("req {} needs {} more acks", req_id, needed);

        Outcome::Again
    }

    fn read_quorum(&mut self, req_id: MsgId, rsp_id: MsgId) -> Outcome {
        let full = self
            .msgs
            .get(&req_id)
            .map(|m| m.responses.len() >= MAX_REPLICAS_PER_DC)
            .unwrap_or(true);

        if full {
            // Cannot happen with pending bounded by the rack count.
            warn!("response slots full for req {}", req_id);
            self.release_response(rsp_id);

            return Outcome::Again;
        }

        let (needed, possible) = {
            let msg = self.msgs.get_mut(&req_id).unwrap();

            msg.responses.push(rsp_id);
            msg.pending_responses = msg.pending_responses.saturating_sub(1);

            if msg.quorum_responses > 0 {
                msg.quorum_responses -= 1;
            }

            (msg.quorum_responses, msg.pending_responses)
        };

        if needed > 0 {
            if needed <= possible {
                info!(
                    "received a response {} for req {}, need {} more",
                    rsp_id, req_id, needed
                );

                return Outcome::Again;
            }

            warn!("read quorum unreachable for req {}, selecting early", req_id);
        }

        self.quorum_select(req_id)
    }

    /// Checksum-compare accumulated replica reads and pick the answer.
    fn quorum_select(&mut self, req_id: MsgId) -> Outcome {
        let (responses, pending) = match self.msgs.get(&req_id) {
            Some(msg) => (msg.responses.clone(), msg.pending_responses),
            None => return Outcome::Again,
        };

        let received = responses.len();

        if received == 0 {
            return Outcome::Again;
        }

        let crcs: Vec<u32> = responses
            .iter()
            .map(|rid| self.msgs.get(rid).map(|m| m.payload_crc32()).unwrap_or(0))
            .collect();

        let selected = if received < 2 {
            0
        } else if crcs[0] == crcs[1] {
            0
        } else if pending > 0 {
            info!(
                "quorum responses do not match, waiting for pending responses for req {}",
                req_id
            );

            return Outcome::Again;
        } else if received > 2 && crcs[1] == crcs[2] {
            1
        } else if received > 2 && crcs[0] == crcs[2] {
            0
        } else {
            warn!("none of the responses match for req {}, returning first", req_id);
            self.stats.quorum_mismatches += 1;

            0
        };

        for (idx, rid) in responses.iter().enumerate() {
            if idx != selected {
                self.release_response(*rid);
            }
        }

        if let Some(msg) = self.msgs.get_mut(&req_id) {
            msg.responses.clear();
        }

        self.link(req_id, responses[selected]);

        Outcome::Done
    }

    /// A replica that will never answer (clone failure, link loss).
    /// Origins not yet settled by finalize still take the decrement.
    fn replica_lost(&mut self, origin_id: MsgId) {
        let (strategy, pending, linked, owner, live) = match self.msgs.get_mut(&origin_id) {
            Some(origin) if !origin.done && !origin.swallow => {
                origin.pending_responses = origin.pending_responses.saturating_sub(1);

                (
                    origin.strategy,
                    origin.pending_responses,
                    origin.peer.is_some(),
                    origin.owner,
                    true,
                )
            }
            _ => (Strategy::ReadOne, 0, false, 0, false),
        };

        if !live || pending > 0 {
            return;
        }

        // Nothing more can arrive; settle for what we have.
        match strategy {
            Strategy::ReadQuorum => {
                let empty = self
                    .msgs
                    .get(&origin_id)
                    .map(|m| m.responses.is_empty())
                    .unwrap_or(true);

                if empty {
                    self.forward_error(
                        origin_id,
                        FanlightError::PeerUnavailable.code(),
                        "no replicas responded",
                    );
                } else if let Outcome::Done = self.quorum_select(origin_id) {
                    self.finalize(owner, origin_id);
                }
            }
            Strategy::WriteQuorum => {
                if linked {
                    warn!(
                        "write quorum degraded for req {}, answering with partial acks",
                        origin_id
                    );
                    self.finalize(owner, origin_id);
                } else {
                    self.forward_error(
                        origin_id,
                        FanlightError::PeerUnavailable.code(),
                        "no replicas responded",
                    );
                }
            }
            Strategy::ReadOne => {}
        }
    }

    // ---- completion & delivery -------------------------------------------

    fn link(&mut self, req_id: MsgId, rsp_id: MsgId) {
        if let Some(req) = self.msgs.get_mut(&req_id) {
            req.peer = Some(rsp_id);
        }

        if let Some(rsp) = self.msgs.get_mut(&rsp_id) {
            rsp.peer = Some(req_id);
        }
    }

    /// Whether the request - and, for fragments, its whole chain - is done.
    fn req_done(&mut self, cid: ConnId, req_id: MsgId) -> bool {
        let (done, fdone, frag_id) = match self.msgs.get(&req_id) {
            Some(msg) => (msg.done, msg.fdone, msg.frag_id),
            None => return false,
        };

        if !done {
            return false;
        }

        if frag_id == 0 || fdone {
            return true;
        }

        let chain = self.frag_chain(cid, req_id);

        if chain.is_empty() {
            return true;
        }

        for mid in &chain {
            match self.msgs.get(mid) {
                Some(msg) if msg.done => {}
                _ => return false,
            }
        }

        let has_last = self
            .msgs
            .get(chain.last().unwrap())
            .map(|m| m.last_fragment)
            .unwrap_or(false);

        if !has_last {
            return false;
        }

        // Cache the verdict on every fragment so repeat checks are cheap.
        for mid in &chain {
            if let Some(msg) = self.msgs.get_mut(mid) {
                msg.fdone = true;
            }
        }

        debug!(
            "req with fid {} and {} fragments is done (conn = {})",
            frag_id,
            chain.len(),
            cid
        );

        true
    }

    /// The contiguous run of same-fragment requests around `req_id` in the
    /// client's out-queue, in queue order.
    fn frag_chain(&self, cid: ConnId, req_id: MsgId) -> Vec<MsgId> {
        let frag_id = match self.msgs.get(&req_id) {
            Some(msg) => msg.frag_id,
            None => return Vec::new(),
        };

        let conn = match self.conns.get(&cid) {
            Some(conn) => conn,
            None => return Vec::new(),
        };

        let pos = match conn.omsg_q.iter().position(|&m| m == req_id) {
            Some(pos) => pos,
            None => return Vec::new(),
        };

        let same = |mid: &MsgId| {
            self.msgs
                .get(mid)
                .map(|m| m.frag_id == frag_id)
                .unwrap_or(false)
        };

        let mut start = pos;
        while start > 0 && same(&conn.omsg_q[start - 1]) {
            start -= 1;
        }

        let mut end = pos;
        while end + 1 < conn.omsg_q.len() && same(&conn.omsg_q[end + 1]) {
            end += 1;
        }

        (start..=end).map(|i| conn.omsg_q[i]).collect()
    }

    fn finalize(&mut self, cid: ConnId, req_id: MsgId) {
        if let Some(msg) = self.msgs.get_mut(&req_id) {
            msg.done = true;
        }

        if !self.req_done(cid, req_id) {
            return;
        }

        let frag_id = self.msgs.get(&req_id).map(|m| m.frag_id).unwrap_or(0);

        if frag_id == 0 {
            self.deliver_single(cid, req_id);
        } else {
            self.deliver_chain(cid, req_id);
        }

        // Half-closed clients wind down once the last answer is out.
        let settle = match self.conns.get(&cid) {
            Some(conn) => conn.eof && !conn.active(),
            None => false,
        };

        if settle {
            self.finish_client(cid);
        }
    }

    fn response_payload(&self, req_id: MsgId) -> Bytes {
        match self.msgs.get(&req_id).and_then(|m| m.peer) {
            Some(rsp_id) => match self.msgs.get(&rsp_id) {
                Some(rsp) => rsp.payload.clone(),
                None => protocol::server_error("internal error"),
            },
            None => protocol::server_error("internal error"),
        }
    }

    fn deliver_single(&mut self, cid: ConnId, req_id: MsgId) {
        let payload = self.response_payload(req_id);

        let (frame_id, stime) = match self.msgs.get(&req_id) {
            Some(msg) => (msg.frame_id, msg.stime),
            None => return,
        };

        self.write_to_owner(cid, payload, frame_id.unwrap_or(req_id));

        if let Some(conn) = self.conns.get_mut(&cid) {
            conn.dequeue_outq(req_id);
            conn.outstanding.remove(&req_id);
        }

        if let Some(stime) = stime {
            self.stats.add_latency(stime.elapsed().as_micros() as u64);
        }

        self.release_request(req_id);
    }

    fn deliver_chain(&mut self, cid: ConnId, req_id: MsgId) {
        let chain = self.frag_chain(cid, req_id);

        if chain.is_empty() {
            self.deliver_single(cid, req_id);
            return;
        }

        let failed = chain
            .iter()
            .filter_map(|mid| self.msgs.get(mid))
            .find(|m| m.error)
            .map(|m| m.err);

        let payload = if let Some(err) = failed {
            protocol::server_error(&format!("replica request failed (err = {})", err))
        } else {
            let parts: Vec<Bytes> = chain.iter().map(|&mid| self.response_payload(mid)).collect();

            protocol::coalesce_fragments(&parts)
        };

        let stime = self.msgs.get(&chain[0]).and_then(|m| m.stime);

        self.write_to_owner(cid, payload, req_id);

        for mid in chain {
            if let Some(conn) = self.conns.get_mut(&cid) {
                conn.dequeue_outq(mid);
                conn.outstanding.remove(&mid);
            }

            self.release_request(mid);
        }

        if let Some(stime) = stime {
            self.stats.add_latency(stime.elapsed().as_micros() as u64);
        }
    }

    fn write_to_owner(&mut self, cid: ConnId, payload: Bytes, frame_id: u64) {
        let role = match self.conns.get(&cid) {
            Some(conn) => conn.role,
            None => return,
        };

        match role {
            ConnRole::Client => {
                if let Some(conn) = self.conns.get(&cid) {
                    conn.send(payload);
                }
            }
            ConnRole::PeerInbound => self.frame_back(cid, frame_id, payload),
            _ => {}
        }
    }

    // ---- errors, timeouts, close & drain ---------------------------------

    /// Fail one request: swallowed replicas are absorbed, origins get a
    /// synthesized error response through the normal delivery path.
    fn forward_error(&mut self, mid: MsgId, err: u8, reason: &'static str) {
        let (noreply, swallow, parent, quorum_member, owner) = match self.msgs.get_mut(&mid) {
            Some(msg) => {
                msg.done = true;
                msg.error = true;
                msg.err = err;

                (
                    msg.noreply,
                    msg.swallow,
                    msg.parent_id,
                    msg.quorum_member,
                    msg.owner,
                )
            }
            None => return,
        };

        info!("forward req {} failed: {}", mid, reason);

        if swallow {
            self.release_request(mid);

            if quorum_member && parent != mid {
                self.replica_lost(parent);
            }

            return;
        }

        if noreply {
            self.release_request(mid);
            return;
        }

        let rsp_id = self.next_id();
        self.msgs
            .insert(rsp_id, Message::response(rsp_id, owner, protocol::server_error(reason)));

        self.link(mid, rsp_id);
        self.finalize(owner, mid);
    }

    pub fn on_request_timeout(&mut self, mid: MsgId) {
        let outbound = match self.msgs.get(&mid) {
            Some(msg) if !msg.done => msg.outbound,
            _ => return,
        };

        let cid = match outbound {
            Some(cid) => cid,
            None => return,
        };

        self.stats.request_timeouts += 1;

        warn!("req {} timed out on conn {}", mid, cid);

        // A missed deadline poisons the whole FIFO link: everything behind
        // the silent request would be mismatched.
        self.close_outbound(cid, FanlightError::RequestTimeout.code(), "request timed out");
    }

    fn close_outbound(&mut self, cid: ConnId, err: u8, reason: &'static str) {
        let (pending, role, addr) = match self.conns.get_mut(&cid) {
            Some(conn) => {
                if conn.state == LinkState::Closed {
                    return;
                }

                conn.state = LinkState::Closed;
                conn.err = Some(err);
                conn.shutdown();

                let mut pending: Vec<MsgId> = conn.imsg_q.drain(..).collect();
                pending.extend(conn.omsg_q.drain(..));

                (pending, conn.role, conn.addr)
            }
            None => return,
        };

        warn!(
            "closing outbound conn {} (addr = {}): {} ({} in flight)",
            cid,
            addr,
            reason,
            pending.len()
        );

        for mid in pending {
            self.forward_error(mid, err, reason);
        }

        match role {
            ConnRole::Storage => {
                // Kept around for lazy reconnect on the next forward.
                if let Some(conn) = self.conns.get_mut(&cid) {
                    *conn = Connection::new(cid, ConnRole::Storage, addr);
                }
            }
            ConnRole::PeerOutbound => {
                self.peer_conns.remove(&addr);
                self.conns.remove(&cid);
            }
            _ => {}
        }
    }

    // ---- message release -------------------------------------------------

    fn release_response(&mut self, rsp_id: MsgId) {
        if let Some(rsp) = self.msgs.remove(&rsp_id) {
            if let Some(req_id) = rsp.peer {
                if let Some(req) = self.msgs.get_mut(&req_id) {
                    req.peer = None;
                }
            }
        }
    }

    fn release_request(&mut self, req_id: MsgId) {
        let msg = match self.msgs.remove(&req_id) {
            Some(msg) => msg,
            None => return,
        };

        if let Some(conn) = self.conns.get_mut(&msg.owner) {
            conn.outstanding.remove(&req_id);
        }

        if let Some(rsp_id) = msg.peer {
            if let Some(rsp) = self.msgs.get_mut(&rsp_id) {
                rsp.peer = None;
            }

            self.msgs.remove(&rsp_id);
        }

        for rsp_id in msg.responses {
            self.msgs.remove(&rsp_id);
        }

        // The fragment owner goes once its last fragment does.
        if let Some(owner_id) = msg.frag_owner {
            let gone = match self.msgs.get_mut(&owner_id) {
                Some(owner) => {
                    owner.nfrag = owner.nfrag.saturating_sub(1);
                    owner.nfrag == 0
                }
                None => false,
            };

            if gone {
                self.msgs.remove(&owner_id);
            }
        }
    }

    #[cfg(test)]
    fn conn(&self, cid: ConnId) -> &Connection {
        self.conns.get(&cid).unwrap()
    }

    #[cfg(test)]
    fn live_messages(&self) -> usize {
        self.msgs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::BytesMut;

    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::sync::watch;

    use tokio_util::codec::Decoder;

    use crate::config::{DatacenterSection, RackSection, TopologySection};
    use crate::protocol::{BackendCodec, ClientCodec};

    const LOCAL: &str = "127.0.0.1:8101";

    struct Harness {
        router: Router,
        client: ConnId,
        client_rx: UnboundedReceiver<Bytes>,
        _client_sd: watch::Receiver<bool>,
        outbound_rx: HashMap<ConnId, UnboundedReceiver<Bytes>>,
        outbound_addr: HashMap<ConnId, SocketAddr>,
    }

    fn topology(local_racks: usize, local_peer_is_us: bool, remote_dcs: usize) -> Topology {
        let mut racks = Vec::new();

        for i in 0..local_racks {
            let peer = if i == 0 && local_peer_is_us {
                LOCAL.to_string()
            } else {
                format!("10.0.0.{}:8101", i + 1)
            };

            racks.push(RackSection {
                name: format!("r{}", i),
                peers: vec![peer],
            });
        }

        let mut datacenters = vec![DatacenterSection {
            name: "east".to_string(),
            racks,
        }];

        for d in 0..remote_dcs {
            datacenters.push(DatacenterSection {
                name: format!("west{}", d),
                racks: vec![RackSection {
                    name: format!("w{}", d),
                    peers: vec![format!("10.1.{}.1:8101", d)],
                }],
            });
        }

        let section = TopologySection {
            datacenter: "east".to_string(),
            rack: "r0".to_string(),
            hash_tag: None,
            datacenters,
        };

        Topology::from_config(&section, LOCAL.parse().unwrap()).unwrap()
    }

    fn options(read: Consistency, write: Consistency) -> RouterOptions {
        RouterOptions {
            storage_addr: "127.0.0.1:11211".parse().unwrap(),
            request_timeout: Duration::from_millis(1000),
            admin_mode: false,
            secure: false,
            max_messages: 1024,
            node_state: NodeState::Normal,
            read_consistency: read,
            write_consistency: write,
        }
    }

    fn harness(topology: Topology, options: RouterOptions) -> Harness {
        let mut router = Router::new(topology, options);

        let (tx, rx) = mpsc::unbounded_channel();
        let (sd_tx, sd_rx) = watch::channel(false);
        let client = router.register_client("127.0.0.2:5000".parse().unwrap(), tx, sd_tx);

        Harness {
            router,
            client,
            client_rx: rx,
            _client_sd: sd_rx,
            outbound_rx: HashMap::new(),
            outbound_addr: HashMap::new(),
        }
    }

    impl Harness {
        /// Complete every pending connect, wiring channels we can observe.
        fn connect_all(&mut self) {
            for op in self.router.take_connect_ops() {
                let (tx, rx) = mpsc::unbounded_channel();
                let (sd_tx, sd_rx) = watch::channel(false);
                std::mem::forget(sd_rx);

                self.router.on_conn_connected(op.conn, tx, sd_tx);
                self.outbound_rx.insert(op.conn, rx);
                self.outbound_addr.insert(op.conn, op.addr);
            }
        }

        fn send(&mut self, text: &str) {
            let mut codec = ClientCodec;
            let mut buf = BytesMut::from(text.as_bytes());
            let req = codec.decode(&mut buf).unwrap().unwrap();

            self.router.on_client_request(self.client, req);
            self.connect_all();
        }

        fn storage(&self) -> ConnId {
            self.router.storage_conn()
        }

        fn storage_respond(&mut self, text: &str) {
            let mut codec = BackendCodec;
            let mut buf = BytesMut::from(text.as_bytes());
            let rsp = codec.decode(&mut buf).unwrap().unwrap();

            let storage = self.storage();
            self.router.on_backend_response(storage, rsp);
        }

        fn peer_respond(&mut self, cid: ConnId, text: &str) {
            let head = self.router.conn(cid).head_outq().unwrap();
            let frame = Frame {
                kind: FrameKind::Response,
                sealed: false,
                msg_id: head,
                payload: Bytes::copy_from_slice(text.as_bytes()),
            };

            self.router.on_peer_frame(cid, frame);
        }

        fn peer_conns(&self) -> Vec<ConnId> {
            let mut ids: Vec<ConnId> = self
                .outbound_addr
                .iter()
                .filter(|(_, addr)| addr.to_string().starts_with("10."))
                .map(|(&cid, _)| cid)
                .collect();
            ids.sort_unstable();
            ids
        }

        fn client_recv(&mut self) -> Option<Bytes> {
            self.client_rx.try_recv().ok()
        }

        fn outbound_recv(&mut self, cid: ConnId) -> Option<Bytes> {
            self.outbound_rx.get_mut(&cid).and_then(|rx| rx.try_recv().ok())
        }
    }

    #[test]
    fn local_one_read_hits_local_storage() {
        let mut h = harness(
            topology(1, true, 0),
            options(Consistency::LocalOne, Consistency::LocalQuorum),
        );

        h.send("get k1\r\n");

        let sent = h.outbound_recv(h.storage()).unwrap();
        assert_eq!(sent, Bytes::from_static(b"get k1\r\n"));

        h.storage_respond("VALUE k1 0 2\r\nv1\r\nEND\r\n");

        let rsp = h.client_recv().unwrap();
        assert_eq!(rsp, Bytes::from_static(b"VALUE k1 0 2\r\nv1\r\nEND\r\n"));

        assert!(h.client_recv().is_none());
        assert_eq!(h.router.live_messages(), 0);
    }

    #[test]
    fn quorum_read_selects_on_first_matching_pair() {
        let mut h = harness(
            topology(3, true, 0),
            options(Consistency::LocalQuorum, Consistency::LocalQuorum),
        );

        h.send("get k1\r\n");

        let peers = h.peer_conns();
        assert_eq!(peers.len(), 2);

        // Replica requests carry the raw body, no frame pollution.
        for &cid in &peers {
            let bytes = h.outbound_recv(cid).unwrap();
            let (_, frame) = Frame::parse(&bytes).unwrap();
            assert_eq!(frame.kind, FrameKind::Request);
            assert_eq!(frame.payload, Bytes::from_static(b"get k1\r\n"));
        }

        h.storage_respond("VALUE k1 0 1\r\nv\r\nEND\r\n");
        assert!(h.client_recv().is_none());

        h.peer_respond(peers[0], "VALUE k1 0 1\r\nv\r\nEND\r\n");

        // Two matching checksums: answer now, do not wait for the third.
        let rsp = h.client_recv().unwrap();
        assert_eq!(rsp, Bytes::from_static(b"VALUE k1 0 1\r\nv\r\nEND\r\n"));

        // The straggler is absorbed silently.
        h.peer_respond(peers[1], "VALUE k1 0 1\r\nv\r\nEND\r\n");
        assert!(h.client_recv().is_none());
        assert_eq!(h.router.live_messages(), 0);
    }

    #[test]
    fn quorum_read_third_replica_breaks_tie() {
        let mut h = harness(
            topology(3, true, 0),
            options(Consistency::LocalQuorum, Consistency::LocalQuorum),
        );

        h.send("get k1\r\n");
        let peers = h.peer_conns();

        h.storage_respond("VALUE k1 0 1\r\na\r\nEND\r\n");
        h.peer_respond(peers[0], "VALUE k1 0 1\r\nb\r\nEND\r\n");

        // First pair disagrees; hold for the third.
        assert!(h.client_recv().is_none());

        h.peer_respond(peers[1], "VALUE k1 0 1\r\na\r\nEND\r\n");

        let rsp = h.client_recv().unwrap();
        assert_eq!(rsp, Bytes::from_static(b"VALUE k1 0 1\r\na\r\nEND\r\n"));
        assert_eq!(h.router.live_messages(), 0);
    }

    #[test]
    fn quorum_read_all_differ_returns_first() {
        let mut h = harness(
            topology(3, true, 0),
            options(Consistency::LocalQuorum, Consistency::LocalQuorum),
        );

        h.send("get k1\r\n");
        let peers = h.peer_conns();

        h.storage_respond("VALUE k1 0 1\r\na\r\nEND\r\n");
        h.peer_respond(peers[0], "VALUE k1 0 1\r\nb\r\nEND\r\n");
        h.peer_respond(peers[1], "VALUE k1 0 1\r\nc\r\nEND\r\n");

        let rsp = h.client_recv().unwrap();
        assert_eq!(rsp, Bytes::from_static(b"VALUE k1 0 1\r\na\r\nEND\r\n"));
        assert_eq!(h.router.stats.quorum_mismatches, 1);
        assert_eq!(h.router.live_messages(), 0);
    }

    #[test]
    fn write_quorum_answers_on_second_ack() {
        let mut h = harness(
            topology(3, true, 0),
            options(Consistency::LocalQuorum, Consistency::LocalQuorum),
        );

        h.send("set k1 0 0 1\r\nv\r\n");
        let peers = h.peer_conns();
        assert_eq!(peers.len(), 2);

        h.storage_respond("STORED\r\n");
        assert!(h.client_recv().is_none());

        h.peer_respond(peers[0], "STORED\r\n");

        let rsp = h.client_recv().unwrap();
        assert_eq!(rsp, Bytes::from_static(b"STORED\r\n"));

        // Third ack is discarded without another delivery.
        h.peer_respond(peers[1], "STORED\r\n");
        assert!(h.client_recv().is_none());
        assert_eq!(h.router.live_messages(), 0);
    }

    #[test]
    fn consistency_toggle_answers_locally() {
        let mut h = harness(
            topology(3, true, 0),
            options(Consistency::LocalQuorum, Consistency::LocalQuorum),
        );

        h.send("consistency read\r\n");

        assert_eq!(h.client_recv().unwrap(), Bytes::from_static(b"1\r\n"));
        assert_eq!(
            h.router.conn(h.client).read_consistency,
            Consistency::LocalOne
        );

        // Nothing was forwarded anywhere.
        assert!(h.router.take_connect_ops().is_empty());
        assert_eq!(h.router.live_messages(), 0);

        h.send("consistency write\r\n");
        assert_eq!(h.client_recv().unwrap(), Bytes::from_static(b"1\r\n"));
        assert_eq!(
            h.router.conn(h.client).write_consistency,
            Consistency::LocalOne
        );
    }

    #[test]
    fn consistency_with_bad_target_errors() {
        let mut h = harness(
            topology(1, true, 0),
            options(Consistency::LocalQuorum, Consistency::LocalQuorum),
        );

        h.send("consistency sideways\r\n");

        let rsp = h.client_recv().unwrap();
        assert!(rsp.starts_with(b"SERVER_ERROR"));
        assert_eq!(h.router.live_messages(), 0);
    }

    #[test]
    fn closed_client_swallows_late_responses() {
        // Local rack's peer is a remote node, so the read goes out a peer link.
        let mut h = harness(
            topology(1, false, 0),
            options(Consistency::LocalOne, Consistency::LocalQuorum),
        );

        h.send("get k1\r\n");
        let peers = h.peer_conns();
        assert_eq!(peers.len(), 1);

        // Client goes away with the request still in flight.
        let client = h.client;
        h.router.on_client_closed(client);
        assert_eq!(h.router.stats.client_dropped_requests, 1);

        // The response arrives afterwards and is absorbed whole.
        h.peer_respond(peers[0], "VALUE k1 0 2\r\nv1\r\nEND\r\n");

        assert!(h.client_recv().is_none());
        assert_eq!(h.router.live_messages(), 0);
        assert!(!h.router.conn(peers[0]).active());
    }

    #[test]
    fn multiget_fragments_and_stitches() {
        let mut h = harness(
            topology(1, true, 0),
            options(Consistency::LocalOne, Consistency::LocalQuorum),
        );

        h.send("get a b\r\n");

        // Two single-key sub-requests, FIFO on the storage link.
        assert_eq!(
            h.outbound_recv(h.storage()).unwrap(),
            Bytes::from_static(b"get a\r\n")
        );
        assert_eq!(
            h.outbound_recv(h.storage()).unwrap(),
            Bytes::from_static(b"get b\r\n")
        );

        h.storage_respond("VALUE a 0 1\r\nx\r\nEND\r\n");

        // Chain incomplete: nothing delivered yet.
        assert!(h.client_recv().is_none());

        h.storage_respond("END\r\n");

        let rsp = h.client_recv().unwrap();
        assert_eq!(rsp, Bytes::from_static(b"VALUE a 0 1\r\nx\r\nEND\r\n"));
        assert_eq!(h.router.live_messages(), 0);
    }

    #[test]
    fn fifo_responses_match_request_order() {
        let mut h = harness(
            topology(1, true, 0),
            options(Consistency::LocalOne, Consistency::LocalQuorum),
        );

        h.send("get a\r\n");
        h.send("get b\r\n");

        h.storage_respond("VALUE a 0 1\r\n1\r\nEND\r\n");
        h.storage_respond("VALUE b 0 1\r\n2\r\nEND\r\n");

        assert_eq!(
            h.client_recv().unwrap(),
            Bytes::from_static(b"VALUE a 0 1\r\n1\r\nEND\r\n")
        );
        assert_eq!(
            h.client_recv().unwrap(),
            Bytes::from_static(b"VALUE b 0 1\r\n2\r\nEND\r\n")
        );
    }

    #[test]
    fn req_done_is_idempotent_across_fragment_chain() {
        let mut h = harness(
            topology(1, true, 0),
            options(Consistency::LocalOne, Consistency::LocalQuorum),
        );

        h.send("get a b\r\n");

        h.storage_respond("END\r\n");

        // One fragment done, chain not: stable false.
        let head = h.router.conn(h.client).head_outq().unwrap();
        let client = h.client;
        assert!(!h.router.req_done(client, head));
        assert!(!h.router.req_done(client, head));

        h.storage_respond("END\r\n");

        // Delivery consumed the chain.
        assert!(h.client_recv().is_some());
        assert_eq!(h.router.live_messages(), 0);
    }

    #[test]
    fn timeout_fails_request_and_resets_link() {
        let mut h = harness(
            topology(1, true, 0),
            options(Consistency::LocalOne, Consistency::LocalQuorum),
        );

        h.send("get k1\r\n");

        let timers = h.router.take_timer_ops();
        assert_eq!(timers.len(), 1);

        h.router.on_request_timeout(timers[0].0);

        let rsp = h.client_recv().unwrap();
        assert!(rsp.starts_with(b"SERVER_ERROR"));
        assert_eq!(h.router.stats.request_timeouts, 1);
        assert_eq!(h.router.live_messages(), 0);
        assert_eq!(h.router.conn(h.storage()).state, LinkState::Disconnected);
    }

    #[test]
    fn standby_drops_everything() {
        let mut opts = options(Consistency::LocalOne, Consistency::LocalQuorum);
        opts.node_state = NodeState::Standby;

        let mut h = harness(topology(1, true, 0), opts);

        h.send("get k1\r\n");

        let rsp = h.client_recv().unwrap();
        assert!(rsp.starts_with(b"SERVER_ERROR"));
        assert_eq!(h.router.live_messages(), 0);
    }

    #[test]
    fn writes_only_still_forwards_writes() {
        let mut opts = options(Consistency::LocalOne, Consistency::LocalOne);
        opts.node_state = NodeState::WritesOnly;

        let mut h = harness(topology(1, true, 0), opts);

        h.send("get k1\r\n");
        assert!(h.client_recv().unwrap().starts_with(b"SERVER_ERROR"));

        h.send("set k1 0 0 1\r\nv\r\n");
        assert!(h.outbound_recv(h.storage()).is_some());

        h.storage_respond("STORED\r\n");
        assert_eq!(h.client_recv().unwrap(), Bytes::from_static(b"STORED\r\n"));
    }

    #[test]
    fn admin_mode_acknowledges_owned_deletes() {
        let mut opts = options(Consistency::LocalOne, Consistency::LocalOne);
        opts.admin_mode = true;

        let mut h = harness(topology(1, true, 0), opts);

        h.send("delete k1\r\n");

        assert_eq!(h.client_recv().unwrap(), Bytes::from_static(b"1\r\n"));
        assert!(h.outbound_recv(h.storage()).is_none());
        assert_eq!(h.router.live_messages(), 0);
    }

    #[test]
    fn noreply_write_expects_nothing() {
        let mut h = harness(
            topology(1, true, 0),
            options(Consistency::LocalOne, Consistency::LocalOne),
        );

        h.send("set k1 0 0 1 noreply\r\nv\r\n");

        assert!(h.outbound_recv(h.storage()).is_some());
        assert!(h.client_recv().is_none());

        // Released after the write: no timers, no queue entries.
        assert!(h.router.take_timer_ops().is_empty());
        assert_eq!(h.router.live_messages(), 0);
        assert!(!h.router.conn(h.storage()).active());
    }

    #[test]
    fn remote_dc_gets_one_swallowed_replica() {
        let mut h = harness(
            topology(1, true, 1),
            options(Consistency::LocalQuorum, Consistency::LocalQuorum),
        );

        h.send("set k1 0 0 1\r\nv\r\n");

        // One local (storage) plus exactly one remote-DC replica.
        let peers = h.peer_conns();
        assert_eq!(peers.len(), 1);

        h.storage_respond("STORED\r\n");

        // Quorum of one local rack: answered already.
        assert_eq!(h.client_recv().unwrap(), Bytes::from_static(b"STORED\r\n"));

        // The remote ack is absorbed.
        h.peer_respond(peers[0], "STORED\r\n");
        assert!(h.client_recv().is_none());
        assert_eq!(h.router.live_messages(), 0);
    }

    #[test]
    fn peer_inbound_request_serves_from_storage() {
        let mut h = harness(
            topology(1, true, 0),
            options(Consistency::LocalOne, Consistency::LocalOne),
        );

        let (tx, mut peer_rx) = mpsc::unbounded_channel();
        let (sd_tx, sd_rx) = watch::channel(false);
        std::mem::forget(sd_rx);

        let peer = h
            .router
            .register_peer_inbound("10.9.9.9:4000".parse().unwrap(), tx, sd_tx);

        let frame = Frame {
            kind: FrameKind::Request,
            sealed: false,
            msg_id: 77,
            payload: Bytes::from_static(b"get k1\r\n"),
        };

        h.router.on_peer_frame(peer, frame);
        h.connect_all();

        assert_eq!(
            h.outbound_recv(h.storage()).unwrap(),
            Bytes::from_static(b"get k1\r\n")
        );

        h.storage_respond("VALUE k1 0 1\r\nv\r\nEND\r\n");

        let bytes = peer_rx.try_recv().unwrap();
        let (_, out) = Frame::parse(&bytes).unwrap();

        assert_eq!(out.kind, FrameKind::Response);
        assert_eq!(out.msg_id, 77);
        assert_eq!(out.payload, Bytes::from_static(b"VALUE k1 0 1\r\nv\r\nEND\r\n"));
        assert_eq!(h.router.live_messages(), 0);
    }

    #[test]
    fn half_close_drains_then_settles() {
        let mut h = harness(
            topology(1, true, 0),
            options(Consistency::LocalOne, Consistency::LocalOne),
        );

        h.send("get k1\r\n");

        let client = h.client;
        h.router.on_client_eof(client);

        // Still active: the answer must flow first.
        assert!(!h.router.conn(client).done);

        h.storage_respond("END\r\n");

        assert_eq!(h.client_recv().unwrap(), Bytes::from_static(b"END\r\n"));
        assert!(h.router.conn(client).done);
    }

    #[test]
    fn peer_link_loss_degrades_quorum_read() {
        let mut h = harness(
            topology(3, true, 0),
            options(Consistency::LocalQuorum, Consistency::LocalQuorum),
        );

        h.send("get k1\r\n");
        let peers = h.peer_conns();

        h.storage_respond("VALUE k1 0 1\r\na\r\nEND\r\n");

        // Both replica links die before answering.
        h.router.on_conn_closed(peers[0]);
        h.router.on_conn_closed(peers[1]);

        // Best-effort: the lone response is the answer.
        let rsp = h.client_recv().unwrap();
        assert_eq!(rsp, Bytes::from_static(b"VALUE k1 0 1\r\na\r\nEND\r\n"));
        assert_eq!(h.router.live_messages(), 0);
    }
}
