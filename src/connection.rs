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

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;

use bytes::Bytes;

use tokio::sync::{mpsc, watch};

use crate::message::{Consistency, MsgId};

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    /// A client speaking the line protocol.
    Client,

    /// Another node speaking frames to us.
    PeerInbound,

    /// An outbound frame link to another node.
    PeerOutbound,

    /// The outbound link to the local storage backend.
    Storage,
}

/// Outbound link lifecycle. Client and peer-inbound connections are born
/// `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Per-socket state.
///
/// The socket itself lives in its own task; the router reaches it only
/// through `outbox` (bytes to write) and `shutdown`. Queues hold message
/// ids into the router's message table.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,

    pub role: ConnRole,

    pub addr: SocketAddr,

    pub state: LinkState,

    outbox: Option<mpsc::UnboundedSender<Bytes>>,

    shutdown: Option<watch::Sender<bool>>,

    /// Requests waiting to be written to the socket. Always empty on
    /// client connections.
    pub imsg_q: VecDeque<MsgId>,

    /// Requests awaiting a response. FIFO: the head is the oldest.
    pub omsg_q: VecDeque<MsgId>,

    /// Requests awaiting their answer, client-facing connections only.
    pub outstanding: HashSet<MsgId>,

    pub read_consistency: Consistency,

    pub write_consistency: Consistency,

    /// Peer link carries sealed payloads.
    pub secured: bool,

    pub eof: bool,

    pub done: bool,

    pub err: Option<u8>,
}

impl Connection {
    pub fn new(id: ConnId, role: ConnRole, addr: SocketAddr) -> Self {
        Self {
            id,
            role,
            addr,
            state: LinkState::Disconnected,
            outbox: None,
            shutdown: None,
            imsg_q: VecDeque::new(),
            omsg_q: VecDeque::new(),
            outstanding: HashSet::new(),
            read_consistency: Consistency::LocalQuorum,
            write_consistency: Consistency::LocalQuorum,
            secured: false,
            eof: false,
            done: false,
            err: None,
        }
    }

    /// Hand the connection its live socket task.
    pub fn attach(&mut self, outbox: mpsc::UnboundedSender<Bytes>, shutdown: watch::Sender<bool>) {
        self.outbox = Some(outbox);
        self.shutdown = Some(shutdown);
        self.state = LinkState::Connected;
    }

    /// Queue bytes for the socket task. Returns false once the task is gone.
    pub fn send(&self, payload: Bytes) -> bool {
        match &self.outbox {
            Some(tx) => match tx.send(payload) {
                Ok(()) => true,
                Err(e) => {
                    error!(
                        "Unable to send payload to connection (addr = {}): {}",
                        self.addr, e
                    );

                    false
                }
            },
            None => false,
        }
    }

    pub fn shutdown(&self) {
        if let Some(tx) = &self.shutdown {
            if let Err(e) = tx.send(true) {
                error!(
                    "Unable to shutdown connection (addr = {}): {}",
                    self.addr, e
                );
            }
        }
    }

    pub fn enqueue_inq(&mut self, id: MsgId) {
        self.imsg_q.push_back(id);
    }

    pub fn dequeue_inq(&mut self) -> Option<MsgId> {
        self.imsg_q.pop_front()
    }

    pub fn enqueue_outq(&mut self, id: MsgId) {
        self.omsg_q.push_back(id);
    }

    pub fn dequeue_outq_head(&mut self) -> Option<MsgId> {
        self.omsg_q.pop_front()
    }

    /// Remove a specific request, wherever it sits in the queue.
    pub fn dequeue_outq(&mut self, id: MsgId) -> bool {
        if let Some(pos) = self.omsg_q.iter().position(|&m| m == id) {
            self.omsg_q.remove(pos);

            return true;
        }

        false
    }

    pub fn head_outq(&self) -> Option<MsgId> {
        self.omsg_q.front().copied()
    }

    /// A connection with nothing awaiting a response may be closed.
    pub fn active(&self) -> bool {
        !self.omsg_q.is_empty()
    }

    pub fn consistency(&self, is_read: bool) -> Consistency {
        if is_read {
            self.read_consistency
        } else {
            self.write_consistency
        }
    }

    pub fn toggle_read_consistency(&mut self) -> Consistency {
        self.read_consistency = toggle(self.read_consistency);
        self.read_consistency
    }

    pub fn toggle_write_consistency(&mut self) -> Consistency {
        self.write_consistency = toggle(self.write_consistency);
        self.write_consistency
    }
}

fn toggle(level: Consistency) -> Consistency {
    match level {
        Consistency::LocalOne => Consistency::LocalQuorum,
        Consistency::LocalQuorum => Consistency::LocalOne,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::new(1, ConnRole::Client, "127.0.0.1:9999".parse().unwrap())
    }

    #[test]
    fn outq_is_fifo() {
        let mut c = conn();

        c.enqueue_outq(1);
        c.enqueue_outq(2);
        c.enqueue_outq(3);

        assert_eq!(c.head_outq(), Some(1));
        assert!(c.dequeue_outq(2));
        assert_eq!(c.dequeue_outq_head(), Some(1));
        assert_eq!(c.dequeue_outq_head(), Some(3));
        assert!(!c.active());
    }

    #[test]
    fn consistency_toggles_both_ways() {
        let mut c = conn();

        assert_eq!(c.read_consistency, Consistency::LocalQuorum);
        assert_eq!(c.toggle_read_consistency(), Consistency::LocalOne);
        assert_eq!(c.toggle_read_consistency(), Consistency::LocalQuorum);
        assert_eq!(c.toggle_write_consistency(), Consistency::LocalOne);
    }
}
