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

use std::net::IpAddr;
use std::num::NonZeroU32;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tokio_stream::StreamExt;
use tokio_util::codec::Decoder;
use tokio_util::time::DelayQueue;

use bytes::Bytes;

use ratelimit_meter::{KeyedRateLimiter, GCRA};

use futures::sink::SinkExt;

use crate::connection::{ConnId, ConnRole};
use crate::error::FanlightResult;
use crate::message::MsgId;
use crate::peer_frame::{Frame, PeerFrameCodec};
use crate::protocol::{BackendCodec, BackendResponse, ClientCodec, ClientRequest};
use crate::router::{ConnectOp, Router};

pub struct Fanlight {
    /// Client-facing TCP listener.
    listener: TcpListener,

    /// Peer-facing TCP listener for replica traffic from other nodes.
    peer_listener: TcpListener,

    /// The routing engine. All of its state is touched only from the
    /// event loop below.
    router: Router,

    /// Main event loop receiver.
    ///
    /// Socket tasks and timers funnel everything through here, so router
    /// mutation stays strictly serial.
    rx: mpsc::UnboundedReceiver<Event>,

    tx: mpsc::UnboundedSender<Event>,

    /// Per-request timeouts, lazily cancelled: an expiry for a request
    /// that already completed is simply ignored.
    timers: DelayQueue<MsgId>,

    /// Ratelimiter for individual IP address.
    ///
    /// Note that the key is `IpAddr` rather than SocketAddr.
    /// As the ratelimit applies globally to a single address,
    /// shared between the IP address's connections.
    ratelimiter: KeyedRateLimiter<IpAddr, GCRA>,

    /// Interval in seconds between stats summary lines.
    stats_interval: u64,
}

/// Enum of message variants & data,
/// in which is passed to the main thread and computed.
enum Event {
    ClientRequest(ConnId, ClientRequest),

    /// Client bytes the codec refused.
    ClientError(ConnId),

    /// Client stopped sending; writes may still drain.
    ClientEof(ConnId),

    ClientClosed(ConnId),

    /// A frame from an inbound or outbound peer link.
    PeerFrame(ConnId, Frame),

    BackendResponse(ConnId, BackendResponse),

    /// An outbound connect finished; channels attach to the connection.
    Connected(ConnId, mpsc::UnboundedSender<Bytes>, watch::Sender<bool>),

    ConnectFailed(ConnId),

    ConnClosed(ConnId),

    StatsTick,
}

impl Fanlight {
    pub async fn new<A>(
        addr: A,
        peer_addr: A,
        router: Router,
        rate_limit: NonZeroU32,
    ) -> FanlightResult<Self>
    where
        A: ToSocketAddrs,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            peer_listener: TcpListener::bind(peer_addr).await?,
            router,
            rx,
            tx,
            timers: DelayQueue::new(),
            ratelimiter: KeyedRateLimiter::new(rate_limit, Duration::from_secs(5)),
            stats_interval: 30,
        })
    }

    pub fn stats_interval(&mut self, secs: u64) -> &mut Self {
        self.stats_interval = secs;

        self
    }

    /// Start the main event loop.
    ///
    /// Handles accepts, socket events, per-request timeouts and periodic
    /// stats, all on this task.
    pub async fn up(&mut self) -> FanlightResult<()> {
        self.start_timers();

        info!("Started processing connections");

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => {
                    // Exit to main
                    return Ok(());
                }
                Ok((stream, addr)) = self.listener.accept() => {
                    debug!("Client has connected (addr = {})", addr);

                    let (tx_shutdown, rx_shutdown) = watch::channel(false);
                    let (tx_bytes, rx_bytes) = mpsc::unbounded_channel();

                    let id = self.router.register_client(addr, tx_bytes, tx_shutdown);

                    self.spawn_client(id, stream, rx_shutdown, rx_bytes);
                }
                Ok((stream, addr)) = self.peer_listener.accept() => {
                    debug!("Peer has connected (addr = {})", addr);

                    let (tx_shutdown, rx_shutdown) = watch::channel(false);
                    let (tx_bytes, rx_bytes) = mpsc::unbounded_channel();

                    let id = self.router.register_peer_inbound(addr, tx_bytes, tx_shutdown);

                    self.spawn_peer(id, stream, rx_shutdown, rx_bytes);
                }
                Some(event) = self.rx.recv() => {
                    self.dispatch(event);
                }
                Some(Ok(expired)) = self.timers.next() => {
                    self.router.on_request_timeout(expired.into_inner());
                    self.pump();
                }
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::ClientRequest(id, req) => match self.router.conn_addr(id) {
                Some(addr) => {
                    if self.ratelimiter.check(addr.ip()).is_err() {
                        warn!("Client exceeded ratelimit (addr = {})", addr);

                        self.router.reject_client(id, "rate limited");
                        self.cleanup();
                    } else {
                        self.router.on_client_request(id, req);
                    }
                }
                None => {}
            },
            Event::ClientError(id) => self.router.on_client_error(id),
            Event::ClientEof(id) => self.router.on_client_eof(id),
            Event::ClientClosed(id) => self.router.on_client_closed(id),
            Event::PeerFrame(id, frame) => self.router.on_peer_frame(id, frame),
            Event::BackendResponse(id, rsp) => self.router.on_backend_response(id, rsp),
            Event::Connected(id, outbox, shutdown) => {
                self.router.on_conn_connected(id, outbox, shutdown)
            }
            Event::ConnectFailed(id) => self.router.on_conn_failed(id),
            Event::ConnClosed(id) => self.router.on_conn_closed(id),
            Event::StatsTick => info!("stats {}", self.router.stats.summary()),
        }

        self.pump();
    }

    /// Apply the side effects a dispatch left behind: arm request timers
    /// and kick off outbound connects.
    fn pump(&mut self) {
        for (mid, delay) in self.router.take_timer_ops() {
            self.timers.insert(mid, delay);
        }

        for op in self.router.take_connect_ops() {
            self.spawn_connect(op);
        }
    }

    fn cleanup(&mut self) {
        self.ratelimiter.cleanup(Duration::from_secs(60));
    }

    fn spawn_connect(&self, op: ConnectOp) {
        let tx = self.tx.clone();

        tokio::spawn(async move {
            match TcpStream::connect(op.addr).await {
                Ok(stream) => {
                    let (tx_shutdown, rx_shutdown) = watch::channel(false);
                    let (tx_bytes, rx_bytes) = mpsc::unbounded_channel();

                    if tx
                        .send(Event::Connected(op.conn, tx_bytes, tx_shutdown))
                        .is_err()
                    {
                        return;
                    }

                    match op.role {
                        ConnRole::Storage => {
                            storage_io(op.conn, stream, rx_shutdown, rx_bytes, tx.clone()).await
                        }
                        _ => peer_io(op.conn, stream, rx_shutdown, rx_bytes, tx.clone()).await,
                    }

                    let _ = tx.send(Event::ConnClosed(op.conn));
                }
                Err(e) => {
                    error!("Unable to connect (addr = {}): {}", op.addr, e);

                    let _ = tx.send(Event::ConnectFailed(op.conn));
                }
            }
        });
    }

    fn spawn_client(
        &self,
        id: ConnId,
        stream: TcpStream,
        rx_shutdown: watch::Receiver<bool>,
        rx_bytes: mpsc::UnboundedReceiver<Bytes>,
    ) {
        let tx = self.tx.clone();

        tokio::spawn(async move {
            client_io(id, stream, rx_shutdown, rx_bytes, tx.clone()).await;

            // Client has no more frames, declare disconnect.
            let _ = tx.send(Event::ClientClosed(id));
        });
    }

    fn spawn_peer(
        &self,
        id: ConnId,
        stream: TcpStream,
        rx_shutdown: watch::Receiver<bool>,
        rx_bytes: mpsc::UnboundedReceiver<Bytes>,
    ) {
        let tx = self.tx.clone();

        tokio::spawn(async move {
            peer_io(id, stream, rx_shutdown, rx_bytes, tx.clone()).await;

            let _ = tx.send(Event::ConnClosed(id));
        });
    }

    /// Starts background timers.
    fn start_timers(&mut self) {
        let tx = self.tx.clone();
        let interval = Duration::from_secs(self.stats_interval);

        tokio::spawn(async move {
            loop {
                sleep(interval).await;

                if tx.send(Event::StatsTick).is_err() {
                    return;
                }
            }
        });
    }
}

async fn client_io(
    id: ConnId,
    stream: TcpStream,
    mut rx_shutdown: watch::Receiver<bool>,
    mut rx_bytes: mpsc::UnboundedReceiver<Bytes>,
    tx: mpsc::UnboundedSender<Event>,
) {
    let mut frames = ClientCodec.framed(stream);
    let mut reading = true;

    loop {
        select! {
            _ = rx_shutdown.changed() => {
                break;
            }
            Some(bytes) = rx_bytes.recv() => {
                if let Err(e) = frames.send(bytes).await {
                    error!("Unable to send bytes to client {}: {}", id, e);
                    break;
                }
            }
            frame = frames.next(), if reading => {
                match frame {
                    Some(Ok(req)) => {
                        let _ = tx.send(Event::ClientRequest(id, req));
                    }
                    Some(Err(e)) => {
                        debug!("Client protocol error (conn = {}): {}", id, e);

                        let _ = tx.send(Event::ClientError(id));
                        reading = false;
                    }
                    None => {
                        // Half-close: stop reading, keep draining writes
                        // until the router shuts us down.
                        let _ = tx.send(Event::ClientEof(id));
                        reading = false;
                    }
                }
            }
        }
    }
}

async fn peer_io(
    id: ConnId,
    stream: TcpStream,
    mut rx_shutdown: watch::Receiver<bool>,
    mut rx_bytes: mpsc::UnboundedReceiver<Bytes>,
    tx: mpsc::UnboundedSender<Event>,
) {
    let mut frames = PeerFrameCodec.framed(stream);

    loop {
        select! {
            _ = rx_shutdown.changed() => {
                break;
            }
            Some(bytes) = rx_bytes.recv() => {
                if let Err(e) = frames.send(bytes).await {
                    error!("Unable to send bytes to peer {}: {}", id, e);
                    break;
                }
            }
            frame = frames.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        let _ = tx.send(Event::PeerFrame(id, frame));
                    }
                    Some(Err(e)) => {
                        error!("Peer framing error (conn = {}): {}", id, e);
                        break;
                    }
                    None => {
                        break;
                    }
                }
            }
        }
    }
}

async fn storage_io(
    id: ConnId,
    stream: TcpStream,
    mut rx_shutdown: watch::Receiver<bool>,
    mut rx_bytes: mpsc::UnboundedReceiver<Bytes>,
    tx: mpsc::UnboundedSender<Event>,
) {
    let mut frames = BackendCodec.framed(stream);

    loop {
        select! {
            _ = rx_shutdown.changed() => {
                break;
            }
            Some(bytes) = rx_bytes.recv() => {
                if let Err(e) = frames.send(bytes).await {
                    error!("Unable to send bytes to storage: {}", e);
                    break;
                }
            }
            frame = frames.next() => {
                match frame {
                    Some(Ok(rsp)) => {
                        let _ = tx.send(Event::BackendResponse(id, rsp));
                    }
                    Some(Err(e)) => {
                        error!("Storage framing error: {}", e);
                        break;
                    }
                    None => {
                        break;
                    }
                }
            }
        }
    }
}
