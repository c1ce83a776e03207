//! One bound messaging socket and its event routing.
//!
//! The messaging library delivers everything (inbound packets, connects,
//! timeouts) through a single event queue that is only serviced when the
//! socket is pumped. Pumping happens inline on the caller's thread; effects
//! are deferred into per-connection inbound queues and an accept queue
//! rather than acted on mid-callback, so pumping never does expensive work.
//!
//! Connections are implicit in the underlying library: the first packet from
//! an unknown peer is the connection request. An empty payload is used as
//! the connection marker in both directions; the data path never produces
//! empty messages, so markers are unambiguous and are consumed by routing.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use laminar::{Config, Packet, Socket, SocketEvent};

use crate::error::{NetError, NetResult};

use super::connection::ReliableCore;

/// How many queued events one pump call will route at most.
pub(crate) const EVENT_BATCH: usize = 256;

/// Largest message handed to the library per send; bigger queues drain in
/// several partial sends.
pub(crate) const MAX_MESSAGE_BYTES: usize = 8 * 1024;

/// Idle time after which the library reports a peer as timed out.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive interval; must stay well under [`IDLE_TIMEOUT`].
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

fn messaging_error(err: laminar::ErrorKind) -> NetError {
    NetError::Messaging(err.to_string())
}

#[derive(Default)]
struct Router {
    /// Live connections by peer address. Held weakly: a closed connection
    /// simply stops receiving.
    conns: HashMap<SocketAddr, Weak<ReliableCore>>,
    /// Peers that knocked but have not been accepted yet.
    pending_accepts: VecDeque<SocketAddr>,
    /// Data that raced ahead of the accept call, delivered on accept.
    pre_accept: HashMap<SocketAddr, VecDeque<Vec<u8>>>,
    /// Whether unknown peers may knock at all (server side).
    accepting: bool,
}

impl Router {
    fn enqueue_accept(&mut self, addr: SocketAddr) {
        if !self.conns.contains_key(&addr) && !self.pending_accepts.contains(&addr) {
            tracing::debug!("incoming messaging connection from [{addr}]");
            self.pending_accepts.push_back(addr);
        }
    }

    fn route(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Packet(packet) => {
                let addr = packet.addr();
                if let Some(core) = self.conns.get(&addr).and_then(Weak::upgrade) {
                    core.mark_established();
                    if !packet.payload().is_empty() {
                        core.push_inbound(packet.payload().to_vec());
                    }
                } else if self.accepting {
                    self.enqueue_accept(addr);
                    if !packet.payload().is_empty() {
                        self.pre_accept
                            .entry(addr)
                            .or_default()
                            .push_back(packet.payload().to_vec());
                    }
                }
            }
            SocketEvent::Connect(addr) => {
                if let Some(core) = self.conns.get(&addr).and_then(Weak::upgrade) {
                    core.mark_established();
                } else if self.accepting {
                    self.enqueue_accept(addr);
                }
            }
            SocketEvent::Timeout(addr) | SocketEvent::Disconnect(addr) => {
                if let Some(core) = self.conns.remove(&addr).and_then(|w| w.upgrade()) {
                    tracing::debug!("messaging peer [{addr}] went away");
                    core.mark_closed();
                }
                self.pre_accept.remove(&addr);
                self.pending_accepts.retain(|a| *a != addr);
            }
        }
    }
}

/// A bound messaging socket plus the routing state layered on top of it.
pub(crate) struct Endpoint {
    socket: Mutex<Socket>,
    packet_tx: Sender<Packet>,
    event_rx: Receiver<SocketEvent>,
    local_addr: SocketAddr,
    router: Mutex<Router>,
}

impl Endpoint {
    /// Bind a messaging socket. `accepting` turns the endpoint into a
    /// server that queues unknown peers for accept.
    pub(crate) fn bind(addr: SocketAddr, accepting: bool) -> NetResult<Arc<Self>> {
        let config = Config {
            idle_connection_timeout: IDLE_TIMEOUT,
            heartbeat_interval: Some(HEARTBEAT_INTERVAL),
            max_packet_size: 2 * MAX_MESSAGE_BYTES,
            ..Config::default()
        };
        let socket = Socket::bind_with_config(addr, config).map_err(messaging_error)?;
        let packet_tx = socket.get_packet_sender();
        let event_rx = socket.get_event_receiver();
        let local_addr = socket.local_addr().map_err(messaging_error)?;

        tracing::debug!("messaging endpoint bound on [{local_addr}] (accepting: {accepting})");
        Ok(Arc::new(Self {
            socket: Mutex::new(socket),
            packet_tx,
            event_rx,
            local_addr,
            router: Mutex::new(Router {
                accepting,
                ..Router::default()
            }),
        }))
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Pump the library and route up to `max_events` queued events.
    ///
    /// Runs inline on the caller's thread; routing only moves bytes into
    /// queues, never anything expensive.
    pub(crate) fn pump(&self, max_events: usize) -> usize {
        self.socket
            .lock()
            .expect("messaging socket lock poisoned")
            .manual_poll(Instant::now());

        let mut router = self.router.lock().expect("messaging router lock poisoned");
        let mut routed = 0;
        while routed < max_events {
            match self.event_rx.try_recv() {
                Ok(event) => {
                    router.route(event);
                    routed += 1;
                }
                Err(_) => break,
            }
        }
        routed
    }

    /// Hand one message to the library for delivery to `addr`.
    ///
    /// The message is queued inside the library; it leaves the machine on a
    /// subsequent pump.
    pub(crate) fn send_to(&self, addr: SocketAddr, payload: Vec<u8>) -> NetResult<()> {
        self.packet_tx
            .send(Packet::reliable_ordered(addr, payload, None))
            .map_err(|_| NetError::Messaging("messaging socket is gone".to_string()))
    }

    /// Install the route for a connection's inbound traffic.
    pub(crate) fn register(&self, addr: SocketAddr, core: Weak<ReliableCore>) {
        self.router
            .lock()
            .expect("messaging router lock poisoned")
            .conns
            .insert(addr, core);
    }

    /// Remove a connection's route and any data buffered for it.
    pub(crate) fn remove_route(&self, addr: SocketAddr) {
        let mut router = self.router.lock().expect("messaging router lock poisoned");
        router.conns.remove(&addr);
        router.pre_accept.remove(&addr);
        router.pending_accepts.retain(|a| *a != addr);
    }

    /// Pop the next peer waiting to be accepted, along with any data that
    /// arrived before the accept.
    pub(crate) fn pop_pending_accept(&self) -> Option<(SocketAddr, VecDeque<Vec<u8>>)> {
        let mut router = self.router.lock().expect("messaging router lock poisoned");
        let addr = router.pending_accepts.pop_front()?;
        let buffered = router.pre_accept.remove(&addr).unwrap_or_default();
        Some((addr, buffered))
    }
}
