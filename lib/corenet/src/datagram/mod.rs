//! UDP endpoint for the datagram transport (C5, spec §3 "DatagramSocket", §4.3).
//!
//! `DatagramEndpoint` owns the one shared `UdpSocket`, keeps a `SocketAddr → DatagramSocket`
//! map, and drives both halves of the state machine spec §4.3 describes: a fresh
//! `Unauthenticated` socket is created the moment a datagram arrives from an address the
//! endpoint hasn't seen (or has since closed and dropped), and a periodic sweep calls
//! `on_ping_tick` on every live socket for liveness pings, timeouts, and the
//! `shouldWaitForNext` skip policy. Session resolution for a handshake token is delegated to
//! whatever owns the token→Session index (`game/server`'s bootstrap), via the
//! `SessionDirectory` this endpoint is constructed with — the same directory the stream
//! transport consults, so a token registered by either transport's handshake is visible to
//! the other. `corenet` itself has no notion of how sessions are authenticated against a
//! concrete player/account.
pub mod socket;
pub mod wire;

use crate::clock::Clock;
use crate::config::ProtocolLimits;
use crate::scheduler::{BoxFuture, Task};
use crate::session::{Session, SessionDirectory};
use flux::logging::{debug, warn, Logger, LoggerFactory};
use flux::SessionToken;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::net::UdpSocket;

pub use socket::{DatagramSocket, ReceiveOutcome};

const MAX_DATAGRAM_SIZE: usize = 2048;

struct Inner {
    sockets: HashMap<SocketAddr, Rc<DatagramSocket>>,
}

/// The datagram side's single entry point: one `UdpSocket`, fanned out per remote address.
pub struct DatagramEndpoint {
    udp: Rc<UdpSocket>,
    clock: Clock,
    limits: ProtocolLimits,
    logger: Logger,
    directory: Rc<dyn SessionDirectory>,
    inner: RefCell<Inner>,
}

impl DatagramEndpoint {
    pub fn new(udp: UdpSocket, clock: Clock, limits: ProtocolLimits, logging: &LoggerFactory, directory: Rc<dyn SessionDirectory>) -> Rc<DatagramEndpoint> {
        Rc::new(DatagramEndpoint {
            udp: Rc::new(udp),
            clock,
            limits,
            logger: logging.build("datagram_endpoint", None),
            directory,
            inner: RefCell::new(Inner { sockets: HashMap::new() }),
        })
    }

    /// The number of addresses currently tracked (bound or unauthenticated), for tests and
    /// diagnostics.
    pub fn socket_count(&self) -> usize {
        self.inner.borrow().sockets.len()
    }

    fn socket_for(self: &Rc<Self>, addr: SocketAddr) -> Rc<DatagramSocket> {
        let existing = self.inner.borrow().sockets.get(&addr).cloned();
        if let Some(socket) = existing {
            if !socket.is_closed() {
                return socket;
            }
        }
        let socket = DatagramSocket::new(addr, self.clock.clone(), self.limits, self.udp.clone(), self.logger.clone());
        self.inner.borrow_mut().sockets.insert(addr, socket.clone());
        socket
    }

    /// Runs forever, reading datagrams off the shared socket and routing each to the
    /// per-address `DatagramSocket`. Meant to be handed to `tokio::task::spawn_local` once by
    /// the server bootstrap.
    pub async fn run_receive_loop(self: Rc<Self>) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, addr) = match self.udp.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(self.logger, "datagram recv_from failed"; "error" => %err);
                    continue;
                }
            };
            self.handle_datagram(addr, &buf[..len]);
        }
    }

    fn handle_datagram(self: &Rc<Self>, addr: SocketAddr, bytes: &[u8]) {
        let socket = self.socket_for(addr);
        match socket.receive(bytes) {
            Ok(ReceiveOutcome::Handled) => {}
            Ok(ReceiveOutcome::HandshakeRequest(token)) => self.handle_handshake(addr, socket, token),
            Err(err) => {
                debug!(self.logger, "dropping malformed datagram"; "addr" => %addr, "error" => %err);
            }
        }
    }

    fn handle_handshake(self: &Rc<Self>, addr: SocketAddr, socket: Rc<DatagramSocket>, token: [u8; flux::TOKEN_SIZE]) {
        match self.directory.resolve(SessionToken::from_bytes(token)) {
            Some(session) => {
                debug!(self.logger, "datagram handshake bound"; "addr" => %addr, "session_id" => format!("{:?}", session.id()));
                socket.bind(session);
            }
            None => {
                warn!(self.logger, "datagram handshake with unknown token"; "addr" => %addr);
                socket.close();
                self.inner.borrow_mut().sockets.remove(&addr);
            }
        }
    }

    /// Drops closed sockets from the address map; run this right after the ping sweep so a
    /// socket `on_ping_tick` just closed doesn't linger (spec §4.3: "A closed socket is
    /// removed from the address map").
    fn collect_closed(&self) {
        self.inner.borrow_mut().sockets.retain(|_, socket| !socket.is_closed());
    }
}

/// Periodic liveness sweep over every tracked address (spec §4.3 "Pinging"). Registered once
/// with the `Scheduler` at a fixed period; `period_millis` is independent of any one session's
/// `sessionTimeout`, since a session's own clock starts from its own `lastReceived`.
pub struct PingSweepTask {
    endpoint: Rc<DatagramEndpoint>,
    period_millis: u64,
    remaining: Cell<Option<u32>>,
}

impl PingSweepTask {
    pub fn new(endpoint: Rc<DatagramEndpoint>, period_millis: u64) -> Rc<PingSweepTask> {
        Rc::new(PingSweepTask { endpoint, period_millis, remaining: Cell::new(None) })
    }
}

impl Task for PingSweepTask {
    fn period_millis(&self) -> u64 {
        self.period_millis
    }

    fn priority(&self) -> i32 {
        0
    }

    fn remaining(&self) -> Option<u32> {
        self.remaining.get()
    }

    fn set_remaining(&self, value: Option<u32>) {
        self.remaining.set(value);
    }

    fn run(self: Rc<Self>, _delta: u64) -> BoxFuture {
        Box::pin(async move {
            let sockets: Vec<Rc<DatagramSocket>> = self.endpoint.inner.borrow().sockets.values().cloned().collect();
            for socket in sockets {
                socket.on_ping_tick();
            }
            self.endpoint.collect_closed();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolLimits;
    use std::net::Ipv4Addr;

    fn logging() -> LoggerFactory {
        LoggerFactory::new(flux::logging::LogConfig::default())
    }

    struct NoTokens;
    impl SessionDirectory for NoTokens {
        fn resolve(&self, _token: SessionToken) -> Option<Session> {
            None
        }
        fn register(&self, _session: &Session) {}
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_address_gets_a_fresh_unauthenticated_socket() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let udp = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
                let endpoint = DatagramEndpoint::new(udp, Clock::new(), ProtocolLimits::default(), &logging(), Rc::new(NoTokens));
                let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();

                endpoint.handle_datagram(addr, &[0]);
                assert_eq!(endpoint.socket_count(), 1);
            })
            .await;
    }
}
