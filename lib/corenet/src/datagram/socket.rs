//! Per-remote-address datagram reliability state (C5, spec §3 "DatagramSocket", §4.3).
use super::wire;
use crate::clock::Clock;
use crate::config::ProtocolLimits;
use crate::error::CoreResult;
use crate::session::{OutboundTransport, Session};
use flux::logging::{warn, Logger};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;

const DEDUPE_HISTORY_LIMIT: usize = 32;
const ACK_HISTORY_LIMIT: usize = 32;

/// *Unauthenticated* → *Bound* → *Closed* (spec §4.3 "State machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unauthenticated,
    Bound,
    Closed,
}

struct PartialMessage {
    part_count: Option<u8>,
    parts: HashMap<u8, Vec<u8>>,
}

struct Inner {
    state: State,
    session: Option<Session>,
    next_id: u8,
    send_times: HashMap<u8, u64>,
    dedupe_order: VecDeque<u8>,
    dedupe_set: std::collections::HashSet<u8>,
    ack_time_history: VecDeque<u64>,
    parts_in_progress: HashMap<u8, PartialMessage>,
    received_bytes_this_window: u32,
    received_window_started_at: u64,
    ordering_buffer: std::collections::BTreeMap<u8, Vec<u8>>,
    next_expected_id: u8,
    waiting_since: Option<u64>,
    last_received_millis: u64,
    last_sent_millis: u64,
}

/// One remote `address:port`. Held by the `DatagramEndpoint`'s address map; sending to the
/// wire goes back through the shared `UdpSocket` the endpoint owns.
pub struct DatagramSocket {
    addr: SocketAddr,
    clock: Clock,
    limits: ProtocolLimits,
    udp: Rc<UdpSocket>,
    logger: Logger,
    inner: RefCell<Inner>,
    /// Lets `send` (taking `&self`, per `OutboundTransport`) recover an `Rc<Self>` to hand
    /// to the retransmit tasks it spawns. Set once at construction via `Rc::new_cyclic`.
    self_ref: Weak<DatagramSocket>,
}

/// What a receive produced, for the endpoint to act on (session lookup, error replies are
/// sent directly by `DatagramSocket` itself since they don't need session state).
pub enum ReceiveOutcome {
    /// Nothing further to do (ping, duplicate, ack, or a dropped/invalid frame).
    Handled,
    /// A handshake naming a token the endpoint must resolve to a `Session`.
    HandshakeRequest([u8; flux::TOKEN_SIZE]),
}

impl DatagramSocket {
    pub fn new(addr: SocketAddr, clock: Clock, limits: ProtocolLimits, udp: Rc<UdpSocket>, logger: Logger) -> Rc<DatagramSocket> {
        let now = clock.now_millis();
        Rc::new_cyclic(|self_ref| DatagramSocket {
            addr,
            clock,
            limits,
            udp,
            logger,
            self_ref: self_ref.clone(),
            inner: RefCell::new(Inner {
                state: State::Unauthenticated,
                session: None,
                next_id: 1,
                send_times: HashMap::new(),
                dedupe_order: VecDeque::new(),
                dedupe_set: std::collections::HashSet::new(),
                ack_time_history: VecDeque::new(),
                parts_in_progress: HashMap::new(),
                received_bytes_this_window: 0,
                received_window_started_at: now,
                ordering_buffer: std::collections::BTreeMap::new(),
                next_expected_id: 1,
                waiting_since: None,
                last_received_millis: now,
                last_sent_millis: now,
            }),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().state == State::Closed
    }

    pub fn bind(self: &Rc<Self>, session: Session) {
        let mut inner = self.inner.borrow_mut();
        inner.state = State::Bound;
        inner.session = Some(session.clone());
        drop(inner);
        session.bind_datagram(self.clone() as Rc<dyn OutboundTransport>);
    }

    fn transmit(&self, bytes: Vec<u8>) {
        let udp = self.udp.clone();
        let addr = self.addr;
        self.inner.borrow_mut().last_sent_millis = self.clock.now_millis();
        tokio::task::spawn_local(async move {
            let _ = udp.send_to(&bytes, addr).await;
        });
    }

    fn average_ack_millis(&self) -> u64 {
        let history = &self.inner.borrow().ack_time_history;
        if history.is_empty() {
            0
        } else {
            history.iter().sum::<u64>() / history.len() as u64
        }
    }

    fn record_ack_sample(&self, sample_millis: u64) {
        let mut inner = self.inner.borrow_mut();
        if inner.ack_time_history.len() >= ACK_HISTORY_LIMIT {
            inner.ack_time_history.pop_front();
        }
        inner.ack_time_history.push_back(sample_millis);
    }

    fn remember_dedupe(&self, id: u8) {
        let mut inner = self.inner.borrow_mut();
        if inner.dedupe_order.len() >= DEDUPE_HISTORY_LIMIT {
            if let Some(oldest) = inner.dedupe_order.pop_front() {
                inner.dedupe_set.remove(&oldest);
            }
        }
        inner.dedupe_order.push_back(id);
        inner.dedupe_set.insert(id);
    }

    fn is_duplicate(&self, id: u8) -> bool {
        self.inner.borrow().dedupe_set.contains(&id)
    }

    /// Splits `buf` into parts, assigns consecutive ids, and kicks off a retransmit task per
    /// part (spec §4.3 "Sending").
    fn send_message(self: &Rc<Self>, buf: Vec<u8>) -> CoreResult<()> {
        let parts = wire::split_into_parts(&buf, &self.limits)?;
        let part_count = if parts.len() > 1 { Some(parts.len() as u8) } else { None };

        for (index, part) in parts.iter().enumerate() {
            let id = {
                let mut inner = self.inner.borrow_mut();
                let id = inner.next_id;
                inner.next_id = wire::next_id(id);
                id
            };
            let part_num = if parts.len() == 1 { 0 } else { (index + 1) as u8 };
            self.schedule_send(id, part_num, part_count, part.to_vec());
        }
        Ok(())
    }

    fn schedule_send(self: &Rc<Self>, id: u8, part_num: u8, part_count: Option<u8>, content: Vec<u8>) {
        let send_time = self.clock.now_millis();
        self.inner.borrow_mut().send_times.insert(id, send_time);
        self.transmit(wire::encode_outbound_data_part(id, part_num, part_count, &content));

        let socket = self.clone();
        tokio::task::spawn_local(async move {
            socket.retransmit_loop(id, part_num, part_count, content, send_time, 1).await;
        });
    }

    /// Each attempt checks whether the recorded send timestamp for `id` is still bit-for-bit
    /// the value captured when this retransmit was scheduled; a mismatch (ack arrived and
    /// removed it, or a later send of the same id overwrote it) is treated as implicit
    /// cancellation — no separate cancel flag exists (spec §9 Open Question).
    async fn retransmit_loop(
        self: Rc<Self>,
        id: u8,
        part_num: u8,
        part_count: Option<u8>,
        content: Vec<u8>,
        send_time: u64,
        mut attempt: u32,
    ) {
        loop {
            let avg_ack = self.average_ack_millis().max(20);
            let backoff = (2u64.saturating_pow(attempt)).saturating_mul(avg_ack).min(1000);
            tokio::time::sleep(Duration::from_millis(backoff)).await;

            if self.is_closed() {
                return;
            }

            let still_pending = self.inner.borrow().send_times.get(&id).copied() == Some(send_time);
            if !still_pending {
                return;
            }

            if attempt >= self.limits.attempt_count {
                self.inner.borrow_mut().send_times.remove(&id);
                let silent_for = self.clock.elapsed_since(self.inner.borrow().last_received_millis);
                if silent_for > self.limits.session_timeout_millis {
                    self.close();
                }
                return;
            }

            attempt += 1;
            self.transmit(wire::encode_outbound_data_part(id, part_num, part_count, &content));
        }
    }

    /// Closes the socket: spec's state machine moves straight to *Closed*; the endpoint is
    /// responsible for removing it from its address map on observing this.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == State::Closed {
            return;
        }
        inner.state = State::Closed;
        if let Some(session) = inner.session.take() {
            drop(inner);
            if !session.is_closed() {
                session.unbind_datagram();
            }
        }
    }

    /// Handles one inbound datagram. Returns `HandshakeRequest` when the endpoint needs to
    /// resolve a token to a `Session`; everything else (acks, pings, errors, delivery) is
    /// fully handled here.
    pub fn receive(self: &Rc<Self>, bytes: &[u8]) -> CoreResult<ReceiveOutcome> {
        // lastReceivedTime updates for every incoming datagram regardless of the budget
        // check below (spec §4.3 "Receiving") — a budget-throttled client is still alive.
        self.inner.borrow_mut().last_received_millis = self.clock.now_millis();
        self.update_receive_window(bytes.len());
        if self.over_receive_budget() {
            warn!(self.logger, "datagram dropped: receive budget exceeded"; "addr" => %self.addr);
            return Ok(ReceiveOutcome::Handled);
        }

        let frame = wire::parse_inbound(bytes)?;
        match frame {
            wire::InboundFrame::Ping => Ok(ReceiveOutcome::Handled),
            wire::InboundFrame::Handshake(token) => Ok(ReceiveOutcome::HandshakeRequest(token)),
            wire::InboundFrame::Data { id, part_num, part_count, token_prefix, content } => {
                self.handle_data_frame(id, part_num, part_count, token_prefix, content)
            }
        }
    }

    fn update_receive_window(&self, bytes_len: usize) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.borrow_mut();
        if now.saturating_sub(inner.received_window_started_at) >= 1000 {
            inner.received_window_started_at = now;
            inner.received_bytes_this_window = 0;
        }
        inner.received_bytes_this_window = inner.received_bytes_this_window.saturating_add(bytes_len as u32);
    }

    fn over_receive_budget(&self) -> bool {
        self.inner.borrow().received_bytes_this_window > self.limits.receive_max_bytes_per_second
    }

    fn handle_data_frame(
        self: &Rc<Self>,
        id: u8,
        part_num: u8,
        part_count: Option<u8>,
        token_prefix: [u8; 2],
        content: Option<Vec<u8>>,
    ) -> CoreResult<ReceiveOutcome> {
        let (state, session) = {
            let inner = self.inner.borrow();
            (inner.state, inner.session.clone())
        };

        if state != State::Bound {
            self.transmit(wire::encode_outbound_error());
            return Ok(ReceiveOutcome::Handled);
        }
        let session = session.expect("Bound state implies a session is attached");

        if token_prefix != session.token().prefix() {
            self.transmit(wire::encode_outbound_error());
            return Ok(ReceiveOutcome::Handled);
        }

        match content {
            None => {
                if let Some(send_time) = self.inner.borrow_mut().send_times.remove(&id) {
                    self.record_ack_sample(self.clock.elapsed_since(send_time));
                }
                Ok(ReceiveOutcome::Handled)
            }
            Some(content) => {
                self.transmit(wire::encode_outbound_ack(id));
                if self.is_duplicate(id) {
                    return Ok(ReceiveOutcome::Handled);
                }
                self.remember_dedupe(id);
                self.deliver(&session, id, part_num, part_count, content);
                self.release_in_order(&session);
                Ok(ReceiveOutcome::Handled)
            }
        }
    }

    /// Delivers a complete or single-part payload "out of order" immediately, and enqueues
    /// it (or, for a multi-part message, its placeholders) into the ordering buffer
    /// (spec §4.3 "Delivery and ordering").
    fn deliver(&self, session: &Session, id: u8, part_num: u8, part_count: Option<u8>, content: Vec<u8>) {
        if part_num == 0 {
            session.dispatch_inbound(content.clone(), Some(false));
            self.inner.borrow_mut().ordering_buffer.insert(id, content);
            return;
        }

        let first_id = shift_id(id, -((part_num - 1) as i32));
        let complete = {
            let mut inner = self.inner.borrow_mut();
            let entry = inner
                .parts_in_progress
                .entry(first_id)
                .or_insert_with(|| PartialMessage { part_count: None, parts: HashMap::new() });
            if part_num == 1 {
                entry.part_count = part_count.or(entry.part_count);
            }
            entry.parts.insert(part_num, content);
            match entry.part_count {
                Some(count) if entry.parts.len() == count as usize => Some(count),
                _ => None,
            }
        };

        if let Some(count) = complete {
            let mut inner = self.inner.borrow_mut();
            let message = inner.parts_in_progress.remove(&first_id).expect("just verified complete");
            drop(inner);

            let mut assembled = Vec::new();
            for part_num in 1..=count {
                if let Some(chunk) = message.parts.get(&part_num) {
                    assembled.extend_from_slice(chunk);
                }
            }
            session.dispatch_inbound(assembled.clone(), Some(false));

            let mut inner = self.inner.borrow_mut();
            let last_id = shift_id(first_id, (count - 1) as i32);
            for part_num in 1..count {
                let intervening_id = shift_id(first_id, (part_num - 1) as i32);
                inner.ordering_buffer.insert(intervening_id, Vec::new());
            }
            inner.ordering_buffer.insert(last_id, assembled);
        }
    }

    /// Releases entries from the ordering buffer in ascending id (with wrap) while it holds
    /// `nextExpectedId`. Empty placeholders advance the cursor without a second dispatch to
    /// the session — they exist only so a multi-part message's intervening ids don't stall
    /// the cursor, the payload itself was already delivered once at the last part's id.
    fn release_in_order(&self, session: &Session) {
        loop {
            let next = {
                let inner = self.inner.borrow();
                inner.next_expected_id
            };
            let content = self.inner.borrow_mut().ordering_buffer.remove(&next);
            match content {
                Some(content) => {
                    if !content.is_empty() {
                        session.dispatch_inbound(content, Some(true));
                    }
                    let mut inner = self.inner.borrow_mut();
                    inner.next_expected_id = wire::next_id(next);
                    inner.waiting_since = Some(self.clock.now_millis());
                }
                None => break,
            }
        }
    }

    /// Called from the endpoint's periodic sweep (spec §4.3 "Pinging"). Closes the socket
    /// on inactivity, emits a liveness ping if nothing has been sent recently, and applies
    /// the `shouldWaitForNext` head-of-line skip policy.
    pub fn on_ping_tick(self: &Rc<Self>) {
        if self.is_closed() {
            return;
        }
        let now = self.clock.now_millis();
        let (since_received, since_sent) = {
            let inner = self.inner.borrow();
            (now.saturating_sub(inner.last_received_millis), now.saturating_sub(inner.last_sent_millis))
        };

        if since_received > self.limits.session_timeout_millis {
            self.transmit(wire::encode_outbound_error());
            self.close();
            return;
        }

        let ping_interval = self.limits.session_timeout_millis / self.limits.attempt_count.max(1) as u64;
        if since_sent >= ping_interval {
            self.transmit(wire::encode_outbound_ping());
        }

        self.maybe_skip_forward(now);
    }

    fn maybe_skip_forward(&self, now: u64) {
        let mut inner = self.inner.borrow_mut();
        if inner.ordering_buffer.is_empty() {
            return;
        }
        let waiting_since = inner.waiting_since.unwrap_or(now);
        if now.saturating_sub(waiting_since) > self.limits.should_wait_for_next_millis {
            if let Some((&lowest, _)) = inner.ordering_buffer.iter().next() {
                inner.next_expected_id = lowest;
                inner.waiting_since = Some(now);
            }
        }
    }
}

impl OutboundTransport for DatagramSocket {
    fn send(&self, buf: Vec<u8>) -> CoreResult<()> {
        let socket = self.self_ref.upgrade().expect("DatagramSocket outlives its own Rc while send is reachable");
        socket.send_message(buf)
    }
}

/// Shifts `id` by `delta` steps (positive or negative) through the 1..=255 circular space
/// (spec §4.3 "Sequence arithmetic"); used to find a multi-part message's first/last id
/// from any one of its parts.
fn shift_id(id: u8, delta: i32) -> u8 {
    let zero_based = (id - 1) as i32;
    let shifted = (zero_based + delta).rem_euclid(255);
    (shifted as u8) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolLimits;
    use std::net::Ipv4Addr;

    #[test]
    fn shift_id_handles_wraparound() {
        assert_eq!(shift_id(3, -2), 1);
        assert_eq!(shift_id(1, -1), 255);
        assert_eq!(shift_id(255, 1), 1);
        assert_eq!(shift_id(1, 2), 3);
    }

    fn logger() -> Logger {
        flux::logging::LoggerFactory::new(flux::logging::LogConfig::default()).build("test", None)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn budget_throttled_datagrams_still_refresh_liveness() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let udp = Rc::new(tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
                let limits = ProtocolLimits { receive_max_bytes_per_second: 0, ..ProtocolLimits::default() };
                let addr: SocketAddr = "127.0.0.1:9002".parse().unwrap();
                let socket = DatagramSocket::new(addr, Clock::new(), limits, udp, logger());

                let before = socket.inner.borrow().last_received_millis;
                socket.receive(&[0]).unwrap();
                let after = socket.inner.borrow().last_received_millis;

                assert!(socket.over_receive_budget(), "budget should already be exceeded");
                assert!(after >= before);
            })
            .await;
    }
}
