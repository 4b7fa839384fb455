//! Transport multiplexer: binds zero, one, or two transports to one logical session, queues
//! outbound messages while disconnected, and survives short disconnects (C7, spec §3, §4.5).
use crate::clock::{CancelToken, Clock};
use crate::config::ProtocolLimits;
use crate::error::{CoreError, CoreResult};
use crate::ids::SessionId;
use flux::logging::{info, warn, Logger, LoggerFactory};
use flux::{SessionToken, TOKEN_SIZE};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

/// A transport's outbound half, as seen by `Session`. Both the datagram socket and the
/// stream transport implement this; `send` is fire-and-forget from the session's point of
/// view — fragmentation/retransmission (datagram) or frame writing (stream) happens behind
/// it, driven by its own scheduled tasks or writer loop.
pub trait OutboundTransport {
    fn send(&self, buf: Vec<u8>) -> CoreResult<()>;
}

/// Where `Session::dispatch_inbound` forwards decoded frame bodies. The actual decode
/// (Codec) and dispatch pipeline (rate limiting, locking, `prepare`/`validate`/`run`) lives
/// in `dispatch`, kept separate so `Session` itself doesn't need to know about the opcode
/// table or rate limiter — it just knows a body arrived, tagged with its ordering context.
pub trait InboundSink {
    /// `correct_order`: `None` matches a Service regardless of its ordering option
    /// (spec §4.4, the stream path); `Some(false)`/`Some(true)` are the two datagram-path
    /// deliveries (spec §4.3).
    fn receive(&self, session: &Session, body: Vec<u8>, correct_order: Option<bool>);
}

struct Inner {
    token: SessionToken,
    outbound_queue: Vec<Vec<u8>>,
    stream: Option<Rc<dyn OutboundTransport>>,
    datagram: Option<Rc<dyn OutboundTransport>>,
    inbound_sink: Option<Rc<dyn InboundSink>>,
    principal_session_slot: Option<Rc<Cell<Option<SessionId>>>>,
    last_run_millis: HashMap<&'static str, u64>,
    pending_soft_delays: HashMap<&'static str, CancelToken>,
    running_services: std::collections::HashSet<&'static str>,
    disconnect_timer: Option<CancelToken>,
    closed: bool,
}

/// A live client session. Cheap to clone (an `Rc`); all mutation goes through `RefCell`, in
/// keeping with the single-threaded cooperative model (spec §5, SPEC_FULL §5).
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    clock: Clock,
    limits: ProtocolLimits,
    logger: Logger,
    inner: Rc<RefCell<Inner>>,
}

impl Session {
    pub fn create(clock: Clock, limits: ProtocolLimits, logging: &LoggerFactory) -> Session {
        let id = SessionId::next();
        Session {
            id,
            clock,
            limits,
            logger: logging.build("session", None),
            inner: Rc::new(RefCell::new(Inner {
                token: SessionToken::generate(),
                outbound_queue: Vec::new(),
                stream: None,
                datagram: None,
                inbound_sink: None,
                principal_session_slot: None,
                last_run_millis: HashMap::new(),
                pending_soft_delays: HashMap::new(),
                running_services: std::collections::HashSet::new(),
                disconnect_timer: None,
                closed: false,
            })),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn token(&self) -> SessionToken {
        self.inner.borrow().token
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    fn assert_open(&self) {
        assert!(!self.is_closed(), "mutating a closed session is a programming error");
    }

    pub fn bind_stream(&self, transport: Rc<dyn OutboundTransport>) {
        self.assert_open();
        {
            let mut inner = self.inner.borrow_mut();
            inner.stream = Some(transport);
            inner.disconnect_timer.take().map(|t| t.cancel());
        }
        self.flush();
    }

    pub fn bind_datagram(&self, transport: Rc<dyn OutboundTransport>) {
        self.assert_open();
        {
            let mut inner = self.inner.borrow_mut();
            inner.datagram = Some(transport);
            inner.disconnect_timer.take().map(|t| t.cancel());
        }
        self.flush();
    }

    pub fn unbind_stream(&self) {
        self.assert_open();
        self.inner.borrow_mut().stream = None;
        self.arm_disconnect_timer_if_fully_detached();
    }

    pub fn unbind_datagram(&self) {
        self.assert_open();
        self.inner.borrow_mut().datagram = None;
        self.arm_disconnect_timer_if_fully_detached();
    }

    fn arm_disconnect_timer_if_fully_detached(&self) {
        let fully_detached = {
            let inner = self.inner.borrow();
            inner.stream.is_none() && inner.datagram.is_none()
        };
        if !fully_detached {
            return;
        }

        let token = CancelToken::new();
        self.inner.borrow_mut().disconnect_timer = Some(token.clone());

        let session = self.clone();
        let wait = Duration::from_millis(self.limits.wait_for_reconnection_millis);
        tokio::task::spawn_local(async move {
            if token.sleep_or_cancelled(wait).await {
                session.close();
            }
        });
    }

    /// `len ≤ maxOptimalPacketCount × (MAX_SAFE_PACKET_SIZE − 2) − 1` routes via datagram;
    /// otherwise stream if bound; otherwise the message stays queued (spec §4.5).
    pub fn send_encoded(&self, encoded: Vec<u8>) {
        self.assert_open();
        self.inner.borrow_mut().outbound_queue.push(encoded);
        self.flush();
    }

    /// Drains the outbound queue if at least one transport is attached; in FIFO order
    /// (spec §3 invariant (d)).
    pub fn flush(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return;
        }
        if inner.stream.is_none() && inner.datagram.is_none() {
            return;
        }

        let pending = std::mem::take(&mut inner.outbound_queue);
        for encoded in pending {
            let route_via_datagram = inner.datagram.is_some() && self.limits.fits_optimal_datagram_path(encoded.len());
            let sent = if route_via_datagram {
                inner.datagram.as_ref().unwrap().send(encoded.clone())
            } else if let Some(stream) = inner.stream.as_ref() {
                stream.send(encoded.clone())
            } else {
                inner.outbound_queue.push(encoded);
                continue;
            };
            if let Err(err) = sent {
                warn!(self.logger, "flush: send failed"; "error" => %err);
            }
        }
    }

    /// Binds a principal's session slot; the entity must not already carry a session
    /// (spec §4.5 "authorize").
    pub fn authorize(&self, slot: Rc<Cell<Option<SessionId>>>) {
        self.assert_open();
        assert!(slot.get().is_none(), "authorize: entity already carries a session");
        slot.set(Some(self.id));
        self.inner.borrow_mut().principal_session_slot = Some(slot);
    }

    /// Closes `previous`'s session, carries forward per-service last-run timestamps (max of
    /// the two), and authorizes this session (spec §4.5 "reauthorize").
    pub fn reauthorize(&self, previous: &Session, slot: Rc<Cell<Option<SessionId>>>) {
        previous.close();
        {
            let previous_times = previous.inner.borrow().last_run_millis.clone();
            let mut inner = self.inner.borrow_mut();
            for (service, time) in previous_times {
                let entry = inner.last_run_millis.entry(service).or_insert(0);
                *entry = (*entry).max(time);
            }
        }
        slot.set(None);
        self.authorize(slot);
    }

    /// Unbinds the principal without closing the session (spec §4.5 "logOut").
    pub fn log_out(&self) {
        self.assert_open();
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.principal_session_slot.take() {
            slot.set(None);
        }
    }

    /// Idempotent in effect (spec §3): unbinds the principal, closes both transports,
    /// cancels all rate-limit delays, clears the queue, deregisters from the token index.
    /// Callers are expected to have already asserted the session isn't closed — a second
    /// `close()` is a programming error, not swallowed here.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        assert!(!inner.closed, "double-close is a programming error");
        inner.closed = true;
        if let Some(slot) = inner.principal_session_slot.take() {
            slot.set(None);
        }
        inner.stream = None;
        inner.datagram = None;
        for (_, token) in inner.pending_soft_delays.drain() {
            token.cancel();
        }
        if let Some(timer) = inner.disconnect_timer.take() {
            timer.cancel();
        }
        inner.outbound_queue.clear();
        info!(self.logger, "session closed"; "session_id" => format!("{:?}", self.id));
    }

    /// Set once at bootstrap (the server owns the one dispatcher instance); later calls
    /// replace it, which is only ever exercised by tests.
    pub fn set_inbound_sink(&self, sink: Rc<dyn InboundSink>) {
        self.inner.borrow_mut().inbound_sink = Some(sink);
    }

    /// Entry point used by the stream transport and datagram socket once they've produced a
    /// full message body (spec §4.5 "receive"). Decoding and dispatch (C4, C9) happen inside
    /// the registered `InboundSink`.
    pub fn dispatch_inbound(&self, body: Vec<u8>, correct_order: Option<bool>) {
        let sink = self.inner.borrow().inbound_sink.clone();
        match sink {
            Some(sink) => sink.receive(self, body, correct_order),
            None => warn!(self.logger, "dispatch_inbound: no sink registered, dropping frame"),
        }
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn elapsed_since(&self, millis: u64) -> u64 {
        self.clock.elapsed_since(millis)
    }

    /// Used by the rate limiter to read/update the per-service last-run map this session
    /// owns (spec §3's "per-service map of last run time" lives on the Session).
    pub fn last_run_millis(&self, service: &'static str) -> Option<u64> {
        self.inner.borrow().last_run_millis.get(service).copied()
    }

    pub fn set_last_run_millis(&self, service: &'static str, now: u64) {
        self.inner.borrow_mut().last_run_millis.insert(service, now);
    }

    /// Non-reentrancy lock acquisition for (session, serviceClass) (spec §4.7 step 6).
    /// Returns `false` (and does not acquire) if the service is already running on this
    /// session.
    pub fn try_enter_service(&self, service: &'static str) -> bool {
        self.inner.borrow_mut().running_services.insert(service)
    }

    pub fn exit_service(&self, service: &'static str) {
        self.inner.borrow_mut().running_services.remove(service);
    }

    /// The rate limiter's per-(session, service) pending-delay slot lives here rather than
    /// in a second map keyed by `SessionId`, so `close()` and `reauthorize` (which already
    /// touch this session's own state) cancel/carry it without needing to know the rate
    /// limiter exists.
    pub fn take_pending_delay(&self, service: &'static str) -> Option<CancelToken> {
        self.inner.borrow_mut().pending_soft_delays.remove(service)
    }

    pub fn set_pending_delay(&self, service: &'static str, token: CancelToken) {
        self.inner.borrow_mut().pending_soft_delays.insert(service, token);
    }

    pub fn clear_pending_delay_if_current(&self, service: &'static str, token: &CancelToken) {
        let mut inner = self.inner.borrow_mut();
        let is_current = inner
            .pending_soft_delays
            .get(service)
            .map(|current| current.is_same_token(token))
            .unwrap_or(false);
        if is_current {
            inner.pending_soft_delays.remove(service);
        }
    }
}

/// The token→Session index every transport's handshake consults, owned by the server
/// bootstrap (spec §4.3, §4.4 "Handshake"). Both `DatagramEndpoint` and the stream listener
/// share this one directory, so a token registered by one transport's handshake is visible
/// to the other's.
pub trait SessionDirectory {
    fn resolve(&self, token: SessionToken) -> Option<Session>;
    /// Registers a freshly created session so a later handshake (either transport) can find
    /// it by token.
    fn register(&self, session: &Session);
}

/// Looks up a 48-byte handshake payload against unknown sessions cheaply — callers own the
/// actual token→Session index (a `HashMap<SessionToken, Session>` held by the server), this
/// just validates shape.
pub fn token_from_handshake(bytes: &[u8]) -> CoreResult<SessionToken> {
    if bytes.len() != TOKEN_SIZE {
        return Err(CoreError::MalformedFrame("handshake payload is not a 48-byte token"));
    }
    let mut buf = [0u8; TOKEN_SIZE];
    buf.copy_from_slice(bytes);
    Ok(SessionToken::from_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    struct RecordingTransport {
        sent: Rc<StdRefCell<Vec<Vec<u8>>>>,
    }

    impl OutboundTransport for RecordingTransport {
        fn send(&self, buf: Vec<u8>) -> CoreResult<()> {
            self.sent.borrow_mut().push(buf);
            Ok(())
        }
    }

    fn logging() -> LoggerFactory {
        LoggerFactory::new(flux::logging::LogConfig::default())
    }

    #[test]
    fn send_before_bind_queues_and_flushes_on_bind() {
        let session = Session::create(Clock::new(), ProtocolLimits::default(), &logging());
        session.send_encoded(vec![1, 2, 3]);
        assert_eq!(session.inner.borrow().outbound_queue.len(), 1);

        let sent = Rc::new(StdRefCell::new(Vec::new()));
        session.bind_stream(Rc::new(RecordingTransport { sent: sent.clone() }));

        assert!(session.inner.borrow().outbound_queue.is_empty());
        assert_eq!(sent.borrow().len(), 1);
    }

    #[test]
    fn small_message_prefers_datagram_when_both_bound() {
        let session = Session::create(Clock::new(), ProtocolLimits::default(), &logging());
        let stream_sent = Rc::new(StdRefCell::new(Vec::new()));
        let datagram_sent = Rc::new(StdRefCell::new(Vec::new()));
        session.bind_stream(Rc::new(RecordingTransport { sent: stream_sent.clone() }));
        session.bind_datagram(Rc::new(RecordingTransport { sent: datagram_sent.clone() }));

        session.send_encoded(vec![0u8; 10]);

        assert_eq!(datagram_sent.borrow().len(), 1);
        assert!(stream_sent.borrow().is_empty());
    }

    #[test]
    #[should_panic(expected = "double-close")]
    fn double_close_panics() {
        let session = Session::create(Clock::new(), ProtocolLimits::default(), &logging());
        session.close();
        session.close();
    }
}
