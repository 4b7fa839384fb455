//! WebSocket stream transport (C6, spec §4.4).
//!
//! One accept loop per listener, one task per connection. Grounded in the pack's own
//! WebSocket server/session pair (`iwismer-rusty-timer`'s `mock_ws_server`/`receiver::session`):
//! split the socket into its sink and stream halves with `futures_util`, drive the sink from
//! a dedicated writer task, and `select!`/loop over the stream half for reads. Unlike that
//! pack's multi-threaded `Arc<Mutex<_>>` session state, everything here stays on the
//! single-threaded `Rc<RefCell<_>>` side of the fence, consistent with the rest of `corenet`.
//!
//! `WS_PATH` enforcement (spec §6) rejects the upgrade before the handshake completes, the
//! same shape as that pack's axum-based `services/server::ws_common` checking the
//! `Authorization` header pre-upgrade; here it's `tokio_tungstenite::accept_hdr_async`'s
//! request callback instead of an axum extractor, since this transport isn't framework-routed.
use crate::clock::Clock;
use crate::config::ProtocolLimits;
use crate::error::{CoreError, CoreResult};
use crate::schema::OpcodeTable;
use crate::session::{InboundSink, OutboundTransport, Session, SessionDirectory};
use flux::logging::{debug, warn, Logger, LoggerFactory};
use flux::{SessionToken, TOKEN_SIZE};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsFrame>;

/// Accepts TCP connections and upgrades each to a WebSocket, per `game/server`'s bootstrap
/// (spec §6 `WS_PORT`/`WS_PATH`). One instance per process, sharing the same `OpcodeTable`
/// and `SessionDirectory` the datagram transport uses.
pub struct StreamListener {
    opcodes: Rc<OpcodeTable>,
    clock: Clock,
    limits: ProtocolLimits,
    directory: Rc<dyn SessionDirectory>,
    dispatcher: Rc<dyn InboundSink>,
    ws_path: String,
    logging: Rc<LoggerFactory>,
    logger: Logger,
}

impl StreamListener {
    pub fn new(
        opcodes: Rc<OpcodeTable>,
        clock: Clock,
        limits: ProtocolLimits,
        directory: Rc<dyn SessionDirectory>,
        dispatcher: Rc<dyn InboundSink>,
        ws_path: String,
        logging: Rc<LoggerFactory>,
    ) -> Rc<StreamListener> {
        let logger = logging.build("stream_listener", None);
        Rc::new(StreamListener { opcodes, clock, limits, directory, dispatcher, ws_path, logging, logger })
    }

    /// Runs forever, accepting connections and handing each to its own `spawn_local`'d
    /// handler so one slow or hung peer never blocks another's accept.
    pub async fn run_accept_loop(self: Rc<Self>, listener: TcpListener) {
        loop {
            let (tcp, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(self.logger, "stream accept failed"; "error" => %err);
                    continue;
                }
            };
            let this = self.clone();
            tokio::task::spawn_local(async move {
                if let Err(err) = this.handle_connection(tcp, addr).await {
                    debug!(this.logger, "stream connection ended"; "addr" => %addr, "error" => %err);
                }
            });
        }
    }

    async fn handle_connection(self: &Rc<Self>, tcp: TcpStream, addr: SocketAddr) -> CoreResult<()> {
        let ws_path = self.ws_path.clone();
        let check_path = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if request.uri().path() == ws_path {
                Ok(response)
            } else {
                let mut rejection = ErrorResponse::new(Some("unknown path".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        };
        let ws = tokio_tungstenite::accept_hdr_async(tcp, check_path).await?;
        let (mut sink, mut stream) = ws.split();

        let describe = serde_json::to_vec(&self.opcodes.describe()).expect("opcode table description is always serializable");
        sink.send(WsFrame::Binary(describe.into())).await?;

        let first = match stream.next().await {
            Some(Ok(WsFrame::Binary(bytes))) => bytes,
            Some(Ok(WsFrame::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => return Err(CoreError::MalformedFrame("stream handshake: expected a binary frame")),
            Some(Err(err)) => return Err(err.into()),
        };

        let session = self.resolve_or_create(&first);
        debug!(self.logger, "stream handshake bound"; "addr" => %addr, "session_id" => format!("{:?}", session.id()));

        sink.send(WsFrame::Binary(session.token().as_bytes().to_vec().into())).await?;

        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let socket = StreamSocket::new(tx);
        session.bind_stream(socket.clone() as Rc<dyn OutboundTransport>);
        tokio::task::spawn_local(run_writer(sink, rx));

        self.run_reader(&mut stream, &session, addr).await;

        socket.mark_closed();
        if !session.is_closed() {
            session.unbind_stream();
        }
        Ok(())
    }

    /// Spec §4.4 handshake: a 48-byte token rebinds to an existing session or, if no match,
    /// creates one; a bare `[0]` always requests a new session.
    fn resolve_or_create(&self, first: &[u8]) -> Session {
        if first.len() == TOKEN_SIZE {
            let mut buf = [0u8; TOKEN_SIZE];
            buf.copy_from_slice(first);
            if let Some(session) = self.directory.resolve(SessionToken::from_bytes(buf)) {
                return session;
            }
        }
        let session = Session::create(self.clock.clone(), self.limits, &self.logging);
        session.set_inbound_sink(self.dispatcher.clone());
        self.directory.register(&session);
        session
    }

    async fn run_reader(
        &self,
        stream: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
        session: &Session,
        addr: SocketAddr,
    ) {
        loop {
            match stream.next().await {
                Some(Ok(WsFrame::Binary(bytes))) => {
                    // Ordering is undefined on the stream path: it matches a Service
                    // regardless of its `correctOrder` option (spec §4.4).
                    session.dispatch_inbound(bytes.to_vec(), None);
                }
                Some(Ok(WsFrame::Close(_))) | None => return,
                Some(Ok(WsFrame::Ping(_))) | Some(Ok(WsFrame::Pong(_))) => {}
                Some(Ok(_)) => {
                    warn!(self.logger, "stream: text frame is a protocol error"; "addr" => %addr);
                    return;
                }
                Some(Err(err)) => {
                    debug!(self.logger, "stream read failed"; "addr" => %addr, "error" => %err);
                    return;
                }
            }
        }
    }
}

/// Drains `rx` into the WebSocket sink until the channel closes (the `StreamSocket` was
/// dropped) or a write fails (the peer is gone; the reader loop will notice independently).
async fn run_writer(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if sink.send(WsFrame::Binary(bytes.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// The stream side's `OutboundTransport`: fire-and-forget into an unbounded channel drained
/// by `run_writer`, mirroring `DatagramSocket::transmit`'s "hand off and move on" shape.
struct StreamSocket {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: Cell<bool>,
}

impl StreamSocket {
    fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Rc<StreamSocket> {
        Rc::new(StreamSocket { tx, closed: Cell::new(false) })
    }

    fn mark_closed(&self) {
        self.closed.set(true);
    }
}

impl OutboundTransport for StreamSocket {
    fn send(&self, buf: Vec<u8>) -> CoreResult<()> {
        if self.closed.get() {
            return Ok(());
        }
        // The receiver only disappears once the writer task has exited, which only happens
        // after the connection is already gone; dropping the frame here is correct, not an
        // error to surface.
        let _ = self.tx.send(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolLimits;

    fn logging() -> Rc<LoggerFactory> {
        Rc::new(LoggerFactory::new(flux::logging::LogConfig::default()))
    }

    struct NoSessions;
    impl SessionDirectory for NoSessions {
        fn resolve(&self, _token: SessionToken) -> Option<Session> {
            None
        }
        fn register(&self, _session: &Session) {}
    }

    struct NoopSink;
    impl InboundSink for NoopSink {
        fn receive(&self, _session: &Session, _body: Vec<u8>, _correct_order: Option<bool>) {}
    }

    fn listener() -> Rc<StreamListener> {
        StreamListener::new(
            Rc::new(crate::schema::OpcodeTableBuilder::new().build()),
            Clock::new(),
            ProtocolLimits::default(),
            Rc::new(NoSessions),
            Rc::new(NoopSink),
            "/ws".to_string(),
            logging(),
        )
    }

    #[test]
    fn unrecognized_token_creates_a_fresh_session() {
        let listener = listener();
        let session = listener.resolve_or_create(&[0u8]);
        assert!(!session.is_closed());
    }

    #[test]
    fn bare_zero_byte_always_creates_a_new_session() {
        let listener = listener();
        let a = listener.resolve_or_create(&[0u8]);
        let b = listener.resolve_or_create(&[0u8]);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn send_after_mark_closed_is_dropped_silently() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let socket = StreamSocket::new(tx);
        socket.mark_closed();
        socket.send(vec![1, 2, 3]).unwrap();
        drop(socket);
        assert!(rx.recv().await.is_none());
    }
}
