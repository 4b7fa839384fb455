//! Error taxonomy (spec §7). This is a classification, not a catch-all: most variants are
//! logged and swallowed at the boundary where they occur (datagram socket, stream
//! transport, dispatch) rather than propagated past the session. Only programmer errors
//! (double-close, send-on-closed-session, constructing a wire type outside its factory) are
//! `panic!`/`assert!`, per spec §7's "fail hard (assertion)" — they never appear here.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("duplicate frame id {0}")]
    DuplicateFrame(u8),

    #[error("rate limit exceeded, retry in {0}ms")]
    RateLimited(i64),

    #[error("validation failed")]
    ValidationFailed,

    #[error("task {0} failed: {1}")]
    TaskFailed(String, String),

    #[error("outbound buffer overflow: more than 255 unacknowledged ids")]
    BackPressure,

    #[error("session timed out after {0}ms of inactivity")]
    SessionTimeout(u64),

    #[error("no transport attached for {0}ms, closing session")]
    ReconnectTimeout(u64),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
