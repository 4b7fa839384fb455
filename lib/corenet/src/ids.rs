//! Small identifier types shared across sessions, rate limiting, and dispatch.
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a live `Session` for the lifetime of the process. Not the wire token — this
/// is an in-process handle, cheap to copy and use as a map key; the wire token (spec §3,
/// `flux::SessionToken`) is the value exchanged with clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    pub fn next() -> SessionId {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}
