//! Soft/strict per-(session, service) rate limiting with delay coalescing (C8, spec §4.6).
//!
//! Spec §4.6 describes the state — "last successful-run time and an optional cancellable
//! delay" — as living per (Session, ServiceClass). Rather than a second map keyed by
//! `SessionId` that would need to be kept in sync with `reauthorize`'s last-run carry-forward
//! and `close()`'s delay cancellation, both pieces of state live directly on `Session`
//! (`last_run_millis`/`set_last_run_millis`, `take_pending_delay`/`set_pending_delay`); this
//! module is the pure logic that reads and writes them in the right order. The coalescing
//! invariant — "at most one delayed invocation pending per key; a new arrival cancels it and
//! wins" — falls out of always cancelling and replacing the session's stored token before
//! sleeping on the new one.
use crate::clock::CancelToken;
use crate::session::Session;
use std::time::Duration;

/// Outcome of a strict rate-limit check (spec §4.6 "Strict variant").
pub enum StrictOutcome {
    Proceed,
    /// The call should be abandoned and the service's `errorOnLimit` handler invoked, with
    /// the remaining wait in milliseconds.
    ErrorOnLimit(i64),
}

/// `getShouldWait`: remaining milliseconds before `period_millis` has elapsed since the last
/// run (may be ≤ 0, meaning "not limited").
pub fn should_wait(session: &Session, service: &'static str, period_millis: i64) -> i64 {
    match session.last_run_millis(service) {
        Some(last) => period_millis - session.elapsed_since(last) as i64,
        None => i64::MIN,
    }
}

/// `softLimit`: cancels any prior pending delay for this key, then either returns
/// immediately (not limited) or sleeps out the remaining period. A later call for the same
/// key cancels this sleep (spec's "last arrival wins" coalescing invariant) — this function
/// returning `false` in that case means the caller's invocation was superseded and should
/// not proceed.
pub async fn soft_limit(session: &Session, service: &'static str, period_millis: i64) -> bool {
    let wait = should_wait(session, service, period_millis);
    if wait <= 0 {
        return true;
    }

    let token = CancelToken::new();
    if let Some(previous) = session.take_pending_delay(service) {
        previous.cancel();
    }
    session.set_pending_delay(service, token.clone());

    let completed = token.sleep_or_cancelled(Duration::from_millis(wait as u64)).await;
    session.clear_pending_delay_if_current(service, &token);
    completed
}

/// Strict variant (spec §4.6): used when the service declares `errorOnLimit`. Never sleeps —
/// it's the caller's job to invoke the error handler.
pub fn strict_limit(session: &Session, service: &'static str, period_millis: i64) -> StrictOutcome {
    let wait = should_wait(session, service, period_millis);
    if wait > 0 {
        StrictOutcome::ErrorOnLimit(wait)
    } else {
        StrictOutcome::Proceed
    }
}

/// `tilesPerSecond -> periodMs` conversion for speed-based services (spec §4.6).
pub fn period_from_speed(tiles_per_second: f64) -> i64 {
    (1000.0 / tiles_per_second) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::ProtocolLimits;
    use flux::logging::{LogConfig, LoggerFactory};

    fn logging() -> LoggerFactory {
        LoggerFactory::new(LogConfig::default())
    }

    fn session() -> Session {
        Session::create(Clock::new(), ProtocolLimits::default(), &logging())
    }

    #[test]
    fn not_limited_before_any_run() {
        let session = session();
        assert!(should_wait(&session, "move", 100) < 0);
    }

    #[test]
    fn update_last_time_starts_the_window() {
        let session = session();
        session.set_last_run_millis("move", session.now_millis());
        let wait = should_wait(&session, "move", 1_000);
        assert!(wait > 0 && wait <= 1_000);
    }

    #[test]
    fn strict_limit_reports_error_while_window_open() {
        let session = session();
        session.set_last_run_millis("move", session.now_millis());
        match strict_limit(&session, "move", 10_000) {
            StrictOutcome::ErrorOnLimit(wait) => assert!(wait > 0),
            StrictOutcome::Proceed => panic!("expected rate limit to trigger"),
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn coalesces_to_the_last_arrival() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let session = session();
                session.set_last_run_millis("move", session.now_millis());

                let first = {
                    let session = session.clone();
                    tokio::task::spawn_local(async move { soft_limit(&session, "move", 1_000).await })
                };
                tokio::task::yield_now().await;

                // Second arrival supersedes the first; the first should observe cancellation.
                let second = soft_limit(&session, "move", 1_000).await;

                let first_result = first.await.unwrap();
                assert!(!first_result);
                assert!(second);
            })
            .await;
    }
}
