//! Monotonic clock and cancellable sleeps (C1, spec §2 "Monotonic now, sleeps with
//! cancellation"). Everything that measures elapsed time in the core — the scheduler's tick
//! intervals, datagram retransmit/ping timers, rate-limit delays, the session's disconnect
//! timer — reads from one `Clock` and cancels sleeps through one `CancelToken`, rather than
//! each component rolling its own.
//!
//! Built on `flux::time::Clock` for "now" and on `tokio::time::sleep` raced against a
//! `tokio::sync::Notify` for cancellation, per SPEC_FULL §4.3/§4.6's cancellable-delay design.
use flux::time::Clock as MonotonicClock;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::Notify;

/// Shared monotonic time source. Cloning is cheap (an `Rc`), so every component that needs
/// "now" holds one of these rather than threading a reference through.
#[derive(Clone)]
pub struct Clock {
    inner: Rc<MonotonicClock>,
}

impl Clock {
    pub fn new() -> Clock {
        Clock { inner: Rc::new(MonotonicClock::new()) }
    }

    #[inline]
    pub fn now_millis(&self) -> u64 {
        self.inner.now_millis()
    }

    #[inline]
    pub fn elapsed_since(&self, millis: u64) -> u64 {
        self.inner.elapsed_since(millis)
    }
}

impl Default for Clock {
    fn default() -> Clock {
        Clock::new()
    }
}

/// One side of a cancellable sleep. Cloning shares the same underlying `Notify`; calling
/// `cancel()` on any clone wakes every outstanding `sleep_or_cancelled` call racing against
/// it immediately, returning `false` from that call (spec: "timer sleeps ... are cancelled by
/// explicit signal").
///
/// This is a best-effort wake, not a guarantee the awaited work never ran: per spec §9's
/// Open Question on retransmit cancellation, components that need exact-once semantics
/// additionally compare a captured timestamp after waking (see `datagram::wire`), because a
/// cancellation racing the sleep's natural expiry can land on either side.
#[derive(Clone)]
pub struct CancelToken {
    notify: Rc<Notify>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken { notify: Rc::new(Notify::new()) }
    }

    pub fn cancel(&self) {
        self.notify.notify_waiters();
    }

    /// Whether `self` and `other` share the same underlying notifier (i.e. are clones of
    /// the same token), for callers that need to check "is this still the current pending
    /// delay" without comparing by value.
    pub fn is_same_token(&self, other: &CancelToken) -> bool {
        Rc::ptr_eq(&self.notify, &other.notify)
    }

    /// Sleeps for `duration`, or returns `false` early if `cancel()` is called first.
    /// Returns `true` if the sleep ran to completion uninterrupted.
    pub async fn sleep_or_cancelled(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.notify.notified() => false,
        }
    }
}

impl Default for CancelToken {
    fn default() -> CancelToken {
        CancelToken::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn sleep_runs_to_completion_without_cancel() {
        let token = CancelToken::new();
        let completed = token.sleep_or_cancelled(Duration::from_millis(50)).await;
        assert!(completed);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn cancel_interrupts_pending_sleep() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let token = CancelToken::new();
                let waiter = token.clone();
                let handle = tokio::task::spawn_local(async move {
                    waiter.sleep_or_cancelled(Duration::from_secs(60)).await
                });
                // Let the spawned task reach its await point before cancelling.
                tokio::task::yield_now().await;
                token.cancel();
                let completed = handle.await.unwrap();
                assert!(!completed);
            })
            .await;
    }
}
