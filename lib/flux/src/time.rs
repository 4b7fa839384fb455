//! Monotonic clock helpers shared across the core.
use std::time::{Duration, Instant, SystemTime};

/// Returns the current unix timestamp (milliseconds elapsed since 1970-01-01). Only used
/// for values that cross process boundaries (tokens, logs); in-process timing always uses
/// `Instant`.
#[inline]
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}

/// A monotonic instant paired with the millisecond reading the rest of the core deals in.
/// Scheduler ticks, rate-limit windows and retransmit timers all work in milliseconds
/// relative to a single `Clock::now()` call per tick, never `SystemTime`, so they are immune
/// to wall-clock adjustments.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Clock {
        Clock { epoch: Instant::now() }
    }

    /// Milliseconds elapsed since this clock was created.
    #[inline]
    pub fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    #[inline]
    pub fn elapsed_since(&self, millis: u64) -> u64 {
        self.now_millis().saturating_sub(millis)
    }
}

impl Default for Clock {
    fn default() -> Clock {
        Clock::new()
    }
}

#[inline]
pub fn millis(n: u64) -> Duration {
    Duration::from_millis(n)
}
