//! Monotonic millisecond clock with defined wraparound semantics.
//!
//! `Tick` models the 32-bit wrapping millisecond counter the rest of the
//! crate measures deadlines against. Deadline comparisons use signed
//! wraparound arithmetic so they stay correct across the u32 rollover.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// A point in time, expressed as a wrapping 32-bit millisecond counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(pub u32);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    /// Milliseconds elapsed from `self` to `other`, using signed wraparound
    /// arithmetic. Negative if `other` is logically before `self`.
    pub fn delta_ms(self, other: Tick) -> i32 {
        other.0.wrapping_sub(self.0) as i32
    }

    pub fn add_ms(self, ms: u32) -> Tick {
        Tick(self.0.wrapping_add(ms))
    }
}

/// Returns true iff at least `timeout_ms` have elapsed since `since`,
/// as measured at `now`, correctly handling u32 wraparound.
pub fn expired(since: Tick, timeout_ms: u32, now: Tick) -> bool {
    since.add_ms(timeout_ms).delta_ms(now) >= 0
}

/// Host-backed monotonic clock. Each `Clock` shares one process-start
/// epoch so independently constructed clocks still agree on `now_ms()`.
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock { epoch: process_epoch() }
    }

    pub fn now(&self) -> Tick {
        Tick(self.epoch.elapsed().as_millis() as u32)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

fn process_epoch() -> Instant {
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// A free-running counter usable in place of `Clock` where tests want to
/// drive the tick deterministically rather than from wall-clock time.
pub struct ManualClock {
    ticks: AtomicU32,
}

impl ManualClock {
    pub fn new(start: Tick) -> Self {
        ManualClock { ticks: AtomicU32::new(start.0) }
    }

    pub fn now(&self) -> Tick {
        Tick(self.ticks.load(Ordering::Relaxed))
    }

    pub fn advance(&self, ms: u32) -> Tick {
        Tick(self.ticks.fetch_add(ms, Ordering::Relaxed).wrapping_add(ms))
    }

    pub fn set(&self, tick: Tick) {
        self.ticks.store(tick.0, Ordering::Relaxed);
    }
}
