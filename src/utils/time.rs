//! Monotonic microsecond clocks.
//!
//! All internal timestamps are microseconds on a monotonic counter, never
//! wall-clock time. The clock is injected so that trackers and the mitigator
//! can be driven deterministically in tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Microseconds per second, used when converting on-wire `f32` seconds.
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Source of monotonic microsecond timestamps.
pub trait Clock: Send + Sync {
    /// Current time in microseconds since an arbitrary fixed origin.
    fn now_us(&self) -> i64;
}

/// Clock backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_micros()).unwrap_or(i64::MAX)
    }
}

/// Manually advanced clock shared between clones.
///
/// ```rust
/// use latency_mitigator::utils::time::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1_000);
/// let shared = clock.clone();
/// clock.advance_ms(5);
/// assert_eq!(shared.now_us(), 6_000);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_us: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_us)),
        }
    }

    pub fn set_us(&self, now_us: i64) {
        self.now.store(now_us, Ordering::SeqCst);
    }

    pub fn advance_us(&self, delta_us: i64) {
        self.now.fetch_add(delta_us, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.advance_us(delta_ms * 1_000);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Convert on-wire seconds to microseconds.
#[inline]
pub fn seconds_to_us(seconds: f32) -> i64 {
    (f64::from(seconds) * MICROS_PER_SECOND as f64) as i64
}

/// Convert microseconds to on-wire seconds.
#[inline]
pub fn us_to_seconds(us: i64) -> f32 {
    (us as f64 / MICROS_PER_SECOND as f64) as f32
}
