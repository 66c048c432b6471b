//! Sources of monotonic time.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A clock producing the number of milliseconds since an arbitrary epoch.
///
/// The values produced must never go backwards, meaning changes to the system
/// time mustn't affect them.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// A clock backed by the operating system's monotonic clock, using the moment
/// the clock is created as its epoch.
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// A clock that only moves when told to.
///
/// This is useful when the passing of time must be deterministic, such as when
/// writing tests.
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock { millis: AtomicU64::new(0) }
    }

    pub fn advance(&self, duration: Duration) {
        self.millis.fetch_add(duration.as_millis() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, millis: u64) {
        self.millis.fetch_max(millis, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.millis.load(Ordering::Acquire)
    }
}
