//! Two clocks, exactly as §4.2 of the cache spec calls for: a monotonic
//! steady clock for LRU/TTL arithmetic, and a wall clock for mapping HTTP
//! `Expires`/`Date` onto it. Kept behind a trait so cache tests can advance
//! time deterministically instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// Supplies both clocks used by the cache substrate.
pub trait Clock: Send + Sync {
    fn steady_now(&self) -> Instant;
    fn wall_now(&self) -> SystemTime;

    /// Converts a wall-clock deadline (e.g. a parsed `Expires` header) into a
    /// steady-clock deadline suitable for the LRU/TTL machinery.
    ///
    /// If `wall_deadline` is already in the past, the result is "now minus a
    /// hair" so the item reads as immediately expired rather than panicking
    /// on a negative duration.
    fn wall_to_steady(&self, wall_deadline: SystemTime) -> Instant {
        let steady_now = self.steady_now();
        match wall_deadline.duration_since(self.wall_now()) {
            Ok(remaining) => steady_now + remaining,
            Err(_) => steady_now - Duration::from_nanos(1),
        }
    }
}

/// The real clock, backed by `Instant`/`SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn steady_now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock whose steady and wall time can be advanced by hand, so tests can
/// assert expiry/LRU behaviour without sleeping in wall-clock time.
pub struct FakeClock {
    base_steady: Instant,
    base_wall: SystemTime,
    offset_nanos: AtomicU64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            base_steady: Instant::now(),
            base_wall: SystemTime::now(),
            offset_nanos: AtomicU64::new(0),
        }
    }

    /// Moves both clocks forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.offset_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    fn offset(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn steady_now(&self) -> Instant {
        self.base_steady + self.offset()
    }

    fn wall_now(&self) -> SystemTime {
        self.base_wall + self.offset()
    }
}
