//! Hybrid clock
//!
//! The server's single source of ordering. [`HybridClock::now`] combines wall
//! time with a strictly monotonic tie-break so that authoritative timestamps
//! never repeat and never go backwards, even when the system clock is
//! adjusted. An independent logical counter ([`HybridClock::tick`] /
//! [`HybridClock::update`]) provides cross-device ordering hints.
//!
//! Every method takes one short critical section and never touches I/O.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::domain::Timestamp;

/// Source of wall-clock time in microseconds since the Unix epoch
pub trait WallClock: Send + Sync {
    fn now_micros(&self) -> i64;
}

/// Wall clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_micros(&self) -> i64 {
        Utc::now().timestamp_micros()
    }
}

/// A timestamp and logical counter taken in the same critical section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockStamp {
    pub timestamp: Timestamp,
    pub logical: u64,
}

#[derive(Debug, Default)]
struct ClockState {
    last: i64,
    counter: u64,
}

impl ClockState {
    fn advance(&mut self, wall: i64) -> Timestamp {
        self.last = wall.max(self.last.saturating_add(1));
        Timestamp::from_micros(self.last)
    }

    fn tick(&mut self) -> u64 {
        self.counter = self.counter.saturating_add(1);
        self.counter
    }
}

/// Strictly monotonic timestamp authority
pub struct HybridClock {
    wall: Box<dyn WallClock>,
    state: Mutex<ClockState>,
}

impl HybridClock {
    /// Creates a clock driven by the system time
    pub fn new() -> Self {
        Self::with_wall_clock(SystemWallClock)
    }

    /// Creates a clock driven by a custom wall-clock source
    pub fn with_wall_clock(wall: impl WallClock + 'static) -> Self {
        Self {
            wall: Box::new(wall),
            state: Mutex::new(ClockState::default()),
        }
    }

    /// Returns `max(wall, last + 1)` and remembers it
    pub fn now(&self) -> Timestamp {
        let wall = self.wall.now_micros();
        self.lock().advance(wall)
    }

    /// Advances the logical counter
    pub fn tick(&self) -> u64 {
        self.lock().tick()
    }

    /// Merges a counter observed elsewhere: `local = max(local, received) + 1`
    pub fn update(&self, received: u64) -> u64 {
        let mut state = self.lock();
        state.counter = state.counter.max(received).saturating_add(1);
        state.counter
    }

    /// Takes a timestamp and a counter tick atomically
    pub fn stamp(&self) -> ClockStamp {
        let wall = self.wall.now_micros();
        let mut state = self.lock();
        ClockStamp {
            timestamp: state.advance(wall),
            logical: state.tick(),
        }
    }

    /// Last timestamp handed out, without advancing
    pub fn last(&self) -> Timestamp {
        Timestamp::from_micros(self.lock().last)
    }

    // The state is two integers updated together; a panic elsewhere cannot
    // leave it half-written, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("HybridClock")
            .field("last", &state.last)
            .field("counter", &state.counter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[derive(Clone)]
    struct ManualClock(Arc<AtomicI64>);

    impl ManualClock {
        fn at(micros: i64) -> Self {
            Self(Arc::new(AtomicI64::new(micros)))
        }

        fn set(&self, micros: i64) {
            self.0.store(micros, Ordering::SeqCst);
        }
    }

    impl WallClock for ManualClock {
        fn now_micros(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_now_follows_wall_clock_when_advancing() {
        let wall = ManualClock::at(1_000);
        let clock = HybridClock::with_wall_clock(wall.clone());

        assert_eq!(clock.now().as_micros(), 1_000);
        wall.set(5_000);
        assert_eq!(clock.now().as_micros(), 5_000);
    }

    #[test]
    fn test_now_strictly_increases_with_frozen_wall_clock() {
        let clock = HybridClock::with_wall_clock(ManualClock::at(42));
        let mut previous = clock.now();
        for _ in 0..1_000 {
            let next = clock.now();
            assert!(next > previous);
            previous = next;
        }
        assert_eq!(previous.as_micros(), 42 + 1_000);
    }

    #[test]
    fn test_now_survives_wall_clock_rewind() {
        let wall = ManualClock::at(10_000);
        let clock = HybridClock::with_wall_clock(wall.clone());

        let before = clock.now();
        wall.set(500);
        let after = clock.now();
        assert!(after > before);
        assert_eq!(after.as_micros(), 10_001);
    }

    #[test]
    fn test_tick_and_update() {
        let clock = HybridClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.update(10), 11);
        assert_eq!(clock.update(3), 12);
        assert_eq!(clock.tick(), 13);
    }

    #[test]
    fn test_stamp_advances_both_components() {
        let clock = HybridClock::with_wall_clock(ManualClock::at(7));
        let a = clock.stamp();
        let b = clock.stamp();
        assert!(b.timestamp > a.timestamp);
        assert_eq!(b.logical, a.logical + 1);
        assert_eq!(clock.last(), b.timestamp);
    }

    #[test]
    fn test_concurrent_callers_never_share_a_timestamp() {
        let clock = Arc::new(HybridClock::with_wall_clock(ManualClock::at(0)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = Arc::clone(&clock);
                thread::spawn(move || (0..500).map(|_| clock.now()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<Timestamp> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
