//! Counting lock for the per-connection reader/writer sides
//!
//! A `LockCell` admits at most one holder. Acquisition is a single atomic
//! increment: the caller owns the cell iff the post-increment value is 1,
//! otherwise it backs out with a decrement. The cell is **not re-entrant**;
//! a thread that already holds it will fail to acquire it again.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Single-holder counting lock
#[derive(Debug, Default)]
pub struct LockCell {
    n: AtomicU32,
}

impl LockCell {
    /// New, unheld cell
    pub const fn new() -> Self {
        Self {
            n: AtomicU32::new(0),
        }
    }

    /// Try to acquire; never blocks
    #[inline]
    pub fn try_enter(&self) -> bool {
        if self.n.fetch_add(1, Ordering::AcqRel) == 0 {
            true
        } else {
            self.n.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    /// Release; the caller must hold the cell
    #[inline]
    pub fn leave(&self) {
        self.n.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether some thread currently holds the cell
    #[inline]
    pub fn is_held(&self) -> bool {
        self.n.load(Ordering::Acquire) != 0
    }

    /// Bounded acquire: spin with alternating 0/1 ms sleeps until acquired,
    /// the timeout elapses, or `alive` reports the resource is gone
    pub fn try_enter_for(&self, timeout_ms: u64, mut alive: impl FnMut() -> bool) -> bool {
        if self.try_enter() {
            return true;
        }
        if timeout_ms == 0 {
            return false;
        }
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut tick = 0u32;
        loop {
            if !alive() {
                return false;
            }
            // Alternate yield and 1 ms sleep to stay responsive under
            // short holds without burning a core on long ones
            if tick & 1 == 0 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
            tick = tick.wrapping_add(1);
            if self.try_enter() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }
}
