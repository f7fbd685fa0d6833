//! One-second bucket FPS accounting.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::clock;

/// Counts events per wall-second; the published value is always the count of
/// the last *complete* second. `bump()` must be called from a single writer
/// thread, `get()` may be called from anywhere.
pub struct FpsCounter {
    name: &'static str,
    current: AtomicU32,
    accum: AtomicU32,
    second: AtomicI64,
}

impl FpsCounter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            current: AtomicU32::new(0),
            accum: AtomicU32::new(0),
            second: AtomicI64::new(0),
        }
    }

    /// Registers one event at monotonic time `now`.
    pub fn bump(&self, now: f64) {
        let second = clock::floor_second(now);
        if self.second.swap(second, Ordering::Relaxed) != second {
            let accum = self.accum.swap(0, Ordering::Relaxed);
            tracing::trace!(name = self.name, fps = accum, "fps");
            self.current.store(accum, Ordering::Relaxed);
        }
        self.accum.fetch_add(1, Ordering::Relaxed);
    }

    /// Resets the published value, e.g. when the source goes offline.
    pub fn reset(&self) {
        self.accum.store(0, Ordering::Relaxed);
        self.current.store(0, Ordering::Relaxed);
    }

    pub fn get(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_publishes_previous_second() {
        let fps = FpsCounter::new("test");
        for i in 0..30 {
            fps.bump(100.0 + i as f64 / 30.0);
        }
        // Nothing published until the second rolls over.
        assert_eq!(fps.get(), 0);
        fps.bump(101.0);
        assert_eq!(fps.get(), 30);
    }

    #[test]
    fn test_reset() {
        let fps = FpsCounter::new("test");
        fps.bump(10.0);
        fps.bump(11.0);
        assert!(fps.get() > 0);
        fps.reset();
        assert_eq!(fps.get(), 0);
    }
}
