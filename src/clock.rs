//! Monotonic and wall clocks with sub-millisecond precision.

/// Seconds since an arbitrary monotonic epoch.
pub fn now_monotonic() -> f64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1_000_000_000.0
}

/// Seconds since the UNIX epoch, for client-visible timestamps.
pub fn now_real() -> f64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1_000_000_000.0
}

/// Whole-second bucket of a monotonic timestamp.
pub fn floor_second(ts: f64) -> i64 {
    ts.floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_is_monotonic() {
        let a = now_monotonic();
        let b = now_monotonic();
        assert!(b >= a);
    }

    #[test]
    fn test_floor_second() {
        assert_eq!(floor_second(12.999), 12);
        assert_eq!(floor_second(13.0), 13);
    }
}
