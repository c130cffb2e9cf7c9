//! The monotonic clock every scheduling decision is made against.

/// Nanoseconds of CLOCK_MONOTONIC since an arbitrary epoch. Race-free
/// under concurrent reads; never goes backwards.
#[cfg(unix)]
pub fn monotonic_nanos() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rv = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    assert_eq!(rv, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

#[cfg(not(unix))]
pub fn monotonic_nanos() -> i64 {
    use once_cell::sync::Lazy;
    use std::time::Instant;

    static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);
    EPOCH.elapsed().as_nanos() as i64
}
