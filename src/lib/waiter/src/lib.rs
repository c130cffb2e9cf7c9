//! The wake/wait primitive that parked worker threads sleep on.
//!
//! A [`Waiter`] is a tiny counting event: producers hand it tokens with
//! [`post()`](Waiter::post) (each wakes exactly one waiting thread) or an
//! idempotent [`poke()`](Waiter::poke) hint, and a consumer blocks in
//! [`wait()`](Waiter::wait) until a token arrives or an optional monotonic
//! deadline passes. Spurious wakes are allowed; callers re-check their
//! condition after waking.
//!
//! Three back-ends sit behind the same API, picked at build time in order
//! of preference: a futex word on Linux, a POSIX semaphore on other unix
//! systems, and a mutex + condition variable everywhere else (including
//! macOS, whose unnamed semaphores are unusable).

mod clock;
// Always compiled (not just where it is the selected backend) so the tests
// can exercise the portable fallback on every platform.
#[allow(dead_code)]
mod condvar;
mod latch;

#[cfg(target_os = "linux")]
mod futex;
#[cfg(all(unix, not(target_os = "linux"), not(target_vendor = "apple")))]
mod sema;

pub use clock::monotonic_nanos;
pub use latch::CountDownLatch;

#[cfg(target_os = "linux")]
use futex as imp;
#[cfg(all(unix, not(target_os = "linux"), not(target_vendor = "apple")))]
use sema as imp;
#[cfg(not(any(target_os = "linux", all(unix, not(target_vendor = "apple")))))]
use condvar as imp;

/// Why a [`Waiter::wait`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A token was consumed (or the wake was spurious; re-check).
    Woke,
    /// The deadline passed before a token arrived.
    TimedOut,
}

impl WaitResult {
    pub fn woke(self) -> bool {
        self == WaitResult::Woke
    }
}

/// A wake/wait event. See the crate docs.
#[derive(Debug, Default)]
pub struct Waiter {
    inner: imp::Waiter,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until a token is available or `deadline` (monotonic nanos, as
    /// returned by [`monotonic_nanos`]) passes. `None` waits indefinitely.
    pub fn wait(&self, deadline: Option<i64>) -> WaitResult {
        self.inner.wait(deadline)
    }

    /// Add one token, waking exactly one waiter.
    pub fn post(&self) {
        self.inner.post();
    }

    /// Idempotent wake hint: ensures at least one token is pending.
    /// Repeated pokes with no intervening wait coalesce into one.
    pub fn poke(&self) {
        self.inner.poke();
    }
}
