//! POSIX semaphore waiter (unix systems without futexes).
//!
//! `sem_timedwait` takes an absolute CLOCK_REALTIME deadline, so the
//! remaining monotonic interval is re-anchored onto the realtime clock at
//! each wait. A realtime clock step while blocked shows up as a bounded
//! early/late wake; callers already tolerate spurious wakes.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;

use crate::clock::monotonic_nanos;
use crate::WaitResult;

pub(crate) struct Waiter {
    sem: UnsafeCell<libc::sem_t>,
    poked: AtomicU32,
}

// sem_t is opaque; show only the poke state.
impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("poked", &self.poked)
            .finish_non_exhaustive()
    }
}

// The semaphore is process-private and sem_* functions are thread-safe.
unsafe impl Send for Waiter {}
unsafe impl Sync for Waiter {}

impl Default for Waiter {
    fn default() -> Self {
        let sem = UnsafeCell::new(unsafe { std::mem::zeroed() });
        let rv = unsafe { libc::sem_init(sem.get(), 0, 0) };
        assert_eq!(rv, 0, "sem_init failed");
        Self {
            sem,
            poked: AtomicU32::new(0),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        unsafe { libc::sem_destroy(self.sem.get()) };
    }
}

impl Waiter {
    pub(crate) fn wait(&self, deadline: Option<i64>) -> WaitResult {
        loop {
            let rv = match deadline {
                None => unsafe { libc::sem_wait(self.sem.get()) },
                Some(deadline) => {
                    let remaining = deadline - monotonic_nanos();
                    if remaining <= 0 {
                        return WaitResult::TimedOut;
                    }
                    let abs = realtime_after(remaining);
                    unsafe { libc::sem_timedwait(self.sem.get(), &abs) }
                }
            };

            if rv == 0 {
                self.poked.store(0, Ordering::Relaxed);
                return WaitResult::Woke;
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ETIMEDOUT => {
                    // Re-check against the monotonic clock; the realtime
                    // clock may have stepped forward under us.
                    if let Some(deadline) = deadline {
                        if deadline - monotonic_nanos() <= 0 {
                            return WaitResult::TimedOut;
                        }
                    }
                }
                errno => panic!("sem_wait failed with {errno}"),
            }
        }
    }

    pub(crate) fn post(&self) {
        let rv = unsafe { libc::sem_post(self.sem.get()) };
        assert_eq!(rv, 0, "sem_post failed");
    }

    pub(crate) fn poke(&self) {
        if self.poked.swap(1, Ordering::AcqRel) == 0 {
            self.post();
        }
    }
}

fn realtime_after(nanos: i64) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rv = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    assert_eq!(rv, 0, "clock_gettime(CLOCK_REALTIME) failed");

    let total = now.tv_sec as i64 * 1_000_000_000 + now.tv_nsec as i64 + nanos;
    libc::timespec {
        tv_sec: (total / 1_000_000_000) as libc::time_t,
        tv_nsec: (total % 1_000_000_000) as libc::c_long,
    }
}
