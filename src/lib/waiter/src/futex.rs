//! Futex-backed waiter (Linux).
//!
//! Tokens live in a 32-bit word; waiters sleep in FUTEX_WAIT on that word
//! and producers wake them with FUTEX_WAKE. FUTEX_WAIT takes a relative
//! timeout measured against CLOCK_MONOTONIC, which matches the deadline
//! contract directly.

use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;

use crate::clock::monotonic_nanos;
use crate::WaitResult;

#[derive(Debug, Default)]
pub(crate) struct Waiter {
    tokens: AtomicU32,
}

// Perform a futex operation through libc. The raw syscall is used rather
// than a wrapper crate; miri and the kernel both understand this form.
fn futex(
    word: &AtomicU32,
    op: libc::c_int,
    val: u32,
    timeout: Option<libc::timespec>,
) -> Result<libc::c_long, Errno> {
    let timeout_ptr: *const libc::timespec = timeout
        .as_ref()
        .map(std::ptr::from_ref)
        .unwrap_or(std::ptr::null());

    let rv = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            op,
            val,
            timeout_ptr,
            std::ptr::null_mut::<u32>(),
            0u32,
        )
    };

    if rv >= 0 {
        Ok(rv)
    } else {
        Err(Errno::last())
    }
}

impl Waiter {
    pub(crate) fn wait(&self, deadline: Option<i64>) -> WaitResult {
        loop {
            if self.try_consume() {
                return WaitResult::Woke;
            }

            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline - monotonic_nanos();
                    if remaining <= 0 {
                        return WaitResult::TimedOut;
                    }
                    Some(libc::timespec {
                        tv_sec: (remaining / 1_000_000_000) as libc::time_t,
                        tv_nsec: (remaining % 1_000_000_000) as libc::c_long,
                    })
                }
                None => None,
            };

            // Sleeps only if the word is still 0; a concurrent post makes
            // this return EAGAIN and we retry the consume.
            let rv = futex(
                &self.tokens,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0,
                timeout,
            );
            assert!(
                matches!(rv, Ok(_) | Err(Errno::EAGAIN | Errno::EINTR | Errno::ETIMEDOUT)),
                "FUTEX_WAIT failed with {rv:?}"
            );
        }
    }

    pub(crate) fn post(&self) {
        self.tokens.fetch_add(1, Ordering::Release);
        futex(
            &self.tokens,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1,
            None,
        )
        .expect("FUTEX_WAKE failed");
    }

    pub(crate) fn poke(&self) {
        // Only the 0 -> 1 transition publishes a token; later pokes
        // coalesce with the pending one.
        if self
            .tokens
            .compare_exchange(0, 1, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            futex(
                &self.tokens,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1,
                None,
            )
            .expect("FUTEX_WAKE failed");
        }
    }

    fn try_consume(&self) -> bool {
        let mut current = self.tokens.load(Ordering::Acquire);
        while current > 0 {
            match self.tokens.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }
}
