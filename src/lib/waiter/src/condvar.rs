//! Mutex + condition variable waiter, the portable fallback backend.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::clock::monotonic_nanos;
use crate::WaitResult;

#[derive(Debug, Default)]
pub(crate) struct Waiter {
    tokens: Mutex<u32>,
    cond: Condvar,
}

impl Waiter {
    pub(crate) fn wait(&self, deadline: Option<i64>) -> WaitResult {
        let mut tokens = self.tokens.lock().unwrap();
        loop {
            if *tokens > 0 {
                *tokens -= 1;
                return WaitResult::Woke;
            }
            match deadline {
                None => {
                    tokens = self.cond.wait(tokens).unwrap();
                }
                Some(deadline) => {
                    let remaining = deadline - monotonic_nanos();
                    if remaining <= 0 {
                        return WaitResult::TimedOut;
                    }
                    let (guard, _timeout) = self
                        .cond
                        .wait_timeout(tokens, Duration::from_nanos(remaining as u64))
                        .unwrap();
                    tokens = guard;
                }
            }
        }
    }

    pub(crate) fn post(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        *tokens += 1;
        drop(tokens);
        self.cond.notify_one();
    }

    pub(crate) fn poke(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        if *tokens == 0 {
            *tokens = 1;
            drop(tokens);
            self.cond.notify_one();
        }
    }
}
