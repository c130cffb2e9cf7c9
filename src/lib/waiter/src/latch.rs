//! A one-shot count-down latch.
//!
//! The runtime bootstrap hands one of these to every worker thread it
//! starts; `start_runtime` returns once each worker has counted down on
//! entering its dispatch loop.

use std::sync::{Condvar, Mutex};

#[derive(Debug)]
pub struct CountDownLatch {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Decrement the count, waking all waiters when it reaches zero.
    /// Panics if called more times than the latch was created with.
    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining = remaining.checked_sub(1).unwrap();
        if *remaining == 0 {
            drop(remaining);
            self.cond.notify_all();
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let remaining = self.remaining.lock().unwrap();
        let _guard = self
            .cond
            .wait_while(remaining, |remaining| *remaining > 0)
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn test_zero_count_is_open() {
        let latch = CountDownLatch::new(0);
        latch.wait();
    }

    #[test]
    fn test_wait_blocks_until_all_counted() {
        let latch = Arc::new(CountDownLatch::new(3));

        let threads: Vec<_> = (0..3)
            .map(|i| {
                let latch = Arc::clone(&latch);
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(30 * (i + 1)));
                    latch.count_down();
                })
            })
            .collect();

        let start = Instant::now();
        latch.wait();
        assert!(start.elapsed() >= Duration::from_millis(50));

        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    #[should_panic]
    fn test_extra_count_down_panics() {
        let latch = CountDownLatch::new(1);
        latch.count_down();
        latch.count_down();
    }
}
