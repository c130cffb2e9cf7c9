//! weft: a NUMA-aware M:N fiber scheduling runtime.
//!
//! User-mode cooperative tasks ("fibers") are multiplexed onto a bounded
//! set of OS worker threads. Workers are organized into *scheduling
//! groups*, each with its own run queue, CPU affinity, and a dedicated
//! timer worker; idle workers steal ready fibers from other groups at
//! configurable intra-node and cross-NUMA frequencies. Fibers move bytes
//! between each other through pooled, reference-counted buffer blocks
//! (re-exported from the `mempool` crate).
//!
//! The scheduler is strictly cooperative: a fiber runs until it yields,
//! sleeps, or finishes. There is no preemption.
//!
//! ```
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! let config = weft::RuntimeConfig {
//!     scheduling_groups: 1,
//!     workers_per_group: 2,
//!     ..Default::default()
//! };
//! weft::start_runtime(config).unwrap();
//!
//! let counter = Arc::new(AtomicU32::new(0));
//! let handles: Vec<_> = (0..8)
//!     .map(|_| {
//!         let counter = Arc::clone(&counter);
//!         weft::spawn(move || {
//!             counter.fetch_add(1, Ordering::Relaxed);
//!             weft::yield_now();
//!         })
//!         .unwrap()
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     assert_eq!(handle.join(), weft::FiberExit::Completed);
//! }
//! assert_eq!(counter.load(Ordering::Relaxed), 8);
//!
//! weft::terminate_runtime();
//! ```

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;

mod fiber;
mod runtime;
mod sched;

pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use fiber::{FiberExit, FiberHandle};
pub use runtime::{
    arm_periodic_timer, arm_timer, cancel_timer, get_scheduling_group_assigned_node,
    get_scheduling_group_count, get_scheduling_group_size, get_scheduling_group_steal_counts,
    nearest_scheduling_group, spawn, spawn_on, start_runtime, terminate_runtime, TimerHandle,
};
// The buffer-block allocator fibers use for zero-copy byte movement, and
// the monotonic clock all deadlines are expressed in.
pub use mempool::{make_block, make_native_block, BlockSize, BufferBlock, PoolConfig, RefPtr};
pub use waiter::monotonic_nanos;

/// Yield the current fiber back to its worker's run queue. When called
/// outside a fiber this degrades to an OS thread yield.
pub fn yield_now() {
    sched::fiber_worker::yield_now()
}

/// Block the current fiber for at least `nanos` nanoseconds. The worker
/// thread is not blocked; other fibers keep running. Returns `Cancelled`
/// when woken by runtime teardown instead of the deadline.
///
/// Must be called from a fiber.
pub fn sleep_for(nanos: i64) -> Result<()> {
    sched::fiber_worker::sleep_for(nanos)
}

/// Like [`sleep_for`], with an absolute monotonic deadline.
pub fn sleep_until(deadline: i64) -> Result<()> {
    sched::fiber_worker::sleep_until(deadline)
}
