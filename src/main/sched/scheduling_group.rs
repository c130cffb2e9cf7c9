//! The scheduling group: the unit of concurrency.
//!
//! A group's run queue is split the way the workers consume it: remote
//! producers (other threads, the timer worker, wake-up agents) push into a
//! shared MPMC inbox, and each member worker keeps a FIFO deque that it
//! refills from the inbox in batches. Foreign groups steal through
//! [`steal_into`](SchedulingGroup::steal_into), which drains the inbox
//! first and then the tails the member deques expose to stealers.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::deque::{Injector, Steal, Stealer, Worker as WorkerQueue};
use once_cell::sync::OnceCell;
use waiter::{WaitResult, Waiter};

use crate::fiber::Fiber;
use crate::sched::timer_worker::TimerWorker;

/// Per-worker parking slot. The `parked` flag lets producers aim their
/// wake-up at a worker that is actually asleep.
pub(crate) struct Parker {
    waiter: Waiter,
    parked: AtomicBool,
}

impl Parker {
    fn new() -> Self {
        Self {
            waiter: Waiter::new(),
            parked: AtomicBool::new(false),
        }
    }

    pub(crate) fn begin_park(&self) {
        self.parked.store(true, Ordering::SeqCst);
    }

    pub(crate) fn end_park(&self) {
        self.parked.store(false, Ordering::SeqCst);
    }

    pub(crate) fn wait(&self, deadline: Option<i64>) -> WaitResult {
        self.waiter.wait(deadline)
    }
}

pub(crate) struct SchedulingGroup {
    pub(crate) index: usize,
    pub(crate) node_id: u32,
    /// CPUs the group's workers may run on.
    pub(crate) affinity: Vec<u32>,
    inbox: Injector<Box<Fiber>>,
    stealers: OnceCell<Vec<Stealer<Box<Fiber>>>>,
    parkers: Vec<Parker>,
    next_wake: AtomicUsize,
    stopping: AtomicBool,
    timer: OnceCell<Arc<TimerWorker>>,
    /// Successful steal operations foreign workers have made against
    /// this group (a batch moved in one operation counts once).
    stolen_from: AtomicU64,
    /// Fibers this group's workers stole from groups on other NUMA nodes.
    cross_node_steals: AtomicU64,
}

impl SchedulingGroup {
    pub(crate) fn new(index: usize, node_id: u32, affinity: Vec<u32>, workers: usize) -> Arc<Self> {
        assert!(workers > 0);
        Arc::new(Self {
            index,
            node_id,
            affinity,
            inbox: Injector::new(),
            stealers: OnceCell::new(),
            parkers: (0..workers).map(|_| Parker::new()).collect(),
            next_wake: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            timer: OnceCell::new(),
            stolen_from: AtomicU64::new(0),
            cross_node_steals: AtomicU64::new(0),
        })
    }

    pub(crate) fn set_timer(&self, timer: Arc<TimerWorker>) {
        self.timer
            .set(timer)
            .unwrap_or_else(|_| panic!("timer worker already attached"));
    }

    pub(crate) fn timer(&self) -> &Arc<TimerWorker> {
        self.timer.get().expect("timer worker not attached")
    }

    /// Register the member workers' steal handles; called once at
    /// bootstrap, before any worker starts.
    pub(crate) fn register_stealers(&self, stealers: Vec<Stealer<Box<Fiber>>>) {
        assert_eq!(stealers.len(), self.parkers.len());
        self.stealers
            .set(stealers)
            .unwrap_or_else(|_| panic!("stealers already registered"));
    }

    pub(crate) fn stealers(&self) -> &[Stealer<Box<Fiber>>] {
        self.stealers.get().expect("stealers not registered")
    }

    /// Hand a ready fiber to this group. Any thread may call this; the
    /// public API layers the `RuntimeStopped` check on top so teardown can
    /// keep delivering parked fibers through this path.
    pub(crate) fn schedule(&self, fiber: Box<Fiber>) {
        self.inbox.push(fiber);
        self.wake_one();
    }

    /// Move work into a foreign worker's deque: a batch from the inbox, or
    /// single fibers from the member deques' steal ends.
    pub(crate) fn steal_into(&self, dest: &WorkerQueue<Box<Fiber>>) -> Option<Box<Fiber>> {
        loop {
            match self.inbox.steal_batch_and_pop(dest) {
                Steal::Success(fiber) => {
                    self.stolen_from.fetch_add(1, Ordering::Relaxed);
                    return Some(fiber);
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        if let Some(stealers) = self.stealers.get() {
            for stealer in stealers {
                loop {
                    match stealer.steal() {
                        Steal::Success(fiber) => {
                            self.stolen_from.fetch_add(1, Ordering::Relaxed);
                            return Some(fiber);
                        }
                        Steal::Retry => continue,
                        Steal::Empty => break,
                    }
                }
            }
        }
        None
    }

    /// Refill a member worker's deque from the inbox.
    pub(crate) fn pop_inbox(&self, dest: &WorkerQueue<Box<Fiber>>) -> Option<Box<Fiber>> {
        loop {
            match self.inbox.steal_batch_and_pop(dest) {
                Steal::Success(fiber) => return Some(fiber),
                Steal::Retry => continue,
                Steal::Empty => return None,
            }
        }
    }

    pub(crate) fn inbox_is_empty(&self) -> bool {
        self.inbox.is_empty()
    }

    pub(crate) fn parker(&self, worker: usize) -> &Parker {
        &self.parkers[worker]
    }

    fn wake_one(&self) {
        // Prefer a worker that is actually parked; fall back to
        // round-robin so the token is not lost when none is.
        for parker in &self.parkers {
            if parker.parked.load(Ordering::SeqCst) {
                parker.waiter.post();
                return;
            }
        }
        let i = self.next_wake.fetch_add(1, Ordering::Relaxed) % self.parkers.len();
        self.parkers[i].waiter.post();
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Begin teardown: no new public submissions, all workers woken so
    /// they can drain and exit. Non-blocking.
    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for parker in &self.parkers {
            parker.waiter.post();
        }
    }

    pub(crate) fn note_cross_node_steal(&self) {
        self.cross_node_steals.fetch_add(1, Ordering::Relaxed);
    }

    /// Successful foreign steal operations against this group.
    pub(crate) fn stolen_from_count(&self) -> u64 {
        self.stolen_from.load(Ordering::Relaxed)
    }

    /// How many fibers this group's workers took from other NUMA nodes.
    pub(crate) fn cross_node_steal_count(&self) -> u64 {
        self.cross_node_steals.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::stack::FiberStack;

    fn test_fiber() -> Box<Fiber> {
        let stack = FiberStack::map(16 * 1024).unwrap();
        let (fiber, _handle) = Fiber::new(0, stack, || {});
        fiber
    }

    #[test]
    fn test_schedule_lands_in_inbox() {
        let group = SchedulingGroup::new(0, 0, vec![], 2);
        assert!(group.inbox_is_empty());
        group.schedule(test_fiber());
        assert!(!group.inbox_is_empty());
    }

    #[test]
    fn test_steal_from_inbox_and_member_deques() {
        let group = SchedulingGroup::new(0, 0, vec![], 1);
        let member: WorkerQueue<Box<Fiber>> = WorkerQueue::new_fifo();
        group.register_stealers(vec![member.stealer()]);

        group.schedule(test_fiber());
        member.push(test_fiber());

        let thief: WorkerQueue<Box<Fiber>> = WorkerQueue::new_fifo();
        assert!(group.steal_into(&thief).is_some()); // inbox first
        assert!(group.steal_into(&thief).is_some()); // then the deque
        assert!(group.steal_into(&thief).is_none());
        assert_eq!(group.stolen_from_count(), 2);
    }

    #[test]
    fn test_stop_flags_and_wakes() {
        let group = SchedulingGroup::new(0, 0, vec![], 2);
        assert!(!group.is_stopping());
        group.stop();
        assert!(group.is_stopping());
        // Every parker got a token, so an immediate wait returns at once.
        for i in 0..2 {
            assert_eq!(group.parker(i).wait(None), WaitResult::Woke);
        }
    }

    #[test]
    fn test_wake_one_prefers_parked_worker() {
        let group = SchedulingGroup::new(0, 0, vec![], 2);
        group.parker(1).begin_park();
        group.schedule(test_fiber());
        // Worker 1 was parked, so the token went to it.
        assert_eq!(
            group.parker(1).wait(Some(waiter::monotonic_nanos() + 50_000_000)),
            WaitResult::Woke
        );
        group.parker(1).end_park();
    }
}
