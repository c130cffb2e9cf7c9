//! The fiber worker: an OS thread running the dispatch loop.
//!
//! Each worker cycles through PICK (local deque, then an inbox batch, then
//! sibling deques), STEAL (foreign victims, gated per victim by its steal
//! ratio), and PARK (on the worker's own parking slot, with a double-check
//! of the inbox after publishing the parked flag so no wake-up is lost).
//!
//! The thread-local [`WorkerContext`] is the bridge between the dispatch
//! loop and code running *inside* a fiber: suspension functions write an
//! [`Action`] into it and switch back to the scheduler context, and the
//! loop acts on the fiber accordingly (re-queue, hand off, or retire).

use std::cell::{Cell, RefCell, UnsafeCell};
use std::sync::Arc;

use crossbeam::deque::{Steal, Worker as WorkerQueue};
use mempool::{GlobalPool, LocalPool};
use waiter::{monotonic_nanos, CountDownLatch};

use crate::error::{Result, RuntimeError};
use crate::fiber::context::{self, Context};
use crate::fiber::stack::FiberStack;
use crate::fiber::{Fiber, FiberExit, FiberState};
use crate::sched::scheduling_group::SchedulingGroup;

/// How long an idle worker with victims sleeps before re-scanning them.
/// Workers without victims park until explicitly woken.
const STEAL_PARK_INTERVAL_NANOS: i64 = 1_000_000;

/// Why a fiber switched back to the scheduler.
pub(crate) enum Action {
    /// Re-queue the fiber; it stays ready.
    Yielded,
    /// The fiber is done; retire it and recycle its stack.
    Finished(FiberExit),
    /// Transfer ownership of the fiber to a wake-up agent.
    Suspended(Box<dyn FnOnce(Box<Fiber>) + Send>),
}

/// A foreign group to steal from, with the fixed frequency (attempt on
/// every `steal_every_n`-th idle wake) assigned at bootstrap.
#[derive(Clone)]
pub(crate) struct Victim {
    pub(crate) group: Arc<SchedulingGroup>,
    pub(crate) steal_every_n: u64,
}

/// Thread-local worker state, installed for the lifetime of the worker
/// thread. See the module docs.
pub(crate) struct WorkerContext {
    group: Arc<SchedulingGroup>,
    sched_ctx: UnsafeCell<Context>,
    current_fiber: Cell<*mut Fiber>,
    pending: RefCell<Option<Action>>,
    stack_cache: RefCell<LocalPool<FiberStack>>,
}

std::thread_local! {
    // Initialized when the worker thread starts running; never accessed
    // from outside the thread.
    static WORKER: once_cell::unsync::OnceCell<WorkerContext> =
        once_cell::unsync::OnceCell::new();
}

fn with_worker<R>(f: impl FnOnce(&WorkerContext) -> R) -> Option<R> {
    WORKER.with(|cell| cell.get().map(f))
}

/// Whether the calling thread is currently executing a fiber.
pub(crate) fn on_fiber() -> bool {
    with_worker(|ctx| !ctx.current_fiber.get().is_null()).unwrap_or(false)
}

/// The group owning the calling worker thread, if it is one.
pub(crate) fn current_group() -> Option<Arc<SchedulingGroup>> {
    with_worker(|ctx| Arc::clone(&ctx.group))
}

pub(crate) fn current_group_index() -> Option<usize> {
    with_worker(|ctx| ctx.group.index)
}

/// Allocate a fiber stack, preferring the calling worker's cache.
pub(crate) fn allocate_stack(global: &Arc<GlobalPool<FiberStack>>) -> Option<FiberStack> {
    match with_worker(|ctx| ctx.stack_cache.borrow_mut().get()) {
        Some(result) => result,
        None => global.get(),
    }
}

/// Give up the CPU to the next ready fiber. A no-op thread yield when not
/// called from a fiber.
pub(crate) fn yield_now() {
    let targets = with_worker(|ctx| {
        let fiber = ctx.current_fiber.get();
        if fiber.is_null() {
            return None;
        }
        *ctx.pending.borrow_mut() = Some(Action::Yielded);
        Some((fiber, ctx.sched_ctx.get() as *const Context))
    })
    .flatten();

    match targets {
        // The worker context outlives the switch; the fiber may resume on
        // a different worker, which is why the raw pointers are captured
        // before switching rather than borrowed across it.
        Some((fiber, sched)) => unsafe {
            context::switch(std::ptr::addr_of_mut!((*fiber).ctx), sched)
        },
        None => std::thread::yield_now(),
    }
}

/// Switch out of the current fiber and hand its box to `handoff`, which
/// runs on the worker thread and must deliver the fiber to its wake-up
/// agent. Must be called from a fiber.
pub(crate) fn suspend(handoff: Box<dyn FnOnce(Box<Fiber>) + Send>) {
    let (fiber, sched) = with_worker(move |ctx| {
        let fiber = ctx.current_fiber.get();
        assert!(!fiber.is_null(), "suspend called outside of a fiber");
        *ctx.pending.borrow_mut() = Some(Action::Suspended(handoff));
        (fiber, ctx.sched_ctx.get() as *const Context)
    })
    .expect("suspend called outside of a fiber worker");

    unsafe { context::switch(std::ptr::addr_of_mut!((*fiber).ctx), sched) }
}

/// Terminate the current fiber with `exit`. Never returns.
pub(crate) fn finish_current(exit: FiberExit) -> ! {
    let (fiber, sched) = with_worker(|ctx| {
        let fiber = ctx.current_fiber.get();
        assert!(!fiber.is_null(), "fiber finished outside of a fiber");
        *ctx.pending.borrow_mut() = Some(Action::Finished(exit));
        (fiber, ctx.sched_ctx.get() as *const Context)
    })
    .expect("fiber finished outside of a fiber worker");

    unsafe { context::switch(std::ptr::addr_of_mut!((*fiber).ctx), sched) };
    unreachable!("a finished fiber was resumed");
}

/// Block the current fiber until `deadline` (monotonic nanos). Returns
/// `Cancelled` if the runtime began stopping instead.
pub(crate) fn sleep_until(deadline: i64) -> Result<()> {
    assert!(on_fiber(), "sleep_* must be called from a fiber");
    let group = current_group().unwrap();

    if group.is_stopping() {
        return Err(RuntimeError::Cancelled);
    }

    let timer = Arc::clone(group.timer());
    let wake_group = Arc::clone(&group);
    suspend(Box::new(move |fiber: Box<Fiber>| {
        let wake = move |fired: bool| {
            let mut fiber = fiber;
            if !fired {
                fiber.cancelled = true;
            }
            fiber.state = FiberState::Ready;
            wake_group.schedule(fiber);
        };
        // On a stopped timer the callback runs inline with fired = false,
        // so the fiber still comes back, carrying cancellation.
        let _ = timer.arm_once(deadline, Box::new(wake));
    }));

    // Resumed, possibly on a different worker thread.
    let cancelled = with_worker(|ctx| {
        let fiber = ctx.current_fiber.get();
        debug_assert!(!fiber.is_null());
        unsafe { (*fiber).take_cancelled() }
    })
    .expect("fiber resumed outside of a fiber worker");

    if cancelled {
        Err(RuntimeError::Cancelled)
    } else {
        Ok(())
    }
}

pub(crate) fn sleep_for(nanos: i64) -> Result<()> {
    sleep_until(monotonic_nanos() + nanos.max(0))
}

pub(crate) struct FiberWorker {
    group: Arc<SchedulingGroup>,
    index: usize,
    local: WorkerQueue<Box<Fiber>>,
    victims: Vec<Victim>,
    stack_pool: Arc<GlobalPool<FiberStack>>,
    /// Pin to this single CPU when migration is disallowed.
    pin_cpu: Option<u32>,
    idle_cycles: u64,
}

impl FiberWorker {
    pub(crate) fn new(
        group: Arc<SchedulingGroup>,
        index: usize,
        local: WorkerQueue<Box<Fiber>>,
        victims: Vec<Victim>,
        stack_pool: Arc<GlobalPool<FiberStack>>,
        pin_cpu: Option<u32>,
    ) -> Self {
        Self {
            group,
            index,
            local,
            victims,
            stack_pool,
            pin_cpu,
            idle_cycles: 0,
        }
    }

    /// The worker thread body.
    pub(crate) fn run(mut self, started: Arc<CountDownLatch>) {
        self.apply_affinity();

        WORKER.with(|cell| {
            let installed = cell.set(WorkerContext {
                group: Arc::clone(&self.group),
                sched_ctx: UnsafeCell::new(Context::empty()),
                current_fiber: Cell::new(std::ptr::null_mut()),
                pending: RefCell::new(None),
                stack_cache: RefCell::new(LocalPool::new(Arc::clone(&self.stack_pool))),
            });
            assert!(installed.is_ok(), "worker context already installed");
        });

        started.count_down();
        log::debug!(
            "fiber worker {}/{} entering dispatch loop",
            self.group.index,
            self.index
        );

        loop {
            if let Some(fiber) = self.next_ready() {
                self.run_fiber(fiber);
                continue;
            }
            if let Some(fiber) = self.steal_foreign() {
                self.run_fiber(fiber);
                continue;
            }
            if self.group.is_stopping() && self.local.is_empty() && self.group.inbox_is_empty() {
                break;
            }
            self.park();
        }

        log::debug!(
            "fiber worker {}/{} exiting",
            self.group.index,
            self.index
        );
    }

    fn apply_affinity(&self) {
        let cpus: Vec<u32> = match self.pin_cpu {
            Some(cpu) => vec![cpu],
            None => self.group.affinity.clone(),
        };
        if cpus.is_empty() {
            return;
        }
        if let Err(e) = topology::set_current_thread_affinity(&cpus) {
            log::warn!(
                "fiber worker {}/{} failed to set affinity: {e}",
                self.group.index,
                self.index
            );
        }
    }

    // PICK: local deque, then an inbox batch, then sibling deques.
    fn next_ready(&mut self) -> Option<Box<Fiber>> {
        if let Some(fiber) = self.local.pop() {
            return Some(fiber);
        }
        if let Some(fiber) = self.group.pop_inbox(&self.local) {
            return Some(fiber);
        }
        let stealers = self.group.stealers();
        for (i, stealer) in stealers.iter().enumerate() {
            if i == self.index {
                continue;
            }
            loop {
                match stealer.steal() {
                    Steal::Success(fiber) => return Some(fiber),
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        None
    }

    // STEAL: scan the victim list, each entry gated by its ratio.
    fn steal_foreign(&mut self) -> Option<Box<Fiber>> {
        if self.victims.is_empty() {
            return None;
        }
        self.idle_cycles = self.idle_cycles.wrapping_add(1);
        for victim in &self.victims {
            if self.idle_cycles % victim.steal_every_n != 0 {
                continue;
            }
            if let Some(fiber) = victim.group.steal_into(&self.local) {
                if victim.group.node_id != self.group.node_id {
                    self.group.note_cross_node_steal();
                }
                return Some(fiber);
            }
        }
        None
    }

    fn park(&self) {
        let parker = self.group.parker(self.index);
        parker.begin_park();
        // Double-check after publishing the parked flag: a producer that
        // pushed before seeing the flag left work, one that saw the flag
        // left a token. Either way we do not sleep through it.
        if !self.group.inbox_is_empty() || self.group.is_stopping() {
            parker.end_park();
            return;
        }
        let deadline = if self.victims.is_empty() {
            None
        } else {
            Some(monotonic_nanos() + STEAL_PARK_INTERVAL_NANOS)
        };
        parker.wait(deadline);
        parker.end_park();
    }

    // RUN: switch into the fiber, then act on how it came back.
    fn run_fiber(&mut self, fiber: Box<Fiber>) {
        self.idle_cycles = 0;

        let fiber_ptr = Box::into_raw(fiber);
        let action = WORKER.with(|cell| {
            let ctx = cell.get().expect("worker context missing");
            unsafe { (*fiber_ptr).state = FiberState::Running };
            ctx.current_fiber.set(fiber_ptr);
            unsafe { context::switch(ctx.sched_ctx.get(), std::ptr::addr_of!((*fiber_ptr).ctx)) };
            ctx.current_fiber.set(std::ptr::null_mut());
            ctx.pending
                .borrow_mut()
                .take()
                .expect("fiber switched out without an action")
        });

        let mut fiber = unsafe { Box::from_raw(fiber_ptr) };
        match action {
            Action::Yielded => {
                fiber.state = FiberState::Ready;
                self.local.push(fiber);
            }
            Action::Finished(exit) => {
                fiber.state = FiberState::Finished;
                if exit == FiberExit::Panicked {
                    log::debug!("a fiber spawned on group {} panicked", fiber.group);
                }
                if let Some(stack) = fiber.take_stack() {
                    WORKER.with(|cell| {
                        cell.get()
                            .unwrap()
                            .stack_cache
                            .borrow_mut()
                            .put(stack)
                    });
                }
                fiber.complete(exit);
            }
            Action::Suspended(handoff) => {
                fiber.state = FiberState::Suspended;
                handoff(fiber);
            }
        }
    }
}
