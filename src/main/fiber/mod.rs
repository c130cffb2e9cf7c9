//! Fibers: cooperatively scheduled tasks with their own stacks.
//!
//! A [`Fiber`] owns its stack and saved context and moves through the
//! scheduler as a `Box<Fiber>`. Ownership of the box *is* the queueing
//! invariant: a fiber sits in exactly one place at a time (a run queue, a
//! worker's hands, or a wake-up agent such as a pending timer), so it can
//! never be resumed twice concurrently.
//!
//! The entry closure runs inside `catch_unwind`: unwinding must never
//! cross the context-switch boundary, so a panicking fiber runs its
//! destructors, is reported as [`FiberExit::Panicked`] on its completion
//! handle, and terminates normally from the scheduler's point of view.

pub(crate) mod context;
pub(crate) mod stack;

use std::sync::{Arc, Mutex};

use waiter::{monotonic_nanos, WaitResult, Waiter};

use crate::error::{Result, RuntimeError};
use crate::fiber::context::Context;
use crate::fiber::stack::FiberStack;

/// How a fiber ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberExit {
    /// The entry function returned.
    Completed,
    /// The entry function panicked; the panic was contained.
    Panicked,
    /// The fiber never ran to completion (runtime teardown).
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FiberState {
    Ready,
    Running,
    Suspended,
    Finished,
}

pub(crate) struct Fiber {
    pub(crate) state: FiberState,
    /// The scheduling group the fiber was spawned on. Informational after
    /// spawn: execution follows the queues (stealing included).
    pub(crate) group: usize,
    pub(crate) ctx: Context,
    /// Set by a wake-up agent that delivered cancellation instead of the
    /// awaited event; consumed when the fiber resumes.
    pub(crate) cancelled: bool,
    stack: Option<FiberStack>,
    entry: Option<Box<dyn FnOnce() + Send + 'static>>,
    completion: Arc<Completion>,
}

impl Fiber {
    /// Build a ready-to-run fiber on `stack`. The returned box must end up
    /// on a run queue; dropping it reports `Cancelled` on the handle.
    pub(crate) fn new(
        group: usize,
        stack: FiberStack,
        entry: impl FnOnce() + Send + 'static,
    ) -> (Box<Fiber>, FiberHandle) {
        let completion = Arc::new(Completion::new());
        let mut fiber = Box::new(Fiber {
            state: FiberState::Ready,
            group,
            ctx: Context::empty(),
            cancelled: false,
            stack: Some(stack),
            entry: Some(Box::new(entry)),
            completion: Arc::clone(&completion),
        });

        // The box gives the fiber a stable address, so the trampoline can
        // carry a pointer to it through the context switch.
        debug_assert!(fiber.stack.as_ref().unwrap().usable_bytes() >= 4096);
        let top = fiber.stack.as_ref().unwrap().top();
        let arg = &mut *fiber as *mut Fiber as *mut ();
        fiber.ctx = unsafe { Context::prepare(top, fiber_main, arg) };

        (fiber, FiberHandle { completion })
    }

    pub(crate) fn take_entry(&mut self) -> Option<Box<dyn FnOnce() + Send + 'static>> {
        self.entry.take()
    }

    /// Reclaim the stack for pooling once the fiber has finished.
    pub(crate) fn take_stack(&mut self) -> Option<FiberStack> {
        debug_assert_eq!(self.state, FiberState::Finished);
        self.stack.take()
    }

    pub(crate) fn complete(&self, exit: FiberExit) {
        self.completion.complete(exit);
    }

    /// Consume the pending-cancellation flag.
    pub(crate) fn take_cancelled(&mut self) -> bool {
        std::mem::take(&mut self.cancelled)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // Reaching here without finishing means the fiber was abandoned
        // (teardown, or a failed hand-off); the handle must still fire.
        if self.state != FiberState::Finished {
            self.completion.complete(FiberExit::Cancelled);
        }
    }
}

// First frame of every fiber. Runs on the fiber's own stack.
extern "C" fn fiber_main(arg: *mut ()) -> ! {
    let entry = {
        let fiber = unsafe { &mut *(arg as *mut Fiber) };
        fiber.take_entry().expect("fiber entry already taken")
    };

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry));
    let exit = match result {
        Ok(()) => FiberExit::Completed,
        Err(_) => FiberExit::Panicked,
    };

    crate::sched::fiber_worker::finish_current(exit)
}

#[derive(Debug)]
pub(crate) struct Completion {
    exit: Mutex<Option<FiberExit>>,
    waiter: Waiter,
}

impl Completion {
    fn new() -> Self {
        Self {
            exit: Mutex::new(None),
            waiter: Waiter::new(),
        }
    }

    fn complete(&self, exit: FiberExit) {
        let mut slot = self.exit.lock().unwrap();
        if slot.is_none() {
            *slot = Some(exit);
            drop(slot);
            self.waiter.post();
        }
    }

    fn peek(&self) -> Option<FiberExit> {
        *self.exit.lock().unwrap()
    }
}

/// Observes a fiber's completion. Dropping the handle detaches the fiber.
#[derive(Debug)]
pub struct FiberHandle {
    completion: Arc<Completion>,
}

impl FiberHandle {
    /// The exit state, if the fiber has already finished.
    pub fn try_exit(&self) -> Option<FiberExit> {
        self.completion.peek()
    }

    /// Block until the fiber finishes.
    pub fn join(&self) -> FiberExit {
        self.join_inner(None).unwrap()
    }

    /// Block until the fiber finishes or `deadline` (monotonic nanos)
    /// passes.
    pub fn join_deadline(&self, deadline: i64) -> Result<FiberExit> {
        self.join_inner(Some(deadline))
    }

    fn join_inner(&self, deadline: Option<i64>) -> Result<FiberExit> {
        // On a fiber, parking the OS thread would stall every fiber of the
        // group; yield through the scheduler instead.
        if crate::sched::fiber_worker::on_fiber() {
            loop {
                if let Some(exit) = self.completion.peek() {
                    return Ok(exit);
                }
                if deadline.is_some_and(|d| monotonic_nanos() >= d) {
                    return Err(RuntimeError::TimedOut);
                }
                crate::sched::fiber_worker::yield_now();
            }
        }

        loop {
            if let Some(exit) = self.completion.peek() {
                // Cascade the token so further joiners wake too.
                self.completion.waiter.post();
                return Ok(exit);
            }
            match self.completion.waiter.wait(deadline) {
                WaitResult::Woke => continue,
                WaitResult::TimedOut => return Err(RuntimeError::TimedOut),
            }
        }
    }
}
