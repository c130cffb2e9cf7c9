//! The per-group timer worker.
//!
//! Timers live in a deadline-ordered min-heap guarded by a light mutex;
//! any thread may arm, only the timer thread pops. Cancellation is lazy:
//! `cancel` flags the entry and drops it from the handle index, and the
//! heap slot is discarded when it surfaces at the top. Expired callbacks
//! are not run on the timer thread beyond handing work to a run queue,
//! which keeps its pop-to-fire latency flat.
//!
//! Callbacks take a `fired` flag: `true` from a normal expiration, `false`
//! when the runtime stops with the entry still pending (the flush path
//! lets a parked-fiber wake-up deliver cancellation instead of the event).

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use waiter::{monotonic_nanos, CountDownLatch, Waiter};

use crate::error::{Result, RuntimeError};

/// A one-shot callback; `fired` distinguishes expiration from teardown.
pub(crate) type OnceCallback = Box<dyn FnOnce(bool) + Send>;
/// A periodic callback, invoked once per period until cancelled.
pub(crate) type PeriodicCallback = Arc<dyn Fn() + Send + Sync>;

enum TimerCallback {
    Once(Option<OnceCallback>),
    Periodic { period: i64, callback: PeriodicCallback },
}

struct TimerEntry {
    id: u64,
    cancelled: AtomicBool,
    callback: Mutex<TimerCallback>,
}

// Max-heap by default; order reversed so the nearest deadline surfaces
// first, with the arming sequence as the tie-break.
struct HeapSlot {
    deadline: i64,
    seq: u64,
    entry: Arc<TimerEntry>,
}

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for HeapSlot {}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    heap: BinaryHeap<HeapSlot>,
    /// Handle id -> entry, for cancellation without a heap scan. Entries
    /// leave the index when they fire or are cancelled.
    index: HashMap<u64, Arc<TimerEntry>>,
    next_id: u64,
    next_seq: u64,
}

enum Step {
    Park(Option<i64>),
    FireOnce(OnceCallback),
    FirePeriodic(PeriodicCallback),
}

pub(crate) struct TimerWorker {
    state: Mutex<TimerState>,
    waiter: Waiter,
    stopping: AtomicBool,
}

impl TimerWorker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                index: HashMap::new(),
                next_id: 1,
                next_seq: 0,
            }),
            waiter: Waiter::new(),
            stopping: AtomicBool::new(false),
        })
    }

    /// Arm a one-shot timer. After `stop()`, fails with `RuntimeStopped`
    /// after invoking `callback(false)` inline, so callbacks that carry a
    /// parked fiber can still deliver it.
    pub(crate) fn arm_once(&self, deadline: i64, callback: OnceCallback) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        // Checked under the lock: the stop flush holds it, so we either
        // land in the heap before the flush or observe `stopping` here.
        if self.stopping.load(Ordering::SeqCst) {
            drop(state);
            callback(false);
            return Err(RuntimeError::RuntimeStopped);
        }
        let id = self.insert(&mut state, deadline, TimerCallback::Once(Some(callback)));
        Ok(id)
    }

    /// Arm a periodic timer first firing at `now + period`, then every
    /// `period` from each *scheduled* deadline (drift does not accumulate).
    pub(crate) fn arm_periodic(&self, period: i64, callback: PeriodicCallback) -> Result<u64> {
        assert!(period > 0);
        let mut state = self.state.lock().unwrap();
        if self.stopping.load(Ordering::SeqCst) {
            return Err(RuntimeError::RuntimeStopped);
        }
        let deadline = monotonic_nanos() + period;
        let id = self.insert(
            &mut state,
            deadline,
            TimerCallback::Periodic { period, callback },
        );
        Ok(id)
    }

    /// Flag a timer as cancelled. Returns whether the entry was observed
    /// not-yet-fired; best-effort, a concurrently-firing callback may
    /// still run.
    pub(crate) fn cancel(&self, id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.index.remove(&id) {
            Some(entry) => {
                entry.cancelled.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Stop the worker and flush pending entries as cancelled (one-shot
    /// callbacks get `fired = false`; periodic callbacks are dropped).
    pub(crate) fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        let flushed: Vec<HeapSlot> = {
            let mut state = self.state.lock().unwrap();
            state.index.clear();
            state.heap.drain().collect()
        };
        // Run the cancellation callbacks outside the lock.
        for slot in flushed {
            if let TimerCallback::Once(cb) = &mut *slot.entry.callback.lock().unwrap() {
                if let Some(cb) = cb.take() {
                    cb(false);
                }
            }
        }

        self.waiter.post();
    }

    /// The timer thread body.
    pub(crate) fn run(self: Arc<Self>, started: Arc<CountDownLatch>) {
        started.count_down();
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            match self.next_step() {
                Step::Park(deadline) => {
                    self.waiter.wait(deadline);
                }
                Step::FireOnce(cb) => cb(true),
                Step::FirePeriodic(cb) => cb(),
            }
        }
        log::debug!("timer worker exiting");
    }

    fn insert(&self, state: &mut TimerState, deadline: i64, callback: TimerCallback) -> u64 {
        let id = state.next_id;
        state.next_id += 1;
        let seq = state.next_seq;
        state.next_seq += 1;

        let entry = Arc::new(TimerEntry {
            id,
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(callback),
        });
        state.index.insert(id, Arc::clone(&entry));
        state.heap.push(HeapSlot {
            deadline,
            seq,
            entry,
        });

        // A new earliest deadline means the worker's current park time is
        // stale; poke it awake to re-evaluate.
        let is_new_top = state.heap.peek().map(|slot| slot.seq) == Some(seq);
        if is_new_top {
            self.waiter.poke();
        }
        id
    }

    fn next_step(&self) -> Step {
        let mut state = self.state.lock().unwrap();
        loop {
            let now = monotonic_nanos();
            match state.heap.peek() {
                None => return Step::Park(None),
                Some(top) if top.deadline > now => return Step::Park(Some(top.deadline)),
                Some(_) => {}
            }

            let slot = state.heap.pop().unwrap();
            if slot.entry.cancelled.load(Ordering::Relaxed) {
                // Lazy removal of a cancelled entry.
                continue;
            }

            let entry = Arc::clone(&slot.entry);
            let mut cb_guard = entry.callback.lock().unwrap();
            match &mut *cb_guard {
                TimerCallback::Once(cb) => {
                    let cb = cb.take();
                    drop(cb_guard);
                    state.index.remove(&entry.id);
                    match cb {
                        Some(cb) => return Step::FireOnce(cb),
                        None => continue,
                    }
                }
                TimerCallback::Periodic { period, callback } => {
                    let period = *period;
                    let callback = Arc::clone(callback);
                    drop(cb_guard);
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.heap.push(HeapSlot {
                        deadline: slot.deadline + period,
                        seq,
                        entry,
                    });
                    return Step::FirePeriodic(callback);
                }
            }
        }
    }
}
