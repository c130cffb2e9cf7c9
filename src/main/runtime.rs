//! Runtime bootstrap, teardown, and the public scheduling entry points.
//!
//! All bootstrap state lives in one [`Runtime`] object behind a process
//! global; the only other global the hot paths touch is the thread-local
//! worker context. Bootstrap resolves the accessible CPUs and NUMA nodes,
//! slices them into scheduling groups (allocating each group's state on
//! its own node), wires the work-stealing victim lists, and starts every
//! worker before returning.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use atomic_refcell::AtomicRefCell;
use crossbeam::deque::Worker as WorkerQueue;
use once_cell::sync::Lazy;
use waiter::CountDownLatch;

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::fiber::stack::{new_stack_pool, FiberStack};
use crate::fiber::{Fiber, FiberHandle};
use crate::sched::fiber_worker::{self, FiberWorker, Victim};
use crate::sched::scheduling_group::SchedulingGroup;
use crate::sched::timer_worker::TimerWorker;

/// A scheduling group together with its threads.
struct GroupRuntime {
    group: Arc<SchedulingGroup>,
    timer: Arc<TimerWorker>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

pub(crate) struct Runtime {
    config: RuntimeConfig,
    groups: Vec<GroupRuntime>,
    /// Node id -> indices into `groups`, for NUMA-local group selection.
    groups_by_node: BTreeMap<u32, Vec<usize>>,
    stack_pool: Arc<mempool::GlobalPool<FiberStack>>,
}

// The installed runtime. Mutated only by start/terminate (serialized by
// BOOTSTRAP); everything else takes short read borrows.
static RUNTIME: Lazy<AtomicRefCell<Option<Arc<Runtime>>>> =
    Lazy::new(|| AtomicRefCell::new(None));

// Serializes start_runtime/terminate_runtime against each other.
static BOOTSTRAP: Mutex<()> = Mutex::new(());

fn current_runtime() -> Result<Arc<Runtime>> {
    RUNTIME
        .borrow()
        .clone()
        .ok_or(RuntimeError::RuntimeStopped)
}

/// Handle for cancelling an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    group: usize,
    id: u64,
}

/// Compute `(node_id, affinity)` for every scheduling group.
fn compute_layout(
    config: &RuntimeConfig,
    cpus: &[u32],
    nodes: &[topology::NumaNode],
) -> Result<Vec<(u32, Vec<u32>)>> {
    let workers = config.workers_per_group;
    let pinned = config.fiber_worker_disallow_cpu_migration;

    if pinned && cpus.len() < config.scheduling_groups * workers {
        return Err(RuntimeError::ConfigInvalid(format!(
            "pinning workers needs {} CPUs but only {} are accessible",
            config.scheduling_groups * workers,
            cpus.len()
        )));
    }

    if config.enable_numa_aware && !nodes.is_empty() {
        let groups_per_node = config.scheduling_groups / nodes.len();
        if groups_per_node == 0 {
            return Err(RuntimeError::ConfigInvalid(format!(
                "scheduling_groups ({}) must be at least the number of NUMA nodes ({})",
                config.scheduling_groups,
                nodes.len()
            )));
        }
        let mut layout = Vec::new();
        for node in nodes {
            for slot in 0..groups_per_node {
                let affinity = if pinned {
                    let start = slot * workers;
                    let end = start + workers;
                    if end > node.logical_cpus.len() {
                        return Err(RuntimeError::ConfigInvalid(format!(
                            "node {} has {} accessible CPUs, need {} for its pinned groups",
                            node.node_id,
                            node.logical_cpus.len(),
                            end
                        )));
                    }
                    node.logical_cpus[start..end].to_vec()
                } else {
                    node.logical_cpus.clone()
                };
                layout.push((node.node_id, affinity));
            }
        }
        Ok(layout)
    } else {
        if config.enable_numa_aware {
            log::info!("NUMA awareness requested but no NUMA topology found; using UMA layout");
        }
        if pinned && nodes.len() > 1 {
            log::warn!(
                "CPU migration of fiber workers is disallowed and the UMA layout spans \
                 multiple NUMA nodes; performance will likely degrade"
            );
        }
        let mut layout = Vec::new();
        for index in 0..config.scheduling_groups {
            let affinity = if pinned {
                cpus[index * workers..(index + 1) * workers].to_vec()
            } else {
                cpus.to_vec()
            };
            layout.push((0, affinity));
        }
        Ok(layout)
    }
}

/// Start the fiber runtime. Returns once every fiber worker and timer
/// worker has entered its loop. Idempotent: if the runtime is already
/// running, the new configuration is ignored.
pub fn start_runtime(config: RuntimeConfig) -> Result<()> {
    let _boot = BOOTSTRAP.lock().unwrap_or_else(|e| e.into_inner());
    if RUNTIME.borrow().is_some() {
        log::warn!("start_runtime called while already running; ignoring the new configuration");
        return Ok(());
    }

    config.validate()?;
    let cpus = config.resolve_accessible_cpus()?;
    let nodes = topology::accessible_nodes(&cpus);

    for (size, pool_config) in &config.buffer_pool_overrides {
        if !mempool::override_pool_config(*size, pool_config.clone()) {
            log::warn!("buffer pool override for {size:?} ignored: pool already in use");
        }
    }

    let layout = compute_layout(&config, &cpus, &nodes)?;
    let workers = config.workers_per_group;
    log::info!(
        "starting {} fiber workers per group, for a total of {} groups over {} CPUs",
        workers,
        layout.len(),
        cpus.len()
    );

    let stack_pool = new_stack_pool(config.fiber_stack_bytes);
    let started = Arc::new(CountDownLatch::new(layout.len() * (workers + 1)));

    // Create the group state on the node it will run on: allocations made
    // while bound to the node's CPUs come from that node's memory.
    let mut group_arcs: Vec<(Arc<SchedulingGroup>, Arc<TimerWorker>)> = Vec::new();
    let mut groups_by_node: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (index, (node_id, affinity)) in layout.iter().enumerate() {
        let group = topology::with_affinity(affinity, || {
            SchedulingGroup::new(index, *node_id, affinity.clone(), workers)
        })
        .map_err(|e| RuntimeError::ConfigInvalid(e.to_string()))?;
        let timer = TimerWorker::new();
        group.set_timer(Arc::clone(&timer));
        groups_by_node.entry(*node_id).or_default().push(index);
        group_arcs.push((group, timer));
    }

    // Victim lists: every other group, gated by the per-pair steal ratio.
    // A ratio of zero leaves the pair unwired entirely.
    let victim_lists: Vec<Vec<Victim>> = group_arcs
        .iter()
        .map(|(thief, _)| {
            group_arcs
                .iter()
                .filter(|(victim, _)| victim.index != thief.index)
                .filter_map(|(victim, _)| {
                    let ratio = if victim.node_id == thief.node_id {
                        config.work_stealing_ratio
                    } else {
                        config.cross_numa_work_stealing_ratio
                    };
                    (ratio != 0).then(|| Victim {
                        group: Arc::clone(victim),
                        steal_every_n: ratio,
                    })
                })
                .collect()
        })
        .collect();

    let mut groups = Vec::new();
    for (index, (group, timer)) in group_arcs.iter().enumerate() {
        let mut threads = Vec::new();

        threads.push(
            std::thread::Builder::new()
                .name("weft-timer".to_string())
                .spawn({
                    let timer = Arc::clone(timer);
                    let started = Arc::clone(&started);
                    move || timer.run(started)
                })
                .expect("failed to spawn timer worker thread"),
        );

        let queues: Vec<WorkerQueue<Box<Fiber>>> =
            (0..workers).map(|_| WorkerQueue::new_fifo()).collect();
        group.register_stealers(queues.iter().map(|q| q.stealer()).collect());

        for (worker_index, queue) in queues.into_iter().enumerate() {
            let pin_cpu = config
                .fiber_worker_disallow_cpu_migration
                .then(|| group.affinity[worker_index]);
            let worker = FiberWorker::new(
                Arc::clone(group),
                worker_index,
                queue,
                victim_lists[index].clone(),
                Arc::clone(&stack_pool),
                pin_cpu,
            );
            threads.push(
                std::thread::Builder::new()
                    .name("weft-worker".to_string())
                    .spawn({
                        let started = Arc::clone(&started);
                        move || worker.run(started)
                    })
                    .expect("failed to spawn fiber worker thread"),
            );
        }

        groups.push(GroupRuntime {
            group: Arc::clone(group),
            timer: Arc::clone(timer),
            threads: Mutex::new(threads),
        });
    }

    started.wait();

    *RUNTIME.borrow_mut() = Some(Arc::new(Runtime {
        config,
        groups,
        groups_by_node,
        stack_pool,
    }));
    Ok(())
}

/// Stop and join every worker. Idempotent; afterwards all scheduling
/// calls fail with `RuntimeStopped`. No fiber is dropped silently:
/// fibers still pending observe cancellation through their completion
/// handles, and blocked fibers see `Cancelled` at their suspension point.
pub fn terminate_runtime() {
    let _boot = BOOTSTRAP.lock().unwrap_or_else(|e| e.into_inner());
    let Some(runtime) = RUNTIME.borrow_mut().take() else {
        return;
    };

    log::info!("terminating the fiber runtime");
    // Stopping the timer first flushes parked sleepers back to their run
    // queues while the workers are still draining.
    for gr in &runtime.groups {
        gr.timer.stop();
        gr.group.stop();
    }
    for gr in &runtime.groups {
        let threads: Vec<_> = gr.threads.lock().unwrap().drain(..).collect();
        for thread in threads {
            if thread.join().is_err() {
                log::warn!("a runtime thread panicked during shutdown");
            }
        }
    }
}

/// Spawn a fiber on the given scheduling group.
pub fn spawn_on(group: usize, f: impl FnOnce() + Send + 'static) -> Result<FiberHandle> {
    let runtime = current_runtime()?;
    assert!(
        group < runtime.groups.len(),
        "scheduling group index out of range"
    );
    let target = &runtime.groups[group].group;
    if target.is_stopping() {
        return Err(RuntimeError::RuntimeStopped);
    }

    let stack = fiber_worker::allocate_stack(&runtime.stack_pool)
        .ok_or(RuntimeError::AllocationFailed)?;
    let (fiber, handle) = Fiber::new(group, stack, f);
    target.schedule(fiber);
    Ok(handle)
}

/// Spawn a fiber on the nearest scheduling group.
pub fn spawn(f: impl FnOnce() + Send + 'static) -> Result<FiberHandle> {
    spawn_on(nearest_scheduling_group()?, f)
}

/// Arm a one-shot timer on `group`. At `deadline` the callback is posted
/// to the group's run queue as a fresh fiber (it never runs on the timer
/// thread). Cancellation at teardown suppresses the callback entirely.
pub fn arm_timer(
    group: usize,
    deadline: i64,
    callback: impl FnOnce() + Send + 'static,
) -> Result<TimerHandle> {
    let runtime = current_runtime()?;
    assert!(
        group < runtime.groups.len(),
        "scheduling group index out of range"
    );
    let gr = &runtime.groups[group];
    let target = Arc::clone(&gr.group);
    let stack_pool = Arc::clone(&runtime.stack_pool);

    let id = gr.timer.arm_once(
        deadline,
        Box::new(move |fired| {
            if !fired {
                return;
            }
            let Some(stack) = fiber_worker::allocate_stack(&stack_pool) else {
                log::warn!("dropping expired timer callback: stack allocation failed");
                return;
            };
            let (fiber, _handle) = Fiber::new(target.index, stack, callback);
            target.schedule(fiber);
        }),
    )?;
    Ok(TimerHandle { group, id })
}

/// Arm a periodic timer on `group`, first firing one period from now and
/// then on every period boundary (measured from the scheduled deadline,
/// so drift does not accumulate) until cancelled.
pub fn arm_periodic_timer(
    group: usize,
    period: i64,
    callback: impl Fn() + Send + Sync + 'static,
) -> Result<TimerHandle> {
    let runtime = current_runtime()?;
    assert!(
        group < runtime.groups.len(),
        "scheduling group index out of range"
    );
    let gr = &runtime.groups[group];
    let target = Arc::clone(&gr.group);
    let stack_pool = Arc::clone(&runtime.stack_pool);
    let callback = Arc::new(callback);

    let id = gr.timer.arm_periodic(
        period,
        Arc::new(move || {
            let Some(stack) = fiber_worker::allocate_stack(&stack_pool) else {
                log::warn!("dropping periodic timer callback: stack allocation failed");
                return;
            };
            let callback = Arc::clone(&callback);
            let (fiber, _handle) = Fiber::new(target.index, stack, move || (callback)());
            target.schedule(fiber);
        }),
    )?;
    Ok(TimerHandle { group, id })
}

/// Cancel a timer. Returns whether the entry was observed not yet fired;
/// best-effort, a concurrently-expiring callback may still run. `false`
/// once the runtime is stopped.
pub fn cancel_timer(handle: TimerHandle) -> bool {
    let Ok(runtime) = current_runtime() else {
        return false;
    };
    match runtime.groups.get(handle.group) {
        Some(gr) => gr.timer.cancel(handle.id),
        None => false,
    }
}

// Non-worker threads spread their load over the eligible groups by
// advancing a randomly seeded per-thread counter on every call.
fn next_sample() -> u64 {
    std::thread_local! {
        static NEXT: once_cell::unsync::Lazy<AtomicU64> =
            once_cell::unsync::Lazy::new(|| AtomicU64::new(rand::random()));
    }
    NEXT.with(|next| next.fetch_add(1, Ordering::Relaxed))
}

/// The scheduling group the caller belongs to: a fiber worker always gets
/// its own group; other threads get a NUMA-local group when NUMA
/// awareness is on, or any group otherwise, re-sampled per call.
pub fn nearest_scheduling_group() -> Result<usize> {
    if let Some(index) = fiber_worker::current_group_index() {
        return Ok(index);
    }

    let runtime = current_runtime()?;
    let sample = next_sample() as usize;
    if runtime.config.enable_numa_aware {
        if let Some(groups) = runtime.groups_by_node.get(&topology::current_node()) {
            if !groups.is_empty() {
                return Ok(groups[sample % groups.len()]);
            }
        }
    }
    Ok(sample % runtime.groups.len())
}

/// Number of scheduling groups; 0 when the runtime is not running.
pub fn get_scheduling_group_count() -> usize {
    RUNTIME.borrow().as_ref().map_or(0, |rt| rt.groups.len())
}

/// Fiber workers per scheduling group; 0 when the runtime is not running.
pub fn get_scheduling_group_size() -> usize {
    RUNTIME
        .borrow()
        .as_ref()
        .map_or(0, |rt| rt.config.workers_per_group)
}

/// The NUMA node group `index` is assigned to.
pub fn get_scheduling_group_assigned_node(index: usize) -> Option<u32> {
    RUNTIME
        .borrow()
        .as_ref()
        .and_then(|rt| rt.groups.get(index).map(|gr| gr.group.node_id))
}

/// Work-stealing traffic counters for group `index`: successful foreign
/// steal operations against it, and steals its own workers made across
/// NUMA nodes. With `cross_numa_work_stealing_ratio = 0` the second
/// counter stays at zero.
pub fn get_scheduling_group_steal_counts(index: usize) -> Option<(u64, u64)> {
    RUNTIME.borrow().as_ref().and_then(|rt| {
        rt.groups.get(index).map(|gr| {
            (
                gr.group.stolen_from_count(),
                gr.group.cross_node_steal_count(),
            )
        })
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    // The runtime is a process singleton; tests that start it must not
    // overlap.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) fn with_runtime(config: RuntimeConfig, f: impl FnOnce()) {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        terminate_runtime();
        start_runtime(config).unwrap();
        f();
        terminate_runtime();
    }

    pub(crate) fn small_config(groups: usize, workers: usize) -> RuntimeConfig {
        RuntimeConfig {
            scheduling_groups: groups,
            workers_per_group: workers,
            work_stealing_ratio: 1,
            fiber_stack_bytes: 64 * 1024,
            ..Default::default()
        }
    }

    pub(crate) fn steal_counters(group: usize) -> (u64, u64) {
        get_scheduling_group_steal_counts(group).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use waiter::monotonic_nanos;

    use super::test_support::{self, small_config, with_runtime};
    use super::*;
    use crate::fiber::FiberExit;

    const MS: i64 = 1_000_000;

    #[test]
    fn test_layout_uma_pinned_slices() {
        // {numa off, groups 2, workers 2, migration off} over CPUs 0-3
        // slices disjoint pairs.
        let config = RuntimeConfig {
            scheduling_groups: 2,
            workers_per_group: 2,
            fiber_worker_disallow_cpu_migration: true,
            ..Default::default()
        };
        let layout = compute_layout(&config, &[0, 1, 2, 3], &[]).unwrap();
        assert_eq!(layout, vec![(0, vec![0, 1]), (0, vec![2, 3])]);
    }

    #[test]
    fn test_layout_uma_unpinned_shares_all_cpus() {
        let config = RuntimeConfig {
            scheduling_groups: 2,
            workers_per_group: 2,
            ..Default::default()
        };
        let layout = compute_layout(&config, &[0, 1, 2, 3], &[]).unwrap();
        assert_eq!(layout.len(), 2);
        assert!(layout.iter().all(|(node, cpus)| *node == 0 && cpus == &[0, 1, 2, 3]));
    }

    #[test]
    fn test_layout_rejects_overcommitted_pinning() {
        let config = RuntimeConfig {
            scheduling_groups: 2,
            workers_per_group: 2,
            fiber_worker_disallow_cpu_migration: true,
            ..Default::default()
        };
        let err = compute_layout(&config, &[0, 1, 2], &[]).unwrap_err();
        assert!(matches!(err, RuntimeError::ConfigInvalid(_)));
    }

    #[test]
    fn test_layout_numa_splits_groups_across_nodes() {
        let nodes = vec![
            topology::NumaNode {
                node_id: 0,
                logical_cpus: vec![0, 1],
            },
            topology::NumaNode {
                node_id: 1,
                logical_cpus: vec![2, 3],
            },
        ];
        let config = RuntimeConfig {
            enable_numa_aware: true,
            scheduling_groups: 2,
            workers_per_group: 2,
            ..Default::default()
        };
        let layout = compute_layout(&config, &[0, 1, 2, 3], &nodes).unwrap();
        assert_eq!(layout, vec![(0, vec![0, 1]), (1, vec![2, 3])]);
    }

    #[test]
    fn test_start_and_terminate_lifecycle() {
        with_runtime(small_config(2, 1), || {
            assert_eq!(get_scheduling_group_count(), 2);
            assert_eq!(get_scheduling_group_size(), 1);
            assert_eq!(get_scheduling_group_assigned_node(0), Some(0));
            assert_eq!(get_scheduling_group_assigned_node(9), None);

            // Idempotent while running.
            start_runtime(small_config(8, 8)).unwrap();
            assert_eq!(get_scheduling_group_count(), 2);
        });

        // Idempotent after stop, and everything reports stopped.
        terminate_runtime();
        assert_eq!(get_scheduling_group_count(), 0);
        assert!(matches!(spawn(|| {}), Err(RuntimeError::RuntimeStopped)));
        assert!(matches!(
            nearest_scheduling_group(),
            Err(RuntimeError::RuntimeStopped)
        ));
    }

    #[test]
    fn test_fibers_run_to_completion() {
        with_runtime(small_config(2, 2), || {
            let counter = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..200)
                .map(|i| {
                    let counter = Arc::clone(&counter);
                    spawn_on(i % 2, move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    })
                    .unwrap()
                })
                .collect();

            for handle in &handles {
                assert_eq!(
                    handle.join_deadline(monotonic_nanos() + 5_000 * MS).unwrap(),
                    FiberExit::Completed
                );
            }
            assert_eq!(counter.load(Ordering::Relaxed), 200);
        });
    }

    #[test]
    fn test_single_worker_runs_fibers_in_submission_order() {
        with_runtime(small_config(1, 1), || {
            let order = Arc::new(Mutex::new(Vec::new()));
            let handles: Vec<_> = (0..50)
                .map(|i| {
                    let order = Arc::clone(&order);
                    spawn_on(0, move || order.lock().unwrap().push(i)).unwrap()
                })
                .collect();
            for handle in handles {
                handle.join();
            }
            assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
        });
    }

    #[test]
    fn test_yield_interleaves_fibers() {
        with_runtime(small_config(1, 1), || {
            let trace = Arc::new(Mutex::new(Vec::new()));
            let handles: Vec<_> = (0..2)
                .map(|id| {
                    let trace = Arc::clone(&trace);
                    spawn_on(0, move || {
                        for round in 0..3 {
                            trace.lock().unwrap().push((id, round));
                            crate::yield_now();
                        }
                    })
                    .unwrap()
                })
                .collect();
            for handle in handles {
                handle.join();
            }
            // With one worker and cooperative yields the two fibers must
            // alternate rounds.
            let trace = trace.lock().unwrap();
            for round in 0..3 {
                let mut ids: Vec<_> = trace
                    .iter()
                    .filter(|(_, r)| *r == round)
                    .map(|(id, _)| *id)
                    .collect();
                ids.sort_unstable();
                assert_eq!(ids, vec![0, 1]);
            }
        });
    }

    #[test]
    fn test_panicking_fiber_is_contained() {
        with_runtime(small_config(1, 1), || {
            let panicker = spawn_on(0, || panic!("boom")).unwrap();
            let survivor = spawn_on(0, || {}).unwrap();
            assert_eq!(panicker.join(), FiberExit::Panicked);
            assert_eq!(survivor.join(), FiberExit::Completed);
        });
    }

    #[test]
    fn test_sleep_waits_and_wakes() {
        with_runtime(small_config(1, 1), || {
            let handle = spawn_on(0, || {
                let start = monotonic_nanos();
                crate::sleep_for(30 * MS).unwrap();
                assert!(monotonic_nanos() - start >= 30 * MS);
            })
            .unwrap();
            assert_eq!(handle.join(), FiberExit::Completed);
        });
    }

    #[test]
    fn test_sleeping_fibers_are_cancelled_at_teardown() {
        // The closure terminates the runtime itself; the trailing
        // terminate inside with_runtime is then a no-op.
        with_runtime(small_config(1, 1), || {
            let outcome = Arc::new(Mutex::new(None));
            let outcome_clone = Arc::clone(&outcome);
            let handle = spawn_on(0, move || {
                *outcome_clone.lock().unwrap() = Some(crate::sleep_for(60_000 * MS));
            })
            .unwrap();

            std::thread::sleep(Duration::from_millis(50));
            terminate_runtime();

            // The fiber was woken with cancellation and finished.
            assert_eq!(handle.join(), FiberExit::Completed);
            assert!(matches!(
                *outcome.lock().unwrap(),
                Some(Err(RuntimeError::Cancelled))
            ));
        });
    }

    #[test]
    fn test_timer_fires_on_a_fiber() {
        with_runtime(small_config(1, 1), || {
            let fired = Arc::new(AtomicUsize::new(0));
            let fired_clone = Arc::clone(&fired);
            arm_timer(0, monotonic_nanos() + 10 * MS, move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

            std::thread::sleep(Duration::from_millis(200));
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_timer_cancel_before_deadline() {
        with_runtime(small_config(1, 1), || {
            let fired = Arc::new(AtomicUsize::new(0));
            let fired_clone = Arc::clone(&fired);
            let handle = arm_timer(0, monotonic_nanos() + 80 * MS, move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

            std::thread::sleep(Duration::from_millis(20));
            assert!(cancel_timer(handle));
            std::thread::sleep(Duration::from_millis(150));
            assert_eq!(fired.load(Ordering::SeqCst), 0);
        });
        // After teardown cancellation reports false.
        assert!(!cancel_timer(TimerHandle { group: 0, id: 1 }));
    }

    #[test]
    fn test_periodic_timer_fires_until_cancelled() {
        with_runtime(small_config(1, 1), || {
            let count = Arc::new(AtomicUsize::new(0));
            let count_clone = Arc::clone(&count);
            let handle = arm_periodic_timer(0, 10 * MS, move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

            std::thread::sleep(Duration::from_millis(300));
            assert!(count.load(Ordering::SeqCst) >= 3);
            assert!(cancel_timer(handle));
        });
    }

    #[test]
    fn test_many_timers_fire_with_bounded_slack() {
        with_runtime(small_config(1, 2), || {
            let fired = Arc::new(AtomicUsize::new(0));
            let late = Arc::new(AtomicUsize::new(0));
            let now = monotonic_nanos();
            for i in 0..200 {
                let fired = Arc::clone(&fired);
                let late = Arc::clone(&late);
                let deadline = now + (1 + i % 100) * MS;
                arm_timer(0, deadline, move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                    // Never early; generous lateness bound for CI.
                    let delay = monotonic_nanos() - deadline;
                    assert!(delay >= 0);
                    if delay > 200 * MS {
                        late.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
            }
            std::thread::sleep(Duration::from_millis(600));
            assert_eq!(fired.load(Ordering::SeqCst), 200);
            assert_eq!(late.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn test_nearest_group_is_stable_on_workers() {
        with_runtime(small_config(2, 1), || {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let seen_clone = Arc::clone(&seen);
            spawn_on(1, move || {
                for _ in 0..3 {
                    seen_clone
                        .lock()
                        .unwrap()
                        .push(nearest_scheduling_group().unwrap());
                }
            })
            .unwrap()
            .join();
            assert_eq!(*seen.lock().unwrap(), vec![1, 1, 1]);

            // Off-worker calls hit some valid group.
            let group = nearest_scheduling_group().unwrap();
            assert!(group < 2);
        });
    }

    #[test]
    fn test_stealing_between_groups() {
        with_runtime(small_config(2, 1), || {
            let (stolen_before, _) = test_support::steal_counters(0);

            // Group 0's single worker is saturated with slow fibers while
            // group 1 idles; group 1 must pick some of them up.
            let handles: Vec<_> = (0..64)
                .map(|_| {
                    spawn_on(0, || {
                        let until = monotonic_nanos() + MS;
                        while monotonic_nanos() < until {
                            std::hint::spin_loop();
                        }
                    })
                    .unwrap()
                })
                .collect();
            for handle in handles {
                assert_eq!(handle.join(), FiberExit::Completed);
            }

            let (stolen_after, cross) = test_support::steal_counters(0);
            assert!(
                stolen_after > stolen_before,
                "no fibers were stolen from the busy group"
            );
            // Single-node host and cross ratio 0: never any cross-node traffic.
            assert_eq!(cross, 0);
        });
    }

    #[test]
    fn test_cross_numa_ratio_zero_wires_no_cross_node_victims() {
        // Two synthetic nodes; cross ratio 0 must only wire same-node pairs.
        let nodes = vec![
            topology::NumaNode {
                node_id: 0,
                logical_cpus: vec![0],
            },
            topology::NumaNode {
                node_id: 1,
                logical_cpus: vec![1],
            },
        ];
        let config = RuntimeConfig {
            enable_numa_aware: true,
            scheduling_groups: 2,
            workers_per_group: 1,
            cross_numa_work_stealing_ratio: 0,
            ..Default::default()
        };
        let layout = compute_layout(&config, &[0, 1], &nodes).unwrap();
        assert_eq!(layout.len(), 2);
        assert_ne!(layout[0].0, layout[1].0);
        // With one group per node, every potential victim is cross-node.
        // (The wiring itself is exercised through start_runtime in the
        // steal test above; here we only pin down the layout part.)
    }
}
