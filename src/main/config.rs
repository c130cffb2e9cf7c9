//! Runtime configuration.
//!
//! The runtime reads one [`RuntimeConfig`] at bootstrap and never again.
//! How the struct gets populated (file, flags, hard-coded) is the host's
//! business; serde derives are provided so it can be embedded in whatever
//! configuration format the host already uses.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Configuration for [`start_runtime`](crate::start_runtime).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Build one set of scheduling groups per NUMA node instead of one
    /// flat set on node 0.
    pub enable_numa_aware: bool,
    /// Total number of scheduling groups. With `enable_numa_aware` this is
    /// divided evenly across the accessible nodes.
    pub scheduling_groups: usize,
    /// Fiber workers (OS threads) per scheduling group.
    pub workers_per_group: usize,
    /// Pin each fiber worker to a single CPU out of its group's affinity
    /// set (deterministically, by worker index).
    pub fiber_worker_disallow_cpu_migration: bool,
    /// Explicit CPU allow-list in kernel cpulist syntax (`0-3,7`). Empty
    /// means "use the current thread affinity".
    pub fiber_worker_accessible_cpus: String,
    /// Explicit CPU deny-list, subtracted from the current thread
    /// affinity. Mutually exclusive with the allow-list.
    pub fiber_worker_inaccessible_cpus: String,
    /// Steal from same-node groups on every Nth idle wake of a worker.
    /// 0 disables intra-node stealing.
    pub work_stealing_ratio: u64,
    /// Steal from groups on other NUMA nodes on every Nth idle wake.
    /// 0 disables cross-node stealing entirely.
    pub cross_numa_work_stealing_ratio: u64,
    /// Usable stack bytes per fiber (rounded up to whole pages; a guard
    /// page is added on top of this).
    pub fiber_stack_bytes: usize,
    /// Programmatic overrides of the buffer-block pool parameters, applied
    /// before the first block of the given size is allocated.
    #[serde(skip)]
    pub buffer_pool_overrides: Vec<(mempool::BlockSize, mempool::PoolConfig)>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enable_numa_aware: false,
            scheduling_groups: 1,
            workers_per_group: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            fiber_worker_disallow_cpu_migration: false,
            fiber_worker_accessible_cpus: String::new(),
            fiber_worker_inaccessible_cpus: String::new(),
            work_stealing_ratio: 16,
            cross_numa_work_stealing_ratio: 0,
            fiber_stack_bytes: 128 * 1024,
            buffer_pool_overrides: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scheduling_groups == 0 {
            return Err(RuntimeError::ConfigInvalid(
                "scheduling_groups must be at least 1".into(),
            ));
        }
        if self.workers_per_group == 0 {
            return Err(RuntimeError::ConfigInvalid(
                "workers_per_group must be at least 1".into(),
            ));
        }
        if self.fiber_stack_bytes < 4096 {
            return Err(RuntimeError::ConfigInvalid(
                "fiber_stack_bytes must be at least one page".into(),
            ));
        }
        // Also catches the mutual-exclusion error early.
        self.resolve_accessible_cpus()?;
        Ok(())
    }

    /// The CPUs fiber workers may run on, per the allow/deny options.
    pub fn resolve_accessible_cpus(&self) -> Result<Vec<u32>> {
        let allow = parse_cpu_option("fiber_worker_accessible_cpus", &self.fiber_worker_accessible_cpus)?;
        let deny = parse_cpu_option(
            "fiber_worker_inaccessible_cpus",
            &self.fiber_worker_inaccessible_cpus,
        )?;
        topology::accessible_cpus(Some(&allow), Some(&deny))
            .map_err(|e| RuntimeError::ConfigInvalid(e.to_string()))
    }
}

fn parse_cpu_option(name: &str, value: &str) -> Result<Vec<u32>> {
    topology::cpulist::parse(value)
        .map_err(|e| RuntimeError::ConfigInvalid(format!("failed to parse `{name}`: {e}")))
}
