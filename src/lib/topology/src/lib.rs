//! CPU and NUMA topology discovery for the fiber runtime.
//!
//! The runtime needs to answer three questions at bootstrap: which logical
//! CPUs may worker threads run on, which NUMA node does each of those CPUs
//! belong to, and how do we pin a thread to a subset of them. This crate
//! answers all three without holding any state of its own; the NUMA node
//! map is probed from sysfs once and memoized.
//!
//! On platforms without affinity support everything degrades gracefully:
//! pinning becomes a successful no-op and [`accessible_nodes`] returns an
//! empty list, which callers treat as "lay out as UMA".

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

pub mod cpulist;

/// A NUMA node and the accessible logical CPUs attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaNode {
    pub node_id: u32,
    pub logical_cpus: Vec<u32>,
}

#[derive(Debug)]
pub enum TopologyError {
    /// Both an allow-list and a deny-list were given; at most one may be.
    ConflictingCpuLists,
    /// The resolved CPU set came out empty.
    EmptyCpuSet,
    /// A pinning syscall failed.
    Affinity(nix::errno::Errno),
}

impl std::fmt::Display for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyError::ConflictingCpuLists => write!(
                f,
                "at most one of the accessible/inaccessible CPU lists may be specified"
            ),
            TopologyError::EmptyCpuSet => write!(f, "no CPUs are accessible to worker threads"),
            TopologyError::Affinity(errno) => write!(f, "failed to set thread affinity: {errno}"),
        }
    }
}

impl std::error::Error for TopologyError {}

/// Whether thread affinity is supported on this platform.
pub fn affinity_supported() -> bool {
    cfg!(target_os = "linux")
}

/// The logical CPUs the calling thread is currently allowed to run on.
///
/// On platforms without affinity support this falls back to one entry per
/// available hardware thread.
pub fn current_thread_affinity() -> Vec<u32> {
    #[cfg(target_os = "linux")]
    {
        match nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(0)) {
            Ok(set) => {
                let mut cpus = Vec::new();
                for cpu in 0..nix::sched::CpuSet::count() {
                    if set.is_set(cpu).unwrap_or(false) {
                        cpus.push(cpu as u32);
                    }
                }
                cpus
            }
            Err(errno) => {
                log::warn!("sched_getaffinity failed ({errno}); assuming all CPUs");
                fallback_cpus()
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        fallback_cpus()
    }
}

fn fallback_cpus() -> Vec<u32> {
    let n = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (0..n as u32).collect()
}

/// Pin the calling thread to `cpus`. A successful no-op on platforms
/// without affinity support.
pub fn set_current_thread_affinity(cpus: &[u32]) -> Result<(), TopologyError> {
    #[cfg(target_os = "linux")]
    {
        let mut set = nix::sched::CpuSet::new();
        for &cpu in cpus {
            set.set(cpu as usize).map_err(TopologyError::Affinity)?;
        }
        nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set)
            .map_err(TopologyError::Affinity)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = cpus;
        Ok(())
    }
}

/// Run `f` with the calling thread's affinity set to `cpus`, restoring the
/// previous affinity afterwards.
///
/// The bootstrap uses this to allocate a scheduling group's memory on the
/// node its workers will run on: the kernel satisfies allocations from the
/// node the allocating thread is running on.
pub fn with_affinity<T>(cpus: &[u32], f: impl FnOnce() -> T) -> Result<T, TopologyError> {
    if !affinity_supported() || cpus.is_empty() {
        return Ok(f());
    }
    let previous = current_thread_affinity();
    set_current_thread_affinity(cpus)?;
    let result = f();
    if let Err(e) = set_current_thread_affinity(&previous) {
        log::warn!("failed to restore thread affinity: {e}");
    }
    Ok(result)
}

// Maps each logical CPU to its NUMA node, probed from
// /sys/devices/system/node/node<N>/cpulist. Empty when the platform has no
// NUMA support (or no sysfs).
static CPU_TO_NODE: Lazy<BTreeMap<u32, u32>> = Lazy::new(probe_cpu_nodes);

#[cfg(target_os = "linux")]
fn probe_cpu_nodes() -> BTreeMap<u32, u32> {
    let mut map = BTreeMap::new();
    let entries = match std::fs::read_dir("/sys/devices/system/node") {
        Ok(entries) => entries,
        Err(_) => return map,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(id) = name.strip_prefix("node").and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(list) = std::fs::read_to_string(entry.path().join("cpulist")) else {
            continue;
        };
        match cpulist::parse(list.trim()) {
            Ok(cpus) => {
                for cpu in cpus {
                    map.insert(cpu, id);
                }
            }
            Err(e) => log::warn!("ignoring malformed cpulist for {name}: {e}"),
        }
    }
    map
}

#[cfg(not(target_os = "linux"))]
fn probe_cpu_nodes() -> BTreeMap<u32, u32> {
    BTreeMap::new()
}

/// The NUMA node `cpu` belongs to. Node 0 when the platform has no NUMA
/// support or the CPU is unknown to sysfs.
pub fn node_of_cpu(cpu: u32) -> u32 {
    CPU_TO_NODE.get(&cpu).copied().unwrap_or(0)
}

/// The NUMA node the calling thread is currently running on (approximated
/// by the node of the first CPU in its affinity set).
pub fn current_node() -> u32 {
    current_thread_affinity()
        .first()
        .map(|&cpu| node_of_cpu(cpu))
        .unwrap_or(0)
}

/// Resolve the set of logical CPUs worker threads may run on.
///
/// Resolution order: an explicit allow-list wins; otherwise the current
/// thread's affinity, minus an explicit deny-list if one was given. Giving
/// both lists is a configuration error.
pub fn accessible_cpus(
    allow: Option<&[u32]>,
    deny: Option<&[u32]>,
) -> Result<Vec<u32>, TopologyError> {
    if allow.is_some_and(|a| !a.is_empty()) && deny.is_some_and(|d| !d.is_empty()) {
        return Err(TopologyError::ConflictingCpuLists);
    }

    if let Some(allow) = allow.filter(|a| !a.is_empty()) {
        let mut cpus = allow.to_vec();
        cpus.sort_unstable();
        cpus.dedup();
        return Ok(cpus);
    }

    // Inaccessible CPUs are not handed to us by the kernel in the first
    // place, so the thread affinity is already the accessible set.
    let mut cpus = current_thread_affinity();
    if let Some(deny) = deny.filter(|d| !d.is_empty()) {
        cpus.retain(|cpu| !deny.contains(cpu));
    }
    if cpus.is_empty() {
        return Err(TopologyError::EmptyCpuSet);
    }
    Ok(cpus)
}

/// Group `cpus` by the NUMA node they belong to, ordered by node id.
///
/// Returns an empty list on platforms without NUMA support; callers fall
/// back to a UMA layout with node 0.
pub fn accessible_nodes(cpus: &[u32]) -> Vec<NumaNode> {
    if CPU_TO_NODE.is_empty() {
        return Vec::new();
    }
    let mut by_node: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for &cpu in cpus {
        by_node.entry(node_of_cpu(cpu)).or_default().push(cpu);
    }
    by_node
        .into_iter()
        .map(|(node_id, logical_cpus)| NumaNode {
            node_id,
            logical_cpus,
        })
        .collect()
}
