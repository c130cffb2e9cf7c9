//! Fiber stacks: anonymous mappings with a guard page, recycled through
//! the shared object pools rather than unmapped on every fiber exit.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use mempool::{GlobalPool, PoolConfig};
use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// One mapped fiber stack. The lowest page is PROT_NONE so overflow traps
/// instead of corrupting the adjacent mapping.
#[derive(Debug)]
pub(crate) struct FiberStack {
    base: NonNull<libc::c_void>,
    mapped_len: usize,
    guard_len: usize,
}

// The stack is only touched by the fiber that owns it, which runs on one
// worker thread at a time.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Map a stack with at least `usable_bytes` of usable space. `None` on
    /// mapping failure (the caller reports allocation failure).
    pub(crate) fn map(usable_bytes: usize) -> Option<FiberStack> {
        let page = page_size();
        let usable = usable_bytes.div_ceil(page) * page;
        let mapped_len = usable + page;

        let flags = {
            #[cfg(target_os = "linux")]
            {
                MapFlags::MAP_PRIVATE | MapFlags::MAP_STACK | MapFlags::MAP_ANONYMOUS
            }
            #[cfg(not(target_os = "linux"))]
            {
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS
            }
        };

        let base = unsafe {
            mmap(
                None,
                NonZeroUsize::new(mapped_len)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
                None::<std::fs::File>,
                0,
            )
        }
        .map_err(|errno| {
            log::warn!("fiber stack mmap of {mapped_len} bytes failed: {errno}");
            errno
        })
        .ok()?;
        let base = NonNull::new(base)?;

        // Guard page at the low end; stacks grow downwards.
        if let Err(errno) = unsafe { mprotect(base.as_ptr(), page, ProtFlags::PROT_NONE) } {
            log::warn!("fiber stack guard mprotect failed: {errno}");
            let _ = unsafe { munmap(base.as_ptr(), mapped_len) };
            return None;
        }

        Some(FiberStack {
            base,
            mapped_len,
            guard_len: page,
        })
    }

    /// The high end of the stack; 16-byte aligned by construction (page
    /// alignment of the mapping).
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { (self.base.as_ptr() as *mut u8).add(self.mapped_len) }
    }

    pub(crate) fn usable_bytes(&self) -> usize {
        self.mapped_len - self.guard_len
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        if let Err(errno) = unsafe { munmap(self.base.as_ptr(), self.mapped_len) } {
            log::warn!("fiber stack munmap failed: {errno}");
        }
    }
}

/// Build the process-wide pool fiber stacks are recycled through. Worker
/// threads put per-thread caches in front of it.
pub(crate) fn new_stack_pool(usable_bytes: usize) -> Arc<GlobalPool<FiberStack>> {
    GlobalPool::new(
        PoolConfig {
            low_watermark: 0,
            high_watermark: 1024,
            max_idle: Duration::from_secs(10),
            min_thread_cache: 32,
            transfer_batch: 16,
        },
        move || FiberStack::map(usable_bytes),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rounds_to_pages() {
        let stack = FiberStack::map(1000).unwrap();
        assert_eq!(stack.usable_bytes() % page_size(), 0);
        assert!(stack.usable_bytes() >= 1000);
        assert_eq!(stack.top() as usize % 16, 0);
    }

    #[test]
    fn test_stack_is_writable_to_the_top() {
        let stack = FiberStack::map(16 * 1024).unwrap();
        unsafe {
            let top = stack.top();
            top.sub(1).write(0xab);
            top.sub(stack.usable_bytes()).write(0xcd);
            assert_eq!(top.sub(1).read(), 0xab);
        }
    }

    #[test]
    fn test_pool_recycles_stacks() {
        let pool = new_stack_pool(16 * 1024);
        let stack = pool.get().unwrap();
        let top = stack.top() as usize;
        pool.put(stack);
        let stack = pool.get().unwrap();
        assert_eq!(stack.top() as usize, top);
    }
}
