//! Pooled, reference-counted byte blocks.
//!
//! Fibers move bytes between each other in fixed-size blocks shared by
//! [`RefPtr`] handles. Three sizes are pre-registered, each with its own
//! pool parameters (bigger blocks are retained in smaller numbers). When
//! the last handle to a fixed-size block drops, the block is not freed: it
//! goes back to the dropping thread's cache with its count reset to 1.
//!
//! A fourth kind wraps caller-owned memory behind the same handle type;
//! those blocks are never pooled and run a caller-supplied release
//! function instead.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::OnceCell;
use static_assertions::const_assert;

use crate::pool::{GlobalPool, LocalPool, PoolConfig};
use crate::ref_ptr::{RefCount, RefPtr, Refable};

pub const SMALL_BLOCK_BYTES: usize = 4096;
pub const MEDIUM_BLOCK_BYTES: usize = 65536;
pub const LARGE_BLOCK_BYTES: usize = 1048576;

const_assert!(SMALL_BLOCK_BYTES < MEDIUM_BLOCK_BYTES);
const_assert!(MEDIUM_BLOCK_BYTES < LARGE_BLOCK_BYTES);

/// The pre-registered fixed block sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSize {
    Small,
    Medium,
    Large,
}

impl BlockSize {
    pub const ALL: [BlockSize; 3] = [BlockSize::Small, BlockSize::Medium, BlockSize::Large];

    pub fn bytes(self) -> usize {
        match self {
            BlockSize::Small => SMALL_BLOCK_BYTES,
            BlockSize::Medium => MEDIUM_BLOCK_BYTES,
            BlockSize::Large => LARGE_BLOCK_BYTES,
        }
    }

    fn index(self) -> usize {
        match self {
            BlockSize::Small => 0,
            BlockSize::Medium => 1,
            BlockSize::Large => 2,
        }
    }
}

/// A byte block shared across fibers via [`RefPtr<BufferBlock>`].
pub struct BufferBlock {
    refs: RefCount,
    storage: Storage,
}

enum Storage {
    Fixed {
        data: Box<[u8]>,
        size: BlockSize,
    },
    External {
        ptr: *mut u8,
        len: usize,
        release: unsafe fn(*mut u8, usize),
    },
}

// Fixed storage is plain owned bytes. External storage is covered by the
// `external` constructor's contract (the memory must be valid for any
// thread until released).
unsafe impl Send for BufferBlock {}
unsafe impl Sync for BufferBlock {}

impl BufferBlock {
    fn fixed(size: BlockSize) -> Self {
        Self {
            refs: RefCount::new(),
            storage: Storage::Fixed {
                data: vec![0u8; size.bytes()].into_boxed_slice(),
                size,
            },
        }
    }

    /// Wrap caller-owned memory in a block handle. `release` runs exactly
    /// once, when the last handle drops.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes, from any
    /// thread, until `release(ptr, len)` is called; nothing else may free
    /// or mutate the memory in the meantime.
    pub unsafe fn external(
        ptr: *mut u8,
        len: usize,
        release: unsafe fn(*mut u8, usize),
    ) -> RefPtr<BufferBlock> {
        RefPtr::new(Self {
            refs: RefCount::new(),
            storage: Storage::External { ptr, len, release },
        })
    }

    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Fixed { data, .. } => data.len(),
            Storage::External { len, .. } => *len,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.storage, Storage::External { .. })
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Fixed { data, .. } => data,
            Storage::External { ptr, len, .. } => unsafe {
                std::slice::from_raw_parts(*ptr, *len)
            },
        }
    }

    /// Mutable access; reach this through [`RefPtr::get_mut`], which
    /// enforces sole ownership.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Fixed { data, .. } => data,
            Storage::External { ptr, len, .. } => unsafe {
                std::slice::from_raw_parts_mut(*ptr, *len)
            },
        }
    }
}

unsafe impl Refable for BufferBlock {
    fn ref_count(&self) -> &RefCount {
        &self.refs
    }

    unsafe fn destroy(this: NonNull<Self>) {
        let block = unsafe { Box::from_raw(this.as_ptr()) };
        match &block.storage {
            Storage::Fixed { size, .. } => {
                let size = *size;
                block.refs.reset_for_reuse();
                with_local_pool(size, |pool| pool.put(block));
            }
            Storage::External { ptr, len, release } => {
                let (ptr, len, release) = (*ptr, *len, *release);
                drop(block);
                unsafe { release(ptr, len) };
            }
        }
    }
}

/// Allocate a block of the given fixed size from the calling thread's
/// pool. The returned handle is the sole owner (count 1). `None` only if
/// the underlying allocation failed.
pub fn make_block(size: BlockSize) -> Option<RefPtr<BufferBlock>> {
    let block = with_local_pool(size, |pool| pool.get())?;
    debug_assert_eq!(block.refs.load(), 1);
    debug_assert!(!block.is_external());
    let ptr = NonNull::from(Box::leak(block));
    Some(unsafe { RefPtr::adopt(ptr) })
}

/// Allocate a block of the default (small) size.
pub fn make_native_block() -> Option<RefPtr<BufferBlock>> {
    make_block(BlockSize::Small)
}

/// Replace the pool parameters for one block size. Only effective before
/// the first block of that size is allocated anywhere in the process;
/// returns whether the override took.
pub fn override_pool_config(size: BlockSize, config: PoolConfig) -> bool {
    if global_pool_cell(size).get().is_some() {
        return false;
    }
    config_overrides().lock().unwrap()[size.index()] = Some(config);
    // The pool may have been initialized concurrently after the check; the
    // caller is expected to do this during single-threaded bootstrap.
    global_pool_cell(size).get().is_none()
}

/// Number of blocks of `size` cached by the calling thread.
pub fn thread_cached_blocks(size: BlockSize) -> usize {
    with_local_pool(size, |pool| pool.cached())
}

/// Number of blocks of `size` idle in the process-global pool.
pub fn global_idle_blocks(size: BlockSize) -> usize {
    global_pool(size).idle_count()
}

type BlockPool = Arc<GlobalPool<Box<BufferBlock>>>;

fn global_pool_cell(size: BlockSize) -> &'static OnceCell<BlockPool> {
    static CELLS: [OnceCell<BlockPool>; 3] = [OnceCell::new(), OnceCell::new(), OnceCell::new()];
    &CELLS[size.index()]
}

fn config_overrides() -> &'static Mutex<[Option<PoolConfig>; 3]> {
    static OVERRIDES: Mutex<[Option<PoolConfig>; 3]> = Mutex::new([None, None, None]);
    &OVERRIDES
}

fn global_pool(size: BlockSize) -> &'static BlockPool {
    global_pool_cell(size).get_or_init(|| {
        let config = config_overrides().lock().unwrap()[size.index()]
            .clone()
            .unwrap_or_else(|| default_pool_config(size));
        GlobalPool::new(config, move || Some(Box::new(BufferBlock::fixed(size))))
    })
}

fn default_pool_config(size: BlockSize) -> PoolConfig {
    let max_idle = Duration::from_secs(10);
    match size {
        // 64M per node retained globally, 16M per thread, 4M per transfer.
        BlockSize::Small => PoolConfig {
            low_watermark: 16384,
            high_watermark: usize::MAX,
            max_idle,
            min_thread_cache: 4096,
            transfer_batch: 1024,
        },
        BlockSize::Medium => PoolConfig {
            low_watermark: 1024,
            high_watermark: usize::MAX,
            max_idle,
            min_thread_cache: 256,
            transfer_batch: 64,
        },
        BlockSize::Large => PoolConfig {
            low_watermark: 128,
            high_watermark: usize::MAX,
            max_idle,
            min_thread_cache: 64,
            transfer_batch: 16,
        },
    }
}

fn with_local_pool<R>(
    size: BlockSize,
    f: impl FnOnce(&mut LocalPool<Box<BufferBlock>>) -> R,
) -> R {
    std::thread_local! {
        static CACHES: RefCell<[Option<LocalPool<Box<BufferBlock>>>; 3]> =
            const { RefCell::new([None, None, None]) };
    }
    CACHES.with(|caches| {
        let mut caches = caches.borrow_mut();
        let pool = caches[size.index()]
            .get_or_insert_with(|| LocalPool::new(Arc::clone(global_pool(size))));
        f(pool)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_native_block_is_small() {
        let block = make_native_block().unwrap();
        assert_eq!(block.capacity(), SMALL_BLOCK_BYTES);
        assert!(!block.is_external());
        assert_eq!(block.unsafe_ref_count(), 1);
    }

    #[test]
    fn test_block_sizes() {
        for size in BlockSize::ALL {
            let block = make_block(size).unwrap();
            assert_eq!(block.capacity(), size.bytes());
        }
    }

    #[test]
    fn test_write_then_share() {
        let mut block = make_native_block().unwrap();
        block.get_mut().unwrap().bytes_mut()[..4].copy_from_slice(b"weft");

        let shared = block.clone();
        assert_eq!(block.unsafe_ref_count(), 2);
        // No mutable access while shared.
        assert!(block.get_mut().is_none());
        assert_eq!(&shared.bytes()[..4], b"weft");
    }

    #[test]
    fn test_last_drop_recycles_to_thread_cache() {
        // Warm the pool so the cache count is stable.
        drop(make_block(BlockSize::Large));
        let cached_before = thread_cached_blocks(BlockSize::Large);

        let block = make_block(BlockSize::Large).unwrap();
        assert_eq!(thread_cached_blocks(BlockSize::Large), cached_before - 1);

        let clone = block.clone();
        drop(block);
        // Still referenced; nothing returned yet.
        assert_eq!(thread_cached_blocks(BlockSize::Large), cached_before - 1);

        drop(clone);
        assert_eq!(thread_cached_blocks(BlockSize::Large), cached_before);
    }

    #[test]
    fn test_recycled_block_reused_with_fresh_count() {
        let block = make_block(BlockSize::Medium).unwrap();
        let addr = block.as_ptr();
        drop(block);

        // Same thread, same size: the hottest cached block comes back.
        let block = make_block(BlockSize::Medium).unwrap();
        assert_eq!(block.as_ptr(), addr);
        assert_eq!(block.unsafe_ref_count(), 1);
    }

    #[test]
    fn test_cross_thread_drop_recycles_on_dropping_thread() {
        let block = make_native_block().unwrap();
        std::thread::spawn(move || {
            // The last reference dies here; the block lands in this
            // thread's cache, not the allocating thread's.
            drop(block);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_external_release_runs_once() {
        static RELEASED: AtomicUsize = AtomicUsize::new(0);

        unsafe fn release(ptr: *mut u8, len: usize) {
            RELEASED.fetch_add(1, Ordering::SeqCst);
            drop(unsafe { Vec::from_raw_parts(ptr, len, len) });
        }

        let mut buf = vec![7u8; 32];
        let (ptr, len) = (buf.as_mut_ptr(), buf.len());
        std::mem::forget(buf);

        let block = unsafe { BufferBlock::external(ptr, len, release) };
        assert!(block.is_external());
        assert_eq!(block.capacity(), 32);
        assert_eq!(block.bytes()[0], 7);

        let clone = block.clone();
        drop(block);
        assert_eq!(RELEASED.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(RELEASED.load(Ordering::SeqCst), 1);
    }
}
