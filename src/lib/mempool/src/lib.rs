//! Pooled memory primitives for the fiber runtime.
//!
//! Two layers live here. The bottom layer is generic: intrusive atomic
//! reference counting ([`RefPtr`], [`AtomicRefPtr`]) and watermarked
//! object pools with per-thread caches ([`GlobalPool`], [`LocalPool`]).
//! The top layer applies both to the runtime's I/O currency: fixed-size
//! [`BufferBlock`]s that fibers pass between each other by handle, with
//! the last handle's drop returning the block to the dropping thread's
//! cache instead of freeing it.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

mod block;
mod pool;
mod ref_ptr;

pub use block::{
    global_idle_blocks, make_block, make_native_block, override_pool_config,
    thread_cached_blocks, BlockSize, BufferBlock, LARGE_BLOCK_BYTES, MEDIUM_BLOCK_BYTES,
    SMALL_BLOCK_BYTES,
};
pub use pool::{GlobalPool, LocalPool, PoolConfig};
pub use ref_ptr::{AtomicRefPtr, RefCount, RefPtr, Refable};
