//! Intrusive atomic reference counting.
//!
//! [`RefPtr`] is a shared-ownership handle over types that embed their own
//! [`RefCount`] and know how to release themselves (heap-delete, or return
//! to a pool with the count reset). Unlike `Arc`, the count lives inside
//! the object, so a raw pointer can be turned back into an owning handle
//! at any point — which is what lets pooled buffer blocks cross fiber and
//! thread boundaries without a separate control block.

use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// An atomic reference count, initialized to 1.
#[derive(Debug)]
pub struct RefCount(AtomicU32);

impl RefCount {
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    /// Increment. The count must be non-zero (someone must already own a
    /// reference); incrementing from zero would resurrect a dead object.
    pub fn increment(&self) {
        let was = self.0.fetch_add(1, Ordering::Relaxed);
        debug_assert!(was > 0);
    }

    /// Decrement; returns true when this was the last reference. The
    /// acquire-release ordering makes every write that happened under the
    /// old references visible to whoever runs the release.
    pub fn decrement(&self) -> bool {
        let was = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(was >= 1);
        was == 1
    }

    /// A relaxed snapshot. By the time it is returned the count may have
    /// changed; the only value callers can rely on is 1 (sole ownership).
    pub fn load(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Reset a dead count (0) back to 1 for pooled reuse.
    pub fn reset_for_reuse(&self) {
        debug_assert_eq!(self.0.load(Ordering::Relaxed), 0);
        self.0.store(1, Ordering::Relaxed);
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

/// A type that can be owned by [`RefPtr`].
///
/// # Safety
///
/// `ref_count` must return a count that tracks exactly the live owning
/// handles of `self`, and `destroy` must release the object (free it, or
/// reset its count to 1 and return it to a pool). `destroy` is called at
/// most once per zero-crossing of the count, with no other references
/// outstanding.
pub unsafe trait Refable {
    fn ref_count(&self) -> &RefCount;

    /// Release an object whose count just reached zero.
    ///
    /// # Safety
    ///
    /// `this` must have been allocated the way the implementation expects
    /// (e.g. `Box`), and no reference to it may exist anymore.
    unsafe fn destroy(this: NonNull<Self>);
}

/// A shared-ownership handle over a [`Refable`] object.
pub struct RefPtr<T: Refable> {
    ptr: NonNull<T>,
}

// A RefPtr hands out &T from any thread it moves to, so T must be Sync,
// and the last drop may run destroy on a different thread, so T: Send.
unsafe impl<T: Refable + Send + Sync> Send for RefPtr<T> {}
unsafe impl<T: Refable + Send + Sync> Sync for RefPtr<T> {}

impl<T: Refable> RefPtr<T> {
    /// Box `value` and take ownership of its (fresh) reference.
    ///
    /// Only valid for types whose `destroy` frees a `Box` allocation.
    pub fn new(value: T) -> Self {
        let ptr = NonNull::from(Box::leak(Box::new(value)));
        debug_assert_eq!(unsafe { ptr.as_ref() }.ref_count().load(), 1);
        Self { ptr }
    }

    /// Take ownership of an already-counted pointer without touching the
    /// count. The inverse of [`leak`](Self::leak).
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object and the caller must own one
    /// reference to it that is being transferred here.
    pub unsafe fn adopt(ptr: NonNull<T>) -> Self {
        Self { ptr }
    }

    /// Create an additional owning handle from a borrowed pointer,
    /// incrementing the count.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object with a non-zero count for the
    /// whole call.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        unsafe { ptr.as_ref() }.ref_count().increment();
        Self { ptr }
    }

    /// Give up ownership without decrementing; the caller becomes
    /// responsible for the reference.
    #[must_use]
    pub fn leak(this: Self) -> NonNull<T> {
        let ptr = this.ptr;
        std::mem::forget(this);
        ptr
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// See [`RefCount::load`]: only 1 is meaningful.
    pub fn unsafe_ref_count(&self) -> u32 {
        unsafe { self.ptr.as_ref() }.ref_count().load()
    }

    /// Mutable access, available only while this is the sole owner.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        if self.unsafe_ref_count() == 1 {
            Some(unsafe { self.ptr.as_mut() })
        } else {
            None
        }
    }
}

impl<T: Refable> Deref for RefPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Refable> Clone for RefPtr<T> {
    fn clone(&self) -> Self {
        unsafe { self.ptr.as_ref() }.ref_count().increment();
        Self { ptr: self.ptr }
    }
}

impl<T: Refable> Drop for RefPtr<T> {
    fn drop(&mut self) {
        if unsafe { self.ptr.as_ref() }.ref_count().decrement() {
            unsafe { T::destroy(self.ptr) };
        }
    }
}

impl<T: Refable + std::fmt::Debug> std::fmt::Debug for RefPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RefPtr").field(&**self).finish()
    }
}

/// An atomically swappable, possibly-null [`RefPtr`] slot.
///
/// All operations use sequentially-consistent ordering. On every
/// replacement the previous pointer is released exactly once (ownership
/// of it transfers out through the returned handle, or is dropped).
///
/// `load` creates a new handle from the stored pointer; callers must
/// guarantee the stored object cannot lose its last reference while the
/// load is in flight (typically by keeping the slot itself alive as an
/// owner, which it is).
pub struct AtomicRefPtr<T: Refable> {
    ptr: AtomicPtr<T>,
}

unsafe impl<T: Refable + Send + Sync> Send for AtomicRefPtr<T> {}
unsafe impl<T: Refable + Send + Sync> Sync for AtomicRefPtr<T> {}

impl<T: Refable> AtomicRefPtr<T> {
    pub fn new(ptr: Option<RefPtr<T>>) -> Self {
        Self {
            ptr: AtomicPtr::new(into_owned_raw(ptr)),
        }
    }

    pub fn load(&self) -> Option<RefPtr<T>> {
        NonNull::new(self.ptr.load(Ordering::SeqCst))
            .map(|ptr| unsafe { RefPtr::from_raw(ptr) })
    }

    pub fn store(&self, ptr: Option<RefPtr<T>>) {
        // Promoted to a swap so the previous pointer can be released.
        drop(self.swap(ptr));
    }

    pub fn swap(&self, ptr: Option<RefPtr<T>>) -> Option<RefPtr<T>> {
        let old = self.ptr.swap(into_owned_raw(ptr), Ordering::SeqCst);
        NonNull::new(old).map(|ptr| unsafe { RefPtr::adopt(ptr) })
    }

    /// Replace the stored pointer with `new` if it currently equals
    /// `current`. On success the old handle is returned (its reference now
    /// owned by the caller); on failure `new` is handed back untouched.
    pub fn compare_exchange(
        &self,
        current: Option<&RefPtr<T>>,
        new: Option<RefPtr<T>>,
    ) -> Result<Option<RefPtr<T>>, Option<RefPtr<T>>> {
        self.compare_exchange_impl(current, new, false)
    }

    /// Like [`compare_exchange`](Self::compare_exchange) but may fail
    /// spuriously; intended for retry loops.
    pub fn compare_exchange_weak(
        &self,
        current: Option<&RefPtr<T>>,
        new: Option<RefPtr<T>>,
    ) -> Result<Option<RefPtr<T>>, Option<RefPtr<T>>> {
        self.compare_exchange_impl(current, new, true)
    }

    fn compare_exchange_impl(
        &self,
        current: Option<&RefPtr<T>>,
        new: Option<RefPtr<T>>,
        weak: bool,
    ) -> Result<Option<RefPtr<T>>, Option<RefPtr<T>>> {
        let current_raw = current.map_or(std::ptr::null_mut(), |p| p.as_ptr());
        let new_raw = new.as_ref().map_or(std::ptr::null_mut(), |p| p.as_ptr());

        let result = if weak {
            self.ptr
                .compare_exchange_weak(current_raw, new_raw, Ordering::SeqCst, Ordering::SeqCst)
        } else {
            self.ptr
                .compare_exchange(current_raw, new_raw, Ordering::SeqCst, Ordering::SeqCst)
        };
        match result {
            Ok(old) => {
                // Ownership of `new`'s reference moved into the slot.
                let _ = new.map(RefPtr::leak);
                Ok(NonNull::new(old).map(|ptr| unsafe { RefPtr::adopt(ptr) }))
            }
            Err(_) => Err(new),
        }
    }
}

impl<T: Refable> Drop for AtomicRefPtr<T> {
    fn drop(&mut self) {
        if let Some(ptr) = NonNull::new(*self.ptr.get_mut()) {
            drop(unsafe { RefPtr::adopt(ptr) });
        }
    }
}

fn into_owned_raw<T: Refable>(ptr: Option<RefPtr<T>>) -> *mut T {
    ptr.map_or(std::ptr::null_mut(), |p| RefPtr::leak(p).as_ptr())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Debug)]
    struct Counted {
        refs: RefCount,
        drops: Arc<AtomicUsize>,
    }

    impl Counted {
        fn new(drops: &Arc<AtomicUsize>) -> RefPtr<Self> {
            RefPtr::new(Self {
                refs: RefCount::new(),
                drops: Arc::clone(drops),
            })
        }
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    unsafe impl Refable for Counted {
        fn ref_count(&self) -> &RefCount {
            &self.refs
        }

        unsafe fn destroy(this: NonNull<Self>) {
            drop(unsafe { Box::from_raw(this.as_ptr()) });
        }
    }

    #[test]
    fn test_clone_and_drop_track_count() {
        let drops = Arc::new(AtomicUsize::new(0));
        let ptr = Counted::new(&drops);
        assert_eq!(ptr.unsafe_ref_count(), 1);

        let clones: Vec<_> = (0..10).map(|_| ptr.clone()).collect();
        assert_eq!(ptr.unsafe_ref_count(), 11);

        drop(clones);
        assert_eq!(ptr.unsafe_ref_count(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(ptr);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_leak_then_adopt_is_balanced() {
        let drops = Arc::new(AtomicUsize::new(0));
        let ptr = Counted::new(&drops);
        let raw = RefPtr::leak(ptr);
        let readopted = unsafe { RefPtr::adopt(raw) };
        assert_eq!(readopted.unsafe_ref_count(), 1);
        drop(readopted);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_from_raw_increments() {
        let drops = Arc::new(AtomicUsize::new(0));
        let ptr = Counted::new(&drops);
        let second = unsafe { RefPtr::from_raw(NonNull::new(ptr.as_ptr()).unwrap()) };
        assert_eq!(ptr.unsafe_ref_count(), 2);
        drop(ptr);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_mut_requires_unique_ownership() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut ptr = Counted::new(&drops);
        assert!(ptr.get_mut().is_some());
        let clone = ptr.clone();
        assert!(ptr.get_mut().is_none());
        drop(clone);
        assert!(ptr.get_mut().is_some());
    }

    #[test]
    fn test_shared_count_under_contention() {
        let drops = Arc::new(AtomicUsize::new(0));
        let ptr = Counted::new(&drops);

        std::thread::scope(|s| {
            for _ in 0..4 {
                let ptr = ptr.clone();
                s.spawn(move || {
                    for _ in 0..100_000 {
                        let clone = ptr.clone();
                        drop(clone);
                    }
                });
            }
        });

        assert_eq!(ptr.unsafe_ref_count(), 1);
        drop(ptr);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_atomic_swap_releases_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let first = Counted::new(&drops);
        let second = Counted::new(&drops);

        let slot = AtomicRefPtr::new(Some(first));
        let old = slot.swap(Some(second));
        assert!(old.is_some());
        drop(old);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(slot);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_atomic_load_shares() {
        let drops = Arc::new(AtomicUsize::new(0));
        let slot = AtomicRefPtr::new(Some(Counted::new(&drops)));

        let loaded = slot.load().unwrap();
        assert_eq!(loaded.unsafe_ref_count(), 2);
        drop(loaded);

        slot.store(None);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(slot.load().is_none());
    }

    #[test]
    fn test_atomic_compare_exchange() {
        let drops = Arc::new(AtomicUsize::new(0));
        let first = Counted::new(&drops);
        let second = Counted::new(&drops);
        let third = Counted::new(&drops);

        let slot = AtomicRefPtr::new(Some(first.clone()));

        // Mismatched expectation: `second` is handed back.
        let second = slot
            .compare_exchange(None, Some(second))
            .unwrap_err()
            .unwrap();

        // Matching expectation: old handle comes out, `third` goes in.
        let old = slot
            .compare_exchange(Some(&first), Some(third))
            .unwrap()
            .unwrap();
        assert!(RefPtr::ptr_eq(&old, &first));

        drop((first, second, old, slot));
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_atomic_compare_exchange_weak_retry_loop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let first = Counted::new(&drops);
        let second = Counted::new(&drops);

        let slot = AtomicRefPtr::new(Some(first.clone()));
        let mut new = Some(second);
        loop {
            // Weak CAS may fail spuriously; retry with the handed-back value.
            match slot.compare_exchange_weak(Some(&first), new) {
                Ok(old) => {
                    drop(old);
                    break;
                }
                Err(handed_back) => new = handed_back,
            }
        }

        drop((first, slot));
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}
