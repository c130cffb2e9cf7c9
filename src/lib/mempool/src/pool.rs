//! Watermarked object pools with per-thread caches.
//!
//! A [`GlobalPool`] is a mutex-guarded free list shared by the whole
//! process. Threads that churn through objects keep a [`LocalPool`] in
//! front of it: gets and puts hit the local cache with no synchronization,
//! and objects move between the two in batches of `transfer_batch` so the
//! global lock is amortized.
//!
//! Retention is governed by a [`PoolConfig`] resolved once at pool
//! construction (there is no type-indexed registry): the global list keeps
//! at most `high_watermark` objects and reclaims objects idle longer than
//! `max_idle` down to `low_watermark`; each local cache keeps at least
//! `min_thread_cache` and spills or reclaims the rest.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Retention parameters for one pool. Values are object counts.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// The global free list never reclaims idle objects below this.
    pub low_watermark: usize,
    /// The global free list never holds more than this; excess is freed
    /// oldest-first.
    pub high_watermark: usize,
    /// Objects idle longer than this are reclaimed (checks piggy-back on
    /// `get`/`put`, there is no background sweeper thread).
    pub max_idle: Duration,
    /// Each thread cache keeps at least this many objects.
    pub min_thread_cache: usize,
    /// Objects moved between a thread cache and the global list per lock
    /// acquisition.
    pub transfer_batch: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            low_watermark: 64,
            high_watermark: usize::MAX,
            max_idle: Duration::from_secs(10),
            min_thread_cache: 16,
            transfer_batch: 16,
        }
    }
}

struct Idle<T> {
    object: T,
    since: Instant,
}

impl<T> Idle<T> {
    fn new(object: T) -> Self {
        Self {
            object,
            since: Instant::now(),
        }
    }
}

/// The process-wide free list. For object kinds that do not warrant a
/// per-thread cache, this is used directly via [`get`](Self::get) /
/// [`put`](Self::put).
pub struct GlobalPool<T> {
    config: PoolConfig,
    /// Constructs a fresh object on pool miss; `None` means allocation
    /// failed and is propagated to the caller.
    create: Box<dyn Fn() -> Option<T> + Send + Sync>,
    /// Front is the oldest (least recently returned) entry.
    free: Mutex<VecDeque<Idle<T>>>,
}

impl<T> GlobalPool<T> {
    pub fn new(
        config: PoolConfig,
        create: impl Fn() -> Option<T> + Send + Sync + 'static,
    ) -> Arc<Self> {
        assert!(config.transfer_batch > 0);
        Arc::new(Self {
            config,
            create: Box::new(create),
            free: Mutex::new(VecDeque::new()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pop a pooled object, or construct a fresh one.
    pub fn get(&self) -> Option<T> {
        let mut free = self.free.lock().unwrap();
        if let Some(idle) = free.pop_back() {
            return Some(idle.object);
        }
        drop(free);
        (self.create)()
    }

    /// Return an object to the free list.
    pub fn put(&self, object: T) {
        let mut free = self.free.lock().unwrap();
        free.push_back(Idle::new(object));
        Self::enforce_watermarks(&self.config, &mut free);
    }

    /// Number of objects currently idle in the global list.
    pub fn idle_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    fn enforce_watermarks(config: &PoolConfig, free: &mut VecDeque<Idle<T>>) {
        while free.len() > config.high_watermark {
            free.pop_front();
        }
        while free.len() > config.low_watermark {
            match free.front() {
                Some(idle) if idle.since.elapsed() > config.max_idle => {
                    free.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Move up to `transfer_batch` of the hottest entries into `out`.
    fn take_batch(&self, out: &mut VecDeque<Idle<T>>) -> usize {
        let mut free = self.free.lock().unwrap();
        let n = free.len().min(self.config.transfer_batch);
        for _ in 0..n {
            out.push_back(free.pop_back().unwrap());
        }
        n
    }

    fn give_batch(&self, items: impl Iterator<Item = Idle<T>>) {
        let mut free = self.free.lock().unwrap();
        free.extend(items);
        Self::enforce_watermarks(&self.config, &mut free);
    }
}

/// A per-thread cache in front of a [`GlobalPool`]. Not `Send`: it belongs
/// to the thread that created it.
pub struct LocalPool<T> {
    shared: Arc<GlobalPool<T>>,
    /// Front is the oldest entry, back the hottest.
    cache: VecDeque<Idle<T>>,
    _not_send: PhantomData<*mut ()>,
}

impl<T> LocalPool<T> {
    pub fn new(shared: Arc<GlobalPool<T>>) -> Self {
        Self {
            shared,
            cache: VecDeque::new(),
            _not_send: PhantomData,
        }
    }

    /// Take an object: local cache first, then a batch pulled from the
    /// global pool under one lock, then fresh construction.
    pub fn get(&mut self) -> Option<T> {
        self.sweep_idle();
        if let Some(idle) = self.cache.pop_back() {
            return Some(idle.object);
        }
        if self.shared.take_batch(&mut self.cache) > 0 {
            return Some(self.cache.pop_back().unwrap().object);
        }
        self.shared.get()
    }

    /// Return an object to the local cache, spilling a batch to the global
    /// pool when the cache grows past its soft cap.
    pub fn put(&mut self, object: T) {
        self.cache.push_back(Idle::new(object));

        let config = self.shared.config();
        let soft_cap = config.min_thread_cache + config.transfer_batch;
        if self.cache.len() > soft_cap {
            let spill: Vec<_> = self.cache.drain(..config.transfer_batch).collect();
            self.shared.give_batch(spill.into_iter());
        }
        self.sweep_idle();
    }

    /// Number of objects currently cached by this thread.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Return everything in the cache to the global pool.
    pub fn flush(&mut self) {
        let all: Vec<_> = self.cache.drain(..).collect();
        if !all.is_empty() {
            self.shared.give_batch(all.into_iter());
        }
    }

    // Reclaim cached objects idle past max_idle, keeping at least
    // min_thread_cache around for the next burst.
    fn sweep_idle(&mut self) {
        let config = self.shared.config();
        while self.cache.len() > config.min_thread_cache {
            match self.cache.front() {
                Some(idle) if idle.since.elapsed() > config.max_idle => {
                    drop(self.cache.pop_front());
                }
                _ => break,
            }
        }
    }
}

impl<T> Drop for LocalPool<T> {
    fn drop(&mut self) {
        self.flush();
    }
}
