//! Core pool implementation: the two-tier reservoir, the hot path, the
//! growth controller, and the refill worker.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace};

use crate::config::PoolConfig;
use crate::errors::{PoolError, PoolResult};
use crate::refill::{RefillReason, RefillResult};
use crate::ring::RingBuffer;
use crate::shrink;
use crate::stats::{PoolStats, StatsSnapshot};

type Allocator<T> = Arc<dyn Fn() -> T + Send + Sync>;
type Cleaner<T> = Arc<dyn Fn(&mut T) + Send + Sync>;
type CloneTemplate<T> = Arc<dyn Fn(&T) -> T + Send + Sync>;

/// The two tiers, swapped wholesale on resize.
///
/// Every tier operation happens while holding the read side of the pool
/// lock; resizes take the write side, so no operation can race a swap.
pub(crate) struct Tiers<T> {
    pub l1: ArrayQueue<T>,
    pub l2: RingBuffer<T>,
}

pub(crate) struct PoolShared<T> {
    pub config: PoolConfig,
    allocator: Allocator<T>,
    cleaner: Cleaner<T>,
    clone_template: Option<CloneTemplate<T>>,
    template: Mutex<Option<T>>,

    pub tiers: RwLock<Tiers<T>>,
    pub stats: PoolStats,
    pub shutdown: AtomicBool,
    pub growth_blocked: AtomicBool,

    // Serializes growth; at most one growth is in progress.
    growth_lock: Mutex<()>,

    // Blocking-get gate. The guarded counter is a generation number bumped
    // on every signal, so a waiter can tell a wakeup from a spurious one.
    gate: Mutex<u64>,
    gate_cond: Condvar,

    refill_pending: AtomicBool,
    refill_stop: Mutex<bool>,
    refill_cond: Condvar,

    pub shrink_stop: Mutex<bool>,
    pub shrink_cond: Condvar,
}

impl<T: Send + 'static> PoolShared<T> {
    /// Pop from L1, then L2. Called with no pool locks held.
    fn try_acquire(&self) -> Option<T> {
        let tiers = self.tiers.read();
        if let Some(value) = tiers.l1.pop() {
            self.stats.record_get(true);
            return Some(value);
        }
        if let Some(value) = tiers.l2.try_read() {
            self.stats.record_get(false);
            self.maybe_schedule_refill(&tiers);
            return Some(value);
        }
        None
    }

    fn maybe_schedule_refill(&self, tiers: &Tiers<T>) {
        let fp = &self.config.fast_path;
        let watermark = tiers.l1.capacity() * fp.refill_percent as usize / 100;
        if tiers.l1.len() > watermark {
            return;
        }
        if !self.refill_pending.swap(true, Ordering::SeqCst) {
            // Taking the lock pins the worker either before its pending
            // check or inside the wait, so the notify cannot be lost.
            let _stop = self.refill_stop.lock();
            self.refill_cond.notify_one();
        }
    }

    /// Clean a value and return it, adjusting in-use accounting. Runs the
    /// cleaner unconditionally, even during shutdown.
    pub(crate) fn put_value(&self, mut value: T) {
        (self.cleaner)(&mut value);

        if self.shutdown.load(Ordering::SeqCst) {
            drop(value);
            self.stats.objects_destroyed.fetch_add(1, Ordering::SeqCst);
            self.stats.release_in_use();
            return;
        }

        let tiers = self.tiers.read();
        match tiers.l1.push(value) {
            Ok(()) => {
                drop(tiers);
                self.stats.record_put(true);
                self.signal_one();
            }
            Err(value) => match tiers.l2.try_write(value) {
                Ok(()) => {
                    drop(tiers);
                    self.stats.record_put(false);
                    self.signal_one();
                }
                Err(value) => {
                    // Both tiers full: only possible transiently while a
                    // shrink replaces a buffer. The value was cleaned above.
                    drop(tiers);
                    drop(value);
                    self.stats.objects_destroyed.fetch_add(1, Ordering::SeqCst);
                    self.stats.release_in_use();
                }
            },
        }
    }

    /// Materialize one value, preferring the clone template.
    fn materialize(&self) -> T {
        self.stats.objects_created.fetch_add(1, Ordering::SeqCst);
        if let Some(clone_fn) = &self.clone_template {
            let template = self.template.lock();
            if let Some(value) = template.as_ref() {
                return clone_fn(value);
            }
        }
        (self.allocator)()
    }

    /// Clean and destroy a value leaving the pool.
    pub(crate) fn discard(&self, mut value: T) {
        (self.cleaner)(&mut value);
        drop(value);
        self.stats.objects_destroyed.fetch_add(1, Ordering::SeqCst);
    }

    /// Grow the reservoir. Exponential below `initial * threshold_factor`,
    /// linear above, clamped at the hard limit. Called with no pool locks
    /// held; serialized by `growth_lock`.
    pub(crate) fn grow(&self) -> PoolResult<()> {
        let _guard = self.growth_lock.lock();
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(PoolError::PoolClosed);
        }

        let current = self.stats.current_capacity.load(Ordering::SeqCst);
        let threshold = self.config.growth_threshold();
        let factor = if current < threshold {
            self.config.growth.controlled_growth_factor
        } else {
            self.config.growth.big_growth_factor
        };
        let delta = ((current as f64 * factor) as usize).max(1);
        let mut new_capacity = current + delta;

        // L1 and L2 share the hard limit: the reservoir may only grow into
        // capacity the fast path has not already claimed.
        let l1_capacity = self.stats.current_l1_capacity.load(Ordering::SeqCst);
        let budget = self.config.hard_limit.saturating_sub(l1_capacity);
        if new_capacity > budget {
            if current >= budget {
                self.growth_blocked.store(true, Ordering::SeqCst);
                debug!(
                    current,
                    l1_capacity,
                    hard_limit = self.config.hard_limit,
                    "growth refused at hard limit"
                );
                return Err(PoolError::GrowthFailed(self.config.hard_limit));
            }
            new_capacity = budget;
        }

        let to_alloc = self.config.alloc.alloc_amount.min(new_capacity - current);
        let values: Vec<T> = (0..to_alloc).map(|_| self.materialize()).collect();

        let rejected = {
            let tiers = self.tiers.read();
            tiers.l2.resize(new_capacity);
            let (_, rejected) = tiers.l2.write_many(values);
            rejected
        };
        for value in rejected {
            self.discard(value);
        }

        self.stats.record_grow(new_capacity);
        trace!(from = current, to = new_capacity, materialized = to_alloc, "pool grew");
        self.try_l1_growth_resize();
        self.signal_all();
        Ok(())
    }

    /// Replace L1 with a larger channel when enough growth events have
    /// accumulated since the last resize.
    fn try_l1_growth_resize(&self) {
        let fp = &self.config.fast_path;
        if !fp.enable_channel_growth {
            return;
        }
        let events = self.stats.total_growth_events.load(Ordering::SeqCst);
        let since = events - self.stats.last_resize_at_growth_num.load(Ordering::SeqCst);
        if since < fp.growth_events_trigger {
            return;
        }

        let mut tiers = self.tiers.write();
        let current = tiers.l1.capacity();
        let threshold = (fp.initial_size as f64 * fp.growth.threshold_factor) as usize;
        let factor = if current < threshold {
            fp.growth.controlled_growth_factor
        } else {
            fp.growth.big_growth_factor
        };
        let mut new_capacity = current + ((current as f64 * factor) as usize).max(1);

        // Same shared hard limit as `grow`: the fast path stops growing
        // once the reservoir holds the rest of the budget.
        let l2_capacity = self.stats.current_capacity.load(Ordering::SeqCst);
        let room = self.config.hard_limit.saturating_sub(l2_capacity);
        new_capacity = new_capacity.min(room);
        if new_capacity <= current {
            return;
        }

        let new_l1 = ArrayQueue::new(new_capacity);
        while let Some(value) = tiers.l1.pop() {
            if let Err(value) = new_l1.push(value) {
                let _ = tiers.l2.try_write(value);
            }
        }
        tiers.l1 = new_l1;
        self.stats.current_l1_capacity.store(new_capacity, Ordering::SeqCst);
        self.stats.last_resize_at_growth_num.store(events, Ordering::SeqCst);
        trace!(from = current, to = new_capacity, "fast path grew");
    }

    /// Replace L1 with a smaller channel when enough shrink events have
    /// accumulated. Excess values spill into L2; values that fit nowhere
    /// are cleaned and dropped rather than silently lost.
    pub(crate) fn try_l1_shrink_resize(&self) {
        let fp = &self.config.fast_path;
        let events = self.stats.total_shrink_events.load(Ordering::SeqCst);
        let since = events - self.stats.last_resize_at_shrink_num.load(Ordering::SeqCst);
        if since < fp.shrink_events_trigger {
            return;
        }

        let mut overflow = Vec::new();
        {
            let mut tiers = self.tiers.write();
            let current = tiers.l1.capacity();
            let target = (current as f64 * (1.0 - fp.shrink_percent as f64 / 100.0)) as usize;
            let new_capacity = target.max(fp.min_capacity);
            if new_capacity >= current {
                return;
            }

            let new_l1 = ArrayQueue::new(new_capacity);
            while let Some(value) = tiers.l1.pop() {
                if let Err(value) = new_l1.push(value) {
                    if let Err(value) = tiers.l2.try_write(value) {
                        overflow.push(value);
                    }
                }
            }
            tiers.l1 = new_l1;
            self.stats.current_l1_capacity.store(new_capacity, Ordering::SeqCst);
            self.stats.last_resize_at_shrink_num.store(events, Ordering::SeqCst);
            trace!(from = current, to = new_capacity, "fast path shrank");
        }
        for value in overflow {
            self.discard(value);
        }
    }

    /// One refill pass: top L1 up to its fill target from L2, growing
    /// first when L2 cannot cover the target.
    fn run_refill(&self) -> RefillResult {
        let fp = &self.config.fast_path;
        let (fill_target, l2_len) = {
            let tiers = self.tiers.read();
            (
                tiers.l1.capacity() * fp.fill_aggressiveness as usize / 100,
                tiers.l2.len(),
            )
        };
        if fill_target == 0 {
            return RefillResult::failed(RefillReason::NoItemsToMove);
        }

        let mut growth_needed = false;
        if l2_len == 0 || fill_target > l2_len {
            if self.growth_blocked.load(Ordering::SeqCst) {
                return RefillResult::failed(RefillReason::GrowthBlocked);
            }
            if self.grow().is_err() {
                return RefillResult::failed(RefillReason::GrowthFailed);
            }
            growth_needed = true;
        }

        let mut moved = 0;
        let mut failed = 0;
        let mut overflow = Vec::new();
        {
            let tiers = self.tiers.read();
            let to_move = fill_target.min(tiers.l2.len());
            let items = tiers.l2.get_n(to_move);
            if items.is_empty() {
                return RefillResult {
                    items_moved: 0,
                    items_failed: 0,
                    growth_needed,
                    reason: RefillReason::NoItemsToMove,
                };
            }
            for item in items {
                match tiers.l1.push(item) {
                    Ok(()) => moved += 1,
                    Err(item) => {
                        failed += 1;
                        if let Err(item) = tiers.l2.try_write(item) {
                            overflow.push(item);
                        }
                    }
                }
            }
        }
        for value in overflow {
            self.discard(value);
        }

        trace!(moved, failed, growth_needed, "refill pass finished");
        RefillResult {
            items_moved: moved,
            items_failed: failed,
            growth_needed,
            reason: RefillReason::Succeeded,
        }
    }

    /// Wake one blocked getter. Only blocking pools maintain the gate.
    fn signal_one(&self) {
        if !self.config.ring.block {
            return;
        }
        {
            let mut generation = self.gate.lock();
            *generation += 1;
        }
        self.gate_cond.notify_one();
    }

    fn signal_all(&self) {
        if !self.config.ring.block {
            return;
        }
        self.signal_all_unconditional();
    }

    fn signal_all_unconditional(&self) {
        {
            let mut generation = self.gate.lock();
            *generation += 1;
        }
        self.gate_cond.notify_all();
    }

    /// Park until a put, a growth, close, or the deadline. Returns `Ok`
    /// when the caller should retry the tiers.
    fn wait_for_value(&self, deadline: Option<Instant>) -> PoolResult<()> {
        let mut generation = self.gate.lock();
        {
            // Re-check under the gate so a signal sent between the caller's
            // last look at the tiers and this lock cannot be lost.
            let tiers = self.tiers.read();
            if !tiers.l1.is_empty() || !tiers.l2.is_empty() {
                return Ok(());
            }
        }

        self.stats.blocked_gets.fetch_add(1, Ordering::Relaxed);
        let start_generation = *generation;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(PoolError::PoolClosed);
            }
            if *generation != start_generation {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::PoolExhausted);
                    }
                    if self
                        .gate_cond
                        .wait_for(&mut generation, deadline - now)
                        .timed_out()
                    {
                        return Err(PoolError::PoolExhausted);
                    }
                }
                None => self.gate_cond.wait(&mut generation),
            }
        }
    }
}

/// A value checked out of a [`Pool`], returned automatically on drop.
///
/// # Examples
///
/// ```
/// use tidepool::{Pool, PoolConfig};
///
/// let pool = Pool::new(PoolConfig::default(), || vec![0u8; 64], Vec::clear).unwrap();
/// {
///     let mut buf = pool.get_value().unwrap();
///     buf.extend_from_slice(b"hello");
/// }
/// // returned and reset when `buf` went out of scope
/// ```
pub struct PooledValue<T: Send + 'static> {
    value: Option<T>,
    shared: Arc<PoolShared<T>>,
}

impl<T: Send + 'static> PooledValue<T> {
    /// Take the value out permanently; it no longer belongs to the pool.
    pub fn detach(mut self) -> T {
        let value = self.value.take().expect("value already taken");
        self.shared.stats.release_in_use();
        self.shared
            .stats
            .objects_destroyed
            .fetch_add(1, Ordering::SeqCst);
        value
    }
}

impl<T: Send + 'static> Deref for PooledValue<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.value.as_ref().expect("value already taken")
    }
}

impl<T: Send + 'static> DerefMut for PooledValue<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value.as_mut().expect("value already taken")
    }
}

impl<T: Send + 'static> Drop for PooledValue<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.shared.put_value(value);
        }
    }
}

/// Adaptive two-tier object pool.
///
/// Values flow through a small fast-path channel (L1) backed by a larger
/// ring buffer (L2). When both run dry the pool grows, exponentially at
/// first and then linearly, up to a hard limit; a background task shrinks
/// the reservoir again once the pool sits idle and underutilized.
///
/// # Examples
///
/// ```
/// use tidepool::{Pool, PoolConfig};
///
/// let config = PoolConfig::builder()
///     .with_initial_capacity(8)
///     .with_hard_limit(64)
///     .build()
///     .unwrap();
///
/// let pool = Pool::new(config, || vec![0u8; 1024], Vec::clear).unwrap();
/// let buf = pool.get().unwrap();
/// pool.put(buf).unwrap();
/// pool.close();
/// ```
pub struct Pool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Create a pool using `allocator` for every materialized value.
    pub fn new<A, C>(config: PoolConfig, allocator: A, cleaner: C) -> PoolResult<Self>
    where
        A: Fn() -> T + Send + Sync + 'static,
        C: Fn(&mut T) + Send + Sync + 'static,
    {
        Self::build(config, Arc::new(allocator), Arc::new(cleaner), None)
    }

    /// Create a pool that bulk-materializes values by cloning a template
    /// produced once by `allocator`.
    pub fn with_clone_template<A, C, K>(
        config: PoolConfig,
        allocator: A,
        cleaner: C,
        clone_template: K,
    ) -> PoolResult<Self>
    where
        A: Fn() -> T + Send + Sync + 'static,
        C: Fn(&mut T) + Send + Sync + 'static,
        K: Fn(&T) -> T + Send + Sync + 'static,
    {
        Self::build(
            config,
            Arc::new(allocator),
            Arc::new(cleaner),
            Some(Arc::new(clone_template)),
        )
    }

    fn build(
        config: PoolConfig,
        allocator: Allocator<T>,
        cleaner: Cleaner<T>,
        clone_template: Option<CloneTemplate<T>>,
    ) -> PoolResult<Self> {
        if std::mem::size_of::<T>() == 0 {
            return Err(PoolError::InvalidValueType(
                "zero-sized types cannot be pooled; store an owned handle instead",
            ));
        }
        if config.initial_capacity == 0 || config.fast_path.initial_size == 0 {
            return Err(PoolError::InvalidConfig(
                "capacities must be greater than 0; use PoolConfig::builder".into(),
            ));
        }

        let l1_capacity = config.fast_path.initial_size;
        let shared = Arc::new(PoolShared {
            stats: PoolStats::new(config.initial_capacity, l1_capacity),
            tiers: RwLock::new(Tiers {
                l1: ArrayQueue::new(l1_capacity),
                l2: RingBuffer::with_config(config.initial_capacity, config.ring),
            }),
            allocator,
            cleaner,
            clone_template,
            template: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            growth_blocked: AtomicBool::new(false),
            growth_lock: Mutex::new(()),
            gate: Mutex::new(0),
            gate_cond: Condvar::new(),
            refill_pending: AtomicBool::new(false),
            refill_stop: Mutex::new(false),
            refill_cond: Condvar::new(),
            shrink_stop: Mutex::new(false),
            shrink_cond: Condvar::new(),
            config,
        });

        // One probe allocation seeds the clone template. It is not counted
        // as a pool-owned value.
        let probe = (shared.allocator)();
        if shared.clone_template.is_some() {
            *shared.template.lock() = Some(probe);
        }

        let prealloc =
            shared.config.initial_capacity * shared.config.alloc.alloc_percent as usize / 100;
        let fill_target =
            l1_capacity * shared.config.fast_path.fill_aggressiveness as usize / 100;
        // Materialize before touching the tiers: client callbacks never run
        // under the pool lock.
        let values: Vec<T> = (0..prealloc).map(|_| shared.materialize()).collect();
        let mut leftover = Vec::new();
        {
            let tiers = shared.tiers.read();
            let mut fast_path_remaining = fill_target;
            for mut value in values {
                if fast_path_remaining > 0 {
                    match tiers.l1.push(value) {
                        Ok(()) => {
                            fast_path_remaining -= 1;
                            continue;
                        }
                        Err(rejected) => {
                            fast_path_remaining = 0;
                            value = rejected;
                        }
                    }
                }
                if let Err(value) = tiers.l2.try_write(value) {
                    leftover.push(value);
                }
            }
        }
        // Preallocation never exceeds the initial capacity, so leftovers
        // only appear with a hand-built config.
        for value in leftover {
            shared.discard(value);
        }

        let mut workers = Vec::new();
        workers.push(spawn_refill_worker(&shared));
        if shared.config.shrink.enabled() {
            workers.push(shrink::spawn(Arc::clone(&shared)));
        }

        debug!(
            initial_capacity = shared.config.initial_capacity,
            l1_capacity,
            preallocated = prealloc,
            "pool created"
        );
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Check a value out of the pool.
    ///
    /// L1 is drained before L2 to preserve locality. When both tiers are
    /// empty the pool grows; once growth is refused at the hard limit,
    /// non-blocking pools fail with [`PoolError::PoolExhausted`] and
    /// blocking pools park until a value is returned.
    pub fn get(&self) -> PoolResult<T> {
        // One deadline for the whole call, so repeated re-parks cannot
        // extend the configured timeout.
        let mut deadline = None;
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Err(PoolError::PoolClosed);
            }
            if let Some(value) = self.shared.try_acquire() {
                return Ok(value);
            }
            match self.shared.grow() {
                Ok(()) => continue,
                Err(PoolError::PoolClosed) => return Err(PoolError::PoolClosed),
                Err(_) => {}
            }
            if !self.shared.config.ring.block {
                return Err(PoolError::PoolExhausted);
            }
            if deadline.is_none() {
                deadline = self
                    .shared
                    .config
                    .ring
                    .r_timeout
                    .map(|timeout| Instant::now() + timeout);
            }
            self.shared.wait_for_value(deadline)?;
        }
    }

    /// Return a value to the pool. The cleaner always runs, even when the
    /// pool has been closed; a value that fits neither tier (transient
    /// during shrink) is cleaned and dropped.
    pub fn put(&self, value: T) -> PoolResult<()> {
        self.shared.put_value(value);
        Ok(())
    }

    /// Check out a value wrapped in a guard that returns it on drop.
    pub fn get_value(&self) -> PoolResult<PooledValue<T>> {
        let value = self.get()?;
        Ok(PooledValue {
            value: Some(value),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Asynchronously check out a value, polling the non-blocking path.
    /// Times out after `r_timeout` (default 30s).
    pub async fn get_async(&self) -> PoolResult<T> {
        let timeout = self
            .shared
            .config
            .ring
            .r_timeout
            .unwrap_or(Duration::from_secs(30));

        tokio::time::timeout(timeout, async {
            loop {
                if self.shared.shutdown.load(Ordering::SeqCst) {
                    return Err(PoolError::PoolClosed);
                }
                if let Some(value) = self.shared.try_acquire() {
                    return Ok(value);
                }
                match self.shared.grow() {
                    Ok(()) => continue,
                    Err(PoolError::PoolClosed) => return Err(PoolError::PoolClosed),
                    Err(_) => {}
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| PoolError::PoolExhausted)?
    }

    /// Try to asynchronously check out a value.
    pub async fn try_get_async(&self) -> Option<T> {
        self.get_async().await.ok()
    }

    /// Point-in-time statistics snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        let (l1_len, l2_len) = {
            let tiers = self.shared.tiers.read();
            (tiers.l1.len(), tiers.l2.len())
        };
        self.shared.stats.snapshot(l1_len, l2_len)
    }

    /// Log the current snapshot at info level.
    pub fn print_stats(&self) {
        tracing::info!("\n{}", self.snapshot());
    }

    /// Report of the most recent refill pass, if any.
    pub fn last_refill(&self) -> Option<RefillResult> {
        self.shared.stats.last_refill()
    }

    pub fn is_growth(&self) -> bool {
        self.shared.stats.total_growth_events.load(Ordering::SeqCst) > 0
    }

    pub fn is_shrunk(&self) -> bool {
        self.shared.stats.total_shrink_events.load(Ordering::SeqCst) > 0
    }

    pub fn is_ring_buffer_growth(&self) -> bool {
        self.is_growth()
    }

    pub fn is_fast_path_growth(&self) -> bool {
        self.shared.stats.current_l1_capacity.load(Ordering::SeqCst)
            > self.shared.config.fast_path.initial_size
    }

    /// Close the pool: wake blocked getters, stop the background workers,
    /// and drain both tiers running the cleaner on every value. Idempotent.
    pub fn close(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing pool");
        self.shared.signal_all_unconditional();

        {
            let mut stop = self.shared.shrink_stop.lock();
            *stop = true;
        }
        self.shared.shrink_cond.notify_all();
        {
            let mut stop = self.shared.refill_stop.lock();
            *stop = true;
        }
        self.shared.refill_cond.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }

        let mut drained = Vec::new();
        {
            let tiers = self.shared.tiers.write();
            while let Some(value) = tiers.l1.pop() {
                drained.push(value);
            }
            drained.extend(tiers.l2.clear_remaining());
        }
        let destroyed = drained.len();
        for value in drained {
            self.shared.discard(value);
        }
        *self.shared.template.lock() = None;
        debug!(destroyed, "pool closed");
    }
}

impl<T: Send + 'static> Drop for Pool<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_refill_worker<T: Send + 'static>(shared: &Arc<PoolShared<T>>) -> JoinHandle<()> {
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name("tidepool-refill".into())
        .spawn(move || loop {
            {
                let mut stop = shared.refill_stop.lock();
                while !*stop && !shared.refill_pending.load(Ordering::SeqCst) {
                    shared.refill_cond.wait(&mut stop);
                }
                if *stop {
                    break;
                }
            }
            shared.refill_pending.store(false, Ordering::SeqCst);
            let result = shared.run_refill();
            shared.stats.record_refill(result);
        })
        .expect("failed to spawn refill worker")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::sync::atomic::AtomicU64;

    #[derive(Debug, Default)]
    struct Widget {
        value: u64,
    }

    fn reset(widget: &mut Widget) {
        widget.value = 0;
    }

    #[test]
    fn test_get_put_round_trip() {
        let pool = Pool::new(PoolConfig::default(), Widget::default, reset).unwrap();

        let mut widget = pool.get().unwrap();
        widget.value = 7;
        pool.put(widget).unwrap();

        let widget = pool.get().unwrap();
        // the cleaner reset it on the way back in
        assert_eq!(widget.value, 0);
        pool.put(widget).unwrap();

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.total_gets, 2);
        assert_eq!(snapshot.objects_in_use, 0);
        pool.close();
    }

    #[test]
    fn test_growth_covers_demand() {
        let config = PoolConfig::builder()
            .with_initial_capacity(2)
            .with_growth_percent(0.5)
            .with_fixed_growth_factor(1.0)
            .with_min_shrink_capacity(2)
            .build()
            .unwrap();
        let pool = Pool::new(config, Widget::default, reset).unwrap();

        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(pool.get().unwrap());
        }

        assert!(pool.is_growth());
        let snapshot = pool.snapshot();
        assert!(snapshot.current_capacity > 2);
        assert!(snapshot.total_growth_events >= 1);

        for widget in held {
            pool.put(widget).unwrap();
        }
        assert_eq!(pool.snapshot().objects_in_use, 0);
        pool.close();
    }

    #[test]
    fn test_hard_limit_non_blocking() {
        let config = PoolConfig::builder()
            .with_initial_capacity(8)
            .with_hard_limit(8)
            .with_fast_path_initial_size(8)
            .with_min_shrink_capacity(8)
            .build()
            .unwrap();
        let pool = Pool::new(config, Widget::default, reset).unwrap();

        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(pool.get().unwrap());
        }
        assert_eq!(pool.get().unwrap_err(), PoolError::PoolExhausted);

        // a return makes the next get succeed again
        pool.put(held.pop().unwrap()).unwrap();
        held.push(pool.get().unwrap());

        for widget in held {
            pool.put(widget).unwrap();
        }
        pool.close();
    }

    #[test]
    fn test_hard_limit_blocking_waiters_complete() {
        let config = PoolConfig::builder()
            .with_initial_capacity(8)
            .with_hard_limit(8)
            .with_fast_path_initial_size(8)
            .with_min_shrink_capacity(8)
            .with_ring_buffer_config(true, Some(Duration::from_secs(5)), None)
            .build()
            .unwrap();
        let pool = Arc::new(Pool::new(config, Widget::default, reset).unwrap());

        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(pool.get().unwrap());
        }

        let completed = Arc::new(AtomicU64::new(0));
        let mut waiters = Vec::new();
        for _ in 0..20 {
            let pool = Arc::clone(&pool);
            let completed = Arc::clone(&completed);
            waiters.push(thread::spawn(move || {
                let widget = pool.get().unwrap();
                completed.fetch_add(1, Ordering::SeqCst);
                pool.put(widget).unwrap();
            }));
        }

        thread::sleep(Duration::from_millis(50));
        assert_eq!(completed.load(Ordering::SeqCst), 0);

        for widget in held {
            pool.put(widget).unwrap();
        }
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 20);

        let snapshot = pool.snapshot();
        assert!(snapshot.blocked_gets >= 12);
        assert_eq!(snapshot.objects_in_use, 0);
        pool.close();
    }

    #[test]
    fn test_blocking_get_times_out() {
        let config = PoolConfig::builder()
            .with_initial_capacity(8)
            .with_hard_limit(8)
            .with_fast_path_initial_size(8)
            .with_min_shrink_capacity(8)
            .with_ring_buffer_config(true, Some(Duration::from_millis(50)), None)
            .build()
            .unwrap();
        let pool = Pool::new(config, Widget::default, reset).unwrap();

        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(pool.get().unwrap());
        }

        let start = Instant::now();
        assert_eq!(pool.get().unwrap_err(), PoolError::PoolExhausted);
        assert!(start.elapsed() >= Duration::from_millis(50));

        for widget in held {
            pool.put(widget).unwrap();
        }
        pool.close();
    }

    #[test]
    fn test_resource_cleanup_counts() {
        let created = Arc::new(AtomicU64::new(0));
        let cleaned = Arc::new(AtomicU64::new(0));

        let config = PoolConfig::builder()
            .with_initial_capacity(100)
            .with_hard_limit(100)
            .with_min_shrink_capacity(100)
            .with_fast_path_initial_size(64)
            .build()
            .unwrap();

        let created_in_alloc = Arc::clone(&created);
        let cleaned_in_cleaner = Arc::clone(&cleaned);
        let pool = Pool::new(
            config,
            move || {
                created_in_alloc.fetch_add(1, Ordering::SeqCst);
                Widget { value: 42 }
            },
            move |widget: &mut Widget| {
                cleaned_in_cleaner.fetch_add(1, Ordering::SeqCst);
                widget.value = 0;
            },
        )
        .unwrap();

        let mut held = Vec::new();
        for _ in 0..100 {
            held.push(pool.get().unwrap());
        }
        for widget in held {
            pool.put(widget).unwrap();
        }

        // let any in-flight refill pass finish moving values between tiers
        thread::sleep(Duration::from_millis(50));
        pool.snapshot().validate(100).unwrap();
        pool.close();

        // one probe allocation plus 100 preallocated values
        assert_eq!(created.load(Ordering::SeqCst), 101);
        // 100 puts, then both tiers drained at close
        assert_eq!(cleaned.load(Ordering::SeqCst), 200);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.objects_created, 100);
        assert_eq!(snapshot.objects_destroyed, 100);
        assert_eq!(snapshot.available_objects, 0);
    }

    #[test]
    fn test_disabled_channel_growth() {
        let config = PoolConfig::builder()
            .with_initial_capacity(2)
            .with_growth_percent(0.5)
            .with_fixed_growth_factor(1.0)
            .with_min_shrink_capacity(2)
            .with_channel_growth(false)
            .with_growth_events_trigger(1)
            .build()
            .unwrap();
        let pool = Pool::new(config, Widget::default, reset).unwrap();

        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(pool.get().unwrap());
        }

        assert!(pool.is_ring_buffer_growth());
        assert!(!pool.is_fast_path_growth());
        assert_eq!(
            pool.snapshot().current_l1_capacity,
            crate::config::DEFAULT_L1_INITIAL_SIZE
        );

        for widget in held {
            pool.put(widget).unwrap();
        }
        pool.close();
    }

    #[test]
    fn test_l1_growth_resize_triggers() {
        let config = PoolConfig::builder()
            .with_initial_capacity(2)
            .with_growth_percent(1.0)
            .with_fixed_growth_factor(1.0)
            .with_min_shrink_capacity(2)
            .with_fast_path_initial_size(8)
            .with_growth_events_trigger(1)
            .build()
            .unwrap();
        let pool = Pool::new(config, Widget::default, reset).unwrap();

        let mut held = Vec::new();
        for _ in 0..32 {
            held.push(pool.get().unwrap());
        }

        assert!(pool.is_fast_path_growth());
        assert!(pool.snapshot().current_l1_capacity > 8);

        for widget in held {
            pool.put(widget).unwrap();
        }
        pool.close();
    }

    #[test]
    fn test_put_spills_to_l2_when_l1_full() {
        let config = PoolConfig::builder()
            .with_initial_capacity(40)
            .with_hard_limit(40)
            .with_min_shrink_capacity(40)
            .with_fast_path_initial_size(8)
            .build()
            .unwrap();
        let pool = Pool::new(config, Widget::default, reset).unwrap();

        let mut held = Vec::new();
        for _ in 0..40 {
            held.push(pool.get().unwrap());
        }
        for widget in held {
            pool.put(widget).unwrap();
        }

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.fast_return_hit + snapshot.fast_return_miss, 40);
        assert!(snapshot.fast_return_miss > 0);
        assert!(snapshot.l2_spill_rate > 0.0);
        pool.close();
    }

    #[test]
    fn test_refill_reports_result() {
        let config = PoolConfig::builder()
            .with_initial_capacity(32)
            .with_fast_path_initial_size(8)
            .with_refill_percent(50)
            .build()
            .unwrap();
        let pool = Pool::new(config, Widget::default, reset).unwrap();

        // drain L1 and dip into L2 so a refill gets scheduled
        let mut held = Vec::new();
        for _ in 0..12 {
            held.push(pool.get().unwrap());
        }
        thread::sleep(Duration::from_millis(50));

        let report = pool.last_refill().expect("refill ran");
        assert!(report.succeeded() || report.items_moved == 0);

        for widget in held {
            pool.put(widget).unwrap();
        }
        pool.close();
    }

    #[test]
    fn test_pooled_value_returns_on_drop() {
        let pool = Pool::new(PoolConfig::default(), Widget::default, reset).unwrap();

        {
            let mut widget = pool.get_value().unwrap();
            (*widget).value = 9;
            assert_eq!(pool.snapshot().objects_in_use, 1);
        }
        assert_eq!(pool.snapshot().objects_in_use, 0);

        // the returned value was cleaned
        let widget = pool.get().unwrap();
        assert_eq!(widget.value, 0);
        pool.put(widget).unwrap();
        pool.close();
    }

    #[test]
    fn test_pooled_value_detach() {
        let pool = Pool::new(PoolConfig::default(), Widget::default, reset).unwrap();
        let before = pool.snapshot();

        let widget = pool.get_value().unwrap();
        let owned = widget.detach();
        assert_eq!(owned.value, 0);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.objects_in_use, 0);
        assert_eq!(snapshot.objects_destroyed, before.objects_destroyed + 1);
        pool.close();
    }

    #[test]
    fn test_closed_pool_rejects_get() {
        let pool = Pool::new(PoolConfig::default(), Widget::default, reset).unwrap();
        let widget = pool.get().unwrap();

        pool.close();
        pool.close(); // idempotent

        assert_eq!(pool.get().unwrap_err(), PoolError::PoolClosed);

        // an outstanding value is cleaned and dropped, not re-pooled
        pool.put(widget).unwrap();
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.objects_in_use, 0);
        assert_eq!(snapshot.available_objects, 0);
        assert_eq!(snapshot.objects_created, snapshot.objects_destroyed);
    }

    #[test]
    fn test_close_wakes_blocked_getters() {
        let config = PoolConfig::builder()
            .with_initial_capacity(8)
            .with_hard_limit(8)
            .with_fast_path_initial_size(8)
            .with_min_shrink_capacity(8)
            .with_ring_buffer_config(true, None, None)
            .build()
            .unwrap();
        let pool = Arc::new(Pool::new(config, Widget::default, reset).unwrap());

        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(pool.get().unwrap());
        }

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get())
        };
        thread::sleep(Duration::from_millis(50));
        pool.close();

        assert_eq!(waiter.join().unwrap().unwrap_err(), PoolError::PoolClosed);
        for widget in held {
            pool.put(widget).unwrap();
        }
    }

    #[test]
    fn test_clone_template_used_for_preallocation() {
        let allocations = Arc::new(AtomicU64::new(0));
        let clones = Arc::new(AtomicU64::new(0));

        let config = PoolConfig::builder()
            .with_initial_capacity(16)
            .with_min_shrink_capacity(16)
            .build()
            .unwrap();

        let allocations_in_alloc = Arc::clone(&allocations);
        let clones_in_template = Arc::clone(&clones);
        let pool = Pool::with_clone_template(
            config,
            move || {
                allocations_in_alloc.fetch_add(1, Ordering::SeqCst);
                Widget { value: 42 }
            },
            reset,
            move |widget: &Widget| {
                clones_in_template.fetch_add(1, Ordering::SeqCst);
                Widget {
                    value: widget.value,
                }
            },
        )
        .unwrap();

        assert_eq!(allocations.load(Ordering::SeqCst), 1);
        assert_eq!(clones.load(Ordering::SeqCst), 16);

        let widget = pool.get().unwrap();
        assert_eq!(widget.value, 42);
        pool.put(widget).unwrap();
        pool.close();
    }

    #[test]
    fn test_zero_sized_type_rejected() {
        let err = Pool::new(PoolConfig::default(), || (), |_: &mut ()| {}).unwrap_err();
        assert!(matches!(err, PoolError::InvalidValueType(_)));
    }

    #[test]
    fn test_concurrent_accounting_invariant() {
        let config = PoolConfig::builder()
            .with_initial_capacity(4)
            .with_hard_limit(256)
            .build()
            .unwrap();
        let pool = Arc::new(Pool::new(config, Widget::default, reset).unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let widget = loop {
                        match pool.get() {
                            Ok(widget) => break widget,
                            Err(PoolError::PoolExhausted) => thread::yield_now(),
                            Err(other) => panic!("unexpected error: {other}"),
                        }
                    };
                    pool.put(widget).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // let any in-flight refill pass finish moving values between tiers
        thread::sleep(Duration::from_millis(50));
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.objects_in_use, 0);
        assert_eq!(snapshot.total_gets, 400);
        assert_eq!(
            snapshot.fast_return_hit + snapshot.fast_return_miss,
            snapshot.total_gets
        );
        assert_eq!(
            snapshot.available_objects,
            snapshot.objects_created - snapshot.objects_destroyed
        );
        pool.close();
    }

    #[tokio::test]
    async fn test_get_async() {
        let pool = Pool::new(PoolConfig::default(), Widget::default, reset).unwrap();

        let widget = pool.get_async().await.unwrap();
        assert_eq!(widget.value, 0);
        pool.put(widget).unwrap();

        assert!(pool.try_get_async().await.is_some());
        pool.close();
    }

    #[tokio::test]
    async fn test_get_async_times_out_at_hard_limit() {
        let config = PoolConfig::builder()
            .with_initial_capacity(8)
            .with_hard_limit(8)
            .with_fast_path_initial_size(8)
            .with_min_shrink_capacity(8)
            .with_ring_buffer_config(false, Some(Duration::from_millis(50)), None)
            .build()
            .unwrap();
        let pool = Pool::new(config, Widget::default, reset).unwrap();

        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(pool.get().unwrap());
        }
        assert_eq!(
            pool.get_async().await.unwrap_err(),
            PoolError::PoolExhausted
        );

        for widget in held {
            pool.put(widget).unwrap();
        }
        pool.close();
    }
}
