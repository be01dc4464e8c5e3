//! Statistics surface: lock-free hot-path counters plus snapshot-time
//! derived metrics.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use crate::refill::RefillResult;

/// Counters updated on the hot path without locks. Time-of-event fields
/// that only the controllers read sit behind a small mutex.
pub(crate) struct PoolStats {
    start: Instant,
    pub initial_capacity: usize,

    pub total_gets: AtomicU64,
    pub l1_hits: AtomicU64,
    pub blocked_gets: AtomicU64,
    pub fast_return_hit: AtomicU64,
    pub fast_return_miss: AtomicU64,

    pub objects_in_use: AtomicU64,
    pub peak_in_use: AtomicU64,
    pub objects_created: AtomicU64,
    pub objects_destroyed: AtomicU64,

    pub total_growth_events: AtomicU64,
    pub total_shrink_events: AtomicU64,
    pub consecutive_shrinks: AtomicU64,
    pub last_resize_at_growth_num: AtomicU64,
    pub last_resize_at_shrink_num: AtomicU64,

    pub current_capacity: AtomicUsize,
    pub current_l1_capacity: AtomicUsize,

    // Nanoseconds since `start`; 0 means never.
    last_get_nanos: AtomicU64,
    last_put_nanos: AtomicU64,

    times: Mutex<EventTimes>,
    last_refill: Mutex<Option<RefillResult>>,
}

#[derive(Default)]
struct EventTimes {
    last_shrink: Option<Instant>,
    last_grow: Option<Instant>,
}

impl PoolStats {
    pub fn new(initial_capacity: usize, l1_capacity: usize) -> Self {
        Self {
            start: Instant::now(),
            initial_capacity,
            total_gets: AtomicU64::new(0),
            l1_hits: AtomicU64::new(0),
            blocked_gets: AtomicU64::new(0),
            fast_return_hit: AtomicU64::new(0),
            fast_return_miss: AtomicU64::new(0),
            objects_in_use: AtomicU64::new(0),
            peak_in_use: AtomicU64::new(0),
            objects_created: AtomicU64::new(0),
            objects_destroyed: AtomicU64::new(0),
            total_growth_events: AtomicU64::new(0),
            total_shrink_events: AtomicU64::new(0),
            consecutive_shrinks: AtomicU64::new(0),
            last_resize_at_growth_num: AtomicU64::new(0),
            last_resize_at_shrink_num: AtomicU64::new(0),
            current_capacity: AtomicUsize::new(initial_capacity),
            current_l1_capacity: AtomicUsize::new(l1_capacity),
            last_get_nanos: AtomicU64::new(0),
            last_put_nanos: AtomicU64::new(0),
            times: Mutex::new(EventTimes::default()),
            last_refill: Mutex::new(None),
        }
    }

    /// Record a successful acquire: in-use and peak tracking, plus breaking
    /// any shrink streak, since client activity resets the pause.
    pub fn record_get(&self, from_l1: bool) {
        let in_use = self.objects_in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.total_gets.fetch_add(1, Ordering::Relaxed);
        if from_l1 {
            self.l1_hits.fetch_add(1, Ordering::Relaxed);
        }

        let mut peak = self.peak_in_use.load(Ordering::Relaxed);
        while in_use > peak {
            match self.peak_in_use.compare_exchange_weak(
                peak,
                in_use,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }

        saturating_dec(&self.consecutive_shrinks);
        self.touch(&self.last_get_nanos);
    }

    pub fn record_put(&self, hit_l1: bool) {
        if hit_l1 {
            self.fast_return_hit.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fast_return_miss.fetch_add(1, Ordering::Relaxed);
        }
        saturating_dec(&self.objects_in_use);
        self.touch(&self.last_put_nanos);
    }

    pub fn release_in_use(&self) {
        saturating_dec(&self.objects_in_use);
    }

    pub fn record_grow(&self, new_capacity: usize) {
        self.current_capacity.store(new_capacity, Ordering::SeqCst);
        self.total_growth_events.fetch_add(1, Ordering::SeqCst);
        self.times.lock().last_grow = Some(Instant::now());
    }

    pub fn record_shrink(&self, new_capacity: usize) {
        self.current_capacity.store(new_capacity, Ordering::SeqCst);
        self.total_shrink_events.fetch_add(1, Ordering::SeqCst);
        self.consecutive_shrinks.fetch_add(1, Ordering::SeqCst);
        self.times.lock().last_shrink = Some(Instant::now());
    }

    pub fn record_refill(&self, result: RefillResult) {
        *self.last_refill.lock() = Some(result);
    }

    pub fn last_refill(&self) -> Option<RefillResult> {
        self.last_refill.lock().clone()
    }

    /// Time since the last `get`, or since pool start when none happened.
    pub fn idle_duration(&self) -> Duration {
        let nanos = self.last_get_nanos.load(Ordering::Relaxed);
        let since_start = self.start.elapsed();
        since_start.saturating_sub(Duration::from_nanos(nanos))
    }

    pub fn since_last_shrink(&self) -> Option<Duration> {
        self.times.lock().last_shrink.map(|at| at.elapsed())
    }

    fn touch(&self, field: &AtomicU64) {
        let nanos = self.start.elapsed().as_nanos() as u64;
        field.store(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self, l1_len: usize, l2_len: usize) -> StatsSnapshot {
        let fast_return_hit = self.fast_return_hit.load(Ordering::Relaxed);
        let fast_return_miss = self.fast_return_miss.load(Ordering::Relaxed);
        let total_returns = fast_return_hit + fast_return_miss;
        let in_use = self.objects_in_use.load(Ordering::SeqCst);
        let available = (l1_len + l2_len) as u64;
        let current_capacity = self.current_capacity.load(Ordering::SeqCst);
        let total_gets = self.total_gets.load(Ordering::Relaxed);

        let l2_spill_rate = if total_returns > 0 {
            fast_return_miss as f64 / total_returns as f64
        } else {
            0.0
        };
        let utilization = if in_use + available > 0 {
            in_use as f64 / (in_use + available) as f64 * 100.0
        } else {
            0.0
        };
        let req_per_obj = if current_capacity > self.initial_capacity {
            Some(total_gets as f64 / (current_capacity - self.initial_capacity) as f64)
        } else {
            None
        };

        StatsSnapshot {
            initial_capacity: self.initial_capacity,
            current_capacity,
            current_l1_capacity: self.current_l1_capacity.load(Ordering::SeqCst),
            objects_in_use: in_use,
            peak_in_use: self.peak_in_use.load(Ordering::Relaxed),
            objects_created: self.objects_created.load(Ordering::SeqCst),
            objects_destroyed: self.objects_destroyed.load(Ordering::SeqCst),
            total_gets,
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            blocked_gets: self.blocked_gets.load(Ordering::Relaxed),
            fast_return_hit,
            fast_return_miss,
            total_growth_events: self.total_growth_events.load(Ordering::SeqCst),
            total_shrink_events: self.total_shrink_events.load(Ordering::SeqCst),
            consecutive_shrinks: self.consecutive_shrinks.load(Ordering::SeqCst),
            last_resize_at_growth_num: self.last_resize_at_growth_num.load(Ordering::Relaxed),
            last_resize_at_shrink_num: self.last_resize_at_shrink_num.load(Ordering::Relaxed),
            l1_length: l1_len,
            l2_length: l2_len,
            available_objects: available,
            l2_spill_rate,
            utilization,
            req_per_obj,
            last_refill: self.last_refill(),
        }
    }
}

/// Decrement with a floor of zero, tolerating concurrent updates.
pub(crate) fn saturating_dec(counter: &AtomicU64) {
    let mut current = counter.load(Ordering::SeqCst);
    while current > 0 {
        match counter.compare_exchange_weak(
            current,
            current - 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

/// Point-in-time view of the pool's statistics.
///
/// Components are sampled separately; a snapshot taken while clients are
/// active may be internally skewed by in-flight operations.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub initial_capacity: usize,
    pub current_capacity: usize,
    pub current_l1_capacity: usize,

    pub objects_in_use: u64,
    pub peak_in_use: u64,
    pub objects_created: u64,
    pub objects_destroyed: u64,

    pub total_gets: u64,
    pub l1_hits: u64,
    pub blocked_gets: u64,
    pub fast_return_hit: u64,
    pub fast_return_miss: u64,

    pub total_growth_events: u64,
    pub total_shrink_events: u64,
    pub consecutive_shrinks: u64,
    pub last_resize_at_growth_num: u64,
    pub last_resize_at_shrink_num: u64,

    pub l1_length: usize,
    pub l2_length: usize,
    pub available_objects: u64,

    /// Fraction of puts that spilled to L2 because L1 was full.
    pub l2_spill_rate: f64,
    /// `in_use / (in_use + available)` as a percentage.
    pub utilization: f64,
    /// Gets per grown object; `None` until the pool has grown.
    pub req_per_obj: Option<f64>,

    pub last_refill: Option<RefillResult>,
}

/// A counter reconciliation failure found by [`StatsSnapshot::validate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(String);

impl StatsSnapshot {
    /// Quiescence check: after `expected_requests` get/put pairs have fully
    /// completed, the counters must reconcile exactly.
    pub fn validate(&self, expected_requests: u64) -> Result<(), ValidationError> {
        let total_returns = self.fast_return_hit + self.fast_return_miss;
        if total_returns != self.total_gets {
            return Err(ValidationError(format!(
                "total returns ({total_returns}) does not match total gets ({})",
                self.total_gets
            )));
        }
        if self.total_gets != expected_requests {
            return Err(ValidationError(format!(
                "total gets ({}) does not match expected requests ({expected_requests})",
                self.total_gets
            )));
        }
        if self.objects_in_use != 0 {
            return Err(ValidationError(format!(
                "objects in use ({}) is not 0",
                self.objects_in_use
            )));
        }
        if self.available_objects != self.current_capacity as u64 {
            return Err(ValidationError(format!(
                "available objects ({}) does not match current capacity ({})",
                self.available_objects, self.current_capacity
            )));
        }
        Ok(())
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Pool Statistics ===")?;
        writeln!(f, "Objects in use: {}", self.objects_in_use)?;
        writeln!(f, "Peak in use: {}", self.peak_in_use)?;
        writeln!(f, "Objects created: {}", self.objects_created)?;
        writeln!(f, "Objects destroyed: {}", self.objects_destroyed)?;
        writeln!(f, "Available objects: {}", self.available_objects)?;
        writeln!(f, "Current capacity: {}", self.current_capacity)?;
        writeln!(f, "L1 capacity: {}", self.current_l1_capacity)?;
        writeln!(f, "L1 length: {}", self.l1_length)?;
        writeln!(f, "L2 length: {}", self.l2_length)?;
        writeln!(f, "Total gets: {}", self.total_gets)?;
        writeln!(f, "L1 hits: {}", self.l1_hits)?;
        writeln!(f, "Blocked gets: {}", self.blocked_gets)?;
        writeln!(f, "Fast return hit: {}", self.fast_return_hit)?;
        writeln!(f, "Fast return miss: {}", self.fast_return_miss)?;
        writeln!(f, "L2 spill rate: {:.2}%", self.l2_spill_rate * 100.0)?;
        writeln!(f, "Utilization: {:.2}%", self.utilization)?;
        writeln!(f, "Total growth events: {}", self.total_growth_events)?;
        writeln!(f, "Total shrink events: {}", self.total_shrink_events)?;
        writeln!(f, "Consecutive shrinks: {}", self.consecutive_shrinks)?;
        write!(f, "=======================")
    }
}
