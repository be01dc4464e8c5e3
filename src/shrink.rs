//! Background shrink controller.
//!
//! A single worker wakes every `check_interval`, scores idleness and
//! utilization against the configured thresholds, and once every gate
//! holds replaces L2 with a smaller buffer that preserves in-pool values.
//! In-use values are never discarded; the streak cap pauses the worker
//! until client activity resumes.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use crate::pool::PoolShared;
use crate::ring::RingBuffer;

pub(crate) fn spawn<T: Send + 'static>(shared: Arc<PoolShared<T>>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("tidepool-shrink".into())
        .spawn(move || run(&shared))
        .expect("failed to spawn shrink worker")
}

fn run<T: Send + 'static>(shared: &PoolShared<T>) {
    let params = shared.config.shrink.clone();
    let mut idle_rounds: u32 = 0;
    let mut under_rounds: u32 = 0;

    loop {
        {
            let mut stop = shared.shrink_stop.lock();
            if !*stop {
                shared
                    .shrink_cond
                    .wait_for(&mut stop, params.check_interval);
            }
            if *stop {
                break;
            }
        }

        let streak = shared.stats.consecutive_shrinks.load(Ordering::SeqCst);
        if streak >= params.max_consecutive_shrinks as u64 {
            // Paused until a get breaks the streak.
            trace!(streak, "shrink paused at streak cap");
            continue;
        }

        if shared.stats.idle_duration() >= params.idle_threshold {
            idle_rounds = (idle_rounds + 1).min(params.min_idle_before_shrink);
        } else {
            idle_rounds = idle_rounds.saturating_sub(1);
        }
        let idle_ok = idle_rounds >= params.min_idle_before_shrink;

        let (l1_len, l2_len) = {
            let tiers = shared.tiers.read();
            (tiers.l1.len(), tiers.l2.len())
        };
        let in_use = shared.stats.objects_in_use.load(Ordering::SeqCst);
        let total = in_use + (l1_len + l2_len) as u64;
        let utilization = if total > 0 {
            in_use as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        if utilization <= params.min_utilization_before_shrink as f64 {
            under_rounds = (under_rounds + 1).min(params.stable_underutilization_rounds);
        } else {
            under_rounds = under_rounds.saturating_sub(1);
        }
        let util_ok = under_rounds >= params.stable_underutilization_rounds;

        let cooldown_ok = shared
            .stats
            .since_last_shrink()
            .map_or(true, |since| since >= params.shrink_cooldown);

        trace!(
            idle_rounds,
            under_rounds,
            utilization,
            cooldown_ok,
            "shrink tick"
        );
        if idle_ok && util_ok && cooldown_ok {
            execute(shared);
        }
    }
}

/// Replace L2 with a smaller buffer, keeping as many in-pool values as the
/// new capacity allows and cleaning the rest. Aborts whenever the target
/// would not actually reduce capacity or would squeeze live checkouts.
fn execute<T: Send + 'static>(shared: &PoolShared<T>) {
    let params = &shared.config.shrink;
    let current = shared.stats.current_capacity.load(Ordering::SeqCst);
    let in_use = shared.stats.objects_in_use.load(Ordering::SeqCst) as usize;

    let target = (current as f64 * (1.0 - params.shrink_percent as f64 / 100.0)) as usize;
    if target == 0 || current <= params.min_capacity || target >= current {
        trace!(current, target, "shrink skipped");
        return;
    }
    let new_capacity = target.max(params.min_capacity).max(in_use);
    if new_capacity >= current {
        trace!(current, new_capacity, in_use, "shrink skipped after clamp");
        return;
    }
    let keep = new_capacity - in_use;
    if keep == 0 {
        trace!(in_use, new_capacity, "shrink skipped, all slots in use");
        return;
    }

    let mut discarded = Vec::new();
    {
        let mut tiers = shared.tiers.write();
        if tiers.l1.len() + tiers.l2.len() == 0 {
            trace!(in_use, "shrink skipped, no available values");
            return;
        }
        let items_to_keep = keep.min(tiers.l2.len());
        let new_l2 = RingBuffer::new(new_capacity);
        new_l2.copy_config(&tiers.l2);
        let kept = tiers.l2.get_n(items_to_keep);
        let (_, rejected) = new_l2.write_many(kept);
        discarded.extend(rejected);
        discarded.extend(tiers.l2.clear_remaining());
        tiers.l2 = new_l2;
    }
    let destroyed = discarded.len();
    for value in discarded {
        shared.discard(value);
    }

    shared.stats.record_shrink(new_capacity);
    if new_capacity < shared.config.hard_limit {
        shared.growth_blocked.store(false, Ordering::SeqCst);
    }
    debug!(from = current, to = new_capacity, destroyed, "pool shrank");

    shared.try_l1_shrink_resize();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::PoolConfig;
    use crate::pool::Pool;

    #[derive(Debug)]
    struct Conn {
        dirty: bool,
    }

    fn shrink_config(initial: usize) -> PoolConfig {
        PoolConfig::builder()
            .with_initial_capacity(initial)
            .enforce_custom_config()
            .with_shrink_check_interval(Duration::from_millis(10))
            .with_idle_threshold(Duration::from_millis(10))
            .with_min_idle_before_shrink(1)
            .with_shrink_cooldown(Duration::from_millis(10))
            .with_min_utilization_before_shrink(90)
            .with_stable_underutilization_rounds(1)
            .with_shrink_percent(50)
            .with_min_shrink_capacity(1)
            .with_max_consecutive_shrinks(5)
            .build()
            .unwrap()
    }

    #[test]
    fn test_idle_pool_shrinks_down_to_in_use() {
        let pool = Pool::new(
            shrink_config(32),
            || Conn { dirty: true },
            |conn: &mut Conn| conn.dirty = false,
        )
        .unwrap();

        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(pool.get().unwrap());
        }

        std::thread::sleep(Duration::from_millis(300));

        assert!(pool.is_shrunk());
        let snapshot = pool.snapshot();
        assert!(snapshot.total_shrink_events >= 1);
        // capacity can never drop below the live checkouts
        assert!(snapshot.current_capacity >= 10);

        for conn in held {
            pool.put(conn).unwrap();
        }
        pool.close();
    }

    #[test]
    fn test_repeated_shrink_stabilizes() {
        let pool = Pool::new(
            shrink_config(64),
            || Conn { dirty: false },
            |conn: &mut Conn| conn.dirty = false,
        )
        .unwrap();

        let held = pool.get().unwrap();
        std::thread::sleep(Duration::from_millis(400));

        let first = pool.snapshot().current_capacity;
        std::thread::sleep(Duration::from_millis(200));
        let second = pool.snapshot().current_capacity;

        // one value in use, floor of 1: the pool bottoms out and stays put
        assert!(first <= 2, "capacity still {first} after repeated shrinks");
        assert_eq!(first, second);

        pool.put(held).unwrap();
        pool.close();
    }

    #[test]
    fn test_shrink_discards_run_cleaner() {
        let cleaned = Arc::new(AtomicU64::new(0));
        let cleaned_in_pool = Arc::clone(&cleaned);
        let pool = Pool::new(
            shrink_config(32),
            || Conn { dirty: true },
            move |conn: &mut Conn| {
                conn.dirty = false;
                cleaned_in_pool.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(200));

        let snapshot = pool.snapshot();
        assert!(snapshot.total_shrink_events >= 1);
        assert!(snapshot.objects_destroyed > 0);
        assert!(cleaned.load(Ordering::SeqCst) >= snapshot.objects_destroyed);
        pool.close();
    }

    #[test]
    fn test_streak_cap_pauses_until_get() {
        let config = PoolConfig::builder()
            .with_initial_capacity(32)
            .enforce_custom_config()
            .with_shrink_check_interval(Duration::from_millis(10))
            .with_idle_threshold(Duration::from_millis(10))
            .with_min_idle_before_shrink(1)
            .with_shrink_cooldown(Duration::from_millis(10))
            .with_min_utilization_before_shrink(90)
            .with_stable_underutilization_rounds(1)
            .with_shrink_percent(10)
            .with_min_shrink_capacity(1)
            .with_max_consecutive_shrinks(1)
            .build()
            .unwrap();

        let pool = Pool::new(
            config,
            || Conn { dirty: false },
            |conn: &mut Conn| conn.dirty = false,
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(150));
        let paused = pool.snapshot();
        assert_eq!(paused.total_shrink_events, 1);

        // activity breaks the streak and shrinking resumes
        let value = pool.get().unwrap();
        pool.put(value).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert!(pool.snapshot().total_shrink_events >= 2);
        pool.close();
    }

    #[test]
    fn test_shrink_below_hard_limit_unblocks_growth() {
        let config = PoolConfig::builder()
            .with_initial_capacity(32)
            .with_hard_limit(32)
            .with_fast_path_initial_size(8)
            .enforce_custom_config()
            .with_shrink_check_interval(Duration::from_millis(10))
            .with_idle_threshold(Duration::from_millis(10))
            .with_min_idle_before_shrink(1)
            .with_shrink_cooldown(Duration::from_millis(10))
            .with_min_utilization_before_shrink(90)
            .with_stable_underutilization_rounds(1)
            .with_shrink_percent(50)
            .with_min_shrink_capacity(1)
            .with_max_consecutive_shrinks(1)
            .build()
            .unwrap();
        let pool = Pool::new(
            config,
            || Conn { dirty: false },
            |conn: &mut Conn| conn.dirty = false,
        )
        .unwrap();

        // exhaust the pool so growth hits the hard limit and latches
        let mut held = Vec::new();
        for _ in 0..32 {
            held.push(pool.get().unwrap());
        }
        assert!(pool.get().is_err());
        for conn in held.drain(..) {
            pool.put(conn).unwrap();
        }

        // a shrink below the hard limit clears the latch
        std::thread::sleep(Duration::from_millis(150));
        let shrunk = pool.snapshot().current_capacity;
        assert!(shrunk < 32);

        // growth works again: drain every pooled value and keep going
        for _ in 0..28 {
            held.push(pool.get().unwrap());
        }
        assert!(pool.snapshot().current_capacity > shrunk);

        for conn in held {
            pool.put(conn).unwrap();
        }
        pool.close();
    }

    #[test]
    fn test_disabled_level_never_shrinks() {
        let config = PoolConfig::builder()
            .with_initial_capacity(32)
            .with_shrink_aggressiveness(0)
            .unwrap()
            .build()
            .unwrap();

        let pool = Pool::new(
            config,
            || Conn { dirty: false },
            |conn: &mut Conn| conn.dirty = false,
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert!(!pool.is_shrunk());
        assert_eq!(pool.snapshot().current_capacity, 32);
        pool.close();
    }
}
