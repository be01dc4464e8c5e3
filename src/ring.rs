//! Bounded FIFO ring buffer backing the pool's L2 reservoir.
//!
//! The buffer is internally synchronized; the pool swaps whole buffers
//! during shrink, so capacity is a soft bound tracked alongside the queue
//! rather than a fixed allocation.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Blocking behavior shared by a ring buffer and its replacements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingConfig {
    /// Whether read/write block when the buffer is empty/full.
    pub block: bool,
    /// Upper bound on a blocking read. `None` waits indefinitely.
    pub r_timeout: Option<Duration>,
    /// Upper bound on a blocking write. `None` waits indefinitely.
    pub w_timeout: Option<Duration>,
}

struct RingState<T> {
    items: VecDeque<T>,
    capacity: usize,
}

/// Bounded FIFO of values with blocking and non-blocking I/O.
pub struct RingBuffer<T> {
    state: Mutex<RingState<T>>,
    config: Mutex<RingConfig>,
    readable: Condvar,
    writable: Condvar,
}

impl<T> RingBuffer<T> {
    /// Create a buffer with the given capacity and default (non-blocking) config.
    pub fn new(capacity: usize) -> Self {
        Self::with_config(capacity, RingConfig::default())
    }

    pub fn with_config(capacity: usize, config: RingConfig) -> Self {
        Self {
            state: Mutex::new(RingState {
                items: VecDeque::with_capacity(capacity),
                capacity,
            }),
            config: Mutex::new(config),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    pub fn config(&self) -> RingConfig {
        *self.config.lock()
    }

    /// Adopt another buffer's blocking configuration. Used when the shrink
    /// controller replaces a buffer with a smaller one.
    pub fn copy_config(&self, other: &RingBuffer<T>) {
        *self.config.lock() = other.config();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Raise the capacity bound. Shrinking goes through buffer replacement
    /// instead, so a smaller value is ignored.
    pub fn resize(&self, new_capacity: usize) {
        let mut state = self.state.lock();
        if new_capacity > state.capacity {
            let extra = new_capacity - state.items.len();
            state.items.reserve(extra);
            state.capacity = new_capacity;
            self.writable.notify_all();
        }
    }

    /// Non-blocking write. Returns the value back on a full buffer.
    pub fn try_write(&self, value: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.items.len() >= state.capacity {
            return Err(value);
        }
        state.items.push_back(value);
        drop(state);
        self.readable.notify_one();
        Ok(())
    }

    /// Write honoring the configured blocking mode and `w_timeout`.
    /// Returns the value back when the buffer stays full.
    pub fn write(&self, value: T) -> Result<(), T> {
        let config = self.config();
        let mut state = self.state.lock();
        while state.items.len() >= state.capacity {
            if !config.block {
                return Err(value);
            }
            match config.w_timeout {
                Some(timeout) => {
                    if self.writable.wait_for(&mut state, timeout).timed_out() {
                        return Err(value);
                    }
                }
                None => self.writable.wait(&mut state),
            }
        }
        state.items.push_back(value);
        drop(state);
        self.readable.notify_one();
        Ok(())
    }

    /// Write a batch, stopping at capacity. Returns the number written and
    /// any values that did not fit.
    pub fn write_many(&self, values: Vec<T>) -> (usize, Vec<T>) {
        let mut state = self.state.lock();
        let room = state.capacity.saturating_sub(state.items.len());
        let mut written = 0;
        let mut rejected = Vec::new();
        for value in values {
            if written < room {
                state.items.push_back(value);
                written += 1;
            } else {
                rejected.push(value);
            }
        }
        drop(state);
        if written > 0 {
            self.readable.notify_all();
        }
        (written, rejected)
    }

    /// Non-blocking read. `None` means empty, which is not an error.
    pub fn try_read(&self) -> Option<T> {
        let mut state = self.state.lock();
        let value = state.items.pop_front();
        drop(state);
        if value.is_some() {
            self.writable.notify_one();
        }
        value
    }

    /// Read honoring the configured blocking mode and `r_timeout`.
    pub fn read(&self) -> Option<T> {
        let config = self.config();
        let mut state = self.state.lock();
        while state.items.is_empty() {
            if !config.block {
                return None;
            }
            match config.r_timeout {
                Some(timeout) => {
                    if self.readable.wait_for(&mut state, timeout).timed_out() {
                        return None;
                    }
                }
                None => self.readable.wait(&mut state),
            }
        }
        let value = state.items.pop_front();
        drop(state);
        self.writable.notify_one();
        value
    }

    /// Read up to `n` values without blocking. An empty result is the
    /// empty sentinel, not an error.
    pub fn get_n(&self, n: usize) -> Vec<T> {
        let mut state = self.state.lock();
        let take = n.min(state.items.len());
        let out: Vec<T> = state.items.drain(..take).collect();
        drop(state);
        if !out.is_empty() {
            self.writable.notify_all();
        }
        out
    }

    /// Drain everything left in the buffer and hand it to the caller, who
    /// owns cleanup of the values.
    pub fn clear_remaining(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let out: Vec<T> = state.items.drain(..).collect();
        drop(state);
        self.writable.notify_all();
        out
    }
}
