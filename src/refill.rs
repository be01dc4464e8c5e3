//! Outcome reporting for the L1 refill protocol.
//!
//! The refill itself runs on a background worker owned by the pool; see
//! `Pool::run_refill`. Only the result types live here so the stats
//! surface can expose the last report without pulling in pool internals.

/// Why a refill pass ended the way it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefillReason {
    /// Values were moved into L1.
    Succeeded,
    /// L2 was short and growth is blocked at the hard limit.
    GrowthBlocked,
    /// L2 was short and the growth attempt failed.
    GrowthFailed,
    /// Nothing to move: the fill target was zero or L2 was empty.
    NoItemsToMove,
    /// The ring buffer reported an error while reading.
    RingBufferError(String),
}

/// Report of a single refill pass, readable via `StatsSnapshot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefillResult {
    /// Values moved from L2 into L1.
    pub items_moved: usize,
    /// Values that did not fit into L1 and were written back to L2.
    pub items_failed: usize,
    /// Whether the pass had to grow the pool before moving values.
    pub growth_needed: bool,
    pub reason: RefillReason,
}

impl RefillResult {
    pub(crate) fn failed(reason: RefillReason) -> Self {
        Self {
            items_moved: 0,
            items_failed: 0,
            growth_needed: false,
            reason,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.reason == RefillReason::Succeeded
    }
}
