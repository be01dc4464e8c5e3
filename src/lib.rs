//! # tidepool
//!
//! Adaptive two-tier object pool for values whose construction is
//! expensive relative to their use.
//!
//! ## Features
//!
//! - Two-tier reservoir: a small lock-free fast path (L1) backed by a
//!   larger ring buffer (L2)
//! - Exponential-then-linear growth, capped at a hard limit, with
//!   optional blocking semantics when exhausted
//! - Background shrinking gated on idleness, utilization, cooldown, and
//!   consecutive-shrink caps; in-use values are never discarded
//! - Automatic L1 refill from L2 off the hot path
//! - Automatic return of values via RAII guard
//! - Async checkout with timeout
//! - Lock-free statistics with snapshot-time derived metrics
//!
//! ## Quick Start
//!
//! ```rust
//! use tidepool::{Pool, PoolConfig};
//!
//! let config = PoolConfig::builder()
//!     .with_initial_capacity(8)
//!     .with_hard_limit(128)
//!     .build()
//!     .unwrap();
//!
//! let pool = Pool::new(config, || vec![0u8; 4096], Vec::clear).unwrap();
//! {
//!     let mut buf = pool.get_value().unwrap();
//!     buf.extend_from_slice(b"reused");
//!     // buffer is reset and returned when `buf` goes out of scope
//! }
//! pool.close();
//! ```

mod config;
mod errors;
mod pool;
mod refill;
mod ring;
mod shrink;
mod stats;

pub use config::{
    AggressivenessLevel, AllocParams, FastPathParams, GrowthParams, PoolConfig,
    PoolConfigBuilder, ShrinkParams,
};
pub use errors::{PoolError, PoolResult};
pub use pool::{Pool, PooledValue};
pub use refill::{RefillReason, RefillResult};
pub use ring::{RingBuffer, RingConfig};
pub use stats::{StatsSnapshot, ValidationError};
