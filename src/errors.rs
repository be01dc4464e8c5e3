//! Error types for the pool

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool is closed")]
    PoolClosed,

    #[error("pool exhausted - no value available and growth is not allowed")]
    PoolExhausted,

    #[error("growth refused - capacity already at hard limit ({0})")]
    GrowthFailed(usize),

    #[error("ring buffer error: {0}")]
    RingBuffer(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid value type: {0}")]
    InvalidValueType(&'static str),
}

pub type PoolResult<T> = Result<T, PoolError>;
