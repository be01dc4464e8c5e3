//! Pool configuration: parameter groups, aggressiveness presets, and the
//! validating builder.

use std::time::Duration;

use crate::errors::{PoolError, PoolResult};
use crate::ring::RingConfig;

pub const DEFAULT_INITIAL_CAPACITY: usize = 64;
pub const DEFAULT_HARD_LIMIT: usize = 4096;
pub const DEFAULT_L1_INITIAL_SIZE: usize = 32;
pub const DEFAULT_L1_MIN_CAPACITY: usize = 8;
pub const DEFAULT_MIN_CAPACITY: usize = 8;

/// Preset shrink sensitivity, from disabled to extreme.
///
/// Selecting a level overwrites the individual shrink parameters with the
/// preset table below; level 0 turns the background shrink loop off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum AggressivenessLevel {
    Disabled = 0,
    Conservative = 1,
    #[default]
    Balanced = 2,
    Aggressive = 3,
    VeryAggressive = 4,
    Extreme = 5,
}

impl AggressivenessLevel {
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::Disabled),
            1 => Some(Self::Conservative),
            2 => Some(Self::Balanced),
            3 => Some(Self::Aggressive),
            4 => Some(Self::VeryAggressive),
            5 => Some(Self::Extreme),
            _ => None,
        }
    }
}

struct ShrinkPreset {
    interval: Duration,
    idle: Duration,
    min_idle: u32,
    cooldown: Duration,
    utilization: u8,
    underutilized: u32,
    percent: u8,
    max_shrinks: u32,
}

fn shrink_preset(level: AggressivenessLevel) -> Option<ShrinkPreset> {
    use AggressivenessLevel::*;
    let preset = match level {
        Disabled => return None,
        Conservative => ShrinkPreset {
            interval: Duration::from_secs(60),
            idle: Duration::from_secs(120),
            min_idle: 5,
            cooldown: Duration::from_secs(120),
            utilization: 15,
            underutilized: 5,
            percent: 10,
            max_shrinks: 1,
        },
        Balanced => ShrinkPreset {
            interval: Duration::from_secs(30),
            idle: Duration::from_secs(60),
            min_idle: 3,
            cooldown: Duration::from_secs(60),
            utilization: 25,
            underutilized: 3,
            percent: 25,
            max_shrinks: 2,
        },
        Aggressive => ShrinkPreset {
            interval: Duration::from_secs(10),
            idle: Duration::from_secs(20),
            min_idle: 2,
            cooldown: Duration::from_secs(30),
            utilization: 35,
            underutilized: 2,
            percent: 40,
            max_shrinks: 3,
        },
        VeryAggressive => ShrinkPreset {
            interval: Duration::from_secs(5),
            idle: Duration::from_secs(10),
            min_idle: 1,
            cooldown: Duration::from_secs(10),
            utilization: 50,
            underutilized: 1,
            percent: 50,
            max_shrinks: 4,
        },
        Extreme => ShrinkPreset {
            interval: Duration::from_secs(1),
            idle: Duration::from_secs(2),
            min_idle: 1,
            cooldown: Duration::from_secs(2),
            utilization: 60,
            underutilized: 1,
            percent: 75,
            max_shrinks: 5,
        },
    };
    Some(preset)
}

/// How capacity increases when both tiers run dry.
///
/// Growth is exponential (a fraction of current capacity) until capacity
/// reaches `initial * threshold_factor`, then linear.
#[derive(Debug, Clone, Copy)]
pub struct GrowthParams {
    /// Multiplier on the initial capacity at which growth switches from
    /// exponential to linear.
    pub threshold_factor: f64,

    /// Fraction of current capacity added per growth while below the
    /// threshold (exponential mode).
    pub controlled_growth_factor: f64,

    /// Fraction of current capacity added per growth once at or above the
    /// threshold (linear mode).
    pub big_growth_factor: f64,
}

impl Default for GrowthParams {
    fn default() -> Self {
        Self {
            threshold_factor: 4.0,
            controlled_growth_factor: 0.5,
            big_growth_factor: 0.25,
        }
    }
}

/// When and how much the background controller shrinks the reservoir.
#[derive(Debug, Clone)]
pub struct ShrinkParams {
    /// When true, preset levels are rejected and every field below must be
    /// set explicitly before `build` succeeds.
    pub enforce_custom: bool,

    /// The preset the fields were derived from, if any.
    pub level: AggressivenessLevel,

    /// How often the background task evaluates shrink eligibility.
    pub check_interval: Duration,

    /// Minimum time since the last `get` for a tick to count as idle.
    pub idle_threshold: Duration,

    /// Consecutive idle ticks required before a shrink is allowed.
    pub min_idle_before_shrink: u32,

    /// Minimum time between two shrink operations.
    pub shrink_cooldown: Duration,

    /// Utilization percentage (0-100) at or below which a tick counts as
    /// underutilized.
    pub min_utilization_before_shrink: u8,

    /// Consecutive underutilized ticks required before a shrink is allowed.
    pub stable_underutilization_rounds: u32,

    /// Percentage of capacity removed per shrink (0-100).
    pub shrink_percent: u8,

    /// Back-to-back shrinks allowed before the controller pauses until the
    /// next `get`.
    pub max_consecutive_shrinks: u32,

    /// Capacity floor; shrinking never goes below this.
    pub min_capacity: usize,
}

impl ShrinkParams {
    fn from_level(level: AggressivenessLevel) -> Self {
        let mut params = Self {
            enforce_custom: false,
            level,
            check_interval: Duration::ZERO,
            idle_threshold: Duration::ZERO,
            min_idle_before_shrink: 0,
            shrink_cooldown: Duration::ZERO,
            min_utilization_before_shrink: 0,
            stable_underutilization_rounds: 0,
            shrink_percent: 0,
            max_consecutive_shrinks: 0,
            min_capacity: DEFAULT_MIN_CAPACITY,
        };
        params.apply_preset(level);
        params
    }

    fn apply_preset(&mut self, level: AggressivenessLevel) {
        self.level = level;
        if let Some(preset) = shrink_preset(level) {
            self.check_interval = preset.interval;
            self.idle_threshold = preset.idle;
            self.min_idle_before_shrink = preset.min_idle;
            self.shrink_cooldown = preset.cooldown;
            self.min_utilization_before_shrink = preset.utilization;
            self.stable_underutilization_rounds = preset.underutilized;
            self.shrink_percent = preset.percent;
            self.max_consecutive_shrinks = preset.max_shrinks;
        }
    }

    /// Whether the background shrink task should run at all.
    pub fn enabled(&self) -> bool {
        self.enforce_custom || self.level != AggressivenessLevel::Disabled
    }
}

impl Default for ShrinkParams {
    fn default() -> Self {
        Self::from_level(AggressivenessLevel::Balanced)
    }
}

/// Configuration of the L1 fast-path channel.
#[derive(Debug, Clone)]
pub struct FastPathParams {
    /// Initial capacity of the L1 channel.
    pub initial_size: usize,

    /// Capacity floor for L1 resizes.
    pub min_capacity: usize,

    /// Percentage of L1 capacity targeted when refilling (0-100).
    pub fill_aggressiveness: u8,

    /// L1 fill percentage (0-99) at or below which a refill is scheduled.
    pub refill_percent: u8,

    /// Whether L1 may be replaced with a larger channel as the pool grows.
    pub enable_channel_growth: bool,

    /// Pool growth events between L1 growth resizes.
    pub growth_events_trigger: u64,

    /// Pool shrink events between L1 shrink resizes.
    pub shrink_events_trigger: u64,

    /// Growth rule applied to L1 capacity on a growth-coupled resize.
    pub growth: GrowthParams,

    /// Percentage removed from L1 capacity on a shrink-coupled resize.
    pub shrink_percent: u8,
}

impl Default for FastPathParams {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_L1_INITIAL_SIZE,
            min_capacity: DEFAULT_L1_MIN_CAPACITY,
            fill_aggressiveness: 100,
            refill_percent: 20,
            enable_channel_growth: true,
            growth_events_trigger: 3,
            shrink_events_trigger: 3,
            growth: GrowthParams::default(),
            shrink_percent: 50,
        }
    }
}

/// How values are materialized.
#[derive(Debug, Clone, Copy)]
pub struct AllocParams {
    /// Percentage of the initial capacity preallocated at construction.
    pub alloc_percent: u8,

    /// Values materialized per growth tick; the growth delta caps it.
    pub alloc_amount: usize,
}

impl Default for AllocParams {
    fn default() -> Self {
        Self {
            alloc_percent: 100,
            alloc_amount: 16,
        }
    }
}

/// Full pool configuration. Built via [`PoolConfigBuilder`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub initial_capacity: usize,
    pub hard_limit: usize,
    pub growth: GrowthParams,
    pub shrink: ShrinkParams,
    pub fast_path: FastPathParams,
    pub alloc: AllocParams,
    pub ring: RingConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            hard_limit: DEFAULT_HARD_LIMIT,
            growth: GrowthParams::default(),
            shrink: ShrinkParams::default(),
            fast_path: FastPathParams::default(),
            alloc: AllocParams::default(),
            ring: RingConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// Capacity at which growth switches from exponential to linear.
    pub(crate) fn growth_threshold(&self) -> usize {
        (self.initial_capacity as f64 * self.growth.threshold_factor) as usize
    }
}

/// Builder for [`PoolConfig`].
///
/// Numeric setters silently ignore zero or negative values, keeping the
/// default; this matches existing client contracts. The one exception is
/// [`with_shrink_aggressiveness`](Self::with_shrink_aggressiveness), which
/// returns an error for out-of-range levels.
///
/// # Examples
///
/// ```
/// use tidepool::PoolConfig;
///
/// let config = PoolConfig::builder()
///     .with_initial_capacity(16)
///     .with_hard_limit(256)
///     .with_growth_percent(0.5)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.initial_capacity, 16);
/// assert_eq!(config.hard_limit, 256);
/// ```
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
        }
    }

    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        if capacity > 0 {
            self.config.initial_capacity = capacity;
        }
        self
    }

    pub fn with_hard_limit(mut self, limit: usize) -> Self {
        if limit > 0 {
            self.config.hard_limit = limit;
        }
        self
    }

    pub fn with_growth_exponential_threshold_factor(mut self, factor: f64) -> Self {
        if factor > 0.0 {
            self.config.growth.threshold_factor = factor;
        }
        self
    }

    /// Growth fraction used while in exponential mode.
    pub fn with_growth_percent(mut self, factor: f64) -> Self {
        if factor > 0.0 {
            self.config.growth.controlled_growth_factor = factor;
        }
        self
    }

    /// Growth fraction used once in linear mode.
    pub fn with_fixed_growth_factor(mut self, factor: f64) -> Self {
        if factor > 0.0 {
            self.config.growth.big_growth_factor = factor;
        }
        self
    }

    /// Require every shrink parameter to be set explicitly.
    ///
    /// Clears the preset-derived shrink values; `build` fails unless the
    /// caller subsequently sets all of them.
    pub fn enforce_custom_config(mut self) -> Self {
        self.config.shrink = ShrinkParams {
            enforce_custom: true,
            level: AggressivenessLevel::Disabled,
            check_interval: Duration::ZERO,
            idle_threshold: Duration::ZERO,
            min_idle_before_shrink: 0,
            shrink_cooldown: Duration::ZERO,
            min_utilization_before_shrink: 0,
            stable_underutilization_rounds: 0,
            shrink_percent: 0,
            max_consecutive_shrinks: 0,
            min_capacity: 0,
        };
        self
    }

    /// Apply a shrink preset (0-5). Level 0 disables the background shrink
    /// loop entirely; levels above 5 are rejected.
    pub fn with_shrink_aggressiveness(mut self, level: u8) -> PoolResult<Self> {
        if self.config.shrink.enforce_custom {
            return Err(PoolError::InvalidConfig(
                "cannot set an aggressiveness level when custom config is enforced".into(),
            ));
        }
        let level = AggressivenessLevel::from_u8(level).ok_or_else(|| {
            PoolError::InvalidConfig(format!("aggressiveness level {level} is out of range (0-5)"))
        })?;
        self.config.shrink.apply_preset(level);
        self.config.shrink.min_capacity = DEFAULT_MIN_CAPACITY;
        Ok(self)
    }

    pub fn with_shrink_check_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.config.shrink.check_interval = interval;
        }
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        if !threshold.is_zero() {
            self.config.shrink.idle_threshold = threshold;
        }
        self
    }

    pub fn with_min_idle_before_shrink(mut self, rounds: u32) -> Self {
        if rounds > 0 {
            self.config.shrink.min_idle_before_shrink = rounds;
        }
        self
    }

    pub fn with_shrink_cooldown(mut self, cooldown: Duration) -> Self {
        if !cooldown.is_zero() {
            self.config.shrink.shrink_cooldown = cooldown;
        }
        self
    }

    pub fn with_min_utilization_before_shrink(mut self, percent: u8) -> Self {
        if percent > 0 {
            self.config.shrink.min_utilization_before_shrink = percent;
        }
        self
    }

    pub fn with_stable_underutilization_rounds(mut self, rounds: u32) -> Self {
        if rounds > 0 {
            self.config.shrink.stable_underutilization_rounds = rounds;
        }
        self
    }

    pub fn with_shrink_percent(mut self, percent: u8) -> Self {
        if percent > 0 {
            self.config.shrink.shrink_percent = percent;
        }
        self
    }

    pub fn with_min_shrink_capacity(mut self, capacity: usize) -> Self {
        if capacity > 0 {
            self.config.shrink.min_capacity = capacity;
        }
        self
    }

    pub fn with_max_consecutive_shrinks(mut self, count: u32) -> Self {
        if count > 0 {
            self.config.shrink.max_consecutive_shrinks = count;
        }
        self
    }

    pub fn with_fast_path_initial_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.config.fast_path.initial_size = size;
        }
        self
    }

    pub fn with_fast_path_min_capacity(mut self, capacity: usize) -> Self {
        if capacity > 0 {
            self.config.fast_path.min_capacity = capacity;
        }
        self
    }

    pub fn with_fill_aggressiveness(mut self, percent: u8) -> Self {
        if percent > 0 {
            self.config.fast_path.fill_aggressiveness = percent;
        }
        self
    }

    pub fn with_refill_percent(mut self, percent: u8) -> Self {
        if percent > 0 {
            self.config.fast_path.refill_percent = percent;
        }
        self
    }

    pub fn with_channel_growth(mut self, enable: bool) -> Self {
        self.config.fast_path.enable_channel_growth = enable;
        self
    }

    pub fn with_growth_events_trigger(mut self, count: u64) -> Self {
        if count > 0 {
            self.config.fast_path.growth_events_trigger = count;
        }
        self
    }

    pub fn with_shrink_events_trigger(mut self, count: u64) -> Self {
        if count > 0 {
            self.config.fast_path.shrink_events_trigger = count;
        }
        self
    }

    pub fn with_fast_path_growth_percent(mut self, factor: f64) -> Self {
        if factor > 0.0 {
            self.config.fast_path.growth.controlled_growth_factor = factor;
        }
        self
    }

    pub fn with_fast_path_exponential_threshold_factor(mut self, factor: f64) -> Self {
        if factor > 0.0 {
            self.config.fast_path.growth.threshold_factor = factor;
        }
        self
    }

    pub fn with_fast_path_fixed_growth_factor(mut self, factor: f64) -> Self {
        if factor > 0.0 {
            self.config.fast_path.growth.big_growth_factor = factor;
        }
        self
    }

    pub fn with_fast_path_shrink_percent(mut self, percent: u8) -> Self {
        if percent > 0 {
            self.config.fast_path.shrink_percent = percent;
        }
        self
    }

    pub fn with_alloc_percent(mut self, percent: u8) -> Self {
        if percent > 0 {
            self.config.alloc.alloc_percent = percent;
        }
        self
    }

    pub fn with_alloc_amount(mut self, amount: usize) -> Self {
        if amount > 0 {
            self.config.alloc.alloc_amount = amount;
        }
        self
    }

    /// Configure the ring buffer's blocking behavior. Blocking mode also
    /// governs whether `get` waits when the pool is exhausted.
    pub fn with_ring_buffer_config(
        mut self,
        block: bool,
        r_timeout: Option<Duration>,
        w_timeout: Option<Duration>,
    ) -> Self {
        self.config.ring.block = block;
        if r_timeout.map_or(false, |t| !t.is_zero()) {
            self.config.ring.r_timeout = r_timeout;
        }
        if w_timeout.map_or(false, |t| !t.is_zero()) {
            self.config.ring.w_timeout = w_timeout;
        }
        self
    }

    pub fn build(self) -> PoolResult<PoolConfig> {
        let config = self.config;
        let invalid = |msg: String| Err(PoolError::InvalidConfig(msg));

        if config.initial_capacity == 0 {
            return invalid("initial_capacity must be greater than 0".into());
        }
        if config.hard_limit == 0 {
            return invalid("hard_limit must be greater than 0".into());
        }
        if config.hard_limit < config.initial_capacity {
            return invalid("hard_limit must be >= initial_capacity".into());
        }
        if config.hard_limit < config.shrink.min_capacity {
            return invalid("hard_limit must be >= min_capacity".into());
        }
        if config.hard_limit < config.fast_path.initial_size {
            return invalid("hard_limit must be >= fast path initial size".into());
        }

        let fp = &config.fast_path;
        if fp.initial_size == 0 {
            return invalid("fast path initial size must be greater than 0".into());
        }
        if fp.min_capacity == 0 || fp.initial_size < fp.min_capacity {
            return invalid("fast path initial size must be >= its min capacity".into());
        }
        if fp.fill_aggressiveness == 0 || fp.fill_aggressiveness > 100 {
            return invalid("fill_aggressiveness must be between 1 and 100".into());
        }
        if fp.refill_percent == 0 || fp.refill_percent >= 100 {
            return invalid("refill_percent must be between 1 and 99".into());
        }
        if fp.growth_events_trigger == 0 {
            return invalid("growth_events_trigger must be greater than 0".into());
        }
        if fp.shrink_events_trigger == 0 {
            return invalid("shrink_events_trigger must be greater than 0".into());
        }
        if fp.shrink_percent == 0 || fp.shrink_percent > 100 {
            return invalid("fast path shrink percent must be between 1 and 100".into());
        }
        for (name, growth) in [("pool", &config.growth), ("fast path", &fp.growth)] {
            if growth.threshold_factor <= 0.0 {
                return invalid(format!("{name} threshold_factor must be > 0"));
            }
            if growth.controlled_growth_factor <= 0.0 {
                return invalid(format!("{name} controlled growth factor must be > 0"));
            }
            if growth.big_growth_factor <= 0.0 {
                return invalid(format!("{name} big growth factor must be > 0"));
            }
        }

        let alloc = &config.alloc;
        if alloc.alloc_percent == 0 || alloc.alloc_percent > 100 {
            return invalid("alloc_percent must be between 1 and 100".into());
        }
        if alloc.alloc_amount == 0 {
            return invalid("alloc_amount must be greater than 0".into());
        }

        let shrink = &config.shrink;
        if shrink.enabled() {
            if shrink.min_utilization_before_shrink == 0
                || shrink.min_utilization_before_shrink > 100
            {
                return invalid("min_utilization_before_shrink must be between 1 and 100".into());
            }
            if shrink.shrink_percent == 0 || shrink.shrink_percent > 100 {
                return invalid("shrink_percent must be between 1 and 100".into());
            }
        }
        if shrink.enforce_custom {
            if shrink.max_consecutive_shrinks == 0 {
                return invalid("max_consecutive_shrinks must be greater than 0".into());
            }
            if shrink.check_interval.is_zero() {
                return invalid("check_interval must be greater than 0".into());
            }
            if shrink.idle_threshold.is_zero() {
                return invalid("idle_threshold must be greater than 0".into());
            }
            if shrink.min_idle_before_shrink == 0 {
                return invalid("min_idle_before_shrink must be greater than 0".into());
            }
            if shrink.idle_threshold < shrink.check_interval {
                return invalid("idle_threshold must be >= check_interval".into());
            }
            if shrink.min_capacity == 0 {
                return invalid("min_capacity must be greater than 0".into());
            }
            if shrink.min_capacity > config.initial_capacity {
                return invalid("min_capacity must be <= initial_capacity".into());
            }
            if shrink.shrink_cooldown.is_zero() {
                return invalid("shrink_cooldown must be greater than 0".into());
            }
            if shrink.stable_underutilization_rounds == 0 {
                return invalid("stable_underutilization_rounds must be greater than 0".into());
            }
        }

        Ok(config)
    }
}
