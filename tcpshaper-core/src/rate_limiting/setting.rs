use std::fmt::Debug;
use std::num::NonZeroU64;
use std::sync::RwLock;

use tcpshaper_common::RateConfig;

/// Throughput ceiling of a [RateSetting].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limit {
    Unlimited,
    BytesPerSecond(NonZeroU64),
}

/// No throughput ceiling at all. Buckets driven by it admit any size immediately.
pub const UNLIMITED: Limit = Limit::Unlimited;

impl Limit {
    /// Anything below one byte per second means "unlimited"
    pub fn from_bytes_per_second(v: i64) -> Self {
        u64::try_from(v)
            .ok()
            .and_then(NonZeroU64::new)
            .map_or(Self::Unlimited, Self::BytesPerSecond)
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// The limit as a plain number, `u64::MAX` standing in for unlimited
    pub fn effective_value(&self) -> u64 {
        match self {
            Self::Unlimited => u64::MAX,
            Self::BytesPerSecond(v) => v.get(),
        }
    }

    /// Token fill rate in bytes per second
    pub(crate) fn fill_rate(&self) -> f64 {
        match self {
            Self::Unlimited => f64::INFINITY,
            Self::BytesPerSecond(v) => v.get() as f64,
        }
    }
}

/// A consistent `(limit, burst)` pair read out of a [RateSetting]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateValues {
    pub limit: Limit,
    pub burst: u64,
}

impl RateValues {
    fn normalized(limit: Limit, burst: i64) -> Self {
        let burst = match u64::try_from(burst) {
            Ok(b) if b > 0 => b,
            _ => limit.effective_value(),
        };
        Self { limit, burst }
    }
}

/// Runtime-adjustable throughput policy shared between any number of
/// [LimiterNode](super::LimiterNode)s.
///
/// Both values live behind one lock so that a reader never sees a limit
/// from one update and a burst from another.
pub struct RateSetting {
    values: RwLock<RateValues>,
}

impl RateSetting {
    pub fn new(limit: i64, burst: i64) -> Self {
        Self {
            values: RwLock::new(RateValues::normalized(
                Limit::from_bytes_per_second(limit),
                burst,
            )),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    pub fn set_limit(&self, limit: i64) {
        self.write().limit = Limit::from_bytes_per_second(limit);
    }

    /// A burst of zero or less follows the current limit.
    pub fn set_burst(&self, burst: i64) {
        let mut values = self.write();
        *values = RateValues::normalized(values.limit, burst);
    }

    /// Replaces both values atomically
    pub fn apply(&self, config: &RateConfig) {
        let limit = Limit::from_bytes_per_second(saturating_i64(config.bytes_per_second));
        *self.write() = RateValues::normalized(limit, saturating_i64(config.burst));
    }

    pub fn limit(&self) -> Limit {
        self.read().limit
    }

    pub fn burst(&self) -> u64 {
        self.read().burst
    }

    pub fn snapshot(&self) -> RateValues {
        *self.read()
    }

    #[allow(clippy::unwrap_used, reason = "panic on poison")]
    fn read(&self) -> std::sync::RwLockReadGuard<'_, RateValues> {
        self.values.read().unwrap()
    }

    #[allow(clippy::unwrap_used, reason = "panic on poison")]
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RateValues> {
        self.values.write().unwrap()
    }
}

fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl From<&RateConfig> for RateSetting {
    fn from(config: &RateConfig) -> Self {
        let setting = Self::unlimited();
        setting.apply(config);
        setting
    }
}

impl Debug for RateSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let values = self.snapshot();
        f.debug_struct("RateSetting")
            .field("limit", &values.limit)
            .field("burst", &values.burst)
            .finish()
    }
}
