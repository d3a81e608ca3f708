use crate::error::{Error, Result};

/// Default bounded capacity of the work pool.
pub const DEFAULT_CAPACITY: usize = 22;

/// Highest (numerically largest, lowest urgency) priority level.
/// Out-of-range priorities are clamped here, never rejected.
pub const MAX_PRIORITY: u32 = 256;

/// How work units are divided across device scheduler threads.
///
/// Exactly one policy is active per pool, chosen at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Device `d` claims the unit whose sequence index maps to `d`
    /// modulo the device count.
    RoundRobin,

    /// Each device claims a fixed fraction of the expected unit count,
    /// proportional to its share, then stops.
    StaticRatio { shares: Vec<u32> },

    /// Starts from the same proportional quotas as `StaticRatio`, then
    /// moves quota away from devices whose execution times trend upward.
    Dynamic { shares: Vec<u32> },
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        SchedulingPolicy::RoundRobin
    }
}

impl SchedulingPolicy {
    pub(crate) fn shares(&self) -> Option<&[u32]> {
        match self {
            SchedulingPolicy::RoundRobin => None,
            SchedulingPolicy::StaticRatio { shares } | SchedulingPolicy::Dynamic { shares } => {
                Some(shares)
            }
        }
    }
}

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Fixed slot capacity of the circular work-unit buffer.
    pub capacity: usize,
    /// Total number of units the producer expects to enqueue over the
    /// pool's lifetime. Ratio policies derive per-device quotas from it.
    pub expected_units: usize,
    pub policy: SchedulingPolicy,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            expected_units: 0,
            policy: SchedulingPolicy::default(),
            thread_name_prefix: "hetpool-worker".to_string(),
            stack_size: Some(2 * 1024 * 1024),
        }
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::configuration("capacity must be > 0"));
        }

        if let Some(shares) = self.policy.shares() {
            if shares.is_empty() {
                return Err(Error::configuration("ratio policy needs at least one share"));
            }
            if shares.iter().all(|&s| s == 0) {
                return Err(Error::configuration("ratio shares must not all be zero"));
            }
            if self.expected_units == 0 {
                return Err(Error::configuration(
                    "ratio policies require expected_units > 0",
                ));
            }
        }

        Ok(())
    }

    /// Shares must line up one-to-one with enumerated devices; checked at
    /// pool construction once the device count is known.
    pub(crate) fn validate_for_devices(&self, num_devices: usize) -> Result<()> {
        if let Some(shares) = self.policy.shares() {
            if shares.len() != num_devices {
                return Err(Error::configuration(format!(
                    "policy declares {} shares but {} devices were enumerated",
                    shares.len(),
                    num_devices
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn expected_units(mut self, n: usize) -> Self {
        self.config.expected_units = n;
        self
    }

    pub fn policy(mut self, policy: SchedulingPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn build(self) -> Result<PoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
