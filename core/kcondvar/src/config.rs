//! Sleep queue table configuration.

use crate::error::ConfigError;

/// Largest supported number of buckets.
pub const MAX_BUCKETS: usize = 1 << 16;

/// Shape of the hashed sleep queue table.
///
/// The table is sized once, when [`SleepQueues`](crate::SleepQueues) is
/// constructed, and never grows afterwards.
///
/// # Valid Ranges
///
/// - `buckets`: a power of two in `1..=65536`
/// - `hash_shift`: smaller than the pointer width; channels are hashed as
///   `((addr >> hash_shift) ^ addr) & (buckets - 1)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepQueueConfig {
    /// Number of independently guarded buckets.
    pub buckets: usize,
    /// Right shift folded into the channel hash.
    pub hash_shift: u32,
}

impl SleepQueueConfig {
    /// Checks the configuration against the valid ranges.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.buckets == 0 || self.buckets > MAX_BUCKETS || !self.buckets.is_power_of_two() {
            return Err(ConfigError::BadBucketCount(self.buckets));
        }
        if self.hash_shift >= usize::BITS {
            return Err(ConfigError::BadHashShift(self.hash_shift));
        }
        Ok(())
    }
}

impl Default for SleepQueueConfig {
    fn default() -> Self {
        Self {
            buckets: 256,
            hash_shift: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(SleepQueueConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_shapes() {
        let bad = |buckets, hash_shift| SleepQueueConfig { buckets, hash_shift }.validate();
        assert_eq!(bad(0, 8), Err(ConfigError::BadBucketCount(0)));
        assert_eq!(bad(100, 8), Err(ConfigError::BadBucketCount(100)));
        assert_eq!(bad(MAX_BUCKETS * 2, 8), Err(ConfigError::BadBucketCount(MAX_BUCKETS * 2)));
        assert_eq!(bad(64, usize::BITS), Err(ConfigError::BadHashShift(usize::BITS)));
        assert_eq!(bad(1, 0), Ok(()));
    }
}
