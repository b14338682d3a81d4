//! Configuration for shard stores
//!
//! Two presets cover the common cases: `durable()` syncs every write,
//! `bulk()` leaves syncing to explicit `Shard::sync` calls so that a report
//! writer pays one fsync per flush instead of one per frame.

use crate::format::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Shard configuration
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Log segment rotation threshold (bytes)
    pub segment_size_bytes: u64,
    /// Sync the log after every put/delete
    pub durable_writes: bool,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
}

impl ShardConfig {
    /// Every write is synced before it becomes visible.
    pub fn durable() -> Self {
        Self {
            segment_size_bytes: 128 * 1024 * 1024,
            durable_writes: true,
            max_key_size: 256,
            max_value_size: 16 * 1024 * 1024,
        }
    }

    /// Bulk loading: writes hit the page cache, `sync()` makes them durable.
    pub fn bulk() -> Self {
        Self {
            segment_size_bytes: 512 * 1024 * 1024,
            durable_writes: false,
            max_key_size: 256,
            max_value_size: MAX_VALUE_SIZE,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.segment_size_bytes < 1024 * 1024 {
            return Err("segment_size_bytes must be >= 1MB".into());
        }
        if self.max_key_size == 0 || self.max_key_size > MAX_KEY_SIZE {
            return Err(format!("max_key_size must be in [1, {}]", MAX_KEY_SIZE));
        }
        if self.max_value_size == 0 || self.max_value_size > MAX_VALUE_SIZE {
            return Err(format!("max_value_size must be in [1, {}]", MAX_VALUE_SIZE));
        }
        if self.max_value_size as u64 >= self.segment_size_bytes {
            return Err("max_value_size must be smaller than segment_size_bytes".into());
        }
        Ok(())
    }
}

impl Default for ShardConfig {
    fn default() -> Self { Self::durable() }
}
