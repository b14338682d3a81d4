//! Configuration for the report engine
//!
//! Presets:
//! - `workstation()` — a handful of workers, memory-mapped reads
//! - `cluster()` — wide task pool, batched reads where the platform has list I/O
//!
//! Individual reports can override the read strategy and shard count through
//! URI query parameters (`?strategy=mmap|batched`, `?shards=N`).

use std::str::FromStr;

use compart_kv::ShardConfig;

/// How the binary backend reads frame data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    /// `Batched` where list I/O is native, `MemoryMapped` elsewhere
    Auto,
    /// Copy out of a read-only mapping of the whole file
    MemoryMapped,
    /// Submit positional reads in bounded batches
    Batched,
}

impl ReadStrategy {
    /// Resolve `Auto` for the current platform.
    pub fn resolve(self) -> ReadStrategy {
        match self {
            ReadStrategy::Auto if crate::backend::aio::NATIVE_LIST_IO => ReadStrategy::Batched,
            ReadStrategy::Auto => ReadStrategy::MemoryMapped,
            other => other,
        }
    }
}

impl FromStr for ReadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ReadStrategy::Auto),
            "mmap" | "mapped" => Ok(ReadStrategy::MemoryMapped),
            "batched" | "aio" => Ok(ReadStrategy::Batched),
            other => Err(format!("unknown read strategy '{}'", other)),
        }
    }
}

/// Report engine configuration
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Worker threads in each report's task pool
    pub worker_threads: usize,
    /// Threads used to decode a binary mapping block
    pub mapping_threads: usize,
    /// Binary backend read strategy
    pub read_strategy: ReadStrategy,
    /// Maximum reads submitted in one batch
    pub io_batch_size: usize,
    /// Shards opened by the key/value backend
    pub kv_shards: usize,
    /// Settings for every key/value shard
    pub shard: ShardConfig,
}

impl ReportConfig {
    /// Desktop analysis: few workers, mapped reads.
    pub fn workstation() -> Self {
        Self {
            worker_threads: 4,
            mapping_threads: 4,
            read_strategy: ReadStrategy::MemoryMapped,
            io_batch_size: 4096,
            kv_shards: 1,
            shard: ShardConfig::bulk(),
        }
    }

    /// Compute node: one worker per core, batched reads where available.
    pub fn cluster() -> Self {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(8);
        Self {
            worker_threads: cores,
            // mapping decode saturates memory bandwidth well before all cores
            mapping_threads: cores.min(16),
            read_strategy: ReadStrategy::Auto,
            io_batch_size: 4096,
            kv_shards: 4,
            shard: ShardConfig::bulk(),
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_threads == 0 {
            return Err("worker_threads must be > 0".into());
        }
        if self.mapping_threads == 0 {
            return Err("mapping_threads must be > 0".into());
        }
        if self.io_batch_size == 0 || self.io_batch_size > 65536 {
            return Err("io_batch_size must be in [1, 65536]".into());
        }
        if self.kv_shards == 0 || self.kv_shards > 100 {
            return Err("kv_shards must be in [1, 100]".into());
        }
        self.shard.validate()
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self::workstation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_valid() {
        assert!(ReportConfig::workstation().validate().is_ok());
        assert!(ReportConfig::cluster().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = ReportConfig::workstation();
        config.worker_threads = 0;
        assert!(config.validate().unwrap_err().contains("worker_threads"));
    }

    #[test]
    fn test_rejects_bad_shard_count() {
        let mut config = ReportConfig::cluster();
        config.kv_shards = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_parse_and_resolve() {
        assert_eq!("mmap".parse::<ReadStrategy>().unwrap(), ReadStrategy::MemoryMapped);
        assert_eq!("batched".parse::<ReadStrategy>().unwrap(), ReadStrategy::Batched);
        assert!("fast".parse::<ReadStrategy>().is_err());
        assert_ne!(ReadStrategy::Auto.resolve(), ReadStrategy::Auto);
        assert_eq!(ReadStrategy::Batched.resolve(), ReadStrategy::Batched);
    }
}
