//! compart-kv — RAM-first sharded key/value storage
//!
//! Each [`Shard`] keeps its entries in a RAM hash table and makes them
//! durable through an append-only, checksummed log in its own directory.
//! Report backends open several shards side by side and stripe reads
//! across them.
//!
//! # Architecture
//!
//! - **Read path**: served from RAM under a shared lock
//! - **Write path**: log append first, then RAM update
//! - **Recovery**: replay of every log segment on open, skipping corrupt
//!   records and stopping at a torn tail
//! - **Compaction**: live set rewritten into one segment via atomic rename

pub mod config;
pub mod error;
pub mod format;
pub mod log;
pub mod platform;
pub mod shard;

pub use config::ShardConfig;
pub use error::{KvError, KvResult};
pub use format::Operation;
pub use log::{LogReader, LogWriter};
pub use shard::{CompactionStats, Shard};
