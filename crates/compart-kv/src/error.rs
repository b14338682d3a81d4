//! Error types for shard store operations
//!
//! All shard failures are represented by the [`KvError`] enum. Variants that
//! come from on-disk data carry the segment path and byte offset where the
//! problem was detected, so log replay can decide between resync and abort.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shard store error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum KvError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", location(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A log segment holds bytes that cannot be a record
    #[error("log corrupted in {} at offset {offset}: {reason}", .path.display())]
    LogCorrupted {
        /// Path to the corrupted segment
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error(
        "checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}",
        .path.display()
    )]
    ChecksumMismatch {
        /// Segment where the checksum failed
        path: PathBuf,
        /// Checksum stored in the record header
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
        /// Byte offset of the damaged payload
        offset: u64,
    },

    /// Partial record at the end of a segment
    #[error(
        "torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available",
        .path.display()
    )]
    TornWrite {
        /// Segment with the torn write
        path: PathBuf,
        /// Payload size announced by the header
        expected_size: u32,
        /// Bytes actually present
        available_bytes: u64,
        /// Offset where the torn record begins
        offset: u64,
    },

    /// Key or value exceeds the configured limit
    #[error("record {component} too large: {size} bytes exceeds limit of {max_size} bytes")]
    OversizedRecord {
        /// Size of the rejected component
        size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// `"key"` or `"value"`
        component: &'static str,
    },

    /// Magic bytes not found at a record boundary
    #[error(
        "magic bytes not found in {} at offset {offset}: found {}",
        .path.display(), hex(.found)
    )]
    NoMagicFound {
        /// Segment being read
        path: PathBuf,
        /// Offset where the magic was expected
        offset: u64,
        /// Bytes actually found
        found: [u8; 4],
    },

    /// Shard configuration rejected by `ShardConfig::validate`
    #[error("invalid shard configuration: {0}")]
    InvalidConfig(String),
}

fn location(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

fn hex(bytes: &[u8; 4]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl KvError {
    /// Wrap an I/O error with the path it happened on and what was attempted.
    pub fn io_at(path: &Path, err: &std::io::Error, what: &str) -> Self {
        KvError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

/// Convert std::io::Error to KvError::Io
impl From<std::io::Error> for KvError {
    fn from(err: std::io::Error) -> Self {
        KvError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for shard store operations
pub type KvResult<T> = Result<T, KvError>;
