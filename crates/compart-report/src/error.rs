//! Error and warning types for report operations
//!
//! Fatal conditions are [`ReportError`] values returned synchronously from
//! open/view construction or carried through a [`LoadHandle`](crate::LoadHandle).
//! Recoverable conditions are [`ReportWarning`] values recorded on the view
//! or report that produced them.

use std::path::{Path, PathBuf};

use compart_kv::KvError;
use thiserror::Error;

use crate::types::Gid;

/// Report engine error types
#[derive(Debug, Clone, Error)]
pub enum ReportError {
    /// Header fields are unreadable, inconsistent or out of bounds
    #[error("corrupt header in {source_name}: {reason}")]
    CorruptHeader {
        /// File path or store URI
        source_name: String,
        /// What failed to decode
        reason: String,
    },

    /// Stored format version is not the one this engine writes
    #[error("format version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this engine understands
        expected: u32,
        /// Version found in the header
        found: u32,
    },

    /// No backend handles this URI
    #[error("unsupported report format '{uri}': {reason}")]
    UnsupportedFormat {
        /// The rejected URI
        uri: String,
        /// Why no backend matched
        reason: String,
    },

    /// None of the requested GIDs exist in the report
    #[error("none of the {requested} requested GIDs exist in the report")]
    GidsOutOfRange {
        /// Size of the requested set
        requested: usize,
    },

    /// No compartment counts could be read for the requested cells
    #[error("compartment mapping missing for {missing} of {requested} cells")]
    MissingMapping {
        /// Cells without a mapping
        missing: usize,
        /// Cells asked for
        requested: usize,
    },

    /// A load could not find every value it needed
    #[error("missing frame data: {found} of {expected} entries available")]
    MissingData {
        /// Entries requested
        expected: usize,
        /// Entries found
        found: usize,
    },

    /// Time window is empty or reversed
    #[error("invalid time interval [{start}, {end})")]
    InvalidInterval {
        /// Window start
        start: f64,
        /// Window end
        end: f64,
    },

    /// Sampling step is smaller than, or not a multiple of, the report step
    #[error("invalid sampling step {step}: must be a multiple of the report time step {time_step}")]
    InvalidStep {
        /// Requested step
        step: f64,
        /// Native report step
        time_step: f64,
    },

    /// Timestamp lies outside the report
    #[error("timestamp {timestamp} outside report range [{start}, {end}]")]
    TimestampOutOfRange {
        /// Requested timestamp
        timestamp: f64,
        /// Report start
        start: f64,
        /// Report end
        end: f64,
    },

    /// I/O operation failed or returned short
    #[error("I/O error{}: {message} ({kind})", location(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Backend does not support the operation
    #[error("{operation} is not implemented by the {backend} backend")]
    NotImplemented {
        /// Backend name
        backend: &'static str,
        /// Rejected operation
        operation: &'static str,
    },

    /// Opening for write found a readable report
    #[error("report already exists at '{uri}'")]
    AlreadyExists {
        /// Report URI
        uri: String,
    },

    /// Configuration rejected by `ReportConfig::validate`
    #[error("invalid report configuration: {0}")]
    InvalidConfig(String),

    /// Caller passed inconsistent arguments
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Shard store failure underneath the key/value backend
    #[error("shard store error: {0}")]
    Store(#[from] KvError),

    /// A worker dropped a task without producing a result
    #[error("load task aborted before completing")]
    TaskAborted,
}

fn location(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

impl ReportError {
    /// Wrap an I/O error with the path it happened on and what was attempted.
    pub fn io_at(path: &Path, err: &std::io::Error, what: &str) -> Self {
        ReportError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    pub(crate) fn corrupt(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        ReportError::CorruptHeader {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for ReportError {
    fn from(err: std::io::Error) -> Self {
        ReportError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for report operations
pub type Result<T> = std::result::Result<T, ReportError>;

/// Recoverable conditions; the operation went ahead with what was available.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportWarning {
    /// Only part of the requested GID set exists in the report
    #[error("{} of {requested} requested GIDs are not in the report", .missing.len())]
    PartialGids {
        /// Size of the requested set
        requested: usize,
        /// Requested GIDs that were dropped
        missing: Vec<Gid>,
    },

    /// Some cells have no compartment counts and were left out
    #[error("compartment mapping missing for {} of {requested} cells", .missing.len())]
    MissingMapping {
        /// Cells asked for
        requested: usize,
        /// Cells without a mapping
        missing: Vec<Gid>,
    },
}
