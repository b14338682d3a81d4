//! compart-report — compartment report storage engine
//!
//! Reads and writes simulation traces holding one value per compartment,
//! per cell, per time frame. Callers usually want a subset of cells over a
//! time window, so the engine builds a cell → section → compartment index
//! once per report and repacks it for each [`View`].
//!
//! # Architecture
//!
//! - **Backends**: flat binary files (read-only, memory-mapped or batched
//!   reads), sharded key/value stores (read/write) and a synthetic
//!   `dummy://` source, chosen by URI scheme
//! - **Index**: built at open, immutable and shared by every view
//! - **Loads**: posted to the report's own task pool and returned as
//!   [`LoadHandle`]s, which are futures and can also be waited on
//! - **Byte order**: detected from the header; data written on a machine
//!   of the other endianness is swapped on read

pub mod backend;
pub mod bytes;
pub mod config;
pub mod error;
pub mod index;
pub mod pool;
pub mod report;
pub mod time;
pub mod types;
pub mod uri;

pub use config::{ReadStrategy, ReportConfig};
pub use error::{ReportError, ReportWarning, Result};
pub use index::{CellRecord, CellRun, CompartmentIndex, ViewMapping};
pub use pool::{LoadHandle, TaskPool};
pub use report::{Report, ReportEngine, ReportWriter, View};
pub use time::TimeAxis;
pub use types::{AccessMode, Frame, FrameBatch, Gid, GidSet, ReportMetadata, UNDEFINED_OFFSET};
pub use uri::ReportUri;
